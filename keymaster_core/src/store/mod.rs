//! C3: the store contract (spec.md §4.C3).
//!
//! Everything persistent goes through this trait. Components never touch
//! SQL (or any other storage detail) directly; `SqliteStore` is the one
//! concrete backing shipped here, but nothing above the trait assumes a
//! particular engine — duplicate detection in particular is specified
//! dialect-agnostically (spec.md §9) so a MySQL/Postgres backing could be
//! dropped in without touching C5-C12.

mod sqlite;
#[cfg(test)]
pub mod memory;

pub use sqlite::SqliteStore;

use crate::model::{Account, AuditLogEntry, BootstrapSessionRecord, KnownHostKey, PublicKey, SystemKey};
use crate::Result;

/// A bundle of the keys that apply to one account's rendered file: the
/// keys assigned directly to it, plus every currently-global key. Kept
/// as a named struct (rather than a tuple) so call sites read clearly.
pub struct AccountKeyBundle {
    pub global_keys: Vec<PublicKey>,
    pub account_keys: Vec<PublicKey>,
}

pub trait Store: Send + Sync {
    // -- Accounts --------------------------------------------------------
    fn add_account(&self, username: &str, hostname: &str, label: &str, tags: &str) -> Result<i64>;
    fn delete_account(&self, id: i64) -> Result<()>;
    fn list_accounts(&self) -> Result<Vec<Account>>;
    fn list_active_accounts(&self) -> Result<Vec<Account>>;
    fn get_account(&self, id: i64) -> Result<Account>;
    fn toggle_account_active(&self, id: i64, active: bool) -> Result<()>;
    fn update_account_serial(&self, id: i64, serial: i64) -> Result<()>;
    fn update_account_label_tags(&self, id: i64, label: &str, tags: &str) -> Result<()>;
    fn set_account_dirty(&self, id: i64, dirty: bool) -> Result<()>;
    fn set_account_fingerprint(&self, id: i64, key_hash: &str) -> Result<()>;
    fn mark_accounts_dirty(&self, ids: &[i64]) -> Result<()>;

    /// Recompute whether `id`'s rendered content would differ from its
    /// stored `key_hash`, and set `is_dirty` accordingly (spec.md §4.C3
    /// "maybe-mark-dirty"). Implementations must run this, and the
    /// mutation that triggered it, in one transaction.
    fn maybe_mark_dirty(&self, id: i64) -> Result<()>;

    fn account_keys(&self, id: i64) -> Result<AccountKeyBundle>;

    // -- Public keys ------------------------------------------------------
    fn add_public_key(&self, algorithm: &str, key_data: &str, comment: &str, is_global: bool) -> Result<PublicKey>;
    fn delete_public_key(&self, id: i64) -> Result<()>;
    fn toggle_global(&self, id: i64, is_global: bool) -> Result<()>;
    fn set_key_expiry(&self, id: i64, expires_at: Option<chrono::DateTime<chrono::Utc>>) -> Result<()>;
    fn list_public_keys(&self) -> Result<Vec<PublicKey>>;
    fn list_global_keys(&self) -> Result<Vec<PublicKey>>;
    fn list_keys_for_account(&self, account_id: i64) -> Result<Vec<PublicKey>>;
    fn find_key_by_comment(&self, comment: &str) -> Result<Option<PublicKey>>;

    // -- Assignments ------------------------------------------------------
    fn assign(&self, key_id: i64, account_id: i64) -> Result<()>;
    fn unassign(&self, key_id: i64, account_id: i64) -> Result<()>;

    // -- System keys --------------------------------------------------------
    fn create_initial_system_key(&self, public_key: &str, private_key: &str) -> Result<SystemKey>;
    fn rotate_system_key(&self, public_key: &str, private_key: &str) -> Result<SystemKey>;
    fn get_active_system_key(&self) -> Result<Option<SystemKey>>;
    fn get_system_key_by_serial(&self, serial: i64) -> Result<Option<SystemKey>>;
    fn has_any_system_key(&self) -> Result<bool>;

    // -- Known hosts --------------------------------------------------------
    fn get_known_host(&self, canonical_host_port: &str) -> Result<Option<KnownHostKey>>;
    fn add_known_host(&self, canonical_host_port: &str, authorized_keys_line: &str) -> Result<()>;
    /// Look up by canonical `host:port` first, falling back to the legacy
    /// host-only form (spec.md §6/§9: "legacy entries must be read,
    /// writes always use canonical form").
    fn lookup_known_host(&self, canonical_host_port: &str, legacy_host_only: &str) -> Result<Option<KnownHostKey>>;

    // -- Bootstrap sessions --------------------------------------------------
    fn save_bootstrap_session(&self, session: &BootstrapSessionRecord) -> Result<()>;
    fn get_bootstrap_session(&self, id: &str) -> Result<Option<BootstrapSessionRecord>>;
    fn delete_bootstrap_session(&self, id: &str) -> Result<()>;
    fn update_bootstrap_status(&self, id: &str, status: crate::model::BootstrapStatus) -> Result<()>;
    fn list_expired_bootstrap_sessions(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<BootstrapSessionRecord>>;
    fn list_orphaned_bootstrap_sessions(&self) -> Result<Vec<BootstrapSessionRecord>>;
    /// Every session still `Active`, regardless of `expires_at`. Used by
    /// startup crash recovery (spec.md §4.C6 `RecoverFromCrash`), which
    /// must orphan every session left over from the previous process —
    /// not only the ones that happened to expire since then.
    fn list_active_bootstrap_sessions(&self) -> Result<Vec<BootstrapSessionRecord>>;

    // -- Audit log ------------------------------------------------------------
    fn append_audit_log(&self, actor: &str, action: &str, details: &str) -> Result<()>;
    fn list_audit_log(&self) -> Result<Vec<AuditLogEntry>>;
}
