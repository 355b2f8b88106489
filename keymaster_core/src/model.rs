//! §3 Data model: the entities every component operates on.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub hostname: String,
    pub label: String,
    /// Free comma-separated tags; empty means the "(no tags)" bucket.
    pub tags: String,
    /// Which system-key generation is currently installed on the host.
    /// 0 means never deployed / bootstrap pending.
    pub serial: i64,
    pub is_active: bool,
    pub is_dirty: bool,
    /// Opaque fingerprint of the last-known-installed content; empty
    /// means unknown.
    pub key_hash: String,
}

impl Account {
    pub fn tags_bucket(&self) -> &str {
        if self.tags.trim().is_empty() { "(no tags)" } else { &self.tags }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublicKey {
    pub id: i64,
    pub algorithm: String,
    pub key_data: String,
    pub comment: String,
    pub is_global: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PublicKey {
    /// Expired keys are filtered out at render time (spec.md §4.C2 rule 3).
    /// "now" is treated as expired (inclusive).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => exp <= now,
            None => false,
        }
    }

    pub fn authorized_line(&self) -> String {
        crate::keys::render(&self.algorithm, &self.key_data, &self.comment)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemKey {
    pub serial: i64,
    /// Full authorized_keys-format public key line (alg + data + comment).
    pub public_key: String,
    /// PEM-encoded private key, possibly passphrase-encrypted.
    pub private_key: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnownHostKey {
    pub canonical_host_port: String,
    pub authorized_keys_line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStatus {
    Active,
    Completed,
    Failed,
    Orphaned,
}

impl BootstrapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapStatus::Active => "active",
            BootstrapStatus::Completed => "completed",
            BootstrapStatus::Failed => "failed",
            BootstrapStatus::Orphaned => "orphaned",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAccount {
    pub username: String,
    pub hostname: String,
    pub label: String,
    pub tags: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapSessionRecord {
    pub id: String,
    pub pending_account: PendingAccount,
    /// Ephemeral public key line; the private half is never persisted.
    pub ephemeral_public_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: BootstrapStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub details: String,
}
