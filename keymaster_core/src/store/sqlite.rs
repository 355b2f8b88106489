//! SQLite backing for the [`Store`](super::Store) contract.
//!
//! Chosen as the one concrete implementation because spec.md itself talks
//! about SQLite's literal "database is locked" error and the retry policy
//! around it (spec.md §4.C8/§7); a SQLite store makes that concern real
//! rather than hypothetical. Duplicate-constraint mapping is written
//! dialect-agnostically (see [`map_err`]) so a MySQL/Postgres backing
//! could share the same trait without touching any caller.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{looks_like_duplicate, ErrorKind};
use crate::model::{
    Account, AuditLogEntry, BootstrapSessionRecord, BootstrapStatus, KnownHostKey, PendingAccount,
    PublicKey, SystemKey,
};
use crate::store::{AccountKeyBundle, Store};
use crate::Result;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    username    TEXT NOT NULL,
    hostname    TEXT NOT NULL,
    label       TEXT NOT NULL DEFAULT '',
    tags        TEXT NOT NULL DEFAULT '',
    serial      INTEGER NOT NULL DEFAULT 0,
    is_active   INTEGER NOT NULL DEFAULT 1,
    is_dirty    INTEGER NOT NULL DEFAULT 0,
    key_hash    TEXT NOT NULL DEFAULT '',
    UNIQUE(username, hostname)
);
CREATE TABLE IF NOT EXISTS public_keys (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    algorithm   TEXT NOT NULL,
    key_data    TEXT NOT NULL,
    comment     TEXT NOT NULL UNIQUE,
    is_global   INTEGER NOT NULL DEFAULT 0,
    expires_at  TEXT
);
CREATE TABLE IF NOT EXISTS assignments (
    public_key_id INTEGER NOT NULL REFERENCES public_keys(id),
    account_id    INTEGER NOT NULL REFERENCES accounts(id),
    PRIMARY KEY (public_key_id, account_id)
);
CREATE TABLE IF NOT EXISTS system_keys (
    serial      INTEGER PRIMARY KEY,
    public_key  TEXT NOT NULL,
    private_key TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS known_hosts (
    canonical_host_port   TEXT PRIMARY KEY,
    authorized_keys_line  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS bootstrap_sessions (
    id          TEXT PRIMARY KEY,
    username    TEXT NOT NULL,
    hostname    TEXT NOT NULL,
    label       TEXT NOT NULL DEFAULT '',
    tags        TEXT NOT NULL DEFAULT '',
    ephemeral_public_key TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    status      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_log (
    timestamp   TEXT NOT NULL,
    actor       TEXT NOT NULL,
    action      TEXT NOT NULL,
    details     TEXT NOT NULL
);
";

/// Map a rusqlite error to the unified `KeymasterError` surface. SQLite's
/// own "UNIQUE constraint failed" message is what `looks_like_duplicate`
/// recognizes; the same helper also understands the MySQL/Postgres
/// phrasings for when another engine is plugged in behind this trait.
fn map_err(e: rusqlite::Error, what: &str) -> failure::Error {
    let msg = e.to_string();
    if looks_like_duplicate(&msg) {
        ErrorKind::ErrDuplicate(what.to_string()).into()
    } else {
        ErrorKind::ErrOther(format!("{}: {}", what, msg)).into()
    }
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        hostname: row.get(2)?,
        label: row.get(3)?,
        tags: row.get(4)?,
        serial: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        is_dirty: row.get::<_, i64>(7)? != 0,
        key_hash: row.get(8)?,
    })
}

fn row_to_public_key(row: &rusqlite::Row) -> rusqlite::Result<PublicKey> {
    let expires_at: Option<String> = row.get(5)?;
    Ok(PublicKey {
        id: row.get(0)?,
        algorithm: row.get(1)?,
        key_data: row.get(2)?,
        comment: row.get(3)?,
        is_global: row.get::<_, i64>(4)? != 0,
        expires_at: expires_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
    })
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| map_err(e, "open database"))?;
        conn.execute_batch(SCHEMA).map_err(|e| map_err(e, "create schema"))?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| map_err(e, "open in-memory database"))?;
        conn.execute_batch(SCHEMA).map_err(|e| map_err(e, "create schema"))?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    fn compute_fingerprint_for(&self, conn: &Connection, account_id: i64) -> Result<String> {
        let account = self.get_account_with(conn, account_id)?;
        let active = self.get_active_system_key_with(conn)?;
        let system_key = match active {
            Some(k) => k,
            // No active system key yet: nothing to fingerprint against.
            None => return Ok(String::new()),
        };
        let bundle = self.account_keys_with(conn, account_id)?;
        let rendered = crate::builder::build(Some(&system_key), &bundle.global_keys, &bundle.account_keys, Utc::now())?;
        let _ = account;
        Ok(crate::fingerprint::fingerprint(&rendered))
    }

    fn get_account_with(&self, conn: &Connection, id: i64) -> Result<Account> {
        conn.query_row(
            "SELECT id, username, hostname, label, tags, serial, is_active, is_dirty, key_hash FROM accounts WHERE id = ?1",
            params![id],
            row_to_account,
        )
        .optional()
        .map_err(|e| map_err(e, "get account"))?
        .ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)).into())
    }

    fn get_active_system_key_with(&self, conn: &Connection) -> Result<Option<SystemKey>> {
        conn.query_row(
            "SELECT serial, public_key, private_key, is_active FROM system_keys WHERE is_active = 1",
            [],
            |row| {
                Ok(SystemKey {
                    serial: row.get(0)?,
                    public_key: row.get(1)?,
                    private_key: row.get(2)?,
                    is_active: row.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()
        .map_err(|e| map_err(e, "get active system key"))
    }

    fn account_keys_with(&self, conn: &Connection, account_id: i64) -> Result<AccountKeyBundle> {
        let mut stmt = conn
            .prepare("SELECT id, algorithm, key_data, comment, is_global, expires_at FROM public_keys WHERE is_global = 1")
            .map_err(|e| map_err(e, "prepare global keys"))?;
        let global_keys = stmt
            .query_map([], row_to_public_key)
            .map_err(|e| map_err(e, "query global keys"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect global keys"))?;

        let mut stmt = conn
            .prepare(
                "SELECT pk.id, pk.algorithm, pk.key_data, pk.comment, pk.is_global, pk.expires_at
                 FROM public_keys pk
                 JOIN assignments a ON a.public_key_id = pk.id
                 WHERE a.account_id = ?1",
            )
            .map_err(|e| map_err(e, "prepare account keys"))?;
        let account_keys = stmt
            .query_map(params![account_id], row_to_public_key)
            .map_err(|e| map_err(e, "query account keys"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect account keys"))?;

        Ok(AccountKeyBundle { global_keys, account_keys })
    }

    fn maybe_mark_dirty_with(&self, conn: &Connection, account_id: i64) -> Result<()> {
        let new_hash = self.compute_fingerprint_for(conn, account_id)?;
        let account = self.get_account_with(conn, account_id)?;
        if new_hash != account.key_hash {
            conn.execute("UPDATE accounts SET is_dirty = 1 WHERE id = ?1", params![account_id])
                .map_err(|e| map_err(e, "mark account dirty"))?;
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn add_account(&self, username: &str, hostname: &str, label: &str, tags: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO accounts (username, hostname, label, tags) VALUES (?1, ?2, ?3, ?4)",
            params![username, hostname, label, tags],
        )
        .map_err(|e| map_err(e, "add account"))?;
        Ok(conn.last_insert_rowid())
    }

    fn delete_account(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute("DELETE FROM assignments WHERE account_id = ?1", params![id])
            .map_err(|e| map_err(e, "delete account assignments"))?;
        let changed = conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(|e| map_err(e, "delete account"))?;
        if changed == 0 {
            return Err(ErrorKind::ErrNotFound(format!("account {}", id)).into());
        }
        Ok(())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT id, username, hostname, label, tags, serial, is_active, is_dirty, key_hash FROM accounts")
            .map_err(|e| map_err(e, "prepare list accounts"))?;
        stmt.query_map([], row_to_account)
            .map_err(|e| map_err(e, "query accounts"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect accounts"))
    }

    fn list_active_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT id, username, hostname, label, tags, serial, is_active, is_dirty, key_hash FROM accounts WHERE is_active = 1")
            .map_err(|e| map_err(e, "prepare list active accounts"))?;
        stmt.query_map([], row_to_account)
            .map_err(|e| map_err(e, "query active accounts"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect active accounts"))
    }

    fn get_account(&self, id: i64) -> Result<Account> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        self.get_account_with(&conn, id)
    }

    fn toggle_account_active(&self, id: i64, active: bool) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE accounts SET is_active = ?2 WHERE id = ?1",
            params![id, active as i64],
        )
        .map_err(|e| map_err(e, "toggle account active"))?;
        Ok(())
    }

    fn update_account_serial(&self, id: i64, serial: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute("UPDATE accounts SET serial = ?2 WHERE id = ?1", params![id, serial])
            .map_err(|e| map_err(e, "update account serial"))?;
        Ok(())
    }

    fn update_account_label_tags(&self, id: i64, label: &str, tags: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE accounts SET label = ?2, tags = ?3 WHERE id = ?1",
            params![id, label, tags],
        )
        .map_err(|e| map_err(e, "update account label/tags"))?;
        Ok(())
    }

    fn set_account_dirty(&self, id: i64, dirty: bool) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE accounts SET is_dirty = ?2 WHERE id = ?1",
            params![id, dirty as i64],
        )
        .map_err(|e| map_err(e, "set account dirty"))?;
        Ok(())
    }

    fn set_account_fingerprint(&self, id: i64, key_hash: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE accounts SET key_hash = ?2 WHERE id = ?1",
            params![id, key_hash],
        )
        .map_err(|e| map_err(e, "set account fingerprint"))?;
        Ok(())
    }

    fn mark_accounts_dirty(&self, ids: &[i64]) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(|e| map_err(e, "begin bulk dirty transaction"))?;
        for id in ids {
            tx.execute("UPDATE accounts SET is_dirty = 1 WHERE id = ?1", params![id])
                .map_err(|e| map_err(e, "mark account dirty"))?;
        }
        tx.commit().map_err(|e| map_err(e, "commit bulk dirty transaction"))?;
        Ok(())
    }

    fn maybe_mark_dirty(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        self.maybe_mark_dirty_with(&conn, id)
    }

    fn account_keys(&self, id: i64) -> Result<AccountKeyBundle> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        self.account_keys_with(&conn, id)
    }

    fn add_public_key(&self, algorithm: &str, key_data: &str, comment: &str, is_global: bool) -> Result<PublicKey> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO public_keys (algorithm, key_data, comment, is_global) VALUES (?1, ?2, ?3, ?4)",
            params![algorithm, key_data, comment, is_global as i64],
        )
        .map_err(|e| map_err(e, "add public key"))?;
        let id = conn.last_insert_rowid();
        Ok(PublicKey {
            id,
            algorithm: algorithm.to_string(),
            key_data: key_data.to_string(),
            comment: comment.to_string(),
            is_global,
            expires_at: None,
        })
    }

    fn delete_public_key(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(|e| map_err(e, "begin delete key transaction"))?;

        let mut stmt = tx
            .prepare("SELECT account_id FROM assignments WHERE public_key_id = ?1")
            .map_err(|e| map_err(e, "prepare affected accounts"))?;
        let affected: Vec<i64> = stmt
            .query_map(params![id], |row| row.get(0))
            .map_err(|e| map_err(e, "query affected accounts"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect affected accounts"))?;
        drop(stmt);

        tx.execute("DELETE FROM assignments WHERE public_key_id = ?1", params![id])
            .map_err(|e| map_err(e, "delete key assignments"))?;
        tx.execute("DELETE FROM public_keys WHERE id = ?1", params![id])
            .map_err(|e| map_err(e, "delete public key"))?;
        for account_id in affected {
            tx.execute("UPDATE accounts SET is_dirty = 1 WHERE id = ?1", params![account_id])
                .map_err(|e| map_err(e, "flag account dirty after key delete"))?;
        }
        tx.commit().map_err(|e| map_err(e, "commit delete key transaction"))?;
        Ok(())
    }

    fn toggle_global(&self, id: i64, is_global: bool) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(|e| map_err(e, "begin toggle global transaction"))?;
        tx.execute(
            "UPDATE public_keys SET is_global = ?2 WHERE id = ?1",
            params![id, is_global as i64],
        )
        .map_err(|e| map_err(e, "toggle global"))?;
        // Global membership changed: every active account's rendered
        // content may have changed, so all of them must be flagged dirty
        // (spec.md §4.C3 toggle-global).
        tx.execute("UPDATE accounts SET is_dirty = 1 WHERE is_active = 1", [])
            .map_err(|e| map_err(e, "flag all active accounts dirty"))?;
        tx.commit().map_err(|e| map_err(e, "commit toggle global transaction"))?;
        Ok(())
    }

    fn set_key_expiry(&self, id: i64, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let as_str = expires_at.map(|d| d.to_rfc3339());
        conn.execute(
            "UPDATE public_keys SET expires_at = ?2 WHERE id = ?1",
            params![id, as_str],
        )
        .map_err(|e| map_err(e, "set key expiry"))?;
        Ok(())
    }

    fn list_public_keys(&self) -> Result<Vec<PublicKey>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT id, algorithm, key_data, comment, is_global, expires_at FROM public_keys")
            .map_err(|e| map_err(e, "prepare list public keys"))?;
        stmt.query_map([], row_to_public_key)
            .map_err(|e| map_err(e, "query public keys"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect public keys"))
    }

    fn list_global_keys(&self) -> Result<Vec<PublicKey>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT id, algorithm, key_data, comment, is_global, expires_at FROM public_keys WHERE is_global = 1")
            .map_err(|e| map_err(e, "prepare list global keys"))?;
        stmt.query_map([], row_to_public_key)
            .map_err(|e| map_err(e, "query global keys"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect global keys"))
    }

    fn list_keys_for_account(&self, account_id: i64) -> Result<Vec<PublicKey>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT pk.id, pk.algorithm, pk.key_data, pk.comment, pk.is_global, pk.expires_at
                 FROM public_keys pk JOIN assignments a ON a.public_key_id = pk.id
                 WHERE a.account_id = ?1",
            )
            .map_err(|e| map_err(e, "prepare list keys for account"))?;
        stmt.query_map(params![account_id], row_to_public_key)
            .map_err(|e| map_err(e, "query keys for account"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect keys for account"))
    }

    fn find_key_by_comment(&self, comment: &str) -> Result<Option<PublicKey>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT id, algorithm, key_data, comment, is_global, expires_at FROM public_keys WHERE comment = ?1",
            params![comment],
            row_to_public_key,
        )
        .optional()
        .map_err(|e| map_err(e, "find key by comment"))
    }

    fn assign(&self, key_id: i64, account_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(|e| map_err(e, "begin assign transaction"))?;
        tx.execute(
            "INSERT OR IGNORE INTO assignments (public_key_id, account_id) VALUES (?1, ?2)",
            params![key_id, account_id],
        )
        .map_err(|e| map_err(e, "assign key"))?;
        tx.execute("UPDATE accounts SET is_dirty = 1 WHERE id = ?1", params![account_id])
            .map_err(|e| map_err(e, "flag account dirty after assign"))?;
        tx.commit().map_err(|e| map_err(e, "commit assign transaction"))?;
        Ok(())
    }

    fn unassign(&self, key_id: i64, account_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(|e| map_err(e, "begin unassign transaction"))?;
        tx.execute(
            "DELETE FROM assignments WHERE public_key_id = ?1 AND account_id = ?2",
            params![key_id, account_id],
        )
        .map_err(|e| map_err(e, "unassign key"))?;
        tx.execute("UPDATE accounts SET is_dirty = 1 WHERE id = ?1", params![account_id])
            .map_err(|e| map_err(e, "flag account dirty after unassign"))?;
        tx.commit().map_err(|e| map_err(e, "commit unassign transaction"))?;
        Ok(())
    }

    fn create_initial_system_key(&self, public_key: &str, private_key: &str) -> Result<SystemKey> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        if self.has_any_system_key_with(&conn)? {
            return Err(ErrorKind::ErrOther("a system key already exists".to_string()).into());
        }
        conn.execute(
            "INSERT INTO system_keys (serial, public_key, private_key, is_active) VALUES (1, ?1, ?2, 1)",
            params![public_key, private_key],
        )
        .map_err(|e| map_err(e, "create initial system key"))?;
        Ok(SystemKey { serial: 1, public_key: public_key.to_string(), private_key: private_key.to_string(), is_active: true })
    }

    fn rotate_system_key(&self, public_key: &str, private_key: &str) -> Result<SystemKey> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.unchecked_transaction().map_err(|e| map_err(e, "begin rotate transaction"))?;
        let max_serial: i64 = tx
            .query_row("SELECT COALESCE(MAX(serial), 0) FROM system_keys", [], |row| row.get(0))
            .map_err(|e| map_err(e, "get max serial"))?;
        let new_serial = max_serial + 1;
        tx.execute("UPDATE system_keys SET is_active = 0", [])
            .map_err(|e| map_err(e, "deactivate old system keys"))?;
        tx.execute(
            "INSERT INTO system_keys (serial, public_key, private_key, is_active) VALUES (?1, ?2, ?3, 1)",
            params![new_serial, public_key, private_key],
        )
        .map_err(|e| map_err(e, "insert rotated system key"))?;
        tx.commit().map_err(|e| map_err(e, "commit rotate transaction"))?;
        Ok(SystemKey { serial: new_serial, public_key: public_key.to_string(), private_key: private_key.to_string(), is_active: true })
    }

    fn get_active_system_key(&self) -> Result<Option<SystemKey>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        self.get_active_system_key_with(&conn)
    }

    fn get_system_key_by_serial(&self, serial: i64) -> Result<Option<SystemKey>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT serial, public_key, private_key, is_active FROM system_keys WHERE serial = ?1",
            params![serial],
            |row| {
                Ok(SystemKey {
                    serial: row.get(0)?,
                    public_key: row.get(1)?,
                    private_key: row.get(2)?,
                    is_active: row.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()
        .map_err(|e| map_err(e, "get system key by serial"))
    }

    fn has_any_system_key(&self) -> Result<bool> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        self.has_any_system_key_with(&conn)
    }

    fn get_known_host(&self, canonical_host_port: &str) -> Result<Option<KnownHostKey>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT canonical_host_port, authorized_keys_line FROM known_hosts WHERE canonical_host_port = ?1",
            params![canonical_host_port],
            |row| Ok(KnownHostKey { canonical_host_port: row.get(0)?, authorized_keys_line: row.get(1)? }),
        )
        .optional()
        .map_err(|e| map_err(e, "get known host"))
    }

    fn add_known_host(&self, canonical_host_port: &str, authorized_keys_line: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO known_hosts (canonical_host_port, authorized_keys_line) VALUES (?1, ?2)
             ON CONFLICT(canonical_host_port) DO UPDATE SET authorized_keys_line = excluded.authorized_keys_line",
            params![canonical_host_port, authorized_keys_line],
        )
        .map_err(|e| map_err(e, "add known host"))?;
        Ok(())
    }

    fn lookup_known_host(&self, canonical_host_port: &str, legacy_host_only: &str) -> Result<Option<KnownHostKey>> {
        if let Some(found) = self.get_known_host(canonical_host_port)? {
            return Ok(Some(found));
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let legacy = conn
            .query_row(
                "SELECT canonical_host_port, authorized_keys_line FROM known_hosts WHERE canonical_host_port = ?1",
                params![legacy_host_only],
                |row| Ok(KnownHostKey { canonical_host_port: row.get(0)?, authorized_keys_line: row.get(1)? }),
            )
            .optional()
            .map_err(|e| map_err(e, "lookup legacy known host"))?;
        if let Some(legacy_entry) = &legacy {
            // Upgrade on read: the next write will use the canonical key.
            conn.execute(
                "INSERT INTO known_hosts (canonical_host_port, authorized_keys_line) VALUES (?1, ?2)
                 ON CONFLICT(canonical_host_port) DO NOTHING",
                params![canonical_host_port, legacy_entry.authorized_keys_line],
            )
            .map_err(|e| map_err(e, "upgrade legacy known host"))?;
        }
        Ok(legacy)
    }

    fn save_bootstrap_session(&self, session: &BootstrapSessionRecord) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO bootstrap_sessions
                (id, username, hostname, label, tags, ephemeral_public_key, created_at, expires_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status",
            params![
                session.id,
                session.pending_account.username,
                session.pending_account.hostname,
                session.pending_account.label,
                session.pending_account.tags,
                session.ephemeral_public_key,
                session.created_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
                session.status.as_str(),
            ],
        )
        .map_err(|e| map_err(e, "save bootstrap session"))?;
        Ok(())
    }

    fn get_bootstrap_session(&self, id: &str) -> Result<Option<BootstrapSessionRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT id, username, hostname, label, tags, ephemeral_public_key, created_at, expires_at, status
             FROM bootstrap_sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .optional()
        .map_err(|e| map_err(e, "get bootstrap session"))
    }

    fn delete_bootstrap_session(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute("DELETE FROM bootstrap_sessions WHERE id = ?1", params![id])
            .map_err(|e| map_err(e, "delete bootstrap session"))?;
        Ok(())
    }

    fn update_bootstrap_status(&self, id: &str, status: BootstrapStatus) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE bootstrap_sessions SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )
        .map_err(|e| map_err(e, "update bootstrap status"))?;
        Ok(())
    }

    fn list_expired_bootstrap_sessions(&self, now: DateTime<Utc>) -> Result<Vec<BootstrapSessionRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, username, hostname, label, tags, ephemeral_public_key, created_at, expires_at, status
                 FROM bootstrap_sessions WHERE status = 'active' AND expires_at < ?1",
            )
            .map_err(|e| map_err(e, "prepare expired sessions"))?;
        stmt.query_map(params![now.to_rfc3339()], row_to_session)
            .map_err(|e| map_err(e, "query expired sessions"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect expired sessions"))
    }

    fn list_orphaned_bootstrap_sessions(&self) -> Result<Vec<BootstrapSessionRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, username, hostname, label, tags, ephemeral_public_key, created_at, expires_at, status
                 FROM bootstrap_sessions WHERE status = 'orphaned'",
            )
            .map_err(|e| map_err(e, "prepare orphaned sessions"))?;
        stmt.query_map([], row_to_session)
            .map_err(|e| map_err(e, "query orphaned sessions"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect orphaned sessions"))
    }

    fn list_active_bootstrap_sessions(&self) -> Result<Vec<BootstrapSessionRecord>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, username, hostname, label, tags, ephemeral_public_key, created_at, expires_at, status
                 FROM bootstrap_sessions WHERE status = 'active'",
            )
            .map_err(|e| map_err(e, "prepare active sessions"))?;
        stmt.query_map([], row_to_session)
            .map_err(|e| map_err(e, "query active sessions"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_err(e, "collect active sessions"))
    }

    fn append_audit_log(&self, actor: &str, action: &str, details: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO audit_log (timestamp, actor, action, details) VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), actor, action, details],
        )
        .map_err(|e| map_err(e, "append audit log"))?;
        Ok(())
    }

    fn list_audit_log(&self) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT timestamp, actor, action, details FROM audit_log ORDER BY timestamp ASC")
            .map_err(|e| map_err(e, "prepare audit log"))?;
        stmt.query_map([], |row| {
            let ts: String = row.get(0)?;
            Ok(AuditLogEntry {
                timestamp: DateTime::parse_from_rfc3339(&ts).unwrap_or_else(|_| Utc::now().into()).with_timezone(&Utc),
                actor: row.get(1)?,
                action: row.get(2)?,
                details: row.get(3)?,
            })
        })
        .map_err(|e| map_err(e, "query audit log"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| map_err(e, "collect audit log"))
    }
}

impl SqliteStore {
    fn has_any_system_key_with(&self, conn: &Connection) -> Result<bool> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM system_keys", [], |row| row.get(0))
            .map_err(|e| map_err(e, "count system keys"))?;
        Ok(count > 0)
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<BootstrapSessionRecord> {
    let created_at: String = row.get(6)?;
    let expires_at: String = row.get(7)?;
    let status: String = row.get(8)?;
    Ok(BootstrapSessionRecord {
        id: row.get(0)?,
        pending_account: PendingAccount {
            username: row.get(1)?,
            hostname: row.get(2)?,
            label: row.get(3)?,
            tags: row.get(4)?,
        },
        ephemeral_public_key: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_at).unwrap_or_else(|_| Utc::now().into()).with_timezone(&Utc),
        expires_at: DateTime::parse_from_rfc3339(&expires_at).unwrap_or_else(|_| Utc::now().into()).with_timezone(&Utc),
        status: match status.as_str() {
            "active" => BootstrapStatus::Active,
            "completed" => BootstrapStatus::Completed,
            "failed" => BootstrapStatus::Failed,
            _ => BootstrapStatus::Orphaned,
        },
    })
}
