//! In-memory `Store` test double, used by the engine tests (C8-C11) the
//! same way the teacher uses `mockito` to stand in for a real HTTP
//! backend — a deterministic double for the one external dependency
//! those tests would otherwise need.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::ErrorKind;
use crate::model::*;
use crate::store::{AccountKeyBundle, Store};
use crate::Result;

#[derive(Default)]
struct Inner {
    next_account_id: i64,
    next_key_id: i64,
    accounts: HashMap<i64, Account>,
    public_keys: HashMap<i64, PublicKey>,
    assignments: Vec<(i64, i64)>,
    system_keys: HashMap<i64, SystemKey>,
    known_hosts: HashMap<String, KnownHostKey>,
    sessions: HashMap<String, BootstrapSessionRecord>,
    audit_log: Vec<AuditLogEntry>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore { inner: Mutex::new(Inner::default()) }
    }

    fn fingerprint_for(&self, inner: &Inner, account_id: i64) -> Result<String> {
        let active = inner.system_keys.values().find(|k| k.is_active).cloned();
        let system_key = match active {
            Some(k) => k,
            None => return Ok(String::new()),
        };
        let global_keys: Vec<PublicKey> = inner.public_keys.values().filter(|k| k.is_global).cloned().collect();
        let account_keys: Vec<PublicKey> = inner
            .assignments
            .iter()
            .filter(|(_, aid)| *aid == account_id)
            .filter_map(|(kid, _)| inner.public_keys.get(kid).cloned())
            .collect();
        let rendered = crate::builder::build(Some(&system_key), &global_keys, &account_keys, Utc::now())?;
        Ok(crate::fingerprint::fingerprint(&rendered))
    }
}

impl Store for InMemoryStore {
    fn add_account(&self, username: &str, hostname: &str, label: &str, tags: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.accounts.values().any(|a| a.username == username && a.hostname == hostname) {
            return Err(ErrorKind::ErrDuplicate(format!("{}@{}", username, hostname)).into());
        }
        inner.next_account_id += 1;
        let id = inner.next_account_id;
        inner.accounts.insert(id, Account {
            id, username: username.to_string(), hostname: hostname.to_string(),
            label: label.to_string(), tags: tags.to_string(),
            serial: 0, is_active: true, is_dirty: false, key_hash: String::new(),
        });
        Ok(id)
    }

    fn delete_account(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.assignments.retain(|(_, aid)| *aid != id);
        inner.accounts.remove(&id).ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)))?;
        Ok(())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.inner.lock().unwrap().accounts.values().cloned().collect())
    }

    fn list_active_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.inner.lock().unwrap().accounts.values().filter(|a| a.is_active).cloned().collect())
    }

    fn get_account(&self, id: i64) -> Result<Account> {
        self.inner.lock().unwrap().accounts.get(&id).cloned()
            .ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)).into())
    }

    fn toggle_account_active(&self, id: i64, active: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let a = inner.accounts.get_mut(&id).ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)))?;
        a.is_active = active;
        Ok(())
    }

    fn update_account_serial(&self, id: i64, serial: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let a = inner.accounts.get_mut(&id).ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)))?;
        a.serial = serial;
        Ok(())
    }

    fn update_account_label_tags(&self, id: i64, label: &str, tags: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let a = inner.accounts.get_mut(&id).ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)))?;
        a.label = label.to_string();
        a.tags = tags.to_string();
        Ok(())
    }

    fn set_account_dirty(&self, id: i64, dirty: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let a = inner.accounts.get_mut(&id).ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)))?;
        a.is_dirty = dirty;
        Ok(())
    }

    fn set_account_fingerprint(&self, id: i64, key_hash: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let a = inner.accounts.get_mut(&id).ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)))?;
        a.key_hash = key_hash.to_string();
        Ok(())
    }

    fn mark_accounts_dirty(&self, ids: &[i64]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            if let Some(a) = inner.accounts.get_mut(id) {
                a.is_dirty = true;
            }
        }
        Ok(())
    }

    fn maybe_mark_dirty(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let new_hash = self.fingerprint_for(&inner, id)?;
        let current = inner.accounts.get(&id).ok_or_else(|| ErrorKind::ErrNotFound(format!("account {}", id)))?.key_hash.clone();
        if new_hash != current {
            inner.accounts.get_mut(&id).unwrap().is_dirty = true;
        }
        Ok(())
    }

    fn account_keys(&self, id: i64) -> Result<AccountKeyBundle> {
        let inner = self.inner.lock().unwrap();
        let global_keys = inner.public_keys.values().filter(|k| k.is_global).cloned().collect();
        let account_keys = inner.assignments.iter()
            .filter(|(_, aid)| *aid == id)
            .filter_map(|(kid, _)| inner.public_keys.get(kid).cloned())
            .collect();
        Ok(AccountKeyBundle { global_keys, account_keys })
    }

    fn add_public_key(&self, algorithm: &str, key_data: &str, comment: &str, is_global: bool) -> Result<PublicKey> {
        let mut inner = self.inner.lock().unwrap();
        if inner.public_keys.values().any(|k| k.comment == comment) {
            return Err(ErrorKind::ErrDuplicate(comment.to_string()).into());
        }
        inner.next_key_id += 1;
        let id = inner.next_key_id;
        let key = PublicKey { id, algorithm: algorithm.to_string(), key_data: key_data.to_string(), comment: comment.to_string(), is_global, expires_at: None };
        inner.public_keys.insert(id, key.clone());
        Ok(key)
    }

    fn delete_public_key(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let affected: Vec<i64> = inner.assignments.iter().filter(|(kid, _)| *kid == id).map(|(_, aid)| *aid).collect();
        inner.assignments.retain(|(kid, _)| *kid != id);
        inner.public_keys.remove(&id);
        for aid in affected {
            if let Some(a) = inner.accounts.get_mut(&aid) {
                a.is_dirty = true;
            }
        }
        Ok(())
    }

    fn toggle_global(&self, id: i64, is_global: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(k) = inner.public_keys.get_mut(&id) {
            k.is_global = is_global;
        }
        for a in inner.accounts.values_mut() {
            if a.is_active {
                a.is_dirty = true;
            }
        }
        Ok(())
    }

    fn set_key_expiry(&self, id: i64, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(k) = inner.public_keys.get_mut(&id) {
            k.expires_at = expires_at;
        }
        Ok(())
    }

    fn list_public_keys(&self) -> Result<Vec<PublicKey>> {
        Ok(self.inner.lock().unwrap().public_keys.values().cloned().collect())
    }

    fn list_global_keys(&self) -> Result<Vec<PublicKey>> {
        Ok(self.inner.lock().unwrap().public_keys.values().filter(|k| k.is_global).cloned().collect())
    }

    fn list_keys_for_account(&self, account_id: i64) -> Result<Vec<PublicKey>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.assignments.iter().filter(|(_, aid)| *aid == account_id)
            .filter_map(|(kid, _)| inner.public_keys.get(kid).cloned()).collect())
    }

    fn find_key_by_comment(&self, comment: &str) -> Result<Option<PublicKey>> {
        Ok(self.inner.lock().unwrap().public_keys.values().find(|k| k.comment == comment).cloned())
    }

    fn assign(&self, key_id: i64, account_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.assignments.contains(&(key_id, account_id)) {
            inner.assignments.push((key_id, account_id));
        }
        if let Some(a) = inner.accounts.get_mut(&account_id) {
            a.is_dirty = true;
        }
        Ok(())
    }

    fn unassign(&self, key_id: i64, account_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.assignments.retain(|p| *p != (key_id, account_id));
        if let Some(a) = inner.accounts.get_mut(&account_id) {
            a.is_dirty = true;
        }
        Ok(())
    }

    fn create_initial_system_key(&self, public_key: &str, private_key: &str) -> Result<SystemKey> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.system_keys.is_empty() {
            return Err(ErrorKind::ErrOther("a system key already exists".to_string()).into());
        }
        let key = SystemKey { serial: 1, public_key: public_key.to_string(), private_key: private_key.to_string(), is_active: true };
        inner.system_keys.insert(1, key.clone());
        Ok(key)
    }

    fn rotate_system_key(&self, public_key: &str, private_key: &str) -> Result<SystemKey> {
        let mut inner = self.inner.lock().unwrap();
        let next = inner.system_keys.keys().max().copied().unwrap_or(0) + 1;
        for k in inner.system_keys.values_mut() {
            k.is_active = false;
        }
        let key = SystemKey { serial: next, public_key: public_key.to_string(), private_key: private_key.to_string(), is_active: true };
        inner.system_keys.insert(next, key.clone());
        Ok(key)
    }

    fn get_active_system_key(&self) -> Result<Option<SystemKey>> {
        Ok(self.inner.lock().unwrap().system_keys.values().find(|k| k.is_active).cloned())
    }

    fn get_system_key_by_serial(&self, serial: i64) -> Result<Option<SystemKey>> {
        Ok(self.inner.lock().unwrap().system_keys.get(&serial).cloned())
    }

    fn has_any_system_key(&self) -> Result<bool> {
        Ok(!self.inner.lock().unwrap().system_keys.is_empty())
    }

    fn get_known_host(&self, canonical_host_port: &str) -> Result<Option<KnownHostKey>> {
        Ok(self.inner.lock().unwrap().known_hosts.get(canonical_host_port).cloned())
    }

    fn add_known_host(&self, canonical_host_port: &str, authorized_keys_line: &str) -> Result<()> {
        self.inner.lock().unwrap().known_hosts.insert(
            canonical_host_port.to_string(),
            KnownHostKey { canonical_host_port: canonical_host_port.to_string(), authorized_keys_line: authorized_keys_line.to_string() },
        );
        Ok(())
    }

    fn lookup_known_host(&self, canonical_host_port: &str, legacy_host_only: &str) -> Result<Option<KnownHostKey>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(found) = inner.known_hosts.get(canonical_host_port).cloned() {
            return Ok(Some(found));
        }
        if let Some(legacy) = inner.known_hosts.get(legacy_host_only).cloned() {
            inner.known_hosts.entry(canonical_host_port.to_string()).or_insert_with(|| KnownHostKey {
                canonical_host_port: canonical_host_port.to_string(),
                authorized_keys_line: legacy.authorized_keys_line.clone(),
            });
            return Ok(Some(legacy));
        }
        Ok(None)
    }

    fn save_bootstrap_session(&self, session: &BootstrapSessionRecord) -> Result<()> {
        self.inner.lock().unwrap().sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn get_bootstrap_session(&self, id: &str) -> Result<Option<BootstrapSessionRecord>> {
        Ok(self.inner.lock().unwrap().sessions.get(id).cloned())
    }

    fn delete_bootstrap_session(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().sessions.remove(id);
        Ok(())
    }

    fn update_bootstrap_status(&self, id: &str, status: BootstrapStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.sessions.get_mut(id) {
            s.status = status;
        }
        Ok(())
    }

    fn list_expired_bootstrap_sessions(&self, now: DateTime<Utc>) -> Result<Vec<BootstrapSessionRecord>> {
        Ok(self.inner.lock().unwrap().sessions.values()
            .filter(|s| s.status == BootstrapStatus::Active && now > s.expires_at)
            .cloned().collect())
    }

    fn list_orphaned_bootstrap_sessions(&self) -> Result<Vec<BootstrapSessionRecord>> {
        Ok(self.inner.lock().unwrap().sessions.values()
            .filter(|s| s.status == BootstrapStatus::Orphaned)
            .cloned().collect())
    }

    fn list_active_bootstrap_sessions(&self) -> Result<Vec<BootstrapSessionRecord>> {
        Ok(self.inner.lock().unwrap().sessions.values()
            .filter(|s| s.status == BootstrapStatus::Active)
            .cloned().collect())
    }

    fn append_audit_log(&self, actor: &str, action: &str, details: &str) -> Result<()> {
        self.inner.lock().unwrap().audit_log.push(AuditLogEntry {
            timestamp: Utc::now(), actor: actor.to_string(), action: action.to_string(), details: details.to_string(),
        });
        Ok(())
    }

    fn list_audit_log(&self) -> Result<Vec<AuditLogEntry>> {
        Ok(self.inner.lock().unwrap().audit_log.clone())
    }
}
