//! C6: bootstrap session manager (spec.md §4.C6).
//!
//! The ephemeral private key never touches the store (spec.md §3:
//! "temp_keypair ... held only in memory") — it lives only in the
//! process-wide [`SESSIONS`] table below, the same
//! const-initializable-`Mutex` pattern [`crate::passphrase`] uses for the
//! other process-wide secret, and is zeroized on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use zeroize::Zeroize;

use crate::deploy::Connector;
use crate::engine::known_host_for;
use crate::error::ErrorKind;
use crate::model::{BootstrapSessionRecord, BootstrapStatus, PendingAccount};
use crate::store::Store;
use crate::Result;

pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: i64 = 15 * 60;
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct EphemeralSession {
    private_key_openssh: String,
}

impl Drop for EphemeralSession {
    fn drop(&mut self) {
        self.private_key_openssh.zeroize();
    }
}

static SESSIONS: Mutex<Option<HashMap<String, EphemeralSession>>> = Mutex::new(None);
static SIGNAL_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

fn with_sessions<R>(f: impl FnOnce(&mut HashMap<String, EphemeralSession>) -> R) -> R {
    let mut guard = SESSIONS.lock().expect("bootstrap session table mutex poisoned");
    let map = guard.get_or_insert_with(HashMap::new);
    f(map)
}

fn wipe_session(session_id: &str) {
    with_sessions(|sessions| {
        sessions.remove(session_id);
    });
}

fn generate_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Install-once guard for the process's SIGINT/SIGTERM handler (spec.md
/// §5: "the in-memory signal-handler-installed flag is set at most
/// once"). Returns `true` the first time it's called in this process,
/// `false` on every call after. The signal plumbing itself (the `ctrlc`
/// registration) lives in the CLI binary; this only guards against
/// installing it twice.
pub fn mark_signal_handler_installed() -> bool {
    SIGNAL_HANDLER_INSTALLED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
}

pub struct NewSessionResult {
    pub session_id: String,
    pub ephemeral_public_key: String,
    pub expires_at: DateTime<Utc>,
}

/// spec.md §4.C6 steps 1-2: generate the ephemeral keypair, register the
/// session in the store and in the in-process table. Rejects a second
/// concurrent session for the same `(username, hostname)` (spec.md §3
/// BootstrapSession invariant).
pub fn new_session(store: &dyn Store, pending: PendingAccount, timeout_secs: i64, now: DateTime<Utc>) -> Result<NewSessionResult> {
    if store
        .list_active_bootstrap_sessions()?
        .iter()
        .any(|s| s.pending_account.username == pending.username && s.pending_account.hostname == pending.hostname)
    {
        return Err(ErrorKind::ErrDuplicate(format!("bootstrap session already active for {}@{}", pending.username, pending.hostname)).into());
    }

    let keypair = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| ErrorKind::ErrOther(format!("failed to generate ephemeral bootstrap keypair: {}", e)))?;
    let public_line = format!(
        "{} keymaster-bootstrap",
        keypair.public_key().to_openssh().map_err(|e| ErrorKind::ErrOther(format!("failed to encode ephemeral public key: {}", e)))?.trim()
    );
    let private_openssh = keypair
        .to_openssh(LineEnding::LF)
        .map_err(|e| ErrorKind::ErrOther(format!("failed to encode ephemeral private key: {}", e)))?
        .to_string();

    let id = generate_session_id();
    let record = BootstrapSessionRecord {
        id: id.clone(),
        pending_account: pending,
        ephemeral_public_key: public_line.clone(),
        created_at: now,
        expires_at: now + chrono::Duration::seconds(timeout_secs),
        status: BootstrapStatus::Active,
    };

    store.save_bootstrap_session(&record)?;
    with_sessions(|sessions| {
        sessions.insert(id.clone(), EphemeralSession { private_key_openssh: private_openssh });
    });
    store.append_audit_log(
        "system",
        "BOOTSTRAP_START",
        &format!("session {} for {}@{}", id, record.pending_account.username, record.pending_account.hostname),
    )?;

    Ok(NewSessionResult { session_id: id, ephemeral_public_key: public_line, expires_at: record.expires_at })
}

/// spec.md §4.C6 steps 4-8. The operator has already deposited the
/// ephemeral public key on the host and confirmed its fingerprint; this
/// takes that confirmed host key plus the set of existing `PublicKey`
/// ids to assign, connects with the ephemeral key, deploys, and persists
/// the new account. On any failure the session transitions to `Failed`,
/// remote/private-key cleanup runs, and a partially-created account is
/// rolled back.
pub fn perform_bootstrap(
    store: &dyn Store,
    connector: &dyn Connector,
    session_id: &str,
    confirmed_host_key: &str,
    selected_key_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<i64> {
    let record = store
        .get_bootstrap_session(session_id)?
        .ok_or_else(|| ErrorKind::ErrNotFound(format!("bootstrap session {}", session_id)))?;

    if record.status != BootstrapStatus::Active {
        return Err(ErrorKind::ErrBootstrapExpired(session_id.to_string()).into());
    }
    if now > record.expires_at {
        store.update_bootstrap_status(session_id, BootstrapStatus::Failed)?;
        wipe_session(session_id);
        return Err(ErrorKind::ErrBootstrapExpired(session_id.to_string()).into());
    }

    let private_key = with_sessions(|sessions| sessions.get(session_id).map(|s| s.private_key_openssh.clone()))
        .ok_or_else(|| ErrorKind::ErrOther(format!("ephemeral key for session {} is no longer available", session_id)))?;

    let outcome = perform_bootstrap_inner(store, connector, &record, &private_key, confirmed_host_key, selected_key_ids, now);

    match outcome {
        Ok(account_id) => {
            store.update_bootstrap_status(session_id, BootstrapStatus::Completed)?;
            let _ = remove_ephemeral_line(connector, &record.pending_account.hostname, &record.pending_account.username, &private_key, confirmed_host_key, &record.ephemeral_public_key);
            wipe_session(session_id);
            store.append_audit_log("system", "BOOTSTRAP_COMPLETE", &format!("session {} enrolled account {}", session_id, account_id))?;
            Ok(account_id)
        }
        Err(e) => {
            store.update_bootstrap_status(session_id, BootstrapStatus::Failed)?;
            cleanup_failed_session(store, connector, &record, &private_key, confirmed_host_key);
            wipe_session(session_id);
            store.append_audit_log("system", "BOOTSTRAP_FAILED", &format!("session {}: {}", session_id, e))?;
            Err(e)
        }
    }
}

fn perform_bootstrap_inner(
    store: &dyn Store,
    connector: &dyn Connector,
    record: &BootstrapSessionRecord,
    private_key: &str,
    confirmed_host_key: &str,
    selected_key_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<i64> {
    let pa = &record.pending_account;
    let canonical = crate::host::canonicalize_host_port(&pa.hostname);
    store.add_known_host(&canonical, confirmed_host_key)?;

    let active_key = store.get_active_system_key()?.ok_or(ErrorKind::ErrNoActiveSystemKey)?;
    let all_keys = store.list_public_keys()?;
    let globals: Vec<_> = all_keys.iter().filter(|k| k.is_global).cloned().collect();
    let selected: Vec<_> = all_keys.iter().filter(|k| selected_key_ids.contains(&k.id)).cloned().collect();
    let content = crate::builder::build(Some(&active_key), &globals, &selected, now)?;

    let mut session = connector.connect(&pa.hostname, &pa.username, private_key, confirmed_host_key)?;
    session.deploy_authorized_keys(&content)?;
    session.close().ok();

    let account_id = store.add_account(&pa.username, &pa.hostname, &pa.label, &pa.tags)?;
    let finish: Result<()> = (|| {
        store.update_account_serial(account_id, active_key.serial)?;
        for id in selected_key_ids {
            store.assign(*id, account_id)?;
        }
        store.set_account_fingerprint(account_id, &crate::fingerprint::fingerprint(&content))?;
        store.set_account_dirty(account_id, false)?;
        Ok(())
    })();

    if let Err(e) = finish {
        let _ = store.delete_account(account_id);
        return Err(e);
    }

    Ok(account_id)
}

/// Best-effort: read the remote file, drop any line exactly equal (after
/// trim) to `ephemeral_line`, and redeploy if that changed anything. A
/// line-equality filter, not a regex, per spec.md §4.C6 ("avoids
/// accidental removal of similar lines").
fn remove_ephemeral_line(connector: &dyn Connector, hostname: &str, username: &str, private_key: &str, host_key: &str, ephemeral_line: &str) -> Result<()> {
    let mut session = connector.connect(hostname, username, private_key, host_key)?;
    let content = session.get_authorized_keys()?.unwrap_or_default();
    let filtered: String = content.lines().filter(|l| l.trim() != ephemeral_line.trim()).map(|l| format!("{}\n", l)).collect();
    if filtered != content {
        session.deploy_authorized_keys(&filtered)?;
    }
    session.close().ok();
    Ok(())
}

fn cleanup_failed_session(store: &dyn Store, connector: &dyn Connector, record: &BootstrapSessionRecord, private_key: &str, host_key: &str) {
    let pa = &record.pending_account;
    if let Err(e) = remove_ephemeral_line(connector, &pa.hostname, &pa.username, private_key, host_key, &record.ephemeral_public_key) {
        let _ = store.append_audit_log("system", "BOOTSTRAP_FAILED", &format!("remote cleanup for session {} failed: {}", record.id, e));
    }
}

/// spec.md §4.C6 "RecoverFromCrash": every session left `Active` by a
/// previous process (the store has no way to tell "stale" from "just
/// created a moment ago", so all of them qualify) is orphaned, then its
/// record is deleted and `BOOTSTRAP_FAILED` is logged. Remote cleanup is
/// skipped — the ephemeral private key died with the old process.
pub fn recover_from_crash(store: &dyn Store) -> Result<usize> {
    let active = store.list_active_bootstrap_sessions()?;
    let count = active.len();
    for session in &active {
        store.update_bootstrap_status(&session.id, BootstrapStatus::Orphaned)?;
    }
    for orphaned in store.list_orphaned_bootstrap_sessions()? {
        store.append_audit_log(
            "system",
            "BOOTSTRAP_FAILED",
            &format!("session {} for {}@{} orphaned by crash recovery", orphaned.id, orphaned.pending_account.username, orphaned.pending_account.hostname),
        )?;
        store.delete_bootstrap_session(&orphaned.id)?;
        wipe_session(&orphaned.id);
    }
    Ok(count)
}

/// spec.md §4.C6 "Reaper": transition every session past `expires_at`
/// (and still `Active`) to `Failed`.
pub fn reap_expired_sessions(store: &dyn Store, now: DateTime<Utc>) -> Result<usize> {
    let expired = store.list_expired_bootstrap_sessions(now)?;
    let count = expired.len();
    for session in expired {
        store.update_bootstrap_status(&session.id, BootstrapStatus::Failed)?;
        store.append_audit_log(
            "system",
            "BOOTSTRAP_FAILED",
            &format!("session {} for {}@{} expired", session.id, session.pending_account.username, session.pending_account.hostname),
        )?;
        wipe_session(&session.id);
    }
    Ok(count)
}

/// A running reaper background thread; dropping this without calling
/// [`ReaperHandle::stop`] leaves the thread running until process exit.
pub struct ReaperHandle {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// spec.md §4.C6 "StartSessionReaper": spawn a background thread that
/// calls [`reap_expired_sessions`] every `interval` until stopped.
pub fn start_session_reaper(store: Arc<dyn Store>, interval: Duration) -> ReaperHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = Arc::clone(&stop);
    let join = thread::spawn(move || {
        let tick = Duration::from_millis(200).min(interval);
        let mut elapsed = Duration::from_secs(0);
        while !stop_for_thread.load(Ordering::SeqCst) {
            thread::sleep(tick);
            elapsed += tick;
            if elapsed >= interval {
                elapsed = Duration::from_secs(0);
                if let Err(e) = reap_expired_sessions(store.as_ref(), Utc::now()) {
                    log::warn!("bootstrap session reaper tick failed: {}", e);
                }
            }
        }
    });
    ReaperHandle { stop, join: Some(join) }
}

/// spec.md §5 "signal handling": terminate every session still live in
/// this process's in-memory table. Attempts remote cleanup using the
/// known host key on file (the confirmed host key isn't retained once
/// `new_session` returns, so this falls back to the store's copy), wipes
/// the private key regardless, and marks the session `Failed`.
pub fn cleanup_all_sessions_on_signal(store: &dyn Store, connector: &dyn Connector) {
    let ids: Vec<String> = with_sessions(|sessions| sessions.keys().cloned().collect());
    for id in ids {
        if let Ok(Some(record)) = store.get_bootstrap_session(&id) {
            if record.status == BootstrapStatus::Active {
                let private_key = with_sessions(|sessions| sessions.get(&id).map(|s| s.private_key_openssh.clone()));
                if let Some(pk) = private_key {
                    if let Ok(known_host) = known_host_for(store, &record.pending_account.hostname) {
                        if let Err(e) = remove_ephemeral_line(connector, &record.pending_account.hostname, &record.pending_account.username, &pk, &known_host.authorized_keys_line, &record.ephemeral_public_key) {
                            let _ = store.append_audit_log("system", "BOOTSTRAP_FAILED", &format!("signal cleanup for session {} failed: {}", id, e));
                        }
                    }
                }
                let _ = store.update_bootstrap_status(&id, BootstrapStatus::Failed);
                let _ = store.append_audit_log("system", "BOOTSTRAP_FAILED", &format!("session {} terminated by signal", id));
            }
        }
        wipe_session(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::fake::{FakeConnector, FakeRemoteFs};
    use crate::store::memory::InMemoryStore;

    fn setup() -> (InMemoryStore, FakeConnector) {
        let store = InMemoryStore::new();
        store.create_initial_system_key("ssh-ed25519 SYSPUB sys", "PEM").unwrap();
        let connector = FakeConnector::new(FakeRemoteFs::new());
        (store, connector)
    }

    fn pending(username: &str, hostname: &str) -> PendingAccount {
        PendingAccount { username: username.to_string(), hostname: hostname.to_string(), label: "".to_string(), tags: "".to_string() }
    }

    #[test]
    fn new_session_registers_and_persists() {
        let (store, _connector) = setup();
        let now = Utc::now();
        let result = new_session(&store, pending("alice", "host.test"), DEFAULT_BOOTSTRAP_TIMEOUT_SECS, now).unwrap();
        assert!(result.ephemeral_public_key.starts_with("ssh-ed25519 "));
        assert!(store.get_bootstrap_session(&result.session_id).unwrap().is_some());
        wipe_session(&result.session_id);
    }

    #[test]
    fn duplicate_active_session_for_same_target_is_rejected() {
        let (store, _connector) = setup();
        let now = Utc::now();
        let first = new_session(&store, pending("alice", "host.test"), DEFAULT_BOOTSTRAP_TIMEOUT_SECS, now).unwrap();
        let err = new_session(&store, pending("alice", "host.test"), DEFAULT_BOOTSTRAP_TIMEOUT_SECS, now).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        wipe_session(&first.session_id);
    }

    #[test]
    fn successful_bootstrap_creates_account_and_completes_session() {
        let (store, connector) = setup();
        connector.set_host_key("host.test", "ssh-ed25519 HOSTKEY host.test");
        let now = Utc::now();
        let session = new_session(&store, pending("alice", "host.test"), DEFAULT_BOOTSTRAP_TIMEOUT_SECS, now).unwrap();

        let key = store.add_public_key("ssh-ed25519", "DATA1", "alice-key", false).unwrap();
        let account_id = perform_bootstrap(&store, &connector, &session.session_id, "ssh-ed25519 HOSTKEY host.test", &[key.id], now).unwrap();

        let account = store.get_account(account_id).unwrap();
        assert_eq!(account.username, "alice");
        assert!(!account.is_dirty);
        assert!(!account.key_hash.is_empty());

        let session_record = store.get_bootstrap_session(&session.session_id).unwrap().unwrap();
        assert_eq!(session_record.status, BootstrapStatus::Completed);
    }

    #[test]
    fn failed_deploy_rolls_back_and_marks_session_failed() {
        let (store, connector) = setup();
        let now = Utc::now();
        let session = new_session(&store, pending("bob", "host.test"), DEFAULT_BOOTSTRAP_TIMEOUT_SECS, now).unwrap();

        *connector.fail_next_connect.lock().unwrap() = Some("host unreachable".to_string());
        let err = perform_bootstrap(&store, &connector, &session.session_id, "ssh-ed25519 HOSTKEY host.test", &[], now);
        assert!(err.is_err());

        assert!(store.list_accounts().unwrap().is_empty());
        let session_record = store.get_bootstrap_session(&session.session_id).unwrap().unwrap();
        assert_eq!(session_record.status, BootstrapStatus::Failed);
    }

    #[test]
    fn recover_from_crash_orphans_and_deletes_every_active_session() {
        let (store, _connector) = setup();
        let now = Utc::now();
        let a = new_session(&store, pending("alice", "host.test"), DEFAULT_BOOTSTRAP_TIMEOUT_SECS, now).unwrap();
        let b = new_session(&store, pending("bob", "other.test"), DEFAULT_BOOTSTRAP_TIMEOUT_SECS, now).unwrap();

        let recovered = recover_from_crash(&store).unwrap();
        assert_eq!(recovered, 2);
        assert!(store.get_bootstrap_session(&a.session_id).unwrap().is_none());
        assert!(store.get_bootstrap_session(&b.session_id).unwrap().is_none());

        let log = store.list_audit_log().unwrap();
        assert_eq!(log.iter().filter(|e| e.action == "BOOTSTRAP_FAILED").count(), 2);
    }

    #[test]
    fn reaper_fails_only_expired_sessions() {
        let (store, _connector) = setup();
        let now = Utc::now();
        let expiring_soon = new_session(&store, pending("alice", "host.test"), 1, now).unwrap();
        let long_lived = new_session(&store, pending("bob", "other.test"), DEFAULT_BOOTSTRAP_TIMEOUT_SECS, now).unwrap();

        let later = now + chrono::Duration::seconds(5);
        let reaped = reap_expired_sessions(&store, later).unwrap();
        assert_eq!(reaped, 1);

        assert_eq!(store.get_bootstrap_session(&expiring_soon.session_id).unwrap().unwrap().status, BootstrapStatus::Failed);
        assert_eq!(store.get_bootstrap_session(&long_lived.session_id).unwrap().unwrap().status, BootstrapStatus::Active);
        wipe_session(&long_lived.session_id);
    }
}
