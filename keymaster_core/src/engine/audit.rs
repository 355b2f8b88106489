//! C9: the audit engine (spec.md §4.C9).

use chrono::{DateTime, Utc};

use crate::deploy::Connector;
use crate::engine::{known_host_for, resolve_keys};
use crate::error::ErrorKind;
use crate::model::{Account, SystemKey};
use crate::store::Store;
use crate::Result;

/// Classification of a strict-audit mismatch (spec.md §4.C9). When more
/// than one applies, `Critical` wins over `Warning` wins over `Info`
/// (SPEC_FULL.md §12, resolving the precedence spec.md leaves implicit in
/// the order it lists them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftClass {
    Critical,
    Warning,
    Info,
}

/// Fast drift check: connect, read the remote file, compare only the
/// header's serial to the account's recorded serial. Does not detect
/// content drift and never touches the store.
pub fn audit_account_serial(store: &dyn Store, connector: &dyn Connector, account: &Account) -> Result<()> {
    let (connect_key, _active_key) = resolve_keys(store, account)?;
    let known_host = known_host_for(store, &account.hostname)?;

    let mut session = connector.connect(&account.hostname, &account.username, &connect_key.private_key, &known_host.authorized_keys_line)?;
    let remote = session.get_authorized_keys()?.unwrap_or_default();
    session.close().ok();

    let normalized = crate::fingerprint::normalize(&remote);
    let first_line = normalized.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let remote_serial = crate::keys::parse_serial(first_line)?;

    if remote_serial != account.serial {
        return Err(ErrorKind::ErrDriftSerial(account.id, remote_serial, account.serial).into());
    }
    Ok(())
}

/// Full drift check: connect, read the remote file, render the expected
/// content and compare byte-for-byte (after the shared normalizer). On
/// mismatch, classifies the drift, records `AUDIT_HASH_MISMATCH` with
/// both fingerprints, and marks the account dirty. A matching audit
/// touches neither the log nor the dirty flag (spec.md testable property
/// #6).
pub fn audit_account_strict(store: &dyn Store, connector: &dyn Connector, account: &Account, now: DateTime<Utc>) -> Result<()> {
    let (connect_key, active_key) = resolve_keys(store, account)?;
    let known_host = known_host_for(store, &account.hostname)?;

    let mut session = connector.connect(&account.hostname, &account.username, &connect_key.private_key, &known_host.authorized_keys_line)?;
    let remote = session.get_authorized_keys()?.unwrap_or_default();
    session.close().ok();

    let bundle = store.account_keys(account.id)?;
    let expected = crate::builder::build(Some(&active_key), &bundle.global_keys, &bundle.account_keys, now)?;

    let remote_norm = crate::fingerprint::normalize(&remote);
    let expected_norm = crate::fingerprint::normalize(&expected);

    if remote_norm == expected_norm {
        return Ok(());
    }

    let class = classify_drift(&remote_norm, &expected_norm, account, &active_key);
    let remote_fp = crate::fingerprint::fingerprint(&remote);
    let expected_fp = crate::fingerprint::fingerprint(&expected);

    store.append_audit_log(
        "system",
        "AUDIT_HASH_MISMATCH",
        &format!(
            "account {} ({}@{}): class={:?} remote={} expected={}",
            account.id, account.username, account.hostname, class, remote_fp, expected_fp
        ),
    )?;
    store.set_account_dirty(account.id, true)?;

    Err(ErrorKind::ErrDriftContent(account.id).into())
}

fn classify_drift(remote_norm: &str, expected_norm: &str, account: &Account, active_key: &SystemKey) -> DriftClass {
    let remote_lines: Vec<&str> = remote_norm.lines().collect();
    let header_serial = remote_lines.first().and_then(|l| crate::keys::parse_serial(l).ok());
    let header_bad = header_serial != Some(account.serial);

    let restricted_line = format!(
        "command=\"internal-sftp\",no-port-forwarding,no-x11-forwarding,no-agent-forwarding,no-pty {}",
        active_key.public_key
    );
    let system_key_changed = !remote_lines.iter().any(|l| l.trim() == restricted_line.trim());

    if header_bad || system_key_changed {
        return DriftClass::Critical;
    }

    let remote_set: std::collections::HashSet<&str> = remote_lines.iter().copied().collect();
    let expected_user_key_lines = expected_norm
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.trim().starts_with('#') && !l.trim().starts_with("command="));
    let missing_expected_key = expected_user_key_lines.into_iter().any(|l| !remote_set.contains(l));

    if missing_expected_key {
        return DriftClass::Warning;
    }

    DriftClass::Info
}
