//! C8: the deployment engine (spec.md §4.C8).

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::deploy::Connector;
use crate::engine::{known_host_for, resolve_keys};
use crate::error::ErrorKind;
use crate::model::Account;
use crate::store::Store;
use crate::Result;

const SERIAL_UPDATE_MAX_RETRIES: u32 = 5;

/// Render the desired content, connect with the serial the host
/// currently has, deploy it, and record the active serial/fingerprint on
/// success (spec.md §4.C8 steps 1-8).
pub fn run_deployment_for_account(
    store: &dyn Store,
    connector: &dyn Connector,
    account: &Account,
    now: DateTime<Utc>,
) -> Result<()> {
    let outcome = deploy_once(store, connector, account, now);

    match &outcome {
        Ok(()) => {
            store.append_audit_log(
                "system",
                "DEPLOY_SUCCESS",
                &format!("account {} ({}@{})", account.id, account.username, account.hostname),
            )?;
        }
        Err(e) => {
            store.append_audit_log(
                "system",
                "DEPLOY_FAIL",
                &format!("account {} ({}@{}): {}", account.id, account.username, account.hostname, e),
            )?;
        }
    }

    outcome
}

fn deploy_once(store: &dyn Store, connector: &dyn Connector, account: &Account, now: DateTime<Utc>) -> Result<()> {
    let (connect_key, active_key) = resolve_keys(store, account)?;
    let bundle = store.account_keys(account.id)?;
    let content = crate::builder::build(Some(&active_key), &bundle.global_keys, &bundle.account_keys, now)?;

    let known_host = known_host_for(store, &account.hostname)?;

    let mut session = connector
        .connect(&account.hostname, &account.username, &connect_key.private_key, &known_host.authorized_keys_line)
        .map_err(|e| ErrorKind::ErrConnectionFailed(account.hostname.clone(), format!("using serial {}: {}", connect_key.serial, e)))?;

    session.deploy_authorized_keys(&content)?;
    session.close().ok();

    let fingerprint = crate::fingerprint::fingerprint(&content);
    update_account_after_deploy(store, account.id, active_key.serial, &fingerprint)
}

/// Update the account's recorded serial/fingerprint/dirty-flag, retried
/// with capped exponential backoff and 50-150ms jitter when the store
/// reports "database is locked" (spec.md §4.C8 step 7 / §7).
fn update_account_after_deploy(store: &dyn Store, account_id: i64, serial: i64, fingerprint: &str) -> Result<()> {
    let mut attempt = 0;
    loop {
        let result = (|| -> Result<()> {
            store.update_account_serial(account_id, serial)?;
            store.set_account_fingerprint(account_id, fingerprint)?;
            store.set_account_dirty(account_id, false)?;
            Ok(())
        })();

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                let locked = e.to_string().to_lowercase().contains("database is locked");
                if !locked || attempt >= SERIAL_UPDATE_MAX_RETRIES {
                    return Err(e);
                }
                let backoff_ms = 50u64 * (1 << (attempt - 1));
                let jitter_ms = rand::thread_rng().gen_range(50, 150);
                thread::sleep(Duration::from_millis(backoff_ms.min(800) + jitter_ms));
            }
        }
    }
}
