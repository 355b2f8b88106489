//! C6 wiring: start and complete an enrollment session (spec.md §4.C6).
//! Depositing the ephemeral public key on the host and confirming its
//! fingerprint out-of-band is the operator's job, not this binary's — see
//! spec.md §1 Out of scope and `keymaster_core::transfer` for the
//! air-gapped variant of that hand-off.

use chrono::Utc;

use keymaster_core::model::PendingAccount;
use keymaster_core::{bootstrap as bootstrap_engine, Result};

use crate::Context;

pub fn new(ctx: &Context, username: &str, hostname: &str, label: &str, tags: &str) -> Result<String> {
    let pending = PendingAccount { username: username.to_string(), hostname: hostname.to_string(), label: label.to_string(), tags: tags.to_string() };
    let result = bootstrap_engine::new_session(ctx.store.as_ref(), pending, ctx.config.bootstrap_timeout.as_secs() as i64, Utc::now())?;
    Ok(format!(
        "session {}\n  deposit this public key on {}@{}:\n    {}\n  expires {}\n",
        result.session_id, username, hostname, result.ephemeral_public_key, result.expires_at.to_rfc3339()
    ))
}

pub fn confirm(ctx: &Context, session_id: &str, confirmed_host_key: &str, selected_key_ids: &[i64]) -> Result<String> {
    let account_id = bootstrap_engine::perform_bootstrap(ctx.store.as_ref(), ctx.connector.as_ref(), session_id, confirmed_host_key, selected_key_ids, Utc::now())?;
    Ok(format!("session {} complete: account {}", session_id, account_id))
}
