//! Fleet-wide operations that aren't tied to one account: rotating the
//! system key (spec.md §3 SystemKey) and reading the audit log (spec.md
//! §4.C13). Actually deploying the new serial onto existing hosts is a
//! normal redeploy ([`crate::deploy`]) once they're marked dirty.

use keymaster_core::store::Store;
use keymaster_core::Result;

use crate::Context;

pub fn rotate_system_key(ctx: &Context, public_key: &str, private_key: &str) -> Result<String> {
    let key = ctx.store.rotate_system_key(public_key, private_key)?;
    let accounts = ctx.store.list_active_accounts()?;
    let ids: Vec<i64> = accounts.iter().map(|a| a.id).collect();
    ctx.store.mark_accounts_dirty(&ids)?;
    Ok(format!("system key rotated to serial {}; {} account(s) marked dirty for redeploy", key.serial, ids.len()))
}

pub fn audit_log(ctx: &Context) -> Result<String> {
    let entries = ctx.store.list_audit_log()?;
    if entries.is_empty() {
        return Ok("(empty)".to_string());
    }

    let mut out = String::new();
    for e in entries {
        out.push_str(&format!("{}  {:<8} {:<24} {}\n", e.timestamp.to_rfc3339(), e.actor, e.action, e.details));
    }
    Ok(out)
}
