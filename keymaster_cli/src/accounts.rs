//! Account-facing subcommands: list and inspect (spec.md §3 Account,
//! §4.C3). There is no standalone "add account" subcommand — an account
//! only ever comes into existence by completing a bootstrap session
//! ([`crate::bootstrap`]), since every account row records the
//! system-key serial it was deployed with.

use keymaster_core::store::Store;
use keymaster_core::Result;

use crate::Context;

pub fn list(ctx: &Context) -> Result<String> {
    let accounts = ctx.store.list_accounts()?;
    if accounts.is_empty() {
        return Ok("(no accounts)".to_string());
    }

    let mut out = String::new();
    for a in accounts {
        out.push_str(&format!(
            "{:>4}  {:<40} {:<20} serial={:<4} active={:<5} dirty={}\n",
            a.id,
            format!("{}@{}", a.username, a.hostname),
            a.tags_bucket(),
            a.serial,
            a.is_active,
            a.is_dirty
        ));
    }
    Ok(out)
}

pub fn show(ctx: &Context, id: i64) -> Result<String> {
    let a = ctx.store.get_account(id)?;
    let bundle = ctx.store.account_keys(id)?;
    Ok(format!(
        "account {} ({}@{})\n  label:       {}\n  tags:        {}\n  serial:      {}\n  active:      {}\n  dirty:       {}\n  fingerprint: {}\n  global keys: {}\n  own keys:    {}\n",
        a.id,
        a.username,
        a.hostname,
        a.label,
        a.tags_bucket(),
        a.serial,
        a.is_active,
        a.is_dirty,
        if a.key_hash.is_empty() { "(unknown)" } else { &a.key_hash },
        bundle.global_keys.len(),
        bundle.account_keys.len(),
    ))
}

pub fn deactivate(ctx: &Context, id: i64) -> Result<String> {
    ctx.store.toggle_account_active(id, false)?;
    Ok(format!("account {} marked inactive", id))
}

pub fn reactivate(ctx: &Context, id: i64) -> Result<String> {
    ctx.store.toggle_account_active(id, true)?;
    Ok(format!("account {} marked active", id))
}
