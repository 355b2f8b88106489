//! Public-key subcommands: register, assign/unassign, list (spec.md §3
//! PublicKey, §4.C3). Parsing/rendering of the `authorized_keys` line
//! itself lives in `keymaster_core::keys`/`keymaster_core::builder`; this
//! is only the store-facing wiring.

use keymaster_core::store::Store;
use keymaster_core::Result;

use crate::Context;

pub fn add(ctx: &Context, algorithm: &str, key_data: &str, comment: &str, is_global: bool) -> Result<String> {
    let key = ctx.store.add_public_key(algorithm, key_data, comment, is_global)?;
    Ok(format!("added key {} ({}){}", key.id, key.comment, if key.is_global { " [global]" } else { "" }))
}

pub fn remove(ctx: &Context, id: i64) -> Result<String> {
    ctx.store.delete_public_key(id)?;
    Ok(format!("removed key {}", id))
}

pub fn assign(ctx: &Context, key_id: i64, account_id: i64) -> Result<String> {
    ctx.store.assign(key_id, account_id)?;
    Ok(format!("assigned key {} to account {}", key_id, account_id))
}

pub fn unassign(ctx: &Context, key_id: i64, account_id: i64) -> Result<String> {
    ctx.store.unassign(key_id, account_id)?;
    Ok(format!("unassigned key {} from account {}", key_id, account_id))
}

pub fn list(ctx: &Context) -> Result<String> {
    let keys = ctx.store.list_public_keys()?;
    if keys.is_empty() {
        return Ok("(no keys)".to_string());
    }

    let mut out = String::new();
    for k in keys {
        out.push_str(&format!(
            "{:>4}  {:<30} {}{}\n",
            k.id,
            k.comment,
            if k.is_global { "[global] " } else { "" },
            match k.expires_at {
                Some(exp) => format!("expires {}", exp.to_rfc3339()),
                None => "no expiry".to_string(),
            }
        ));
    }
    Ok(out)
}
