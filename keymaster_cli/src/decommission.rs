//! C10 wiring: decommission one account, or every active account in
//! sequence (spec.md §4.C10). Deliberately sequential for the `--all`
//! path, not fanned out through C12 — see
//! `keymaster_core::engine::decommission::decommission_all`.

use keymaster_core::engine::decommission::{self, DecommissionOptions};
use keymaster_core::store::Store;
use keymaster_core::Result;

use crate::Context;

pub fn one(ctx: &Context, account_id: i64, options: &DecommissionOptions) -> Result<String> {
    let account = ctx.store.get_account(account_id)?;
    let outcome = decommission::decommission_account(ctx.store.as_ref(), ctx.connector.as_ref(), &account, options)?;
    Ok(format!("account {}: {}", account_id, outcome))
}

pub fn all(ctx: &Context, options: &DecommissionOptions) -> Result<String> {
    let mut out = String::new();
    let results = decommission::decommission_all(ctx.store.as_ref(), ctx.connector.as_ref(), options, |id, result| {
        out.push_str(&format!("  account {}: {}\n", id, decommission::describe_result(result)));
    })?;
    Ok(format!("{} account(s) processed\n{}", results.len(), out))
}
