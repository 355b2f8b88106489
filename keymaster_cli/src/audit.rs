//! C9 wiring: check one account's installed content against what the
//! store says it should be (spec.md §4.C9).

use chrono::Utc;

use keymaster_core::engine::audit;
use keymaster_core::store::Store;
use keymaster_core::Result;

use crate::Context;

pub fn check(ctx: &Context, account_id: i64, strict: bool) -> Result<String> {
    let account = ctx.store.get_account(account_id)?;
    if strict {
        audit::audit_account_strict(ctx.store.as_ref(), ctx.connector.as_ref(), &account, Utc::now())?;
    } else {
        audit::audit_account_serial(ctx.store.as_ref(), ctx.connector.as_ref(), &account)?;
    }
    Ok(format!("account {} ({}@{}) matches its expected state", account.id, account.username, account.hostname))
}
