//! C8/C11 wiring: redeploy one account, or every currently-dirty account
//! in parallel via the core's C12 runner (spec.md §4.C8/§4.C11).

use std::sync::Arc;

use chrono::Utc;

use keymaster_core::deploy::Connector;
use keymaster_core::engine::{deploy as deploy_engine, scheduler};
use keymaster_core::parallel::CancelToken;
use keymaster_core::store::Store;
use keymaster_core::Result;

use crate::Context;

pub fn one(ctx: &Context, account_id: i64) -> Result<String> {
    let account = ctx.store.get_account(account_id)?;
    deploy_engine::run_deployment_for_account(ctx.store.as_ref(), ctx.connector.as_ref(), &account, Utc::now())?;
    Ok(format!("deployed account {} ({}@{}), serial now {}", account.id, account.username, account.hostname, ctx.store.get_account(account_id)?.serial))
}

pub fn dirty(ctx: &Context) -> Result<String> {
    let store: Arc<dyn Store> = ctx.store.clone();
    let connector: Arc<dyn Connector> = ctx.connector.clone();
    let results = scheduler::deploy_dirty_accounts(store, connector, ctx.config.deploy_parallelism, CancelToken::new())?;

    let failed: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).collect();
    let mut out = format!("{} succeeded, {} failed\n", results.len() - failed.len(), failed.len());
    for (id, r) in failed {
        if let Err(e) = r {
            out.push_str(&format!("  account {}: {}\n", id, e));
        }
    }
    Ok(out)
}
