//! C10: the decommission engine (spec.md §4.C10).

use std::fmt;

use chrono::Utc;

use crate::deploy::Connector;
use crate::engine::{known_host_for, resolve_keys};
use crate::model::Account;
use crate::store::Store;
use crate::Result;

/// The five fields spec.md §4.C10/§9 names: a fixed struct of booleans
/// plus one list, no reflection, no free-form map (spec.md §9 Design
/// note).
#[derive(Debug, Clone)]
pub struct DecommissionOptions {
    /// Don't touch the remote host at all; only the store is updated.
    pub skip_remote_cleanup: bool,
    /// Preserve non-managed content instead of wiping the file outright
    /// once the managed block is gone.
    pub keep_file: bool,
    /// Continue to step 5 (delete the account) even if remote cleanup
    /// failed.
    pub force: bool,
    /// Log what would happen and stop; no remote or store mutation.
    pub dry_run: bool,
    /// `PublicKey` ids to exclude from a re-rendered managed block instead
    /// of removing the block entirely; every other assigned key (and the
    /// system key) is preserved.
    pub selective_keys: Vec<i64>,
}

impl Default for DecommissionOptions {
    fn default() -> Self {
        DecommissionOptions {
            skip_remote_cleanup: false,
            keep_file: true,
            force: false,
            dry_run: false,
            selective_keys: Vec::new(),
        }
    }
}

/// The stringified result spec.md §4.C10 says bulk decommission reports
/// per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecommissionStatus {
    Success,
    Partial,
    Skipped,
    Failed,
}

impl DecommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecommissionStatus::Success => "SUCCESS",
            DecommissionStatus::Partial => "PARTIAL",
            DecommissionStatus::Skipped => "SKIPPED",
            DecommissionStatus::Failed => "FAILED",
        }
    }
}

/// Result of decommissioning a single account.
#[derive(Debug, Clone)]
pub struct DecommissionOutcome {
    pub account_id: i64,
    pub status: DecommissionStatus,
    pub had_managed_block: bool,
    /// Spec.md §4.C10 mentions an "optional backup path" on the
    /// stringified result; no backup mechanism is otherwise specified, so
    /// this core never populates it (DESIGN.md Open Question) — it exists
    /// so a caller that does add one has somewhere to put it.
    pub backup_path: Option<String>,
}

impl fmt::Display for DecommissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.status.as_str())?;
        if let Some(path) = &self.backup_path {
            write!(f, " (backup: {})", path)?;
        }
        Ok(())
    }
}

/// Stringify a full `(account, Result<DecommissionOutcome>)` the way
/// spec.md §4.C10 describes for bulk decommission: `FAILED` for the error
/// path, the outcome's own status otherwise.
pub fn describe_result(result: &Result<DecommissionOutcome>) -> String {
    match result {
        Ok(outcome) => outcome.to_string(),
        Err(_) => DecommissionStatus::Failed.as_str().to_string(),
    }
}

/// `DecommissionAccount` (spec.md §4.C10 steps 1-6): log start/dry-run,
/// optionally clean up the remote managed block, then delete the account
/// from the store. `options.selective_keys` determines whether the
/// managed block is removed entirely or re-rendered minus those ids;
/// either way the account row itself is always removed in step 5 — that
/// is the one part of "decommission" this operation never skips short of
/// `dry_run` or an unforced remote failure.
pub fn decommission_account(
    store: &dyn Store,
    connector: &dyn Connector,
    account: &Account,
    options: &DecommissionOptions,
) -> Result<DecommissionOutcome> {
    store.append_audit_log(
        "system",
        if options.dry_run { "DECOMMISSION_DRYRUN" } else { "DECOMMISSION_START" },
        &format!("account {} ({}@{})", account.id, account.username, account.hostname),
    )?;

    if options.dry_run {
        return Ok(DecommissionOutcome {
            account_id: account.id,
            status: DecommissionStatus::Skipped,
            had_managed_block: false,
            backup_path: None,
        });
    }

    let mut had_managed_block = false;
    let mut remote_cleanup_failed = false;

    if !options.skip_remote_cleanup {
        match run_remote_cleanup(store, connector, account, options) {
            Ok(present) => had_managed_block = present,
            Err(e) => {
                store.append_audit_log(
                    "system",
                    "DECOMMISSION_FAILED",
                    &format!("account {} ({}@{}): remote cleanup failed: {}", account.id, account.username, account.hostname, e),
                )?;
                if !options.force {
                    return Ok(DecommissionOutcome {
                        account_id: account.id,
                        status: DecommissionStatus::Skipped,
                        had_managed_block: false,
                        backup_path: None,
                    });
                }
                remote_cleanup_failed = true;
            }
        }
    }

    if let Err(e) = store.delete_account(account.id) {
        store.append_audit_log(
            "system",
            "DECOMMISSION_FAILED",
            &format!("account {} ({}@{}): database delete failed: {}", account.id, account.username, account.hostname, e),
        )?;
        return Err(e);
    }

    store.append_audit_log(
        "system",
        "DECOMMISSION_SUCCESS",
        &format!("account {} ({}@{})", account.id, account.username, account.hostname),
    )?;

    Ok(DecommissionOutcome {
        account_id: account.id,
        status: if remote_cleanup_failed { DecommissionStatus::Partial } else { DecommissionStatus::Success },
        had_managed_block,
        backup_path: None,
    })
}

/// spec.md §4.C10 step 3: connect, read the remote file, compose the
/// replacement content, deploy it. Returns whether a managed block was
/// present before cleanup.
fn run_remote_cleanup(store: &dyn Store, connector: &dyn Connector, account: &Account, options: &DecommissionOptions) -> Result<bool> {
    let (connect_key, active_key) = resolve_keys(store, account)?;
    let known_host = known_host_for(store, &account.hostname)?;

    let mut session = connector.connect(&account.hostname, &account.username, &connect_key.private_key, &known_host.authorized_keys_line)?;
    let remote = session.get_authorized_keys()?.unwrap_or_default();

    let split = split_managed_block(&remote);
    let had_block = split.is_some();

    let new_content = match &split {
        Some(ManagedBlockSplit { pre, post }) => {
            if options.selective_keys.is_empty() {
                // Full decommission: omit the managed block entirely.
                if options.keep_file { join_non_managed(pre, post) } else { String::new() }
            } else {
                // Selective: re-render the block minus the excluded ids,
                // preserving the system key, spliced back between the
                // same non-managed pre/post content.
                let bundle = store.account_keys(account.id)?;
                let rebuilt = crate::builder::build_selective(
                    Some(&active_key),
                    &bundle.global_keys,
                    &bundle.account_keys,
                    &options.selective_keys,
                    Utc::now(),
                )?;
                format!("{}{}{}", pre, rebuilt, post)
            }
        }
        None => {
            if options.keep_file { remote.clone() } else { String::new() }
        }
    };

    // "If the final content has no remaining text at all, deploy an
    // empty file (we never remove the file itself; we overwrite)."
    session.deploy_authorized_keys(&new_content)?;
    session.close().ok();

    Ok(had_block)
}

/// Decommission every active account sequentially, invoking `progress`
/// after each one (success or failure) so a caller (the CLI) can report a
/// running count. Sequential, not via C12's runner: bulk decommission is
/// a destructive operation spec.md keeps one-at-a-time auditable rather
/// than racing (SPEC_FULL.md §12).
pub fn decommission_all(
    store: &dyn Store,
    connector: &dyn Connector,
    options: &DecommissionOptions,
    mut progress: impl FnMut(i64, &Result<DecommissionOutcome>),
) -> Result<Vec<(i64, Result<DecommissionOutcome>)>> {
    let accounts = store.list_active_accounts()?;
    let mut results = Vec::with_capacity(accounts.len());
    for account in accounts {
        let outcome = decommission_account(store, connector, &account, options);
        progress(account.id, &outcome);
        results.push((account.id, outcome));
    }
    Ok(results)
}

struct ManagedBlockSplit {
    pre: String,
    post: String,
}

/// Locate the managed block within arbitrary remote content: the header
/// line (anything `parse_serial` accepts), followed by every contiguous
/// line that looks like block content (blank, a comment, or a key line)
/// up to the first line that doesn't. Everything outside that span is
/// non-managed and is what `pre`/`post` preserve.
fn split_managed_block(content: &str) -> Option<ManagedBlockSplit> {
    let lines: Vec<&str> = content.split('\n').collect();
    let header_idx = lines.iter().position(|l| crate::keys::parse_serial(l).is_ok())?;

    let mut end = header_idx + 1;
    while end < lines.len() {
        let trimmed = lines[end].trim();
        let looks_like_block_line = trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.starts_with("ssh-")
            || trimmed.starts_with("ecdsa-")
            || trimmed.starts_with("command=");
        if !looks_like_block_line {
            break;
        }
        end += 1;
    }

    let pre = if header_idx == 0 { String::new() } else { format!("{}\n", lines[..header_idx].join("\n")) };
    let post = if end >= lines.len() { String::new() } else { lines[end..].join("\n") };

    Some(ManagedBlockSplit { pre, post })
}

fn join_non_managed(pre: &str, post: &str) -> String {
    format!("{}{}", pre, post)
}
