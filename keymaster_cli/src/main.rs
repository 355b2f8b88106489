//! `keymaster`: the command-line entry point. Per spec.md §1 Out of
//! scope, this is deliberately a thin argv dispatcher, not a real flag
//! parser — each subcommand below is a one-line call into
//! `keymaster_cli`'s wiring, which in turn calls straight into
//! `keymaster_core`.

extern crate keymaster_cli;
extern crate log;

use std::env;
use std::process;

use keymaster_cli::{Context, Result};

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let ctx = match keymaster_cli::init() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("keymaster: failed to start: {}", e);
            process::exit(1);
        }
    };

    match dispatch(&ctx, &args) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("keymaster: {}", e);
            process::exit(1);
        }
    }
}

fn dispatch(ctx: &Context, args: &[String]) -> Result<String> {
    let rest: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();
    match args.first().map(String::as_str) {
        Some("accounts") => accounts(ctx, &rest),
        Some("keys") => keys(ctx, &rest),
        Some("deploy") => deploy(ctx, &rest),
        Some("audit") => audit(ctx, &rest),
        Some("decommission") => decommission(ctx, &rest),
        Some("bootstrap") => bootstrap(ctx, &rest),
        Some("system") => system(ctx, &rest),
        _ => Ok(usage()),
    }
}

fn accounts(ctx: &Context, args: &[&str]) -> Result<String> {
    match args {
        ["list"] => keymaster_cli::accounts::list(ctx),
        ["show", id] => keymaster_cli::accounts::show(ctx, parse_id(id)?),
        ["deactivate", id] => keymaster_cli::accounts::deactivate(ctx, parse_id(id)?),
        ["reactivate", id] => keymaster_cli::accounts::reactivate(ctx, parse_id(id)?),
        _ => Ok(usage()),
    }
}

fn keys(ctx: &Context, args: &[&str]) -> Result<String> {
    match args {
        ["add", algorithm, key_data, comment] => keymaster_cli::pubkeys::add(ctx, algorithm, key_data, comment, false),
        ["add", algorithm, key_data, comment, "--global"] => keymaster_cli::pubkeys::add(ctx, algorithm, key_data, comment, true),
        ["remove", id] => keymaster_cli::pubkeys::remove(ctx, parse_id(id)?),
        ["assign", key_id, account_id] => keymaster_cli::pubkeys::assign(ctx, parse_id(key_id)?, parse_id(account_id)?),
        ["unassign", key_id, account_id] => keymaster_cli::pubkeys::unassign(ctx, parse_id(key_id)?, parse_id(account_id)?),
        ["list"] => keymaster_cli::pubkeys::list(ctx),
        _ => Ok(usage()),
    }
}

fn deploy(ctx: &Context, args: &[&str]) -> Result<String> {
    match args {
        ["--dirty"] => keymaster_cli::deploy::dirty(ctx),
        [id] => keymaster_cli::deploy::one(ctx, parse_id(id)?),
        _ => Ok(usage()),
    }
}

fn audit(ctx: &Context, args: &[&str]) -> Result<String> {
    match args {
        [id, "--strict"] => keymaster_cli::audit::check(ctx, parse_id(id)?, true),
        [id] => keymaster_cli::audit::check(ctx, parse_id(id)?, false),
        _ => Ok(usage()),
    }
}

fn decommission(ctx: &Context, args: &[&str]) -> Result<String> {
    use keymaster_core::engine::decommission::DecommissionOptions;

    let mut options = DecommissionOptions::default();
    let mut target: Option<&str> = None;
    let mut all = false;

    for &arg in args {
        match arg {
            "--all" => all = true,
            "--force" => options.force = true,
            "--dry-run" => options.dry_run = true,
            "--skip-remote-cleanup" => options.skip_remote_cleanup = true,
            "--wipe-file" => options.keep_file = false,
            other => target = Some(other),
        }
    }

    if all {
        keymaster_cli::decommission::all(ctx, &options)
    } else if let Some(id) = target {
        keymaster_cli::decommission::one(ctx, parse_id(id)?, &options)
    } else {
        Ok(usage())
    }
}

fn bootstrap(ctx: &Context, args: &[&str]) -> Result<String> {
    match args {
        ["new", username, hostname] => keymaster_cli::bootstrap::new(ctx, username, hostname, "", ""),
        ["new", username, hostname, label] => keymaster_cli::bootstrap::new(ctx, username, hostname, label, ""),
        ["new", username, hostname, label, tags] => keymaster_cli::bootstrap::new(ctx, username, hostname, label, tags),
        ["confirm", session_id, host_key, key_ids] => {
            let ids: Vec<i64> = if key_ids.is_empty() {
                Vec::new()
            } else {
                key_ids
                    .split(',')
                    .map(|s| parse_id(s))
                    .collect::<Result<Vec<i64>>>()?
            };
            keymaster_cli::bootstrap::confirm(ctx, session_id, host_key, &ids)
        }
        _ => Ok(usage()),
    }
}

fn system(ctx: &Context, args: &[&str]) -> Result<String> {
    match args {
        ["rotate-key", public_key, private_key] => keymaster_cli::system::rotate_system_key(ctx, public_key, private_key),
        ["audit-log"] => keymaster_cli::system::audit_log(ctx),
        _ => Ok(usage()),
    }
}

fn parse_id(s: &str) -> Result<i64> {
    s.parse::<i64>().map_err(|_| failure::format_err!("not a valid id: {}", s))
}

fn usage() -> String {
    "usage: keymaster <accounts|keys|deploy|audit|decommission|bootstrap|system> ...\n\n\
     accounts list\n\
     accounts show <id>\n\
     accounts deactivate <id>\n\
     accounts reactivate <id>\n\
     keys add <algorithm> <key-data> <comment> [--global]\n\
     keys remove <id>\n\
     keys assign <key-id> <account-id>\n\
     keys unassign <key-id> <account-id>\n\
     keys list\n\
     deploy <account-id>\n\
     deploy --dirty\n\
     audit <account-id> [--strict]\n\
     decommission <account-id> [--force] [--dry-run] [--skip-remote-cleanup] [--wipe-file]\n\
     decommission --all [--force] [--dry-run]\n\
     bootstrap new <username> <hostname> [label] [tags]\n\
     bootstrap confirm <session-id> <confirmed-host-key> <key-id[,key-id...]>\n\
     system rotate-key <public-key-line> <private-key-pem>\n\
     system audit-log\n"
        .to_string()
}
