//! `keymaster_cli`: a thin wiring layer over `keymaster_core`.
//!
//! Per spec.md §1 Out of scope, flag parsing, a TUI, i18n, logging setup
//! and config-file discovery are not implemented in depth here — this
//! crate exists only to demonstrate that the core is callable from a
//! binary, a handful of subcommands wired directly to `keymaster_core`
//! facade functions, the way `shipcat_cli` is a thin layer over
//! `shipcat_definitions`.

#[macro_use]
extern crate log;
#[macro_use]
extern crate failure;
extern crate chrono;
extern crate ctrlc;
extern crate dirs;
extern crate keymaster_core;

pub use keymaster_core::{Config, ErrorKind, KeymasterError, Result};

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use keymaster_core::deploy::{Connector, Ssh2Connector};
use keymaster_core::store::{SqliteStore, Store};

pub mod accounts;
pub mod audit;
pub mod bootstrap;
pub mod decommission;
pub mod deploy;
pub mod pubkeys;
pub mod system;

/// Everything a subcommand needs: an opened store, a real connector, and
/// the config it was built from.
pub struct Context {
    pub store: Arc<SqliteStore>,
    pub connector: Arc<Ssh2Connector>,
    pub config: Config,
}

/// `$KEYMASTER_DB`, else `~/.keymaster/keymaster.db`. Config-file
/// discovery is out of scope (spec.md §1); this is the one piece of
/// discovery a binary needs just to find anything at all, the same way
/// `shipcat_cli::init` only looks at `SHIPCAT_MANIFEST_DIR`.
fn default_db_path() -> Result<PathBuf> {
    if let Ok(p) = env::var("KEYMASTER_DB") {
        return Ok(PathBuf::from(p));
    }
    let home = dirs::home_dir();
    ensure!(home.is_some(), "system must have a home directory");
    Ok(home.unwrap().join(".keymaster").join("keymaster.db"))
}

/// Open the store, recover any bootstrap sessions orphaned by a previous
/// crash (spec.md §4.C6 `RecoverFromCrash`), and install the
/// SIGINT/SIGTERM cleanup handler (spec.md §5).
pub fn init() -> Result<Context> {
    let config = Config::default();
    let db_path = default_db_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Arc::new(SqliteStore::open(&db_path)?);
    let connector = Arc::new(Ssh2Connector::new(config.dial_timeout, config.op_timeout));

    let orphaned = keymaster_core::bootstrap::recover_from_crash(store.as_ref())?;
    if orphaned > 0 {
        warn!("recovered {} bootstrap session(s) orphaned by a previous crash", orphaned);
    }

    install_signal_handler(Arc::clone(&store), Arc::clone(&connector));

    Ok(Context { store, connector, config })
}

/// Wire `ctrlc` to `bootstrap::cleanup_all_sessions_on_signal` so a
/// Ctrl-C during an in-progress bootstrap wipes the ephemeral key and
/// marks the session `Failed` instead of leaking it (spec.md §4.C6/§5).
/// Guarded by the core's install-once flag since a process only ever
/// needs one handler no matter how many `Context`s it opens.
fn install_signal_handler(store: Arc<SqliteStore>, connector: Arc<Ssh2Connector>) {
    if !keymaster_core::bootstrap::mark_signal_handler_installed() {
        return;
    }
    let result = ctrlc::set_handler(move || {
        let store: &dyn Store = store.as_ref();
        let connector: &dyn Connector = connector.as_ref();
        keymaster_core::bootstrap::cleanup_all_sessions_on_signal(store, connector);
        std::process::exit(130);
    });
    if let Err(e) = result {
        warn!("failed to install signal handler: {}", e);
    }
}
