//! C8-C11: the engines that drive an account towards its desired state.
//!
//! Each engine is a thin orchestration over the lower-level components
//! (C1/C2 render, C3 store, C5 connect) — the shape spec.md prescribes for
//! all four: resolve the system key(s) to use, connect, do the remote
//! work, update the store, log. `resolve_keys`/`known_host_for` are
//! shared because C8, C9 and C10 all start from the identical
//! precondition checks spec.md §4.C8 steps 1-3 describe once.

pub mod audit;
pub mod decommission;
pub mod deploy;
pub mod scheduler;

use crate::error::ErrorKind;
use crate::model::{Account, KnownHostKey, SystemKey};
use crate::store::Store;
use crate::Result;

/// spec.md §4.C8 steps 1-3: pick the system key to *connect* with (the
/// serial the host currently has) and the *active* system key (the
/// serial to render into the desired content / record on success).
pub(crate) fn resolve_keys(store: &dyn Store, account: &Account) -> Result<(SystemKey, SystemKey)> {
    let connect_key = if account.serial == 0 {
        store.get_active_system_key()?.ok_or(ErrorKind::ErrNoActiveSystemKey)?
    } else {
        store
            .get_system_key_by_serial(account.serial)?
            .ok_or_else(|| ErrorKind::ErrDBInconsistency(format!(
                "account {} records serial {} but no such system key exists",
                account.id, account.serial
            )))?
    };

    let active_key = store.get_active_system_key()?.ok_or(ErrorKind::ErrNoActiveSystemKey)?;

    Ok((connect_key, active_key))
}

/// Look up the known host key for `hostname`, canonical form first, then
/// the legacy host-only form (spec.md §4.C4/§9).
pub(crate) fn known_host_for(store: &dyn Store, hostname: &str) -> Result<KnownHostKey> {
    let canonical = crate::host::canonicalize_host_port(hostname);
    let (legacy_host, _port) = crate::host::parse_host_port(&canonical);
    store
        .lookup_known_host(&canonical, &legacy_host)?
        .ok_or_else(|| ErrorKind::ErrHostKeyUnknown(canonical.clone()).into())
}
