//! C5: remote deployer (spec.md §4.C5).

mod ssh2_deployer;
#[cfg(test)]
pub mod fake;

pub use ssh2_deployer::{Auth, Ssh2Connector, Ssh2Deployer};

use crate::Result;

/// One instance per host session. Construction (not part of this trait —
/// see [`Ssh2Deployer::connect`]/[`Ssh2Deployer::connect_bootstrap`]) does
/// authentication and host-key verification; everything here operates on
/// an already-established session.
pub trait Deployer {
    /// Atomically replace `~/.ssh/authorized_keys` with `content`.
    /// Atomicity requirement (spec.md §4.C5/§6): write a sibling temp
    /// file, fsync, rename; on failure the old file must remain intact.
    /// Creates `~/.ssh` (mode 0700) if missing; file mode is 0600.
    fn deploy_authorized_keys(&mut self, content: &str) -> Result<()>;

    /// Read the current content, or a well-known "no such file" error.
    fn get_authorized_keys(&mut self) -> Result<Option<String>>;

    /// Release transport resources. Implementations should also do this
    /// on `Drop`; `close` lets a caller do it eagerly and observe errors.
    fn close(&mut self) -> Result<()>;
}

/// Factory for a [`Deployer`] session, the construction half of C5 that
/// the engines (C8-C10) and the bootstrap manager (C6) depend on so they
/// can be exercised against a `FakeConnector`/`FakeDeployer` instead of a
/// real SSH session. `expected_host_key` is always supplied by the
/// caller: for the normal path that's a known-host line looked up from
/// the Store, for the bootstrap path it's the operator-confirmed literal
/// (spec.md §4.C5: "this is the only path that may connect without a
/// pre-saved known-host entry" — from this trait's point of view that
/// distinction lives entirely in what the caller passes, not in a
/// separate method).
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        hostname: &str,
        username: &str,
        private_key_pem: &str,
        expected_host_key: &str,
    ) -> Result<Box<dyn Deployer>>;
}
