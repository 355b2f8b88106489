//! Unified error surface for the whole core.
//!
//! Every component (C1-C13) returns `crate::Result<T>` and fails with one
//! of the kinds below rather than a component-local enum: callers need to
//! match on `ErrorKind::ErrDuplicate` regardless of whether the duplicate
//! came from an account insert or a public key insert. This collapses the
//! "one XErrKind per module" pattern that `vault.rs`/`slack.rs`/
//! `helm/mod.rs` each use independently; see DESIGN.md Open Question 1.

use std::fmt::{self, Display};
use failure::{Backtrace, Context, Fail};

#[derive(Debug)]
pub struct KeymasterError {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "duplicate entry: {}", _0)]
    ErrDuplicate(String),

    #[fail(display = "not found: {}", _0)]
    ErrNotFound(String),

    #[fail(display = "no active system key is registered")]
    ErrNoActiveSystemKey,

    #[fail(display = "no system key with serial {}", _0)]
    ErrNoSerialKey(i64),

    #[fail(display = "database inconsistency: {}", _0)]
    ErrDBInconsistency(String),

    #[fail(display = "host key mismatch for {}: potential MITM", _0)]
    ErrHostKeyMismatch(String),

    #[fail(display = "no known host key for {}", _0)]
    ErrHostKeyUnknown(String),

    #[fail(display = "passphrase required to unlock private key")]
    ErrPassphraseRequired,

    #[fail(display = "connection to {} failed: {}", _0, _1)]
    ErrConnectionFailed(String, String),

    #[fail(display = "deployment failed: {}", _0)]
    ErrDeploymentFailed(String),

    #[fail(display = "drift detected for account {}", _0)]
    ErrDriftDetected(i64),

    #[fail(display = "serial drift for account {}: host has {}, expected {}", _0, _1, _2)]
    ErrDriftSerial(i64, i64, i64),

    #[fail(display = "content drift for account {}", _0)]
    ErrDriftContent(i64),

    #[fail(display = "transfer package is corrupt: CRC mismatch")]
    ErrTransferCorrupt,

    #[fail(display = "transfer package has the wrong magic value")]
    ErrTransferMagic,

    #[fail(display = "bootstrap session {} has expired", _0)]
    ErrBootstrapExpired(String),

    #[fail(display = "operation cancelled")]
    ErrCancelled,

    #[fail(display = "{}", _0)]
    ErrBuildRejected(String),

    #[fail(display = "{}", _0)]
    ErrOther(String),
}

impl Fail for KeymasterError {
    fn cause(&self) -> Option<&dyn Fail> { self.inner.cause() }
    fn backtrace(&self) -> Option<&Backtrace> { self.inner.backtrace() }
}

impl Display for KeymasterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl KeymasterError {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for KeymasterError {
    fn from(kind: ErrorKind) -> KeymasterError {
        KeymasterError { inner: Context::new(kind) }
    }
}

impl From<Context<ErrorKind>> for KeymasterError {
    fn from(inner: Context<ErrorKind>) -> KeymasterError {
        KeymasterError { inner }
    }
}

pub type Result<T> = std::result::Result<T, failure::Error>;

/// Map an engine-specific uniqueness-violation message to `ErrDuplicate`.
///
/// Per spec.md §4.C3/§9: the store must unify MySQL ("duplicate entry"),
/// PostgreSQL ("23505") and SQLite ("unique constraint") violations into a
/// single kind. A real implementation should prefer engine-typed error
/// codes where the driver exposes one and fall back to this substring
/// check otherwise (spec.md §9).
pub fn looks_like_duplicate(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("duplicate") || lower.contains("unique") || lower.contains("23505") || lower.contains("1062")
}
