//! `keymaster_core`: the state machines behind fleet SSH authorization
//! management — parsing and rendering the managed `authorized_keys`
//! block, the store contract, the remote deployer, and the engines
//! (deploy, audit, decommission, dirty-account scheduling) and bootstrap
//! session manager that drive accounts towards their desired state.
//!
//! This crate has no UI of its own; `keymaster_cli` is a thin binary
//! wired directly to the functions below.

#[macro_use]
extern crate failure;

#[macro_use]
extern crate log;

pub mod error;
pub use error::{ErrorKind, KeymasterError, Result};

pub mod model;

pub mod config;
pub use config::Config;

pub mod fingerprint;
pub mod audit_log;
pub mod passphrase;

pub mod keys;
pub mod builder;
pub mod host;

pub mod store;
pub mod deploy;

pub mod transfer;
pub mod parallel;
pub mod engine;
pub mod bootstrap;
