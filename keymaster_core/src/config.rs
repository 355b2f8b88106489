//! Configuration options consumed by the core (spec.md §6). File
//! discovery, env layering and on-disk defaults are all CLI/TUI concerns
//! and out of scope here (spec.md §1); this is just the typed bag a
//! caller builds and passes in.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bootstrap_timeout: Duration,
    pub session_reaper_interval: Duration,
    pub deploy_parallelism: usize,
    pub dial_timeout: Duration,
    pub op_timeout: Duration,
    pub authorized_keys_path: String,
    pub default_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bootstrap_timeout: Duration::from_secs(15 * 60),
            session_reaper_interval: Duration::from_secs(5 * 60),
            deploy_parallelism: num_cpus::get(),
            dial_timeout: Duration::from_secs(10),
            op_timeout: Duration::from_secs(30),
            authorized_keys_path: ".ssh/authorized_keys".to_string(),
            default_port: 22,
        }
    }
}
