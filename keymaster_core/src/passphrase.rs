//! Process-wide passphrase cache (spec.md §5).
//!
//! The TUI prompts once; the deployer factory may need to read the
//! passphrase many times across retries within one operation chain.
//! Writers store a copy, readers get a copy, `clear()` zeroes the backing
//! buffer. Every consumer must zero its own copy after use — this module
//! only guarantees its own storage is wiped.

use std::sync::Mutex;
use zeroize::Zeroize;

static CACHE: Mutex<Vec<u8>> = Mutex::new(Vec::new());

/// Store a copy of the passphrase, replacing and zeroing whatever was
/// cached before.
pub fn store(passphrase: &str) {
    let mut guard = CACHE.lock().expect("passphrase cache mutex poisoned");
    guard.zeroize();
    guard.clear();
    guard.extend_from_slice(passphrase.as_bytes());
}

/// Read a copy of the cached passphrase, if any.
pub fn read() -> Option<Vec<u8>> {
    let guard = CACHE.lock().expect("passphrase cache mutex poisoned");
    if guard.is_empty() { None } else { Some(guard.clone()) }
}

/// Zero the backing buffer. Called on successful authentication or at the
/// end of the outermost operation (spec.md §5: "lifecycle is a single
/// operation chain").
pub fn clear() {
    let mut guard = CACHE.lock().expect("passphrase cache mutex poisoned");
    guard.zeroize();
    guard.clear();
}
