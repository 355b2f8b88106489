//! C12: parallel task runner (spec.md §4.C12/§5).
//!
//! A generic bounded-parallelism runner over an item list with a
//! caller-supplied worker. Built on the teacher's own `threadpool`
//! dependency (`shipcat_cli`'s `extern crate threadpool;`, declared for
//! "parallel upgrades"); `crossbeam-channel` supplies both the result
//! collection channel and the cancellation token, since `threadpool`
//! itself has no cancellation concept.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::bounded;
use threadpool::ThreadPool;

use crate::error::ErrorKind;
use crate::Result;

/// A single context shared by every in-flight worker (spec.md §5:
/// "cancellation is propagated via a single context").
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    /// Signal every in-flight and not-yet-started worker to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

/// Run `worker` over `items` with bounded parallelism.
///
/// `parallelism == 0` means "use the number of hardware threads" (spec.md
/// §6 `deploy.parallelism` default). Each task is independent; results
/// come back paired with their originating item, in completion order —
/// callers that need input order back (as the dirty-account scheduler
/// does, spec.md testable property F) re-sort by whatever they used to
/// identify the item. A worker observed via `cancel.is_cancelled()`
/// before it starts is skipped with `ErrCancelled` rather than run;
/// workers already running are expected to check the token themselves if
/// they want to abort promptly (the deployer drops its SSH session when
/// cancelled, for example).
pub fn parallel_run<T, F>(
    items: Vec<T>,
    parallelism: usize,
    cancel: CancelToken,
    worker: F,
) -> Vec<(T, Result<()>)>
where
    T: Send + 'static,
    F: Fn(&T) -> Result<()> + Send + Sync + 'static,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let n_workers = if parallelism == 0 { num_cpus::get() } else { parallelism }.max(1);
    let pool = ThreadPool::new(n_workers);
    let worker = Arc::new(worker);
    let (tx, rx) = bounded(total);

    for item in items {
        let tx = tx.clone();
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        pool.execute(move || {
            let result = if cancel.is_cancelled() {
                Err(ErrorKind::ErrCancelled.into())
            } else {
                worker(&item)
            };
            // The channel is sized to `total` and every sender is dropped
            // after sending exactly once, so this can only fail if the
            // receiving end was dropped early, which no caller does.
            let _ = tx.send((item, result));
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(total);
    for _ in 0..total {
        match rx.recv() {
            Ok(pair) => results.push(pair),
            Err(_) => break,
        }
    }
    pool.join();
    results
}
