//! C11: the dirty-account scheduler (spec.md §4.C11).
//!
//! Lists every active account whose `is_dirty` flag is set and redeploys
//! each one via C8, fanning the work out across C12's parallel runner the
//! same way the teacher's `shipcat_cli` drives its own cluster-wide apply
//! across a `threadpool`.

use std::sync::Arc;

use chrono::Utc;

use crate::deploy::Connector;
use crate::model::Account;
use crate::parallel::{parallel_run, CancelToken};
use crate::store::Store;
use crate::Result;

/// Re-sort a `parallel_run` result back into the order its `ids` were
/// submitted in. `parallel_run` (parallel.rs) hands results back in
/// completion order, which is nondeterministic under `parallelism > 1`;
/// spec.md §8 scenario D requires input order ("results has 2 entries for
/// id2 and id3, in input order"), so every caller here re-sorts before
/// returning.
fn sort_by_input_order(ids: &[i64], mut results: Vec<(i64, Result<()>)>) -> Vec<(i64, Result<()>)> {
    let position = |id: i64| ids.iter().position(|&x| x == id).unwrap_or(usize::MAX);
    results.sort_by_key(|(id, _)| position(*id));
    results
}

/// Synchronous helper used directly by tests (spec.md §8 scenario D): run
/// `worker` for every currently-dirty active account, in parallel, and
/// return one `(account_id, Result<()>)` per account, in the same order
/// the dirty accounts were listed in. Does not require `'static`
/// store/connector references, unlike [`deploy_dirty_accounts`].
pub fn run_for_dirty_accounts<F>(store: &dyn Store, parallelism: usize, cancel: CancelToken, worker: F) -> Result<Vec<(i64, Result<()>)>>
where
    F: Fn(&i64) -> Result<()> + Send + Sync + 'static,
{
    let dirty: Vec<i64> = store.list_active_accounts()?.into_iter().filter(|a: &Account| a.is_dirty).map(|a| a.id).collect();
    let results = parallel_run(dirty.clone(), parallelism, cancel, worker);
    Ok(sort_by_input_order(&dirty, results))
}

/// Redeploy every currently-dirty active account in parallel using the
/// real deployment engine (spec.md §4.C11 steps 1-3), returning results in
/// the same order the dirty accounts were listed in (spec.md §8 scenario
/// D). Takes `Arc`s because C12's worker closure must be `'static`: the
/// account list is read synchronously up front, then each worker clones
/// its own handle into the pool.
pub fn deploy_dirty_accounts(store: Arc<dyn Store>, connector: Arc<dyn Connector>, parallelism: usize, cancel: CancelToken) -> Result<Vec<(i64, Result<()>)>> {
    let dirty: Vec<i64> = store.list_active_accounts()?.into_iter().filter(|a| a.is_dirty).map(|a| a.id).collect();

    let worker = move |account_id: &i64| -> Result<()> {
        let account = store.get_account(*account_id)?;
        crate::engine::deploy::run_deployment_for_account(store.as_ref(), connector.as_ref(), &account, Utc::now())
    };

    let results = parallel_run(dirty.clone(), parallelism, cancel, worker);
    Ok(sort_by_input_order(&dirty, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::fake::{FakeConnector, FakeRemoteFs};
    use crate::store::memory::InMemoryStore;
    use std::sync::Mutex;

    fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_initial_system_key("ssh-ed25519 SYSPUB sys", "PEM").unwrap();
        for name in &["alice", "bob", "carol"] {
            store.add_account(name, "host.test", "", "").unwrap();
        }
        store
    }

    fn mark_all_dirty(store: &InMemoryStore) {
        let ids: Vec<i64> = store.list_active_accounts().unwrap().iter().map(|a| a.id).collect();
        store.mark_accounts_dirty(&ids).unwrap();
    }

    #[test]
    fn only_dirty_accounts_are_visited() {
        let store = seeded_store();
        let ids: Vec<i64> = store.list_active_accounts().unwrap().iter().map(|a| a.id).collect();
        store.mark_accounts_dirty(&[ids[0]]).unwrap();

        let visited = Arc::new(Mutex::new(Vec::new()));
        let visited2 = Arc::clone(&visited);
        let results = run_for_dirty_accounts(&store, 2, CancelToken::new(), move |id| {
            visited2.lock().unwrap().push(*id);
            Ok(())
        }).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(*visited.lock().unwrap(), vec![ids[0]]);
    }

    #[test]
    fn one_failing_account_does_not_block_the_others() {
        let store = seeded_store();
        mark_all_dirty(&store);
        let ids: Vec<i64> = store.list_active_accounts().unwrap().iter().map(|a| a.id).collect();
        let failing_id = ids[1];

        let results = run_for_dirty_accounts(&store, 3, CancelToken::new(), move |id| {
            if *id == failing_id {
                Err(crate::error::ErrorKind::ErrOther("simulated".to_string()).into())
            } else {
                Ok(())
            }
        }).unwrap();

        assert_eq!(results.len(), 3);
        let failed: Vec<i64> = results.iter().filter(|(_, r)| r.is_err()).map(|(id, _)| *id).collect();
        assert_eq!(failed, vec![failing_id]);
    }

    #[test]
    fn deploy_dirty_accounts_redeploys_and_clears_dirty_flag() {
        let store_concrete = seeded_store();
        let connector = FakeConnector::new(FakeRemoteFs::new());
        connector.set_host_key("host.test", "ssh-ed25519 HOSTKEY host.test");
        store_concrete.add_known_host("host.test:22", "ssh-ed25519 HOSTKEY host.test").unwrap();
        let ids: Vec<i64> = store_concrete.list_active_accounts().unwrap().iter().map(|a| a.id).collect();
        store_concrete.mark_accounts_dirty(&ids).unwrap();

        let store: Arc<dyn Store> = Arc::new(store_concrete);
        let connector: Arc<dyn Connector> = Arc::new(connector);
        let results = deploy_dirty_accounts(store.clone(), connector, 2, CancelToken::new()).unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        for id in ids {
            assert!(!store.get_account(id).unwrap().is_dirty);
        }
    }

    #[test]
    fn no_dirty_accounts_yields_empty_result() {
        let store = seeded_store();
        let results = run_for_dirty_accounts(&store, 2, CancelToken::new(), |_| Ok(())).unwrap();
        assert!(results.is_empty());
    }

    /// spec.md §8 scenario D: {id1 clean, id2 dirty, id3 dirty}, the worker
    /// fails only id3; results must come back as exactly 2 entries, in
    /// input order (id2 then id3), regardless of which one's worker
    /// happens to finish first.
    #[test]
    fn results_come_back_in_dirty_account_input_order_not_completion_order() {
        let store = seeded_store();
        let ids: Vec<i64> = store.list_active_accounts().unwrap().iter().map(|a| a.id).collect();
        let (id1, id2, id3) = (ids[0], ids[1], ids[2]);
        store.mark_accounts_dirty(&[id2, id3]).unwrap();

        // id3 (submitted second) is made to finish before id2 (submitted
        // first) so a completion-order return would visibly differ from
        // input order.
        let results = run_for_dirty_accounts(&store, 2, CancelToken::new(), move |id| {
            if *id == id2 {
                std::thread::sleep(std::time::Duration::from_millis(30));
            }
            if *id == id3 {
                Err(crate::error::ErrorKind::ErrOther("simulated".to_string()).into())
            } else {
                Ok(())
            }
        }).unwrap();

        assert_eq!(results.len(), 2);
        let returned_ids: Vec<i64> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(returned_ids, vec![id2, id3]);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        let _ = id1;
    }
}
