use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::LockManagerConfig;
use crate::error::{AbortReason, TidepoolError, TidepoolResult};
use crate::storage::page::RecordId;
use crate::transaction::{IsolationLevel, TableOid, Transaction, TransactionId, TransactionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared
                | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        )
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    oid: TableOid,
    rid: Option<RecordId>,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    requests: VecDeque<LockRequest>,
    /// Transaction currently upgrading on this resource, if any. At most one
    /// at a time; a second upgrader aborts with `UpgradeConflict`.
    upgrading: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    table_queues: DashMap<TableOid, Arc<LockRequestQueue>>,
    row_queues: DashMap<RecordId, Arc<LockRequestQueue>>,
}

/// Hierarchical two-phase-locking lock manager: table and row locks in five
/// modes, compatibility-matrix admission, upgrades with queue priority, and
/// a background deadlock detector over the wait-for graph.
#[derive(Debug)]
pub struct LockManager {
    state: Arc<LockState>,
    shutdown: Arc<AtomicBool>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        let state = Arc::new(LockState::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let detector = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            let interval = config.cycle_detection_interval;
            thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    run_cycle_detection(&state);
                }
            })
        };

        LockManager {
            state,
            shutdown,
            detector: Some(detector),
        }
    }

    /// Acquire a table lock. `Ok(false)` means the wait was cut short because
    /// the transaction was aborted (deadlock victim); the caller is expected
    /// to release whatever the transaction still holds.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> TidepoolResult<bool> {
        self.check_isolation_level(txn, mode, false)?;
        let queue = self
            .state
            .table_queues
            .entry(oid)
            .or_insert_with(|| Arc::new(LockRequestQueue::default()))
            .value()
            .clone();
        self.lock_on_queue(txn, mode, oid, None, &queue)
    }

    /// Acquire a row lock. Intention modes are table-only, and the matching
    /// table-level lock must already be held.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> TidepoolResult<bool> {
        if mode.is_intention() {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_isolation_level(txn, mode, true)?;
        if !self.table_lock_supports_row(txn, mode, oid) {
            return Err(self.abort(txn, AbortReason::TableLockNotPresent));
        }
        let queue = self
            .state
            .row_queues
            .entry(rid)
            .or_insert_with(|| Arc::new(LockRequestQueue::default()))
            .value()
            .clone();
        self.lock_on_queue(txn, mode, oid, Some(rid), &queue)
    }

    /// Release a table lock. All row locks under the table must already be
    /// gone. Drives the 2PL state machine into `Shrinking` per isolation
    /// level.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> TidepoolResult<()> {
        let Some(mode) = txn.table_lock_mode(oid) else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.holds_any_row_lock_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink {
            txn.begin_shrinking();
        }
        txn.forget_table_lock(oid);

        if let Some(queue) = self.state.table_queues.get(&oid).map(|q| q.value().clone()) {
            let mut inner = queue.inner.lock();
            remove_request(&mut inner, txn.id());
            grant_new_locks_if_possible(&mut inner);
            queue.cv.notify_all();
        }
        trace!("txn {} released table {} ({:?})", txn.id(), oid, mode);
        Ok(())
    }

    /// Release a row lock. With `force` the 2PL state transition is
    /// suppressed (used while tearing down an aborted transaction).
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
        force: bool,
    ) -> TidepoolResult<()> {
        let Some(mode) = txn.row_lock_mode(oid, rid) else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        if !force {
            let shrink = match txn.isolation_level() {
                IsolationLevel::RepeatableRead => {
                    matches!(mode, LockMode::Shared | LockMode::Exclusive)
                }
                IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                    mode == LockMode::Exclusive
                }
            };
            if shrink {
                txn.begin_shrinking();
            }
        }
        txn.forget_row_lock(oid, rid);

        if let Some(queue) = self.state.row_queues.get(&rid).map(|q| q.value().clone()) {
            let mut inner = queue.inner.lock();
            remove_request(&mut inner, txn.id());
            grant_new_locks_if_possible(&mut inner);
            queue.cv.notify_all();
        }
        Ok(())
    }

    /// Force-release everything the transaction still holds, rows before
    /// tables. The commit/abort path of the transaction runtime.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        for (oid, rid) in txn.held_row_ids() {
            let _ = self.unlock_row(txn, oid, rid, true);
        }
        for oid in txn.held_table_oids() {
            let _ = self.unlock_table(txn, oid);
        }
    }

    fn lock_on_queue(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<RecordId>,
        queue: &Arc<LockRequestQueue>,
    ) -> TidepoolResult<bool> {
        let mut inner = queue.inner.lock();

        let existing = inner.requests.iter().position(|r| r.txn.id() == txn.id());
        if let Some(pos) = existing {
            // This transaction already holds the resource: upgrade path.
            let held_mode = inner.requests[pos].mode;
            debug_assert!(inner.requests[pos].granted);
            if held_mode == mode {
                return Ok(true);
            }
            if inner.upgrading.is_some() {
                drop(inner);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !can_upgrade(held_mode, mode) {
                drop(inner);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            inner.requests.remove(pos);
            match rid {
                Some(rid) => txn.forget_row_lock(oid, rid),
                None => txn.forget_table_lock(oid),
            }
            // The upgrade jumps ahead of every ungranted peer, never ahead
            // of granted holders.
            let insert_pos = inner
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(inner.requests.len());
            inner.requests.insert(
                insert_pos,
                LockRequest {
                    txn: txn.clone(),
                    mode,
                    oid,
                    rid,
                    granted: false,
                },
            );
            inner.upgrading = Some(txn.id());
        } else {
            inner.requests.push_back(LockRequest {
                txn: txn.clone(),
                mode,
                oid,
                rid,
                granted: false,
            });
        }

        loop {
            if txn.state() == TransactionState::Aborted {
                remove_request(&mut inner, txn.id());
                if inner.upgrading == Some(txn.id()) {
                    inner.upgrading = None;
                }
                grant_new_locks_if_possible(&mut inner);
                queue.cv.notify_all();
                return Ok(false);
            }
            let pos = inner
                .requests
                .iter()
                .position(|r| r.txn.id() == txn.id())
                .ok_or_else(|| {
                    TidepoolError::Internal("lock request vanished while waiting".to_string())
                })?;
            if inner.requests[pos].granted {
                break;
            }
            if can_grant(&inner, pos) {
                inner.requests[pos].granted = true;
                break;
            }
            queue.cv.wait(&mut inner);
        }

        if inner.upgrading == Some(txn.id()) {
            inner.upgrading = None;
        }
        grant_new_locks_if_possible(&mut inner);
        queue.cv.notify_all();
        drop(inner);

        match rid {
            Some(rid) => txn.record_row_lock(oid, rid, mode),
            None => txn.record_table_lock(oid, mode),
        }
        trace!(
            "txn {} granted {:?} on table {} row {:?}",
            txn.id(),
            mode,
            oid,
            rid
        );
        Ok(true)
    }

    /// The isolation-level policing of lock acquisition. Sets the
    /// transaction `Aborted` and returns the typed reason on violation.
    fn check_isolation_level(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        is_row: bool,
    ) -> TidepoolResult<()> {
        match txn.state() {
            TransactionState::Shrinking => match txn.isolation_level() {
                IsolationLevel::RepeatableRead => {
                    Err(self.abort(txn, AbortReason::LockOnShrinking))
                }
                IsolationLevel::ReadCommitted => {
                    if matches!(mode, LockMode::Shared | LockMode::IntentionShared) {
                        Ok(())
                    } else {
                        Err(self.abort(txn, AbortReason::LockOnShrinking))
                    }
                }
                IsolationLevel::ReadUncommitted => {
                    if matches!(mode, LockMode::Exclusive | LockMode::IntentionExclusive) {
                        Err(self.abort(txn, AbortReason::LockOnShrinking))
                    } else {
                        Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted))
                    }
                }
            },
            TransactionState::Growing => {
                if txn.isolation_level() == IsolationLevel::ReadUncommitted {
                    let shared_like = if is_row {
                        mode == LockMode::Shared
                    } else {
                        matches!(
                            mode,
                            LockMode::Shared
                                | LockMode::IntentionShared
                                | LockMode::SharedIntentionExclusive
                        )
                    };
                    if shared_like {
                        return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                    }
                }
                Ok(())
            }
            // Aborted transactions fall out of the wait loop immediately;
            // committed ones have no business here but are not policed.
            TransactionState::Aborted | TransactionState::Committed => Ok(()),
        }
    }

    /// A row lock needs the right table-level company: exclusive rows under
    /// IX/SIX/X, shared rows under any table lock.
    fn table_lock_supports_row(&self, txn: &Arc<Transaction>, mode: LockMode, oid: TableOid) -> bool {
        let Some(table_mode) = txn.table_lock_mode(oid) else {
            return false;
        };
        match mode {
            LockMode::Exclusive => matches!(
                table_mode,
                LockMode::IntentionExclusive
                    | LockMode::SharedIntentionExclusive
                    | LockMode::Exclusive
            ),
            LockMode::Shared => true,
            _ => false,
        }
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TidepoolError {
        txn.set_state(TransactionState::Aborted);
        warn!("txn {} aborted: {}", txn.id(), reason);
        TidepoolError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector.take() {
            let _ = handle.join();
        }
    }
}

fn remove_request(inner: &mut QueueInner, txn_id: TransactionId) {
    let pos = inner.requests.iter().position(|r| r.txn.id() == txn_id);
    if let Some(pos) = pos {
        inner.requests.remove(pos);
    }
}

/// A request is grantable iff its mode is compatible with every granted
/// request, and no pending upgrade outranks it.
fn can_grant(inner: &QueueInner, pos: usize) -> bool {
    let request = &inner.requests[pos];
    for (i, other) in inner.requests.iter().enumerate() {
        if i == pos || !other.granted || other.txn.id() == request.txn.id() {
            continue;
        }
        if !modes_compatible(request.mode, other.mode) {
            return false;
        }
    }
    if let Some(upgrading) = inner.upgrading {
        if request.txn.id() != upgrading {
            if let Some(upgrade_pos) = inner
                .requests
                .iter()
                .position(|r| r.txn.id() == upgrading)
            {
                if pos > upgrade_pos {
                    return false;
                }
            }
        }
    }
    true
}

/// Walk the queue head-first, admitting compatible ungranted requests until
/// the first one that cannot be granted. Clears `upgrading` when the
/// upgrading request goes through.
fn grant_new_locks_if_possible(inner: &mut QueueInner) {
    loop {
        let Some(pos) = inner.requests.iter().position(|r| !r.granted) else {
            return;
        };
        if !can_grant(inner, pos) {
            return;
        }
        let request = &mut inner.requests[pos];
        request.granted = true;
        trace!(
            "txn {} granted {:?} on table {} row {:?} from the queue walk",
            request.txn.id(),
            request.mode,
            request.oid,
            request.rid
        );
        if inner.upgrading == Some(inner.requests[pos].txn.id()) {
            inner.upgrading = None;
        }
    }
}

/// Compatibility matrix, requested x held.
fn modes_compatible(requested: LockMode, held: LockMode) -> bool {
    match requested {
        LockMode::Shared => matches!(
            held,
            LockMode::Shared | LockMode::IntentionShared
        ),
        LockMode::Exclusive => false,
        LockMode::IntentionShared => !matches!(held, LockMode::Exclusive),
        LockMode::IntentionExclusive => matches!(
            held,
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ),
        LockMode::SharedIntentionExclusive => matches!(held, LockMode::IntentionShared),
    }
}

/// Permitted monotone upgrade transitions.
fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
    matches!(
        (held, requested),
        (
            LockMode::IntentionShared,
            LockMode::Shared
                | LockMode::Exclusive
                | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        ) | (
            LockMode::Shared,
            LockMode::Exclusive | LockMode::SharedIntentionExclusive
        ) | (
            LockMode::IntentionExclusive,
            LockMode::Exclusive | LockMode::SharedIntentionExclusive
        ) | (LockMode::SharedIntentionExclusive, LockMode::Exclusive)
    )
}

/// One round of deadlock detection: rebuild the wait-for graph (an edge from
/// every ungranted transaction to every granted one in the same queue),
/// then repeatedly abort the victim of each cycle until none remains.
fn run_cycle_detection(state: &LockState) {
    let mut waits_for: BTreeMap<TransactionId, BTreeSet<TransactionId>> = BTreeMap::new();
    let mut txns: HashMap<TransactionId, Arc<Transaction>> = HashMap::new();

    for entry in state.table_queues.iter() {
        collect_edges(entry.value(), &mut waits_for, &mut txns);
    }
    for entry in state.row_queues.iter() {
        collect_edges(entry.value(), &mut waits_for, &mut txns);
    }

    while let Some(victim) = find_cycle_victim(&waits_for) {
        warn!("deadlock detected, aborting txn {}", victim);
        if let Some(txn) = txns.get(&victim) {
            txn.set_state(TransactionState::Aborted);
        }
        notify_queues_holding(state, victim);
        waits_for.remove(&victim);
        for edges in waits_for.values_mut() {
            edges.remove(&victim);
        }
        waits_for.retain(|_, edges| !edges.is_empty());
    }
}

fn collect_edges(
    queue: &Arc<LockRequestQueue>,
    waits_for: &mut BTreeMap<TransactionId, BTreeSet<TransactionId>>,
    txns: &mut HashMap<TransactionId, Arc<Transaction>>,
) {
    let inner = queue.inner.lock();
    let granted: Vec<TransactionId> = inner
        .requests
        .iter()
        .filter(|r| r.granted)
        .map(|r| r.txn.id())
        .collect();
    for request in inner.requests.iter() {
        txns.insert(request.txn.id(), request.txn.clone());
        if request.granted {
            continue;
        }
        for &holder in &granted {
            if holder != request.txn.id() {
                waits_for.entry(request.txn.id()).or_default().insert(holder);
            }
        }
    }
}

/// DFS from the lowest transaction id, visiting neighbours in ascending
/// order; on a back-edge the victim is the highest id on the cycle, i.e. on
/// the path suffix starting at the revisited node.
fn find_cycle_victim(
    waits_for: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
) -> Option<TransactionId> {
    fn dfs(
        node: TransactionId,
        graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
        path: &mut Vec<TransactionId>,
        on_path: &mut BTreeSet<TransactionId>,
    ) -> Option<TransactionId> {
        if on_path.contains(&node) {
            let cycle_start = path.iter().position(|&n| n == node).unwrap_or(0);
            return path[cycle_start..].iter().copied().max();
        }
        path.push(node);
        on_path.insert(node);
        if let Some(nexts) = graph.get(&node) {
            for &next in nexts {
                if let Some(victim) = dfs(next, graph, path, on_path) {
                    return Some(victim);
                }
            }
        }
        path.pop();
        on_path.remove(&node);
        None
    }

    for &start in waits_for.keys() {
        let mut path = Vec::new();
        let mut on_path = BTreeSet::new();
        if let Some(victim) = dfs(start, waits_for, &mut path, &mut on_path) {
            return Some(victim);
        }
    }
    None
}

/// Wake every queue the victim appears in so its waiting thread can clean
/// up and return.
fn notify_queues_holding(state: &LockState, victim: TransactionId) {
    for entry in state.table_queues.iter() {
        let inner = entry.value().inner.lock();
        if inner.requests.iter().any(|r| r.txn.id() == victim) {
            entry.value().cv.notify_all();
        }
    }
    for entry in state.row_queues.iter() {
        let inner = entry.value().inner.lock();
        if inner.requests.iter().any(|r| r.txn.id() == victim) {
            entry.value().cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    fn new_manager() -> LockManager {
        LockManager::new(LockManagerConfig {
            cycle_detection_interval: Duration::from_millis(10),
        })
    }

    fn new_txn(id: TransactionId, level: IsolationLevel) -> Arc<Transaction> {
        Arc::new(Transaction::new(id, level))
    }

    fn abort_reason(result: TidepoolResult<bool>) -> AbortReason {
        match result {
            Err(TidepoolError::TransactionAbort { reason, .. }) => reason,
            other => panic!("expected abort, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn shared_locks_are_compatible() {
        let manager = new_manager();
        let txn1 = new_txn(1, IsolationLevel::RepeatableRead);
        let txn2 = new_txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_table(&txn1, LockMode::Shared, 1).unwrap());
        assert!(manager.lock_table(&txn2, LockMode::Shared, 1).unwrap());

        manager.unlock_table(&txn1, 1).unwrap();
        manager.unlock_table(&txn2, 1).unwrap();
    }

    #[test]
    fn exclusive_waits_for_shared_and_shrinking_lock_aborts() {
        let manager = Arc::new(new_manager());
        let txn1 = new_txn(1, IsolationLevel::RepeatableRead);
        let txn2 = new_txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_table(&txn1, LockMode::Shared, 7).unwrap());

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let manager = manager.clone();
            let txn2 = txn2.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let ok = manager.lock_table(&txn2, LockMode::Exclusive, 7).unwrap();
                acquired.store(ok, AtomicOrdering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(AtomicOrdering::SeqCst));

        // Releasing S under repeatable read moves txn1 into shrinking and
        // hands the queue to txn2.
        manager.unlock_table(&txn1, 7).unwrap();
        handle.join().unwrap();
        assert!(acquired.load(AtomicOrdering::SeqCst));
        assert_eq!(txn1.state(), TransactionState::Shrinking);

        // Any further acquisition by txn1 aborts.
        assert_eq!(
            abort_reason(manager.lock_table(&txn1, LockMode::Shared, 7)),
            AbortReason::LockOnShrinking
        );
        assert_eq!(txn1.state(), TransactionState::Aborted);
    }

    #[test]
    fn read_uncommitted_rejects_shared_locks() {
        let manager = new_manager();
        let txn = new_txn(1, IsolationLevel::ReadUncommitted);
        assert_eq!(
            abort_reason(manager.lock_table(&txn, LockMode::Shared, 1)),
            AbortReason::LockSharedOnReadUncommitted
        );
    }

    #[test]
    fn read_committed_allows_shared_while_shrinking() {
        let manager = new_manager();
        let txn = new_txn(1, IsolationLevel::ReadCommitted);
        assert!(manager.lock_table(&txn, LockMode::Exclusive, 1).unwrap());
        manager.unlock_table(&txn, 1).unwrap();
        assert_eq!(txn.state(), TransactionState::Shrinking);

        assert!(manager.lock_table(&txn, LockMode::Shared, 2).unwrap());
        assert_eq!(
            abort_reason(manager.lock_table(&txn, LockMode::Exclusive, 3)),
            AbortReason::LockOnShrinking
        );
    }

    #[test]
    fn intention_lock_on_row_aborts() {
        let manager = new_manager();
        let txn = new_txn(1, IsolationLevel::RepeatableRead);
        assert_eq!(
            abort_reason(manager.lock_row(&txn, LockMode::IntentionShared, 1, RecordId::new(1, 1))),
            AbortReason::AttemptedIntentionLockOnRow
        );
    }

    #[test]
    fn row_lock_requires_table_intention() {
        let manager = new_manager();
        let rid = RecordId::new(1, 1);

        let txn1 = new_txn(1, IsolationLevel::RepeatableRead);
        assert_eq!(
            abort_reason(manager.lock_row(&txn1, LockMode::Exclusive, 1, rid)),
            AbortReason::TableLockNotPresent
        );

        // IS on the table is enough for a shared row lock but not an
        // exclusive one.
        let txn2 = new_txn(2, IsolationLevel::RepeatableRead);
        assert!(manager
            .lock_table(&txn2, LockMode::IntentionShared, 1)
            .unwrap());
        assert!(manager.lock_row(&txn2, LockMode::Shared, 1, rid).unwrap());
        assert_eq!(
            abort_reason(manager.lock_row(&txn2, LockMode::Exclusive, 1, RecordId::new(1, 2))),
            AbortReason::TableLockNotPresent
        );

        let txn3 = new_txn(3, IsolationLevel::RepeatableRead);
        assert!(manager
            .lock_table(&txn3, LockMode::IntentionExclusive, 2)
            .unwrap());
        assert!(manager
            .lock_row(&txn3, LockMode::Exclusive, 2, rid)
            .unwrap());
    }

    #[test]
    fn table_unlock_blocked_by_row_locks() {
        let manager = new_manager();
        let txn = new_txn(1, IsolationLevel::RepeatableRead);
        let rid = RecordId::new(1, 1);

        assert!(manager
            .lock_table(&txn, LockMode::IntentionExclusive, 1)
            .unwrap());
        assert!(manager.lock_row(&txn, LockMode::Exclusive, 1, rid).unwrap());

        assert_eq!(
            abort_reason(manager.unlock_table(&txn, 1).map(|_| true)),
            AbortReason::TableUnlockedBeforeUnlockingRows
        );
    }

    #[test]
    fn unlock_without_lock_aborts() {
        let manager = new_manager();
        let txn = new_txn(1, IsolationLevel::RepeatableRead);
        assert_eq!(
            abort_reason(manager.unlock_table(&txn, 9).map(|_| true)),
            AbortReason::AttemptedUnlockButNoLockHeld
        );
    }

    #[test]
    fn identical_mode_relock_is_a_noop() {
        let manager = new_manager();
        let txn = new_txn(1, IsolationLevel::RepeatableRead);
        assert!(manager.lock_table(&txn, LockMode::Shared, 1).unwrap());
        assert!(manager.lock_table(&txn, LockMode::Shared, 1).unwrap());
        manager.unlock_table(&txn, 1).unwrap();
    }

    #[test]
    fn upgrade_follows_the_lattice() {
        let manager = new_manager();
        let txn = new_txn(1, IsolationLevel::RepeatableRead);

        assert!(manager
            .lock_table(&txn, LockMode::IntentionShared, 1)
            .unwrap());
        assert!(manager.lock_table(&txn, LockMode::Shared, 1).unwrap());
        assert!(manager.lock_table(&txn, LockMode::Exclusive, 1).unwrap());
        assert_eq!(txn.table_lock_mode(1), Some(LockMode::Exclusive));

        // X cannot be downgraded.
        let txn2 = new_txn(2, IsolationLevel::RepeatableRead);
        assert!(manager.lock_table(&txn2, LockMode::Exclusive, 2).unwrap());
        assert_eq!(
            abort_reason(manager.lock_table(&txn2, LockMode::Shared, 2)),
            AbortReason::IncompatibleUpgrade
        );
    }

    #[test]
    fn concurrent_upgrades_conflict() {
        let manager = Arc::new(new_manager());
        let txn1 = new_txn(1, IsolationLevel::RepeatableRead);
        let txn2 = new_txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_table(&txn1, LockMode::Shared, 1).unwrap());
        assert!(manager.lock_table(&txn2, LockMode::Shared, 1).unwrap());

        // txn1 starts upgrading and blocks behind txn2's shared lock.
        let handle = {
            let manager = manager.clone();
            let txn1 = txn1.clone();
            thread::spawn(move || manager.lock_table(&txn1, LockMode::Exclusive, 1).unwrap())
        };
        thread::sleep(Duration::from_millis(30));

        // A second upgrader aborts immediately.
        assert_eq!(
            abort_reason(manager.lock_table(&txn2, LockMode::Exclusive, 1)),
            AbortReason::UpgradeConflict
        );
        manager.release_all_locks(&txn2);

        assert!(handle.join().unwrap());
        assert_eq!(txn1.table_lock_mode(1), Some(LockMode::Exclusive));
    }

    #[test]
    fn deadlock_detector_aborts_the_youngest() {
        let manager = Arc::new(new_manager());
        let txn1 = new_txn(1, IsolationLevel::RepeatableRead);
        let txn2 = new_txn(2, IsolationLevel::RepeatableRead);

        assert!(manager.lock_table(&txn1, LockMode::Exclusive, 1).unwrap());
        assert!(manager.lock_table(&txn2, LockMode::Exclusive, 2).unwrap());

        // txn1 waits for table 2, txn2 waits for table 1: a cycle.
        let handle1 = {
            let manager = manager.clone();
            let txn1 = txn1.clone();
            thread::spawn(move || manager.lock_table(&txn1, LockMode::Exclusive, 2).unwrap())
        };
        let handle2 = {
            let manager = manager.clone();
            let txn2 = txn2.clone();
            thread::spawn(move || manager.lock_table(&txn2, LockMode::Exclusive, 1).unwrap())
        };

        // The detector aborts the higher id; its lock call reports failure.
        assert!(!handle2.join().unwrap());
        assert_eq!(txn2.state(), TransactionState::Aborted);

        // The survivor proceeds once the victim's locks are torn down.
        manager.release_all_locks(&txn2);
        assert!(handle1.join().unwrap());
        assert_eq!(txn1.state(), TransactionState::Growing);
    }

    #[test]
    fn detector_victim_comes_from_the_cycle_not_the_search_path() {
        let manager = Arc::new(new_manager());
        let txn_a = new_txn(1, IsolationLevel::RepeatableRead);
        let txn_b = new_txn(50, IsolationLevel::RepeatableRead);
        let txn_c = new_txn(2, IsolationLevel::RepeatableRead);
        let txn_d = new_txn(3, IsolationLevel::RepeatableRead);

        assert!(manager.lock_table(&txn_c, LockMode::Exclusive, 2).unwrap());
        assert!(manager.lock_table(&txn_d, LockMode::Exclusive, 3).unwrap());
        assert!(manager.lock_table(&txn_b, LockMode::Exclusive, 4).unwrap());

        // txn 50 waits behind txn 2, and txn 1 behind txn 50; both dangle off
        // the cycle without being part of it.
        let handle_b = {
            let manager = manager.clone();
            let txn_b = txn_b.clone();
            thread::spawn(move || manager.lock_table(&txn_b, LockMode::Exclusive, 2).unwrap())
        };
        let handle_a = {
            let manager = manager.clone();
            let txn_a = txn_a.clone();
            thread::spawn(move || manager.lock_table(&txn_a, LockMode::Exclusive, 4).unwrap())
        };
        thread::sleep(Duration::from_millis(30));

        // txns 2 and 3 now close a cycle over tables 2 and 3.
        let handle_c = {
            let manager = manager.clone();
            let txn_c = txn_c.clone();
            thread::spawn(move || manager.lock_table(&txn_c, LockMode::Exclusive, 3).unwrap())
        };
        let handle_d = {
            let manager = manager.clone();
            let txn_d = txn_d.clone();
            thread::spawn(move || manager.lock_table(&txn_d, LockMode::Exclusive, 2).unwrap())
        };

        // Only the highest id on the cycle dies; the bystander with the
        // larger id keeps waiting.
        assert!(!handle_d.join().unwrap());
        assert_eq!(txn_d.state(), TransactionState::Aborted);
        manager.release_all_locks(&txn_d);

        assert!(handle_c.join().unwrap());
        assert_ne!(txn_b.state(), TransactionState::Aborted);
        manager.release_all_locks(&txn_c);

        assert!(handle_b.join().unwrap());
        manager.release_all_locks(&txn_b);

        assert!(handle_a.join().unwrap());
        assert_ne!(txn_a.state(), TransactionState::Aborted);
    }

    #[test]
    fn released_exclusive_admits_all_compatible_waiters() {
        let manager = Arc::new(new_manager());
        let writer = new_txn(1, IsolationLevel::RepeatableRead);
        assert!(manager.lock_table(&writer, LockMode::Exclusive, 1).unwrap());

        let mut handles = Vec::new();
        for id in 2..6 {
            let manager = manager.clone();
            handles.push(thread::spawn(move || {
                let reader = new_txn(id, IsolationLevel::RepeatableRead);
                manager.lock_table(&reader, LockMode::Shared, 1).unwrap()
            }));
        }
        thread::sleep(Duration::from_millis(30));
        manager.unlock_table(&writer, 1).unwrap();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
