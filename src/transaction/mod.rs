mod lock_manager;

pub use lock_manager::{LockManager, LockMode};

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::storage::page::RecordId;

pub type TransactionId = u64;
pub type TableOid = u32;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase-locking lifecycle. `Aborted` is reachable from any earlier
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// A transaction as the lock manager sees it: identity, isolation level,
/// 2PL state, and the set of locks currently held. State and lock sets are
/// internally synchronized so the deadlock detector can abort from its own
/// thread.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    table_locks: Mutex<HashMap<TableOid, LockMode>>,
    row_locks: Mutex<HashMap<(TableOid, RecordId), LockMode>>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Transaction {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            table_locks: Mutex::new(HashMap::new()),
            row_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Move to `Shrinking`, but never out of a terminal or aborted state.
    pub(crate) fn begin_shrinking(&self) {
        let mut state = self.state.lock();
        if *state == TransactionState::Growing {
            *state = TransactionState::Shrinking;
        }
    }

    pub fn table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        self.table_locks.lock().get(&oid).copied()
    }

    pub fn row_lock_mode(&self, oid: TableOid, rid: RecordId) -> Option<LockMode> {
        self.row_locks.lock().get(&(oid, rid)).copied()
    }

    /// Tables on which this transaction holds any lock.
    pub fn held_table_oids(&self) -> Vec<TableOid> {
        self.table_locks.lock().keys().copied().collect()
    }

    /// Rows on which this transaction holds any lock.
    pub fn held_row_ids(&self) -> Vec<(TableOid, RecordId)> {
        self.row_locks.lock().keys().copied().collect()
    }

    pub fn holds_any_row_lock_on(&self, oid: TableOid) -> bool {
        self.row_locks.lock().keys().any(|&(o, _)| o == oid)
    }

    pub(crate) fn record_table_lock(&self, oid: TableOid, mode: LockMode) {
        self.table_locks.lock().insert(oid, mode);
    }

    pub(crate) fn forget_table_lock(&self, oid: TableOid) {
        self.table_locks.lock().remove(&oid);
    }

    pub(crate) fn record_row_lock(&self, oid: TableOid, rid: RecordId, mode: LockMode) {
        self.row_locks.lock().insert((oid, rid), mode);
    }

    pub(crate) fn forget_row_lock(&self, oid: TableOid, rid: RecordId) {
        self.row_locks.lock().remove(&(oid, rid));
    }
}
