use std::fmt;

use thiserror::Error;

use crate::buffer::PageId;
use crate::transaction::TransactionId;

pub type TidepoolResult<T, E = TidepoolError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum TidepoolError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid page id: {0}")]
    InvalidPageId(PageId),

    #[error("Transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

/// Why the lock manager aborted a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
    AttemptedUnlockButNoLockHeld,
    TableUnlockedBeforeUnlockingRows,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::LockOnShrinking => "lock requested in shrinking phase",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under read uncommitted"
            }
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "lock upgrade not permitted by the upgrade lattice",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableLockNotPresent => "row lock requested without a table lock",
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock requested but no lock held",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked while row locks are still held"
            }
        };
        write!(f, "{}", s)
    }
}
