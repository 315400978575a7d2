//! Durable transaction log
//!
//! The coordinator records just enough to finish a transaction after a crash:
//!
//! 1. `Prepared { decision, branches }` once every branch has voted. It must be
//!    durable before any branch is told to commit (write-ahead rule).
//! 2. `Heuristic { .. }` when the second phase ended with heuristic outcomes.
//! 3. `Completed` when every branch is resolved. Records of completed
//!    transactions are dropped by the next keypoint.
//!
//! Two backends ship with the crate:
//! - [`FileLog`]: append-only file with group commit and deferred fsync
//! - [`MemoryLog`]: rows keyed by (local id, server, instance) holding an
//!   opaque encoded blob, the shape of a database-backed log

pub mod memory;
pub mod record;
pub mod wal;

pub use memory::{LogEvent, MemoryLog};
pub use record::{
    live_records, live_transactions, BranchRecord, Decision, HeuristicKind, LiveTransaction,
    LogOperation, LogRecord, Lsn,
};
pub use wal::{FileLog, LogWorkerHandle};

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::xid::TransactionId;

/// Backend contract for the transaction log
pub trait DurableLog: Send + Sync {
    /// Append a record. The record is not guaranteed durable until
    /// [`DurableLog::sync`] returns for its LSN.
    fn append(&self, xid: &TransactionId, local_id: u64, op: LogOperation) -> Result<Lsn>;

    /// Block until every record up to `lsn` is durable
    fn sync(&self, lsn: Lsn) -> Result<()>;

    /// Records of transactions owned by `server` that are not yet completed
    fn read_all(&self, server: &str) -> Result<Vec<LogRecord>>;

    /// Mark a transaction completed so compaction may drop its records
    fn delete(&self, xid: &TransactionId, local_id: u64) -> Result<()>;

    /// Compact the log, keeping only records of incomplete transactions
    fn keypoint(&self) -> Result<()>;

    /// Append and wait for durability
    fn append_durable(&self, xid: &TransactionId, local_id: u64, op: LogOperation) -> Result<Lsn> {
        let lsn = self.append(xid, local_id, op)?;
        self.sync(lsn)?;
        Ok(lsn)
    }
}

/// Current timestamp in milliseconds
pub(crate) fn timestamp() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}
