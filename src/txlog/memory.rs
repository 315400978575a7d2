//! In-memory log with the row layout of a database-backed log
//!
//! Each transaction owns one row keyed by `(local id, server, instance)`; the
//! row holds its records as an opaque bincode blob. Completing a transaction
//! deletes the row. Every call is also appended to an event journal so
//! callers can check write ordering after the fact.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::record::{LogOperation, LogRecord, Lsn};
use super::{timestamp, DurableLog};
use crate::error::{Result, TxError};
use crate::xid::TransactionId;

type RowKey = (u64, String, String);

/// One entry in the log's call journal
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Appended { lsn: Lsn, xid: TransactionId, op: LogOperation },
    Synced(Lsn),
    Deleted(TransactionId),
    Keypoint,
}

pub struct MemoryLog {
    server: String,
    instance: String,
    rows: Mutex<BTreeMap<RowKey, Vec<u8>>>,
    next_lsn: AtomicU64,
    synced_lsn: AtomicU64,
    events: Mutex<Vec<LogEvent>>,
    fail_writes: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryLog {
    pub fn new(server: &str, instance: &str) -> Self {
        Self {
            server: server.to_string(),
            instance: instance.to_string(),
            rows: Mutex::new(BTreeMap::new()),
            next_lsn: AtomicU64::new(1),
            synced_lsn: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following append fail with a system error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the call journal
    pub fn events(&self) -> Vec<LogEvent> {
        lock(&self.events).clone()
    }

    pub fn synced_lsn(&self) -> Lsn {
        self.synced_lsn.load(Ordering::SeqCst)
    }

    /// True if a `Prepared` record for the global transaction is durable
    pub fn is_prepared_durable(&self, xid: &TransactionId) -> bool {
        let synced = self.synced_lsn();
        lock(&self.events).iter().any(|e| match e {
            LogEvent::Appended { lsn, xid: logged, op } => {
                logged.same_global(xid)
                    && *lsn <= synced
                    && matches!(op, LogOperation::Prepared { .. })
            }
            _ => false,
        })
    }

    /// Number of rows (transactions) currently stored
    pub fn row_count(&self) -> usize {
        lock(&self.rows).len()
    }

    fn record_event(&self, event: LogEvent) {
        lock(&self.events).push(event);
    }
}

impl DurableLog for MemoryLog {
    fn append(&self, xid: &TransactionId, local_id: u64, op: LogOperation) -> Result<Lsn> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TxError::System("transaction log unavailable".into()));
        }
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord {
            lsn,
            local_id,
            xid: xid.global(),
            server: self.server.clone(),
            instance: self.instance.clone(),
            op: op.clone(),
            timestamp: timestamp(),
        };

        let key = (local_id, self.server.clone(), self.instance.clone());
        let mut rows = lock(&self.rows);
        let mut records: Vec<LogRecord> = match rows.get(&key) {
            Some(blob) => bincode::deserialize(blob)?,
            None => Vec::new(),
        };
        records.push(record);
        rows.insert(key, bincode::serialize(&records)?);
        drop(rows);

        self.record_event(LogEvent::Appended {
            lsn,
            xid: xid.global(),
            op,
        });
        Ok(lsn)
    }

    fn sync(&self, lsn: Lsn) -> Result<()> {
        self.synced_lsn.fetch_max(lsn, Ordering::SeqCst);
        self.record_event(LogEvent::Synced(lsn));
        Ok(())
    }

    fn read_all(&self, server: &str) -> Result<Vec<LogRecord>> {
        let rows = lock(&self.rows);
        let mut out = Vec::new();
        for ((_, row_server, _), blob) in rows.iter() {
            if row_server != server {
                continue;
            }
            let records: Vec<LogRecord> = bincode::deserialize(blob)?;
            out.extend(records);
        }
        out.sort_by_key(|r| r.lsn);
        Ok(out)
    }

    fn delete(&self, xid: &TransactionId, local_id: u64) -> Result<()> {
        let key = (local_id, self.server.clone(), self.instance.clone());
        lock(&self.rows).remove(&key);
        self.record_event(LogEvent::Deleted(xid.global()));
        Ok(())
    }

    fn keypoint(&self) -> Result<()> {
        // rows of completed transactions are already gone
        self.record_event(LogEvent::Keypoint);
        Ok(())
    }
}
