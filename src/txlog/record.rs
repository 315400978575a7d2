//! Transaction log record structures and framing

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::xid::TransactionId;

/// Log Sequence Number - unique identifier for each log record
pub type Lsn = u64;

/// Outcome the coordinator decided for a prepared transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Rollback,
}

/// Heuristic outcome recorded after the second phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeuristicKind {
    Commit,
    Rollback,
    Mixed,
    Hazard,
}

/// A participant branch as recorded in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub branch: TransactionId,
    /// Resource manager identity, used to find the resource again at recovery
    pub resource_manager: String,
}

/// A transaction log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number
    pub lsn: Lsn,
    /// Local transaction number
    pub local_id: u64,
    /// Global transaction id (branch 0)
    pub xid: TransactionId,
    /// Server that owns the transaction
    pub server: String,
    /// Instance that wrote the record
    pub instance: String,
    /// The state transition
    pub op: LogOperation,
    /// Timestamp (Unix epoch millis)
    pub timestamp: u64,
}

/// State transitions that can be logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOperation {
    /// Every branch voted; the decision and participant snapshot
    Prepared {
        decision: Decision,
        branches: Vec<BranchRecord>,
    },
    /// The second phase ended with heuristic outcomes
    Heuristic {
        kind: HeuristicKind,
        branches: Vec<BranchRecord>,
    },
    /// Transaction fully resolved; its records may be dropped
    Completed,
    /// Keypoint marker listing local ids still live at compaction time
    Keypoint { live: Vec<u64> },
}

/// The latest known state of a transaction that is not yet completed
#[derive(Debug, Clone, PartialEq)]
pub struct LiveTransaction {
    pub xid: TransactionId,
    pub local_id: u64,
    pub server: String,
    pub decision: Decision,
    pub heuristic: Option<HeuristicKind>,
    pub branches: Vec<BranchRecord>,
}

/// Keep only the records of transactions without a `Completed` record.
/// Keypoint markers are dropped.
pub fn live_records(records: Vec<LogRecord>) -> Vec<LogRecord> {
    let completed: std::collections::HashSet<TransactionId> = records
        .iter()
        .filter(|r| matches!(r.op, LogOperation::Completed))
        .map(|r| r.xid.clone())
        .collect();

    records
        .into_iter()
        .filter(|r| !matches!(r.op, LogOperation::Keypoint { .. }))
        .filter(|r| !completed.contains(&r.xid))
        .collect()
}

/// Fold live records into one entry per global transaction, in LSN order.
/// The latest `Prepared` record carries the decision.
pub fn live_transactions(records: &[LogRecord]) -> Vec<LiveTransaction> {
    let mut sorted: Vec<&LogRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.lsn);

    let mut txns: BTreeMap<TransactionId, LiveTransaction> = BTreeMap::new();
    for record in sorted {
        match &record.op {
            LogOperation::Prepared { decision, branches } => {
                let entry = txns
                    .entry(record.xid.clone())
                    .or_insert_with(|| LiveTransaction {
                        xid: record.xid.clone(),
                        local_id: record.local_id,
                        server: record.server.clone(),
                        decision: *decision,
                        heuristic: None,
                        branches: branches.clone(),
                    });
                entry.decision = *decision;
                if !branches.is_empty() {
                    entry.branches = branches.clone();
                }
            }
            LogOperation::Heuristic { kind, .. } => {
                if let Some(entry) = txns.get_mut(&record.xid) {
                    entry.heuristic = Some(*kind);
                }
            }
            LogOperation::Completed => {
                txns.remove(&record.xid);
            }
            LogOperation::Keypoint { .. } => {}
        }
    }
    txns.into_values().collect()
}

/// Write one length-prefixed bincode frame. Returns bytes written.
pub fn write_frame<W: Write>(out: &mut W, record: &LogRecord) -> Result<usize> {
    let encoded = bincode::serialize(record)?;
    let len = encoded.len() as u32;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&encoded)?;
    Ok(4 + encoded.len())
}

/// Read every frame until EOF. A torn final frame (crash mid-write) ends the
/// scan; malformed frames are skipped.
pub fn read_frames<R: Read>(input: &mut R) -> Result<Vec<LogRecord>> {
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match input.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut record_buf = vec![0u8; len];
        match input.read_exact(&mut record_buf) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::warn!("Ignoring torn log record at end of log ({} bytes expected)", len);
                break;
            }
            Err(e) => return Err(e.into()),
        }

        match bincode::deserialize::<LogRecord>(&record_buf) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping malformed log record: {}", e),
        }
    }
    Ok(records)
}
