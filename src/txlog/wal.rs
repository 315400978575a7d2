//! File-backed transaction log: group-commit worker and keypoint compaction
//!
//! All file I/O happens on one dedicated worker thread. Callers hand records
//! to the worker over a bounded channel and get a reply once the record is in
//! the OS buffer. Durability is separate:
//!
//! - Writes are flushed to the OS immediately
//! - fsync happens every `fsync_interval_ms`, when the unsynced buffer grows
//!   past `max_unfsynced_bytes`, or on demand
//! - A caller that needs durability waits on a latch until the durable LSN
//!   passes its record, so many waiters share one fsync
//!
//! Keypoint runs on the worker too: it rewrites the file with only the records
//! of incomplete transactions, through a temporary file that atomically
//! replaces the log. Appends queued meanwhile land in the new file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::record::{live_records, read_frames, write_frame, LogOperation, LogRecord, Lsn};
use super::{timestamp, DurableLog};
use crate::config::{LogConfig, TmConfig};
use crate::error::{Result, TxError};
use crate::xid::{TransactionId, GTRID_LEN, KEYSTONE_FORMAT_ID};

/// Name of the log file inside the log directory
pub const LOG_FILE_NAME: &str = "tx.log";
/// Name of the JSON keypoint marker inside the log directory
pub const KEYPOINT_FILE_NAME: &str = "tx.keypoint";

/// How long a caller waits for its record to become durable
const DURABLE_WAIT: Duration = Duration::from_secs(30);

fn worker_gone<E: std::fmt::Display>(what: &str, e: E) -> TxError {
    TxError::System(format!("log worker {}: {}", what, e))
}

/// Commit latch shared between the worker and waiting callers
pub struct FsyncState {
    /// Highest LSN known to be on disk
    durable_lsn: AtomicU64,
    /// Highest LSN handed to the OS
    written_lsn: AtomicU64,
    condvar: Condvar,
    mutex: Mutex<()>,
    shutdown: AtomicU64,
}

impl FsyncState {
    fn new() -> Self {
        Self {
            durable_lsn: AtomicU64::new(0),
            written_lsn: AtomicU64::new(0),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            shutdown: AtomicU64::new(0),
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    pub fn written_lsn(&self) -> Lsn {
        self.written_lsn.load(Ordering::Acquire)
    }

    /// Wait until `target` is durable, the worker shuts down, or `timeout` passes
    pub fn wait_for_durable(&self, target: Lsn, timeout: Duration) -> Result<()> {
        if self.durable_lsn() >= target {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self
            .mutex
            .lock()
            .map_err(|_| TxError::System("fsync latch poisoned".into()))?;

        loop {
            if self.durable_lsn() >= target {
                return Ok(());
            }
            if self.shutdown.load(Ordering::Acquire) != 0 {
                return Err(TxError::System(
                    "log worker shut down while waiting for durability".into(),
                ));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TxError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "Timeout waiting for LSN {} to become durable (current: {})",
                        target,
                        self.durable_lsn()
                    ),
                )));
            }

            guard = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| TxError::System("fsync latch wait failed".into()))?
                .0;
        }
    }

    fn signal_durable(&self, lsn: Lsn) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        // take the latch so a waiter cannot miss the wake-up between its check and wait
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn update_written(&self, lsn: Lsn) {
        self.written_lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(1, Ordering::Release);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

/// A record to append, with the channel for the worker's reply
pub struct LogWriteRequest {
    pub record: LogRecord,
    pub responder: mpsc::SyncSender<Result<()>>,
}

/// Messages understood by the log worker
pub enum LogMessage {
    Write(LogWriteRequest),
    /// Rewrite the file keeping live records; replies with the number kept
    Keypoint {
        marker: LogRecord,
        responder: mpsc::SyncSender<Result<usize>>,
    },
    /// fsync now; replies with the durable LSN
    ForceSync(mpsc::SyncSender<Result<Lsn>>),
    Shutdown,
}

/// Handle to the log worker thread
pub struct LogWorkerHandle {
    sender: mpsc::SyncSender<LogMessage>,
    fsync_state: Arc<FsyncState>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl LogWorkerHandle {
    /// Open `path` for append and start the worker
    pub fn spawn(path: PathBuf, config: LogConfig, durable_lsn: Lsn) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (tx, rx) = mpsc::sync_channel::<LogMessage>(10_000);
        let fsync_state = Arc::new(FsyncState::new());
        // everything already in the file survived a previous run
        fsync_state.signal_durable(durable_lsn);
        fsync_state.update_written(durable_lsn);

        let state = Arc::clone(&fsync_state);
        let join = thread::Builder::new()
            .name("keystone-log".to_string())
            .spawn(move || log_worker_thread(file, rx, path, config, state))?;

        Ok(Self {
            sender: tx,
            fsync_state,
            join: Mutex::new(Some(join)),
        })
    }

    /// Append a record; returns once it reached the OS buffer
    pub fn write(&self, record: LogRecord) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(LogMessage::Write(LogWriteRequest {
                record,
                responder: tx,
            }))
            .map_err(|e| worker_gone("channel closed", e))?;
        rx.recv().map_err(|e| worker_gone("response lost", e))?
    }

    pub fn wait_for_durable(&self, lsn: Lsn) -> Result<()> {
        self.fsync_state.wait_for_durable(lsn, DURABLE_WAIT)
    }

    pub fn force_sync(&self) -> Result<Lsn> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(LogMessage::ForceSync(tx))
            .map_err(|e| worker_gone("channel closed", e))?;
        rx.recv().map_err(|e| worker_gone("response lost", e))?
    }

    pub fn keypoint(&self, marker: LogRecord) -> Result<usize> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(LogMessage::Keypoint {
                marker,
                responder: tx,
            })
            .map_err(|e| worker_gone("channel closed", e))?;
        rx.recv().map_err(|e| worker_gone("response lost", e))?
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.fsync_state.durable_lsn()
    }

    pub fn written_lsn(&self) -> Lsn {
        self.fsync_state.written_lsn()
    }

    /// Stop the worker after a final fsync
    pub fn shutdown(&self) {
        let _ = self.sender.send(LogMessage::Shutdown);
        let join = match self.join.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(join) = join {
            if join.join().is_err() {
                log::error!("Log worker panicked");
            }
        }
    }
}

impl Drop for LogWorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker loop: batch writes, deferred fsync, keypoint
fn log_worker_thread(
    mut file: File,
    rx: mpsc::Receiver<LogMessage>,
    path: PathBuf,
    config: LogConfig,
    fsync_state: Arc<FsyncState>,
) {
    let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
    let fsync_interval = Duration::from_millis(config.fsync_interval_ms);
    let deferred_fsync = config.fsync_interval_ms > 0;

    let mut last_fsync = Instant::now();
    let mut unfsynced_bytes: usize = 0;
    let mut max_written_lsn: Lsn = fsync_state.written_lsn();

    loop {
        let mut batch: Vec<LogWriteRequest> = Vec::new();
        let mut keypoints: Vec<(LogRecord, mpsc::SyncSender<Result<usize>>)> = Vec::new();
        let mut force_syncs: Vec<mpsc::SyncSender<Result<Lsn>>> = Vec::new();
        let mut should_shutdown = false;

        let time_until_fsync = if deferred_fsync && unfsynced_bytes > 0 {
            fsync_interval.saturating_sub(last_fsync.elapsed())
        } else {
            fsync_interval.max(batch_timeout)
        };
        let recv_timeout = batch_timeout.min(time_until_fsync).max(Duration::from_millis(1));

        let mut accept = |msg: LogMessage,
                          batch: &mut Vec<LogWriteRequest>,
                          should_shutdown: &mut bool| match msg {
            LogMessage::Write(req) => batch.push(req),
            LogMessage::Keypoint { marker, responder } => keypoints.push((marker, responder)),
            LogMessage::ForceSync(responder) => force_syncs.push(responder),
            LogMessage::Shutdown => *should_shutdown = true,
        };

        match rx.recv_timeout(recv_timeout) {
            Ok(msg) => accept(msg, &mut batch, &mut should_shutdown),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => should_shutdown = true,
        }

        // gather more writes for the same batch
        let deadline = Instant::now() + batch_timeout;
        while batch.len() < config.max_batch_size && !should_shutdown {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(msg) => accept(msg, &mut batch, &mut should_shutdown),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let mut responders = Vec::with_capacity(batch.len());
            let mut total = 0usize;
            let mut failure: Option<TxError> = None;
            let mut batch_max = 0;
            for req in batch {
                if failure.is_none() {
                    match write_frame(&mut file, &req.record) {
                        Ok(n) => total += n,
                        Err(e) => failure = Some(e),
                    }
                }
                batch_max = batch_max.max(req.record.lsn);
                responders.push(req.responder);
            }
            let written = match failure {
                Some(e) => Err(e),
                None => flush_batch(&mut file, deferred_fsync).map(|_| total),
            };

            match written {
                Ok(bytes) => {
                    max_written_lsn = max_written_lsn.max(batch_max);
                    fsync_state.update_written(max_written_lsn);
                    if deferred_fsync {
                        unfsynced_bytes += bytes;
                    } else {
                        fsync_state.signal_durable(max_written_lsn);
                        last_fsync = Instant::now();
                    }
                    for responder in responders {
                        let _ = responder.send(Ok(()));
                    }
                }
                Err(e) => {
                    log::error!("Transaction log write failed: {}", e);
                    let msg = e.to_string();
                    for responder in responders {
                        let _ = responder.send(Err(TxError::System(format!(
                            "transaction log write failed: {}",
                            msg
                        ))));
                    }
                }
            }
        }

        let time_triggered = deferred_fsync && last_fsync.elapsed() >= fsync_interval;
        let size_triggered = unfsynced_bytes >= config.max_unfsynced_bytes;
        let needs_sync = !force_syncs.is_empty() || !keypoints.is_empty() || should_shutdown;

        if unfsynced_bytes > 0 && (time_triggered || size_triggered || needs_sync) {
            match file.sync_data() {
                Ok(()) => {
                    fsync_state.signal_durable(max_written_lsn);
                    log::debug!(
                        "Log fsync complete: LSN {}, {} bytes",
                        max_written_lsn,
                        unfsynced_bytes
                    );
                    unfsynced_bytes = 0;
                    last_fsync = Instant::now();
                }
                Err(e) => {
                    log::error!("Transaction log fsync failed: {}", e);
                    for responder in force_syncs.drain(..) {
                        let _ = responder.send(Err(TxError::Io(e.kind().into())));
                    }
                }
            }
        }
        for responder in force_syncs {
            let _ = responder.send(Ok(fsync_state.durable_lsn()));
        }

        for (mut marker, responder) in keypoints {
            let result = perform_keypoint(&mut file, &path, &mut marker);
            if result.is_ok() {
                max_written_lsn = max_written_lsn.max(marker.lsn);
                fsync_state.update_written(max_written_lsn);
                fsync_state.signal_durable(max_written_lsn);
            }
            let _ = responder.send(result);
        }

        if should_shutdown {
            if unfsynced_bytes > 0 && file.sync_data().is_ok() {
                fsync_state.signal_durable(max_written_lsn);
            }
            fsync_state.signal_shutdown();
            log::info!("Transaction log worker shutting down");
            break;
        }
    }
}

fn flush_batch(file: &mut File, deferred_fsync: bool) -> Result<()> {
    file.flush()?;
    if !deferred_fsync {
        file.sync_data()?;
    }
    Ok(())
}

/// Rewrite the log keeping live records plus a keypoint marker
fn perform_keypoint(file: &mut File, path: &Path, marker: &mut LogRecord) -> Result<usize> {
    file.flush()?;
    file.sync_all()?;

    let records = read_frames(&mut BufReader::new(File::open(path)?))?;
    let total = records.len();
    let live = live_records(records);

    let mut live_ids: Vec<u64> = live.iter().map(|r| r.local_id).collect();
    live_ids.sort_unstable();
    live_ids.dedup();
    marker.op = LogOperation::Keypoint { live: live_ids };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir)?;
    for record in &live {
        write_frame(tmp.as_file_mut(), record)?;
    }
    write_frame(tmp.as_file_mut(), marker)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| TxError::Io(e.error))?;

    *file = OpenOptions::new().create(true).append(true).open(path)?;

    log::info!(
        "Keypoint at LSN {}: kept {} of {} records",
        marker.lsn,
        live.len(),
        total
    );
    Ok(live.len())
}

/// JSON marker written next to the log after each keypoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeypointMarker {
    pub lsn: Lsn,
    pub live_records: usize,
    pub durable_lsn: Lsn,
    pub timestamp: u64,
}

impl KeypointMarker {
    /// Read the marker from a log directory, if one was written
    pub fn read(dir: &Path) -> Option<Self> {
        let path = dir.join(KEYPOINT_FILE_NAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return None,
        };
        match serde_json::from_str(&text) {
            Ok(marker) => Some(marker),
            Err(e) => {
                log::warn!("Failed to parse keypoint marker '{}': {}", path.display(), e);
                None
            }
        }
    }
}

/// Append-only file log
pub struct FileLog {
    dir: PathBuf,
    worker: LogWorkerHandle,
    current_lsn: AtomicU64,
    server: String,
    instance: String,
    keypoint_interval: u64,
    completed_since_keypoint: AtomicU64,
    max_local_id: u64,
}

impl FileLog {
    /// Open (or create) the log in `dir`
    pub fn open(
        dir: &Path,
        server: &str,
        instance: &str,
        config: &LogConfig,
        keypoint_interval: u64,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let existing = if path.exists() {
            read_frames(&mut BufReader::new(File::open(&path)?))?
        } else {
            Vec::new()
        };
        let max_lsn = existing.iter().map(|r| r.lsn).max().unwrap_or(0);
        let max_local_id = existing
            .iter()
            .filter(|r| r.server == server)
            .map(|r| r.local_id)
            .max()
            .unwrap_or(0);

        let worker = LogWorkerHandle::spawn(path.clone(), config.clone(), max_lsn)?;
        log::info!(
            "Opened transaction log {} ({} records, next LSN {})",
            path.display(),
            existing.len(),
            max_lsn + 1
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            worker,
            current_lsn: AtomicU64::new(max_lsn + 1),
            server: server.to_string(),
            instance: instance.to_string(),
            keypoint_interval,
            completed_since_keypoint: AtomicU64::new(0),
            max_local_id,
        })
    }

    /// Open the log described by a manager configuration
    pub fn from_config(config: &TmConfig) -> Result<Self> {
        Self::open(
            &config.tx_log_dir,
            &config.server_name,
            &config.instance_name,
            &config.log,
            config.keypoint_interval,
        )
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    /// Highest local transaction number found in the log at open time
    pub fn max_local_id(&self) -> u64 {
        self.max_local_id
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.worker.durable_lsn()
    }

    pub fn force_sync(&self) -> Result<Lsn> {
        self.worker.force_sync()
    }

    fn alloc_lsn(&self) -> Lsn {
        self.current_lsn.fetch_add(1, Ordering::SeqCst)
    }

    fn write_keypoint_marker(&self, lsn: Lsn, live_records: usize) -> Result<()> {
        let marker = KeypointMarker {
            lsn,
            live_records,
            durable_lsn: self.durable_lsn(),
            timestamp: timestamp(),
        };
        fs::write(
            self.dir.join(KEYPOINT_FILE_NAME),
            serde_json::to_string_pretty(&marker)?,
        )?;
        Ok(())
    }
}

impl DurableLog for FileLog {
    fn append(&self, xid: &TransactionId, local_id: u64, op: LogOperation) -> Result<Lsn> {
        let lsn = self.alloc_lsn();
        self.worker.write(LogRecord {
            lsn,
            local_id,
            xid: xid.global(),
            server: self.server.clone(),
            instance: self.instance.clone(),
            op,
            timestamp: timestamp(),
        })?;
        Ok(lsn)
    }

    fn sync(&self, lsn: Lsn) -> Result<()> {
        self.worker.wait_for_durable(lsn)
    }

    fn read_all(&self, server: &str) -> Result<Vec<LogRecord>> {
        let records = read_frames(&mut BufReader::new(File::open(self.path())?))?;
        Ok(live_records(records)
            .into_iter()
            .filter(|r| r.server == server)
            .collect())
    }

    fn delete(&self, xid: &TransactionId, local_id: u64) -> Result<()> {
        // losing this record only makes recovery re-drive a finished branch
        self.append(xid, local_id, LogOperation::Completed)?;

        let completed = self.completed_since_keypoint.fetch_add(1, Ordering::Relaxed) + 1;
        if self.keypoint_interval > 0 && completed >= self.keypoint_interval {
            if let Err(e) = self.keypoint() {
                log::warn!("Automatic keypoint failed: {}", e);
            }
        }
        Ok(())
    }

    fn keypoint(&self) -> Result<()> {
        let lsn = self.alloc_lsn();
        let marker = LogRecord {
            lsn,
            local_id: 0,
            xid: TransactionId::new(KEYSTONE_FORMAT_ID, &[0u8; GTRID_LEN], &[])?,
            server: self.server.clone(),
            instance: self.instance.clone(),
            op: LogOperation::Keypoint { live: Vec::new() },
            timestamp: timestamp(),
        };
        let kept = self.worker.keypoint(marker)?;
        self.completed_since_keypoint.store(0, Ordering::Relaxed);
        self.write_keypoint_marker(lsn, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txlog::record::{BranchRecord, Decision};
    use crate::xid::XidFactory;

    fn open(dir: &Path, config: LogConfig) -> FileLog {
        FileLog::open(dir, "node-a", "server", &config, 0).unwrap()
    }

    fn prepared(xid: &TransactionId) -> LogOperation {
        LogOperation::Prepared {
            decision: Decision::Commit,
            branches: vec![BranchRecord {
                branch: xid.branch(1),
                resource_manager: "rm-1".into(),
            }],
        }
    }

    #[test]
    fn test_fsync_state_latch() {
        let state = Arc::new(FsyncState::new());
        assert_eq!(state.durable_lsn(), 0);

        state.signal_durable(5);
        state.signal_durable(3);
        assert_eq!(state.durable_lsn(), 5);
        assert!(state.wait_for_durable(4, Duration::from_millis(10)).is_ok());

        let err = state
            .wait_for_durable(10, Duration::from_millis(30))
            .unwrap_err();
        assert!(err.to_string().contains("Timeout"));

        let waker = Arc::clone(&state);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            waker.signal_durable(10);
        });
        assert!(state.wait_for_durable(10, Duration::from_secs(2)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_durable_append_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), LogConfig::synchronous());
        let (seq, xid) = XidFactory::new("node-a").next_global();

        let lsn = log.append_durable(&xid, seq, prepared(&xid)).unwrap();
        assert!(log.durable_lsn() >= lsn);
        assert!(fs::metadata(log.path()).unwrap().len() > 0);
    }

    #[test]
    fn test_durable_append_deferred_shares_fsync() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(open(
            dir.path(),
            LogConfig {
                fsync_interval_ms: 30,
                ..Default::default()
            },
        ));
        let factory = Arc::new(XidFactory::new("node-a"));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let log = Arc::clone(&log);
                let factory = Arc::clone(&factory);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let (seq, xid) = factory.next_global();
                        log.append_durable(&xid, seq, prepared(&xid)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(log.durable_lsn() >= 20);
        assert_eq!(log.read_all("node-a").unwrap().len(), 20);
    }

    #[test]
    fn test_force_sync() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(
            dir.path(),
            LogConfig {
                fsync_interval_ms: 10_000,
                ..Default::default()
            },
        );
        let (seq, xid) = XidFactory::new("node-a").next_global();
        let lsn = log.append(&xid, seq, prepared(&xid)).unwrap();

        let durable = log.force_sync().unwrap();
        assert!(durable >= lsn);
    }

    #[test]
    fn test_read_all_filters_completed_and_server() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), LogConfig::synchronous());
        let factory = XidFactory::new("node-a");
        let (s1, done) = factory.next_global();
        let (s2, pending) = factory.next_global();

        log.append_durable(&done, s1, prepared(&done)).unwrap();
        log.append_durable(&pending, s2, prepared(&pending)).unwrap();
        log.delete(&done, s1).unwrap();

        let live = log.read_all("node-a").unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].xid, pending);
        assert!(log.read_all("node-b").unwrap().is_empty());
    }

    #[test]
    fn test_keypoint_keeps_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), LogConfig::synchronous());
        let factory = XidFactory::new("node-a");

        let mut pending = None;
        for i in 0..10 {
            let (seq, xid) = factory.next_global();
            log.append_durable(&xid, seq, prepared(&xid)).unwrap();
            if i == 7 {
                pending = Some(xid);
            } else {
                log.delete(&xid, seq).unwrap();
            }
        }
        let before = fs::metadata(log.path()).unwrap().len();

        log.keypoint().unwrap();

        let after = fs::metadata(log.path()).unwrap().len();
        assert!(after < before);
        let live = log.read_all("node-a").unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(Some(live[0].xid.clone()), pending);

        let marker = KeypointMarker::read(dir.path()).unwrap();
        assert_eq!(marker.live_records, 1);
    }

    #[test]
    fn test_append_after_keypoint_lands_in_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path(), LogConfig::synchronous());
        let factory = XidFactory::new("node-a");

        let (s1, x1) = factory.next_global();
        log.append_durable(&x1, s1, prepared(&x1)).unwrap();
        log.keypoint().unwrap();
        let (s2, x2) = factory.next_global();
        log.append_durable(&x2, s2, prepared(&x2)).unwrap();

        assert_eq!(log.read_all("node-a").unwrap().len(), 2);
    }

    #[test]
    fn test_automatic_keypoint_interval() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), "node-a", "server", &LogConfig::synchronous(), 3)
            .unwrap();
        let factory = XidFactory::new("node-a");

        for _ in 0..3 {
            let (seq, xid) = factory.next_global();
            log.append_durable(&xid, seq, prepared(&xid)).unwrap();
            log.delete(&xid, seq).unwrap();
        }

        assert!(KeypointMarker::read(dir.path()).is_some());
        assert!(log.read_all("node-a").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_restores_counters() {
        let dir = tempfile::tempdir().unwrap();
        let factory = XidFactory::new("node-a");
        let (seq, xid) = factory.next_global();
        factory.advance_past(seq + 10);
        let (seq2, xid2) = factory.next_global();

        let last_lsn = {
            let log = open(dir.path(), LogConfig::synchronous());
            log.append_durable(&xid, seq, prepared(&xid)).unwrap();
            log.append_durable(&xid2, seq2, prepared(&xid2)).unwrap()
        };

        let log = open(dir.path(), LogConfig::synchronous());
        assert_eq!(log.max_local_id(), seq2);
        let next = log.append(&xid, seq, LogOperation::Completed).unwrap();
        assert_eq!(next, last_lsn + 1);
        assert_eq!(log.read_all("node-a").unwrap().len(), 2);
    }
}
