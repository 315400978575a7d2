//! Transaction timeouts
//!
//! One scheduler serves every transaction. Entries live in a deadline-ordered
//! queue and are indexed by `(local id, kind)` so a transaction can replace or
//! cancel its own timeout without scanning. A background scanner wakes every
//! scan interval and fires whatever expired:
//!
//! - `Active` timeouts mark the transaction rollback-only
//! - `InDoubt` timeouts re-drive branches whose commit or rollback outcome was
//!   unknown

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::coordinator::ReplayResult;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Application work is still running
    Active,
    /// Prepared, with branches whose outcome is not yet known
    InDoubt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drop pending timeouts
    Immediate,
    /// Fire every pending timeout before stopping
    Quiesce,
}

/// Something a timeout acts on
pub trait TimeoutTarget: Send + Sync {
    fn on_active_timeout(&self) -> Result<()>;
    fn replay_in_doubt(&self) -> Result<ReplayResult>;
}

type Key = (u64, TimeoutKind);

struct Entry {
    key: Key,
    target: Arc<dyn TimeoutTarget>,
}

#[derive(Default)]
struct Queue {
    by_deadline: BTreeMap<(Instant, u64), Entry>,
    index: HashMap<Key, (Instant, u64)>,
    next_seq: u64,
    stopped: bool,
}

impl Queue {
    fn remove(&mut self, key: &Key) -> Option<Entry> {
        let slot = self.index.remove(key)?;
        self.by_deadline.remove(&slot)
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<Entry> {
        let mut expired = Vec::new();
        while let Some((&slot, _)) = self.by_deadline.iter().next() {
            if slot.0 > now {
                break;
            }
            if let Some(entry) = self.by_deadline.remove(&slot) {
                self.index.remove(&entry.key);
                expired.push(entry);
            }
        }
        expired
    }

    fn drain(&mut self) -> Vec<Entry> {
        self.index.clear();
        std::mem::take(&mut self.by_deadline).into_values().collect()
    }
}

pub struct TimeoutManager {
    interval: Duration,
    queue: Mutex<Queue>,
    wakeup: Condvar,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutManager {
    pub fn new(scan_interval: Duration) -> Self {
        Self {
            interval: scan_interval,
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
            scanner: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        self.interval
    }

    /// Start the background scanner
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut scanner = match self.scanner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if scanner.is_some() {
            return Ok(());
        }
        self.lock().stopped = false;

        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("keystone-timeout".to_string())
            .spawn(move || manager.scanner_loop())?;
        *scanner = Some(handle);
        log::info!("Timeout scanner started (interval: {:?})", self.interval);
        Ok(())
    }

    fn scanner_loop(&self) {
        loop {
            {
                let queue = self.lock();
                if queue.stopped {
                    break;
                }
                let (queue, _) = match self.wakeup.wait_timeout(queue, self.interval) {
                    Ok(r) => r,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if queue.stopped {
                    break;
                }
            }
            self.scan_now();
        }
        log::info!("Timeout scanner stopped");
    }

    /// Schedule (or replace) the timeout of `kind` for a transaction
    pub fn schedule(
        &self,
        local_id: u64,
        kind: TimeoutKind,
        after: Duration,
        target: Arc<dyn TimeoutTarget>,
    ) {
        let deadline = Instant::now() + after;
        let mut queue = self.lock();
        if queue.stopped {
            log::warn!("Timeout for transaction {} ignored: scheduler stopped", local_id);
            return;
        }
        let key = (local_id, kind);
        queue.remove(&key);
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.by_deadline.insert((deadline, seq), Entry { key, target });
        queue.index.insert(key, (deadline, seq));
        log::debug!(
            "Scheduled {:?} timeout for transaction {} in {:?}",
            kind,
            local_id,
            after
        );
    }

    /// Cancel a pending timeout; true if one was pending
    pub fn cancel(&self, local_id: u64, kind: TimeoutKind) -> bool {
        self.lock().remove(&(local_id, kind)).is_some()
    }

    pub fn is_scheduled(&self, local_id: u64, kind: TimeoutKind) -> bool {
        self.lock().index.contains_key(&(local_id, kind))
    }

    pub fn pending(&self) -> usize {
        self.lock().index.len()
    }

    /// Fire everything that has expired; returns how many fired
    pub fn scan_now(&self) -> usize {
        let expired = self.lock().pop_expired(Instant::now());
        let fired = expired.len();
        for entry in expired {
            fire(entry);
        }
        fired
    }

    /// Stop the scanner and settle pending timeouts according to `mode`
    pub fn shutdown(&self, mode: ShutdownMode) {
        let pending = {
            let mut queue = self.lock();
            queue.stopped = true;
            queue.drain()
        };
        self.wakeup.notify_all();

        let handle = match self.scanner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Timeout scanner panicked");
            }
        }

        match mode {
            ShutdownMode::Immediate => {
                if !pending.is_empty() {
                    log::info!("Discarded {} pending timeouts", pending.len());
                }
            }
            ShutdownMode::Quiesce => {
                log::info!("Firing {} pending timeouts before shutdown", pending.len());
                for entry in pending {
                    fire(entry);
                }
            }
        }
    }
}

fn fire(entry: Entry) {
    let (local_id, kind) = entry.key;
    match kind {
        TimeoutKind::Active => {
            log::info!("Transaction {} timed out; marking rollback-only", local_id);
            if let Err(e) = entry.target.on_active_timeout() {
                log::debug!("Active timeout for transaction {} ignored: {}", local_id, e);
            }
        }
        TimeoutKind::InDoubt => match entry.target.replay_in_doubt() {
            Ok(ReplayResult::Resolved(status)) => {
                log::info!("In-doubt transaction {} resolved: {}", local_id, status)
            }
            Ok(ReplayResult::StillUnknown) => log::warn!(
                "Transaction {} is still in doubt; operator intervention may be required",
                local_id
            ),
            Err(e) => log::warn!("Replay of in-doubt transaction {} failed: {}", local_id, e),
        },
    }
}
