//! Process-wide transaction services
//!
//! A [`TxContext`] bundles what every transaction shares: configuration, the
//! durable log, the id factory, the timeout scheduler, and the registered
//! recovery handlers and listeners. It is built once at startup and handed to
//! the transaction manager and the recovery manager.
//!
//! It also tracks the global ids of distributed transactions this process is
//! still driving, so that recovery leaves their branches to the coordinator.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::config::TmConfig;
use crate::error::Result;
use crate::recovery::{RecoveryListener, RecoveryResourceHandler};
use crate::resource::{LoggingErrorHandler, ResourceErrorHandler};
use crate::timeout::{ShutdownMode, TimeoutManager};
use crate::txlog::{DurableLog, FileLog, MemoryLog};
use crate::xid::{TransactionId, XidFactory};

pub struct TxContext {
    config: TmConfig,
    log: Arc<dyn DurableLog>,
    xids: Arc<XidFactory>,
    timeouts: Arc<TimeoutManager>,
    recovery_handlers: RwLock<Vec<Arc<dyn RecoveryResourceHandler>>>,
    recovery_listeners: RwLock<Vec<Arc<dyn RecoveryListener>>>,
    error_handler: RwLock<Arc<dyn ResourceErrorHandler>>,
    in_flight: Mutex<HashSet<TransactionId>>,
}

impl TxContext {
    /// Build a context over an existing log. The timeout scanner is not
    /// started; call [`TxContext::start`] or drive it with `scan_now`.
    pub fn new(config: TmConfig, log: Arc<dyn DurableLog>) -> Result<Arc<Self>> {
        config.validate()?;

        let xids = Arc::new(XidFactory::new(&config.server_name));
        // keep local ids of live log records unique after a restart
        let max_local_id = log
            .read_all(&config.server_name)?
            .iter()
            .map(|r| r.local_id)
            .max()
            .unwrap_or(0);
        xids.advance_past(max_local_id);

        let timeouts = Arc::new(TimeoutManager::new(Duration::from_secs(
            config.effective_scan_interval_secs(),
        )));

        Ok(Arc::new(Self {
            config,
            log,
            xids,
            timeouts,
            recovery_handlers: RwLock::new(Vec::new()),
            recovery_listeners: RwLock::new(Vec::new()),
            error_handler: RwLock::new(Arc::new(LoggingErrorHandler)),
            in_flight: Mutex::new(HashSet::new()),
        }))
    }

    /// Open the file log under `tx_log_dir` and start the timeout scanner
    pub fn open(config: TmConfig) -> Result<Arc<Self>> {
        let log = FileLog::from_config(&config)?;
        let floor = log.max_local_id();
        let ctx = Self::new(config, Arc::new(log))?;
        ctx.xids.advance_past(floor);
        ctx.start()?;
        log::info!(
            "Transaction services ready for server '{}' (log: {})",
            ctx.config.server_name,
            ctx.config.tx_log_dir.display()
        );
        Ok(ctx)
    }

    /// Context backed by an in-memory log
    pub fn in_memory(config: TmConfig) -> Result<Arc<Self>> {
        let log = MemoryLog::new(&config.server_name, &config.instance_name);
        Self::new(config, Arc::new(log))
    }

    pub fn start(&self) -> Result<()> {
        self.timeouts.start()
    }

    pub fn shutdown(&self, mode: ShutdownMode) {
        self.timeouts.shutdown(mode);
    }

    pub fn config(&self) -> &TmConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    pub fn xids(&self) -> &XidFactory {
        &self.xids
    }

    pub fn timeouts(&self) -> &Arc<TimeoutManager> {
        &self.timeouts
    }

    pub fn register_recovery_handler(&self, handler: Arc<dyn RecoveryResourceHandler>) {
        write(&self.recovery_handlers).push(handler);
    }

    pub fn recovery_handlers(&self) -> Vec<Arc<dyn RecoveryResourceHandler>> {
        read(&self.recovery_handlers).clone()
    }

    pub fn add_recovery_listener(&self, listener: Arc<dyn RecoveryListener>) {
        write(&self.recovery_listeners).push(listener);
    }

    pub fn recovery_listeners(&self) -> Vec<Arc<dyn RecoveryListener>> {
        read(&self.recovery_listeners).clone()
    }

    pub fn set_resource_error_handler(&self, handler: Arc<dyn ResourceErrorHandler>) {
        *write(&self.error_handler) = handler;
    }

    pub fn resource_error_handler(&self) -> Arc<dyn ResourceErrorHandler> {
        Arc::clone(&read(&self.error_handler))
    }

    fn in_flight_set(&self) -> MutexGuard<'_, HashSet<TransactionId>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A coordinator in this process now owns `xid`'s global transaction
    pub(crate) fn begin_in_flight(&self, xid: &TransactionId) {
        self.in_flight_set().insert(xid.global());
    }

    /// The coordinator of `xid`'s global transaction has nothing left to drive
    pub(crate) fn end_in_flight(&self, xid: &TransactionId) {
        self.in_flight_set().remove(&xid.global());
    }

    /// Whether a live coordinator still owns the global transaction of `xid`
    pub fn is_in_flight(&self, xid: &TransactionId) -> bool {
        self.in_flight_set().contains(&xid.global())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_set().len()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
