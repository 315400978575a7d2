//! Transaction manager
//!
//! Associates transactions with the calling thread and drives them to
//! completion. The association is thread-local and keyed by manager, so
//! several managers can live in one process and spawned threads start with
//! no transaction.
//!
//! `begin`, `commit` and `rollback` hold the read side of a gate; `freeze`
//! takes the write side to hold new work off while the caller inspects or
//! reconfigures the manager.

pub mod invocation;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use invocation::{Invocation, InvocationContext};
pub use transaction::{Synchronization, Transaction};

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::TxContext;
use crate::coordinator::Status;
use crate::error::{Result, TxError, XaError};
use crate::resource::{ResourceErrorAction, ResourceHandle};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<HashMap<u64, Arc<Transaction>>> = RefCell::new(HashMap::new());
    static THREAD_TIMEOUTS: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// Holds new transactional work off until dropped
pub struct FreezeGuard<'a> {
    _gate: RwLockWriteGuard<'a, ()>,
}

pub struct TransactionManager {
    id: u64,
    ctx: Arc<TxContext>,
    gate: RwLock<()>,
    active: Mutex<HashMap<u64, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(ctx: Arc<TxContext>) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            ctx,
            gate: RwLock::new(()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<TxContext> {
        &self.ctx
    }

    fn enter(&self) -> RwLockReadGuard<'_, ()> {
        match self.gate.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<u64, Arc<Transaction>>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current(&self) -> Option<Arc<Transaction>> {
        CURRENT.with(|c| c.borrow().get(&self.id).cloned())
    }

    fn associate(&self, tx: Arc<Transaction>) {
        CURRENT.with(|c| c.borrow_mut().insert(self.id, tx));
    }

    fn disassociate(&self) -> Option<Arc<Transaction>> {
        CURRENT.with(|c| c.borrow_mut().remove(&self.id))
    }

    fn require_current(&self) -> Result<Arc<Transaction>> {
        self.current().ok_or_else(|| {
            TxError::IllegalState("no transaction associated with the current thread".into())
        })
    }

    /// Write side of the gate; begin, commit and rollback block until the
    /// guard is dropped
    pub fn freeze(&self) -> FreezeGuard<'_> {
        let gate = match self.gate.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        FreezeGuard { _gate: gate }
    }

    /// Begin with this thread's timeout, or the configured default
    pub fn begin(&self) -> Result<Arc<Transaction>> {
        let secs = THREAD_TIMEOUTS
            .with(|t| t.borrow().get(&self.id).copied())
            .unwrap_or(self.ctx.config().timeout_in_seconds);
        self.begin_with_timeout(secs)
    }

    pub fn begin_with_timeout(&self, timeout_secs: u32) -> Result<Arc<Transaction>> {
        let _gate = self.enter();
        if let Some(current) = self.current() {
            return Err(TxError::NotSupported(format!(
                "nested transactions are not supported (thread is in {})",
                current.xid()
            )));
        }

        let tx = Transaction::begin(Arc::clone(&self.ctx), timeout_secs);
        self.active().insert(tx.local_id(), Arc::clone(&tx));
        self.associate(Arc::clone(&tx));
        Ok(tx)
    }

    /// Complete the current transaction; the thread is disassociated whatever
    /// the outcome
    pub fn commit(&self) -> Result<()> {
        let _gate = self.enter();
        let tx = self.disassociate().ok_or_else(|| {
            TxError::IllegalState("no transaction associated with the current thread".into())
        })?;
        let result = tx.commit();
        self.active().remove(&tx.local_id());
        result
    }

    pub fn rollback(&self) -> Result<()> {
        let _gate = self.enter();
        let tx = self.disassociate().ok_or_else(|| {
            TxError::IllegalState("no transaction associated with the current thread".into())
        })?;
        let result = tx.rollback();
        self.active().remove(&tx.local_id());
        result
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        self.require_current()?.set_rollback_only()
    }

    pub fn status(&self) -> Status {
        self.current()
            .map(|tx| tx.status())
            .unwrap_or(Status::NoTransaction)
    }

    /// Timeout for transactions this thread begins later; 0 restores the
    /// configured default
    pub fn set_transaction_timeout(&self, seconds: u32) {
        THREAD_TIMEOUTS.with(|t| {
            let mut timeouts = t.borrow_mut();
            if seconds == 0 {
                timeouts.remove(&self.id);
            } else {
                timeouts.insert(self.id, seconds);
            }
        });
    }

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.current()
    }

    /// Transactions begun through this manager and not yet completed
    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    /// Detach the current transaction from the thread, suspending its
    /// resources
    pub fn suspend(&self) -> Result<Option<Arc<Transaction>>> {
        let tx = match self.disassociate() {
            Some(tx) => tx,
            None => return Ok(None),
        };
        let failures = tx.suspend_resources();
        self.handle_failures(&tx, failures);
        log::debug!("Suspended transaction {}", tx.xid());
        Ok(Some(tx))
    }

    pub fn resume(&self, tx: Arc<Transaction>) -> Result<()> {
        let status = tx.status();
        if status.is_terminal() || status == Status::NoTransaction {
            return Err(TxError::InvalidTransaction(format!(
                "transaction {} is {}",
                tx.xid(),
                status
            )));
        }
        if let Some(current) = self.current() {
            return Err(TxError::IllegalState(format!(
                "thread is already associated with {}",
                current.xid()
            )));
        }
        let failures = tx.resume_resources();
        self.handle_failures(&tx, failures);
        log::debug!("Resumed transaction {}", tx.xid());
        self.associate(tx);
        Ok(())
    }

    pub fn enlist_resource(&self, resource: &ResourceHandle) -> Result<bool> {
        self.require_current()?.enlist_resource(resource)
    }

    /// End a resource's association. A resource that fails to end is handed
    /// to the error handler, the transaction becomes rollback-only and
    /// `false` is returned.
    pub fn delist_resource(&self, resource: &ResourceHandle, flag: i32) -> Result<bool> {
        let tx = self.require_current()?;
        match tx.delist_resource(resource, flag) {
            Ok(()) => Ok(true),
            Err(TxError::Resource(e)) => {
                self.handle_failures(&tx, vec![(resource.clone(), e)]);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_failures(
        &self,
        tx: &Transaction,
        failures: Vec<(ResourceHandle, XaError)>,
    ) {
        if failures.is_empty() {
            return;
        }
        let handler = self.ctx.resource_error_handler();
        for (resource, error) in &failures {
            let action = ResourceErrorAction::for_error(error);
            log::warn!(
                "{} failed in {} ({}); requesting {:?}",
                resource.name(),
                tx.xid(),
                error,
                action
            );
            handler.handle_resource_error(resource, action, error);
        }
        tx.mark_rollback_only(format!("{} failed to end its work", failures[0].0.name()));
    }

    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<()> {
        self.require_current()?.register_synchronization(sync)
    }

    pub fn register_interposed_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<()> {
        self.require_current()?
            .register_interposed_synchronization(sync)
    }

    /// Enlist every resource of an invocation in the current transaction
    pub fn enlist_invocation_resources(&self, invocation: &mut dyn InvocationContext) -> Result<()> {
        let tx = match self.current() {
            Some(tx) => tx,
            None => return Ok(()),
        };
        for resource in invocation.resources().iter() {
            tx.enlist_resource(resource)?;
        }
        invocation.set_transaction(Some(tx));
        Ok(())
    }

    /// Delist every resource of an invocation from the transaction it was
    /// enlisted in
    pub fn delist_invocation_resources(
        &self,
        invocation: &mut dyn InvocationContext,
        flag: i32,
    ) -> Result<()> {
        let tx = match invocation.transaction().or_else(|| self.current()) {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let mut failures = Vec::new();
        for resource in invocation.resources().iter() {
            match tx.delist_resource(resource, flag) {
                Ok(()) => {}
                Err(TxError::Resource(e)) => failures.push((resource.clone(), e)),
                Err(e) => log::debug!("{} not delisted: {}", resource.name(), e),
            }
        }
        self.handle_failures(&tx, failures);
        invocation.set_transaction(None);
        Ok(())
    }
}
