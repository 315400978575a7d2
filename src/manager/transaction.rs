//! Per-transaction facade
//!
//! A [`Transaction`] starts out local: a single resource that cannot prepare
//! is started directly on the global branch and committed in one phase,
//! without a coordinator or any log traffic. Enlisting a second resource, or
//! any XA resource, promotes it to a distributed transaction driven by a
//! [`Coordinator`]; the local resource then becomes the coordinator's last
//! agent.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::context::TxContext;
use crate::coordinator::{Coordinator, ReplayResult, Status};
use crate::error::xa_codes::{XA_HEURCOM, XA_HEURMIX, XA_HEURRB};
use crate::error::{Result, TxError, XaError};
use crate::resource::flags::{TMFAIL, TMJOIN, TMNOFLAGS, TMRESUME, TMSUCCESS, TMSUSPEND};
use crate::resource::{AssociationState, ResourceHandle, Vote};
use crate::timeout::{TimeoutKind, TimeoutTarget};
use crate::xid::TransactionId;

/// Callbacks around transaction completion
pub trait Synchronization: Send + Sync {
    /// Runs before completion starts; an error marks the transaction
    /// rollback-only
    fn before_completion(&self) -> Result<()>;

    /// Runs after completion with the final status
    fn after_completion(&self, status: Status);
}

struct LocalResource {
    resource: ResourceHandle,
    state: AssociationState,
}

struct TxInner {
    status: Status,
    coordinator: Option<Arc<Coordinator>>,
    local: Option<LocalResource>,
    interposed: Vec<Arc<dyn Synchronization>>,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    deadline: Option<Instant>,
    timeout_secs: u32,
    rollback_only: bool,
    rollback_cause: Option<String>,
    timed_out: bool,
}

impl TxInner {
    fn mark_rollback_only(&mut self, cause: Option<String>) {
        self.rollback_only = true;
        if self.rollback_cause.is_none() {
            self.rollback_cause = cause;
        }
    }

    /// Mark the transaction timed out once its deadline passed; true when
    /// this call did the marking
    fn check_deadline(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline && !self.timed_out => {
                self.timed_out = true;
                self.mark_rollback_only(Some("time out".to_string()));
                true
            }
            _ => false,
        }
    }

    fn rollback_error(&self) -> TxError {
        if self.timed_out {
            return TxError::timed_out();
        }
        match &self.rollback_cause {
            Some(cause) => TxError::Rollback(format!("Transaction rolled back: {}", cause)),
            None => TxError::Rollback("Transaction was marked rollback-only".to_string()),
        }
    }
}

pub struct Transaction {
    local_id: u64,
    xid: TransactionId,
    ctx: Arc<TxContext>,
    inner: Mutex<TxInner>,
}

impl Transaction {
    /// Start a transaction; a positive timeout schedules an active timeout
    pub(crate) fn begin(ctx: Arc<TxContext>, timeout_secs: u32) -> Arc<Self> {
        let (local_id, xid) = ctx.xids().next_global();
        let deadline = (timeout_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(timeout_secs)));

        let tx = Arc::new(Self {
            local_id,
            xid,
            ctx,
            inner: Mutex::new(TxInner {
                status: Status::Active,
                coordinator: None,
                local: None,
                interposed: Vec::new(),
                synchronizations: Vec::new(),
                deadline,
                timeout_secs,
                rollback_only: false,
                rollback_cause: None,
                timed_out: false,
            }),
        });

        if timeout_secs > 0 {
            tx.ctx.timeouts().schedule(
                local_id,
                TimeoutKind::Active,
                Duration::from_secs(u64::from(timeout_secs)),
                Arc::clone(&tx) as Arc<dyn TimeoutTarget>,
            );
        }
        log::debug!("Began transaction {} (local id {})", tx.xid, local_id);
        tx
    }

    fn lock(&self) -> MutexGuard<'_, TxInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    pub fn xid(&self) -> &TransactionId {
        &self.xid
    }

    /// Current status; an expired deadline reads as marked for rollback even
    /// before the timeout scanner gets to it
    pub fn status(&self) -> Status {
        let mut inner = self.lock();
        if inner.status != Status::Active {
            return inner.status;
        }
        if inner.check_deadline() {
            if let Some(coordinator) = &inner.coordinator {
                if let Err(e) = coordinator.rollback_only() {
                    log::debug!("Could not mark {} rollback-only: {}", self.xid, e);
                }
            }
        }
        if inner.rollback_only {
            return Status::MarkedRollback;
        }
        match &inner.coordinator {
            Some(coordinator) => coordinator.status(),
            None => Status::Active,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.lock().coordinator.is_some()
    }

    pub fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.lock().coordinator.clone()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.lock().rollback_only
    }

    pub fn timed_out(&self) -> bool {
        self.lock().timed_out
    }

    pub fn timeout_secs(&self) -> u32 {
        self.lock().timeout_secs
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        let mut inner = self.lock();
        if !matches!(inner.status, Status::Active | Status::MarkedRollback) {
            return Err(TxError::IllegalState(format!(
                "transaction {} is {}",
                self.xid, inner.status
            )));
        }
        inner.mark_rollback_only(Some("marked rollback-only by the application".into()));
        if let Some(coordinator) = &inner.coordinator {
            coordinator.rollback_only()?;
        }
        Ok(())
    }

    fn check_registrable(&self, inner: &TxInner) -> Result<()> {
        match inner.status {
            Status::Active if inner.rollback_only => Err(inner.rollback_error()),
            Status::Active => Ok(()),
            status => Err(TxError::IllegalState(format!(
                "transaction {} is {}",
                self.xid, status
            ))),
        }
    }

    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<()> {
        let mut inner = self.lock();
        self.check_registrable(&inner)?;
        inner.synchronizations.push(sync);
        Ok(())
    }

    /// Interposed synchronizations run before the regular ones on the way in
    /// and before them again on the way out
    pub fn register_interposed_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<()> {
        let mut inner = self.lock();
        self.check_registrable(&inner)?;
        inner.interposed.push(sync);
        Ok(())
    }

    /// Enlist a resource, promoting the transaction when needed
    pub fn enlist_resource(&self, resource: &ResourceHandle) -> Result<bool> {
        let mut inner = self.lock();
        if inner.status != Status::Active {
            return Err(TxError::IllegalState(format!(
                "transaction {} is {}",
                self.xid, inner.status
            )));
        }

        let config = self.ctx.config();
        let two_phase = resource.supports_two_phase();

        if let Some(coordinator) = inner.coordinator.clone() {
            if inner.rollback_only {
                return Err(inner.rollback_error());
            }
            if !two_phase && !config.use_last_agent_optimization {
                return Err(TxError::System(format!(
                    "{} cannot prepare and last agent optimization is disabled",
                    resource.name()
                )));
            }
            coordinator.register_resource(resource)?;
            self.apply_timeout(&inner, resource);
            return Ok(true);
        }

        let same_local = inner
            .local
            .as_ref()
            .map_or(false, |l| l.resource.same_object(resource));
        if same_local || (inner.local.is_none() && !two_phase) {
            if inner.rollback_only {
                return Err(inner.rollback_error());
            }
            self.enlist_local(&mut inner, resource)?;
            return Ok(true);
        }

        // promotion to a distributed transaction
        if inner.rollback_only && !config.disable_status_check_on_switch_to_xa {
            return Err(inner.rollback_error());
        }
        if let Some(local) = &inner.local {
            if !config.use_last_agent_optimization {
                return Err(TxError::System(format!(
                    "cannot add {} to a transaction holding the local resource {} \
                     without last agent optimization",
                    resource.name(),
                    local.resource.name()
                )));
            }
            if !two_phase {
                return Err(TxError::System(
                    "a transaction may hold only one resource that cannot prepare".into(),
                ));
            }
        }

        let coordinator = Coordinator::new(Arc::clone(&self.ctx), self.local_id, self.xid.clone());
        if let Some(local) = &inner.local {
            coordinator.adopt_last_agent(&local.resource, self.xid.clone())?;
        }
        coordinator.register_resource(resource)?;
        if inner.rollback_only {
            log::warn!(
                "Transaction {} promoted while marked rollback-only",
                self.xid
            );
            coordinator.rollback_only()?;
        }
        log::debug!("Transaction {} promoted to distributed", self.xid);
        inner.local = None;
        inner.coordinator = Some(coordinator);
        self.apply_timeout(&inner, resource);
        Ok(true)
    }

    fn enlist_local(&self, inner: &mut TxInner, resource: &ResourceHandle) -> Result<()> {
        let flag = match &inner.local {
            None => TMNOFLAGS,
            Some(local) => match local.state {
                AssociationState::Associated => return Ok(()),
                AssociationState::Suspended => TMRESUME,
                AssociationState::NotAssociated => TMJOIN,
                state => {
                    return Err(TxError::IllegalState(format!(
                        "cannot re-enlist local resource in state {:?}",
                        state
                    )))
                }
            },
        };
        resource.start(&self.xid, flag)?;
        inner.local = Some(LocalResource {
            resource: resource.clone(),
            state: AssociationState::Associated,
        });
        Ok(())
    }

    fn apply_timeout(&self, inner: &TxInner, resource: &ResourceHandle) {
        let remaining = match inner.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => return,
        };
        let secs = remaining.as_secs().max(1).min(u64::from(u32::MAX)) as u32;
        if let Err(e) = resource.set_transaction_timeout(secs) {
            log::debug!("{} rejected transaction timeout: {}", resource.name(), e);
        }
    }

    /// End a resource's association; TMFAIL marks the transaction
    /// rollback-only
    pub fn delist_resource(&self, resource: &ResourceHandle, flag: i32) -> Result<()> {
        let mut inner = self.lock();
        if flag == TMFAIL {
            inner.mark_rollback_only(Some(format!("{} failed its work", resource.name())));
        }
        if let Some(coordinator) = &inner.coordinator {
            return coordinator.delist_resource(resource, flag);
        }

        let local = match inner.local.as_mut() {
            Some(local) if local.resource.same_object(resource) => local,
            _ => {
                return Err(TxError::IllegalState(format!(
                    "{} is not enlisted in {}",
                    resource.name(),
                    self.xid
                )))
            }
        };
        if !matches!(
            local.state,
            AssociationState::Associated | AssociationState::Suspended
        ) {
            return Err(TxError::IllegalState(format!(
                "cannot delist local resource in state {:?}",
                local.state
            )));
        }
        match local.resource.end(&self.xid, flag) {
            Ok(()) => {
                local.state = match flag {
                    TMSUSPEND => AssociationState::Suspended,
                    TMFAIL => AssociationState::Failed,
                    _ => AssociationState::NotAssociated,
                };
                Ok(())
            }
            Err(e) => {
                local.state = AssociationState::Failed;
                Err(TxError::Resource(e))
            }
        }
    }

    /// Suspend live associations; returns the resources that failed
    pub(crate) fn suspend_resources(&self) -> Vec<(ResourceHandle, XaError)> {
        let mut inner = self.lock();
        if let Some(coordinator) = &inner.coordinator {
            return coordinator.suspend_resources();
        }
        let mut failures = Vec::new();
        if let Some(local) = inner.local.as_mut() {
            if local.state == AssociationState::Associated {
                match local.resource.end(&self.xid, TMSUSPEND) {
                    Ok(()) => local.state = AssociationState::Suspended,
                    Err(e) => {
                        local.state = AssociationState::Failed;
                        failures.push((local.resource.clone(), e));
                    }
                }
            }
        }
        failures
    }

    /// Resume suspended associations; returns the resources that failed
    pub(crate) fn resume_resources(&self) -> Vec<(ResourceHandle, XaError)> {
        let mut inner = self.lock();
        if let Some(coordinator) = &inner.coordinator {
            return coordinator.resume_resources();
        }
        let mut failures = Vec::new();
        if let Some(local) = inner.local.as_mut() {
            if local.state == AssociationState::Suspended {
                match local.resource.start(&self.xid, TMRESUME) {
                    Ok(()) => local.state = AssociationState::Associated,
                    Err(e) => {
                        local.state = AssociationState::Failed;
                        failures.push((local.resource.clone(), e));
                    }
                }
            }
        }
        failures
    }

    pub(crate) fn mark_rollback_only(&self, cause: String) {
        let mut inner = self.lock();
        if matches!(inner.status, Status::Active | Status::MarkedRollback) {
            inner.mark_rollback_only(Some(cause));
            if let Some(coordinator) = &inner.coordinator {
                if let Err(e) = coordinator.rollback_only() {
                    log::debug!("Could not mark {} rollback-only: {}", self.xid, e);
                }
            }
        }
    }

    /// Take the transaction into completion; returns the synchronizations in
    /// calling order
    fn start_completion(&self) -> Result<Vec<Arc<dyn Synchronization>>> {
        let inner = self.lock();
        if !matches!(inner.status, Status::Active | Status::MarkedRollback) {
            return Err(TxError::IllegalState(format!(
                "transaction {} is already {}",
                self.xid, inner.status
            )));
        }
        Ok(inner
            .interposed
            .iter()
            .chain(inner.synchronizations.iter())
            .cloned()
            .collect())
    }

    pub fn commit(&self) -> Result<()> {
        self.ctx.timeouts().cancel(self.local_id, TimeoutKind::Active);
        let syncs = self.start_completion()?;

        if !self.lock().rollback_only {
            for sync in &syncs {
                if let Err(e) = sync.before_completion() {
                    log::warn!("before_completion failed for {}: {}", self.xid, e);
                    self.lock().mark_rollback_only(Some(e.to_string()));
                }
            }
        }

        let result = self.complete_commit();
        self.after_completion(&syncs);
        result
    }

    pub fn rollback(&self) -> Result<()> {
        self.ctx.timeouts().cancel(self.local_id, TimeoutKind::Active);
        let syncs = self.start_completion()?;
        let result = self.complete_rollback();
        self.after_completion(&syncs);
        result
    }

    fn complete_commit(&self) -> Result<()> {
        let (coordinator, local) = {
            let mut inner = self.lock();
            inner.check_deadline();
            if inner.rollback_only {
                let error = inner.rollback_error();
                drop(inner);
                if let Err(e) = self.complete_rollback() {
                    log::warn!("Rollback of {} failed: {}", self.xid, e);
                }
                return Err(error);
            }
            inner.status = Status::Committing;
            (
                inner.coordinator.clone(),
                inner.local.as_ref().map(|l| (l.resource.clone(), l.state)),
            )
        };

        let (status, result) = match coordinator {
            Some(coordinator) => self.commit_distributed(&coordinator),
            None => match local {
                Some((resource, state)) => self.commit_local(&resource, state),
                None => (Status::Committed, Ok(())),
            },
        };
        self.lock().status = status;
        match &result {
            Ok(()) => log::debug!("Transaction {} committed", self.xid),
            Err(e) => log::info!("Transaction {} did not commit cleanly: {}", self.xid, e),
        }
        result
    }

    fn commit_distributed(&self, coordinator: &Coordinator) -> (Status, Result<()>) {
        let result = if coordinator.branch_count() == 1 && !coordinator.has_last_agent() {
            coordinator.commit_one_phase()
        } else {
            match coordinator.prepare() {
                Ok(Vote::Commit) => coordinator.commit(),
                Ok(Vote::ReadOnly) => Ok(()),
                Ok(Vote::Rollback) => Err(TxError::Rollback(
                    "Transaction rolled back: a participant voted to roll back".into(),
                )),
                Err(TxError::Rollback(cause)) => {
                    if let Err(e) = coordinator.rollback(true) {
                        log::warn!("Rollback of {} failed: {}", self.xid, e);
                    }
                    Err(TxError::Rollback(cause))
                }
                Err(e) => Err(e),
            }
        };

        let status = match coordinator.status() {
            status @ (Status::Committed | Status::RolledBack | Status::Unknown) => status,
            // second phase still has unresolved branches
            Status::Committing => Status::Committing,
            _ if result.is_ok() => Status::Committed,
            _ => Status::RolledBack,
        };
        coordinator.release_if_settled(status);
        (status, result)
    }

    fn commit_local(
        &self,
        resource: &ResourceHandle,
        state: AssociationState,
    ) -> (Status, Result<()>) {
        if matches!(
            state,
            AssociationState::Associated | AssociationState::Suspended
        ) {
            if let Err(e) = resource.end(&self.xid, TMSUCCESS) {
                log::warn!("{} could not end its work: {}", resource.name(), e);
                if let Err(e) = resource.rollback(&self.xid) {
                    log::warn!("Rollback of local resource {} failed: {}", resource.name(), e);
                }
                return (
                    Status::RolledBack,
                    Err(TxError::Rollback(format!(
                        "Transaction rolled back: {} failed to end its work",
                        resource.name()
                    ))),
                );
            }
        }

        match resource.commit(&self.xid, true) {
            Ok(()) => (Status::Committed, Ok(())),
            Err(e) if e.is_rollback() || e.is_unknown_branch() => (
                Status::RolledBack,
                Err(TxError::Rollback(format!(
                    "Transaction rolled back by {}: {}",
                    resource.name(),
                    e
                ))),
            ),
            Err(e) => {
                if e.is_heuristic() {
                    if let Err(f) = resource.forget(&self.xid) {
                        log::warn!("forget failed for {}: {}", self.xid, f);
                    }
                }
                let message = format!("{}: {}", self.xid, e);
                match e.code {
                    XA_HEURCOM => (Status::Committed, Ok(())),
                    XA_HEURRB => (Status::RolledBack, Err(TxError::HeuristicRollback(message))),
                    XA_HEURMIX => (Status::Committed, Err(TxError::HeuristicMixed(message))),
                    _ => (Status::Unknown, Err(TxError::HeuristicHazard(message))),
                }
            }
        }
    }

    fn complete_rollback(&self) -> Result<()> {
        let (coordinator, local) = {
            let mut inner = self.lock();
            inner.status = Status::RollingBack;
            (inner.coordinator.clone(), inner.local.take())
        };

        let result = match coordinator {
            Some(coordinator) => {
                let result = coordinator.rollback(true).map(|_| ());
                coordinator.release_if_settled(coordinator.status());
                result
            }
            None => match local {
                Some(local) => {
                    if matches!(
                        local.state,
                        AssociationState::Associated | AssociationState::Suspended
                    ) {
                        if let Err(e) = local.resource.end(&self.xid, TMFAIL) {
                            log::debug!("end(TMFAIL) failed for {}: {}", local.resource.name(), e);
                        }
                    }
                    match local.resource.rollback(&self.xid) {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_unknown_branch() || e.is_rollback() => Ok(()),
                        Err(e) => Err(TxError::System(format!(
                            "rollback of {} failed: {}",
                            local.resource.name(),
                            e
                        ))),
                    }
                }
                None => Ok(()),
            },
        };

        self.lock().status = Status::RolledBack;
        log::debug!("Transaction {} rolled back", self.xid);
        result
    }

    fn after_completion(&self, syncs: &[Arc<dyn Synchronization>]) {
        let status = self.lock().status;
        for sync in syncs {
            sync.after_completion(status);
        }
    }
}

impl TimeoutTarget for Transaction {
    fn on_active_timeout(&self) -> Result<()> {
        let mut inner = self.lock();
        if !matches!(inner.status, Status::Active | Status::MarkedRollback) {
            return Err(TxError::Inactive(format!(
                "transaction {} is {}",
                self.xid, inner.status
            )));
        }
        inner.timed_out = true;
        inner.mark_rollback_only(Some("time out".to_string()));
        if let Some(coordinator) = &inner.coordinator {
            coordinator.rollback_only()?;
        }
        Ok(())
    }

    fn replay_in_doubt(&self) -> Result<ReplayResult> {
        match self.coordinator() {
            Some(coordinator) => coordinator.replay_in_doubt(),
            None => Ok(ReplayResult::Resolved(self.status())),
        }
    }
}
