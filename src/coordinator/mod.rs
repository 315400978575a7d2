//! Two-phase commit coordinator
//!
//! A [`Coordinator`] drives one transaction (or one subordinate scope of it)
//! through the protocol:
//!
//! ```text
//! Active ──rollback_only──► MarkedRollback
//!   │                             │
//!   └──────────► Preparing ◄──────┘ (fails fast)
//!                   │
//!          ┌────────┴────────┐
//!          ▼                 ▼
//!       Prepared         RolledBack
//!          │
//!          ▼
//!     Committing ──► Committed
//!
//! any non-terminal state ──rollback──► RollingBack ──► RolledBack
//! ```
//!
//! Every branch is attempted in every phase; per-branch failures are folded
//! into the aggregate outcome, worst first:
//! Rollback > HeuristicMixed > HeuristicHazard > Commit.
//!
//! Only the root writes log records. The `Prepared` record is durable before
//! the first commit directive is sent. Subordinates hand their branches to
//! the parent when they commit.
//!
//! A root registers its global id with the context while it is alive and
//! unsettled; recovery in this process does not touch those branches.

pub mod state;

#[cfg(test)]
mod tests;

pub use state::{
    BranchState, CoordinatorRole, Outcome, PhaseTally, ReplayResult, ReplyAction, Status,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::TxContext;
use crate::error::xa_codes::XA_HEURRB;
use crate::error::{Result, TxError, XaError};
use crate::resource::flags::{TMFAIL, TMSUCCESS, TMSUSPEND};
use crate::resource::registry::Branch;
use crate::resource::{AssociationState, ResourceHandle, ResourceRegistry, Vote};
use crate::timeout::{TimeoutKind, TimeoutTarget};
use crate::txlog::{BranchRecord, Decision, HeuristicKind, LogOperation};
use crate::xid::TransactionId;
use state::heuristic_kind;

struct Inner {
    status: Status,
    registry: ResourceRegistry,
    branches: HashMap<TransactionId, BranchState>,
    /// The one resource that cannot prepare, committed last in one phase
    last_agent: Option<Branch>,
    children: Vec<Arc<Coordinator>>,
    /// Decision recorded in the log, if any
    decision: Option<Decision>,
}

impl Inner {
    fn new() -> Self {
        Self {
            status: Status::Active,
            registry: ResourceRegistry::new(),
            branches: HashMap::new(),
            last_agent: None,
            children: Vec::new(),
            decision: None,
        }
    }

    fn state(&self, xid: &TransactionId) -> BranchState {
        self.branches
            .get(xid)
            .copied()
            .unwrap_or(BranchState::Active)
    }

    fn branches_in(&self, wanted: impl Fn(BranchState) -> bool) -> Vec<Branch> {
        self.registry
            .branches()
            .iter()
            .filter(|b| wanted(self.state(&b.xid)))
            .cloned()
            .collect()
    }

    fn has_unresolved(&self) -> bool {
        self.branches.values().any(|s| *s == BranchState::Unresolved)
    }
}

fn branch_records(branches: &[Branch]) -> Vec<BranchRecord> {
    branches
        .iter()
        .map(|b| BranchRecord {
            branch: b.xid.clone(),
            resource_manager: b.resource.resource_manager_id(),
        })
        .collect()
}

fn forget(branch: &Branch) {
    if let Err(e) = branch.resource.forget(&branch.xid) {
        log::warn!("forget failed for branch {}: {}", branch.xid, e);
    }
}

pub struct Coordinator {
    xid: TransactionId,
    local_id: u64,
    role: CoordinatorRole,
    parent: Option<Weak<Coordinator>>,
    ctx: Arc<TxContext>,
    me: Weak<Coordinator>,
    inner: Mutex<Inner>,
}

impl Coordinator {
    /// Root coordinator for the global transaction `xid`
    pub fn new(ctx: Arc<TxContext>, local_id: u64, xid: TransactionId) -> Arc<Self> {
        ctx.begin_in_flight(&xid);
        Arc::new_cyclic(|me| Self {
            xid,
            local_id,
            role: CoordinatorRole::Root,
            parent: None,
            ctx,
            me: me.clone(),
            inner: Mutex::new(Inner::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn xid(&self) -> &TransactionId {
        &self.xid
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    pub fn role(&self) -> CoordinatorRole {
        self.role
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Give the global id back to recovery once no branch is left to drive
    pub(crate) fn release_if_settled(&self, status: Status) {
        if self.role == CoordinatorRole::Root
            && matches!(status, Status::Committed | Status::RolledBack | Status::Unknown)
        {
            self.ctx.end_in_flight(&self.xid);
        }
    }

    pub fn branch_count(&self) -> usize {
        self.lock().registry.branch_count()
    }

    pub fn has_last_agent(&self) -> bool {
        self.lock().last_agent.is_some()
    }

    pub fn branch_state(&self, branch: &TransactionId) -> Option<BranchState> {
        self.lock().branches.get(branch).copied()
    }

    pub fn association_state(&self, resource: &ResourceHandle) -> AssociationState {
        self.lock().registry.state_of(resource)
    }

    fn check_enlistable(&self, inner: &Inner) -> Result<()> {
        match inner.status {
            Status::Active => Ok(()),
            Status::MarkedRollback => Err(TxError::Rollback(format!(
                "transaction {} is marked rollback-only",
                self.xid
            ))),
            status => Err(TxError::Inactive(format!(
                "transaction {} is {}",
                self.xid, status
            ))),
        }
    }

    /// Create a child scope sharing this transaction's global id
    pub fn create_subordinate(&self) -> Result<Arc<Coordinator>> {
        let mut inner = self.lock();
        self.check_enlistable(&inner)?;

        let xid = self.xid.global().branch(self.ctx.xids().next_branch());
        let parent = self.me.clone();
        let child = Arc::new_cyclic(|me| Self {
            xid,
            local_id: self.local_id,
            role: CoordinatorRole::Subordinate,
            parent: Some(parent),
            ctx: Arc::clone(&self.ctx),
            me: me.clone(),
            inner: Mutex::new(Inner::new()),
        });
        inner.children.push(Arc::clone(&child));
        log::debug!("Created subordinate {} under {}", child.xid, self.xid);
        Ok(child)
    }

    /// Enlist a resource, starting or joining its branch
    pub fn register_resource(&self, resource: &ResourceHandle) -> Result<TransactionId> {
        let mut inner = self.lock();
        self.check_enlistable(&inner)?;

        let one_phase_only = !resource.supports_two_phase();
        if one_phase_only {
            if let Some(agent) = &inner.last_agent {
                if !agent.resource.same_object(resource) {
                    return Err(TxError::System(
                        "a transaction may hold only one resource that cannot prepare".into(),
                    ));
                }
            }
        }

        let global = self.xid.global();
        let xids = self.ctx.xids();
        let branch = inner
            .registry
            .enlist(resource, || global.branch(xids.next_branch()))?;
        inner
            .branches
            .entry(branch.clone())
            .or_insert(BranchState::Active);
        if one_phase_only && inner.last_agent.is_none() {
            inner.last_agent = Some(Branch {
                xid: branch.clone(),
                resource: resource.clone(),
            });
        }
        Ok(branch)
    }

    /// Take over a one-phase resource that was already started on `branch`
    pub fn adopt_last_agent(&self, resource: &ResourceHandle, branch: TransactionId) -> Result<()> {
        let mut inner = self.lock();
        self.check_enlistable(&inner)?;
        if inner.last_agent.is_some() {
            return Err(TxError::System(
                "a transaction may hold only one resource that cannot prepare".into(),
            ));
        }
        inner
            .registry
            .adopt(resource, branch.clone(), AssociationState::Associated);
        inner.branches.insert(branch.clone(), BranchState::Active);
        inner.last_agent = Some(Branch {
            xid: branch,
            resource: resource.clone(),
        });
        Ok(())
    }

    /// End a resource's association. TMFAIL, or a failure to end, marks the
    /// transaction rollback-only.
    pub fn delist_resource(&self, resource: &ResourceHandle, flag: i32) -> Result<()> {
        let mut inner = self.lock();
        let result = inner.registry.delist(resource, flag);
        let failed = flag == TMFAIL || result.is_err();
        if failed && inner.status == Status::Active {
            inner.status = Status::MarkedRollback;
        }
        result.map_err(TxError::Resource)
    }

    /// Suspend every live association; returns the resources that failed
    pub fn suspend_resources(&self) -> Vec<(ResourceHandle, XaError)> {
        let mut inner = self.lock();
        let failures = inner.registry.end_all(TMSUSPEND);
        if !failures.is_empty() && inner.status == Status::Active {
            inner.status = Status::MarkedRollback;
        }
        failures
    }

    /// Resume every suspended association; returns the resources that failed
    pub fn resume_resources(&self) -> Vec<(ResourceHandle, XaError)> {
        let mut inner = self.lock();
        let failures = inner.registry.resume_all();
        if !failures.is_empty() && inner.status == Status::Active {
            inner.status = Status::MarkedRollback;
        }
        failures
    }

    pub fn rollback_only(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.status {
            Status::Active | Status::MarkedRollback => {
                inner.status = Status::MarkedRollback;
                Ok(())
            }
            status => Err(TxError::Inactive(format!(
                "transaction {} is already {}",
                self.xid, status
            ))),
        }
    }

    pub fn reply_action(&self) -> ReplyAction {
        if self.lock().children.is_empty() {
            ReplyAction::Forget
        } else {
            ReplyAction::Retain
        }
    }

    /// Phase one: collect votes from every distinct branch
    pub fn prepare(&self) -> Result<Vote> {
        let mut inner = self.lock();
        match inner.status {
            Status::Active => {}
            Status::MarkedRollback => {
                return Err(TxError::Rollback(format!(
                    "transaction {} is marked rollback-only",
                    self.xid
                )))
            }
            status => {
                return Err(TxError::IllegalState(format!(
                    "cannot prepare transaction {} in state {}",
                    self.xid, status
                )))
            }
        }
        if !inner.children.is_empty() {
            return Err(TxError::InvalidTransaction(format!(
                "transaction {} has {} active subordinate(s)",
                self.xid,
                inner.children.len()
            )));
        }
        if self.role == CoordinatorRole::Subordinate {
            inner.status = Status::Prepared;
            return Ok(Vote::Commit);
        }

        inner.status = Status::Preparing;
        let mut outcome = Outcome::Commit;

        for (resource, e) in inner.registry.end_all(TMSUCCESS) {
            log::warn!("{} could not end its work ({}); rolling back", resource.name(), e);
            outcome = Outcome::Rollback;
        }

        let mut heuristic = Vec::new();
        let voters = inner.branches_in(|s| s == BranchState::Active);
        for branch in voters.iter().filter(|b| b.resource.supports_two_phase()) {
            let (state, vote) = match branch.resource.prepare(&branch.xid) {
                Ok(Vote::Commit) => (BranchState::Prepared, Outcome::Commit),
                Ok(Vote::ReadOnly) => (BranchState::ReadOnly, Outcome::Commit),
                Ok(Vote::Rollback) => (BranchState::RolledBack, Outcome::Rollback),
                Err(e) if e.is_rollback() => (BranchState::RolledBack, Outcome::Rollback),
                Err(e) => match heuristic_kind(&e) {
                    Some(HeuristicKind::Rollback) => (
                        BranchState::Heuristic(HeuristicKind::Rollback),
                        Outcome::Rollback,
                    ),
                    Some(HeuristicKind::Mixed) => (
                        BranchState::Heuristic(HeuristicKind::Mixed),
                        Outcome::HeuristicMixed,
                    ),
                    Some(kind) => (BranchState::Heuristic(kind), Outcome::HeuristicHazard),
                    None => {
                        log::warn!("prepare failed for branch {}: {}", branch.xid, e);
                        (BranchState::Active, Outcome::Rollback)
                    }
                },
            };
            log::debug!("Branch {} voted {:?}", branch.xid, state);
            if matches!(state, BranchState::Heuristic(_)) {
                heuristic.push(branch.clone());
            }
            inner.branches.insert(branch.xid.clone(), state);
            outcome = outcome.worst(vote);
        }
        heuristic.iter().for_each(forget);

        if outcome != Outcome::Commit {
            let (tally, _) = self.rollback_pending(&mut inner, None);
            inner.status = Status::RolledBack;
            log::info!("Transaction {} rolled back at prepare ({:?})", self.xid, outcome);
            if let Some(err) = tally.rollback_error(&self.xid) {
                return Err(err);
            }
            return match outcome {
                Outcome::HeuristicMixed => Err(TxError::HeuristicMixed(format!(
                    "{}: a branch reported a mixed heuristic outcome at prepare",
                    self.xid
                ))),
                Outcome::HeuristicHazard => Err(TxError::HeuristicHazard(format!(
                    "{}: a branch may have completed heuristically at prepare",
                    self.xid
                ))),
                _ => Ok(Vote::Rollback),
            };
        }

        let mut agent_committed = false;
        if let Some(agent) = inner.last_agent.clone() {
            match self.commit_branch(&agent, true) {
                BranchState::Committed => {
                    inner.branches.insert(agent.xid.clone(), BranchState::Committed);
                    agent_committed = true;
                }
                BranchState::RolledBack => {
                    inner.branches.insert(agent.xid.clone(), BranchState::RolledBack);
                    self.rollback_pending(&mut inner, None);
                    inner.status = Status::RolledBack;
                    log::info!("Last agent of {} rolled back", self.xid);
                    return Ok(Vote::Rollback);
                }
                state => {
                    inner.branches.insert(agent.xid.clone(), state);
                    if matches!(state, BranchState::Heuristic(_)) {
                        forget(&agent);
                    }
                    self.rollback_pending(&mut inner, Some(&agent.xid));
                    inner.status = Status::Unknown;
                    log::error!(
                        "Last agent {} of {} failed with unknown outcome",
                        agent.resource.name(),
                        self.xid
                    );
                    return Err(TxError::HeuristicHazard(format!(
                        "{}: outcome of the one-phase resource {} is unknown",
                        self.xid,
                        agent.resource.name()
                    )));
                }
            }
        }

        let prepared = inner.branches_in(|s| s == BranchState::Prepared);
        if prepared.is_empty() {
            inner.status = Status::Committed;
            return Ok(Vote::ReadOnly);
        }

        let op = LogOperation::Prepared {
            decision: Decision::Commit,
            branches: branch_records(&prepared),
        };
        if let Err(e) = self.ctx.log().append_durable(&self.xid, self.local_id, op) {
            log::error!("Could not log commit decision for {}: {}", self.xid, e);
            self.rollback_pending(&mut inner, None);
            inner.status = Status::RolledBack;
            if agent_committed {
                return Err(TxError::HeuristicMixed(format!(
                    "{}: one-phase resource committed but the decision could not be logged",
                    self.xid
                )));
            }
            return Err(TxError::Rollback(format!(
                "commit decision for {} could not be logged: {}",
                self.xid, e
            )));
        }

        inner.decision = Some(Decision::Commit);
        inner.status = Status::Prepared;
        Ok(Vote::Commit)
    }

    /// Phase two: commit every prepared branch
    pub fn commit(&self) -> Result<()> {
        if self.role == CoordinatorRole::Subordinate {
            return self.commit_subordinate();
        }

        let mut inner = self.lock();
        if inner.status != Status::Prepared {
            return Err(TxError::NotPrepared(format!(
                "transaction {} is {}",
                self.xid, inner.status
            )));
        }
        inner.status = Status::Committing;

        let mut tally = PhaseTally::default();
        if let Some(agent) = &inner.last_agent {
            tally.record(inner.state(&agent.xid));
        }
        let mut heuristic = Vec::new();
        for branch in inner.branches_in(|s| s == BranchState::Prepared) {
            let state = self.commit_branch(&branch, false);
            tally.record(state);
            if matches!(state, BranchState::Heuristic(_)) {
                heuristic.push(branch.clone());
            }
            inner.branches.insert(branch.xid.clone(), state);
        }
        heuristic.iter().for_each(forget);

        let kind = tally.commit_heuristic();
        self.finish_phase(&inner, kind, &heuristic);
        if !inner.has_unresolved() {
            inner.status = if kind == Some(HeuristicKind::Rollback) {
                Status::RolledBack
            } else {
                Status::Committed
            };
        }
        drop(inner);

        match tally.commit_error(&self.xid) {
            Some(err) => {
                log::warn!("Transaction {} completed with {}", self.xid, err);
                Err(err)
            }
            None => {
                log::debug!("Transaction {} committed", self.xid);
                Ok(())
            }
        }
    }

    /// Commit a transaction with a single participant, skipping prepare
    pub fn commit_one_phase(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.status {
            Status::Active => {}
            Status::MarkedRollback => {
                return Err(TxError::Rollback(format!(
                    "transaction {} is marked rollback-only",
                    self.xid
                )))
            }
            status => {
                return Err(TxError::IllegalState(format!(
                    "cannot commit transaction {} in state {}",
                    self.xid, status
                )))
            }
        }
        if !inner.children.is_empty() {
            return Err(TxError::InvalidTransaction(format!(
                "transaction {} has active subordinates",
                self.xid
            )));
        }
        if inner.registry.branch_count() > 1 {
            return Err(TxError::IllegalState(
                "one-phase commit requires a single participant".into(),
            ));
        }
        inner.status = Status::Committing;

        let failures = inner.registry.end_all(TMSUCCESS);
        if !failures.is_empty() {
            self.rollback_pending(&mut inner, None);
            inner.status = Status::RolledBack;
            return Err(TxError::Rollback(format!(
                "participant of {} failed to end its work: {}",
                self.xid, failures[0].1
            )));
        }

        let branch = match inner.registry.branches().first() {
            Some(branch) => branch.clone(),
            None => {
                inner.status = Status::Committed;
                return Ok(());
            }
        };

        let state = self.commit_branch(&branch, true);
        inner.branches.insert(branch.xid.clone(), state);
        match state {
            BranchState::Committed => {
                inner.status = Status::Committed;
                Ok(())
            }
            BranchState::RolledBack => {
                inner.status = Status::RolledBack;
                Err(TxError::Rollback(format!(
                    "one-phase commit of {} was rolled back by the resource",
                    self.xid
                )))
            }
            BranchState::Heuristic(kind) => {
                forget(&branch);
                match kind {
                    HeuristicKind::Commit => {
                        inner.status = Status::Committed;
                        Ok(())
                    }
                    HeuristicKind::Rollback => {
                        inner.status = Status::RolledBack;
                        Err(TxError::HeuristicRollback(format!(
                            "{}: the resource rolled back heuristically",
                            self.xid
                        )))
                    }
                    HeuristicKind::Mixed => {
                        inner.status = Status::Committed;
                        Err(TxError::HeuristicMixed(format!(
                            "{}: the resource partially committed",
                            self.xid
                        )))
                    }
                    HeuristicKind::Hazard => {
                        inner.status = Status::Unknown;
                        Err(TxError::HeuristicHazard(format!(
                            "{}: outcome unknown",
                            self.xid
                        )))
                    }
                }
            }
            _ => {
                inner.status = Status::Unknown;
                Err(TxError::HeuristicHazard(format!(
                    "{}: outcome of the one-phase commit is unknown",
                    self.xid
                )))
            }
        }
    }

    /// Roll back. Without `force`, a prepared transaction is left alone and
    /// `false` is returned.
    pub fn rollback(&self, force: bool) -> Result<bool> {
        self.rollback_inner(force, true)
    }

    fn rollback_inner(&self, force: bool, detach: bool) -> Result<bool> {
        let result = {
            let mut inner = self.lock();
            match inner.status {
                Status::RolledBack | Status::NoTransaction => return Ok(true),
                Status::Committed => {
                    return Err(TxError::IllegalState(format!(
                        "transaction {} is already committed",
                        self.xid
                    )))
                }
                Status::Prepared | Status::Committing | Status::Unknown if !force => {
                    log::debug!("Not rolling back prepared transaction {}", self.xid);
                    return Ok(false);
                }
                _ => {}
            }

            for child in std::mem::take(&mut inner.children) {
                if let Err(e) = child.rollback_inner(true, false) {
                    log::warn!("Rollback of subordinate {} failed: {}", child.xid, e);
                }
            }

            let root = self.role == CoordinatorRole::Root;
            if root && inner.decision == Some(Decision::Commit) {
                let pending = inner.branches_in(BranchState::is_pending);
                let op = LogOperation::Prepared {
                    decision: Decision::Rollback,
                    branches: branch_records(&pending),
                };
                self.ctx
                    .log()
                    .append_durable(&self.xid, self.local_id, op)
                    .map_err(|e| {
                        TxError::System(format!(
                            "could not log rollback decision for {}: {}",
                            self.xid, e
                        ))
                    })?;
                inner.decision = Some(Decision::Rollback);
            }

            inner.status = Status::RollingBack;
            inner.registry.end_all(TMFAIL);
            inner.registry.mark_rolling_back();

            let (tally, heuristic) = self.rollback_pending(&mut inner, None);
            let kind = tally.rollback_heuristic();
            self.finish_phase(&inner, kind, &heuristic);
            if !inner.has_unresolved() {
                inner.status = Status::RolledBack;
            }
            log::debug!("Transaction {} rolled back", self.xid);
            tally.rollback_error(&self.xid)
        };

        if detach {
            self.detach_from_parent();
        }
        match result {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Re-drive branches whose second-phase outcome was unknown
    pub fn replay_in_doubt(&self) -> Result<ReplayResult> {
        let mut inner = self.lock();
        let unresolved = inner.branches_in(|s| s == BranchState::Unresolved);
        if unresolved.is_empty() {
            return Ok(ReplayResult::Resolved(inner.status));
        }

        let decision = inner.decision.unwrap_or(Decision::Rollback);
        let mut heuristic = Vec::new();
        for branch in &unresolved {
            let state = match decision {
                Decision::Commit => self.commit_branch(branch, false),
                Decision::Rollback => rollback_branch(branch),
            };
            if matches!(state, BranchState::Heuristic(_)) {
                heuristic.push(branch.clone());
            }
            inner.branches.insert(branch.xid.clone(), state);
        }
        heuristic.iter().for_each(forget);

        if inner.has_unresolved() {
            return Ok(ReplayResult::StillUnknown);
        }
        if self.role == CoordinatorRole::Root {
            if let Err(e) = self.ctx.log().delete(&self.xid, self.local_id) {
                log::warn!("Could not complete log record of {}: {}", self.xid, e);
            }
        }
        inner.status = match decision {
            Decision::Commit => Status::Committed,
            Decision::Rollback => Status::RolledBack,
        };
        self.release_if_settled(inner.status);
        Ok(ReplayResult::Resolved(inner.status))
    }

    /// Commit one branch, retrying transient failures within the retry window
    fn commit_branch(&self, branch: &Branch, one_phase: bool) -> BranchState {
        let config = self.ctx.config();
        let started = Instant::now();
        loop {
            let e = match branch.resource.commit(&branch.xid, one_phase) {
                Ok(()) => return BranchState::Committed,
                Err(e) => e,
            };
            if e.is_unknown_branch() {
                // two-phase: already committed; one-phase: the work is gone
                return if one_phase {
                    BranchState::RolledBack
                } else {
                    BranchState::Committed
                };
            }
            if e.is_rollback() || (one_phase && e.code == XA_HEURRB) {
                return BranchState::RolledBack;
            }
            if let Some(kind) = heuristic_kind(&e) {
                return BranchState::Heuristic(kind);
            }
            if e.is_transient() && may_retry(config.retry_timeout_in_seconds, started) {
                log::debug!("Retrying commit of {} after {}", branch.xid, e);
                thread::sleep(Duration::from_millis(config.commit_retry_wait_ms));
                continue;
            }
            log::warn!("commit failed for branch {}: {}", branch.xid, e);
            return BranchState::Unresolved;
        }
    }

    /// Roll back every branch that still needs a directive
    fn rollback_pending(
        &self,
        inner: &mut Inner,
        skip: Option<&TransactionId>,
    ) -> (PhaseTally, Vec<Branch>) {
        let mut tally = PhaseTally::default();
        let mut heuristic = Vec::new();
        let pending = inner.branches_in(BranchState::is_pending);
        for branch in pending.iter().filter(|b| Some(&b.xid) != skip) {
            let state = rollback_branch(branch);
            tally.record(state);
            if matches!(state, BranchState::Heuristic(_)) {
                heuristic.push(branch.clone());
            }
            inner.branches.insert(branch.xid.clone(), state);
        }
        heuristic.iter().for_each(forget);
        (tally, heuristic)
    }

    /// Log heuristics and completion at the end of a second phase
    fn finish_phase(&self, inner: &Inner, kind: Option<HeuristicKind>, heuristic: &[Branch]) {
        if self.role != CoordinatorRole::Root {
            return;
        }
        let log = self.ctx.log();
        if let Some(kind) = kind {
            let mut involved = heuristic.to_vec();
            involved.extend(inner.branches_in(|s| s == BranchState::Unresolved));
            let op = LogOperation::Heuristic {
                kind,
                branches: branch_records(&involved),
            };
            if let Err(e) = log.append(&self.xid, self.local_id, op) {
                log::warn!("Could not log heuristic outcome of {}: {}", self.xid, e);
            }
        }

        if inner.has_unresolved() {
            if let Some(me) = self.me.upgrade() {
                let timeouts = self.ctx.timeouts();
                timeouts.schedule(
                    self.local_id,
                    TimeoutKind::InDoubt,
                    timeouts.scan_interval(),
                    me,
                );
            }
        } else if inner.decision.is_some() || kind.is_some() {
            if let Err(e) = log.delete(&self.xid, self.local_id) {
                log::warn!("Could not complete log record of {}: {}", self.xid, e);
            }
        }
    }

    /// Hand this scope's branches to the parent
    fn commit_subordinate(&self) -> Result<()> {
        let parent = self
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TxError::System(format!("parent of {} is gone", self.xid)))?;

        let (registry, branches, last_agent) = {
            let mut inner = self.lock();
            if inner.status != Status::Prepared {
                return Err(TxError::NotPrepared(format!(
                    "subordinate {} is {}",
                    self.xid, inner.status
                )));
            }
            inner.status = Status::Committed;
            (
                std::mem::take(&mut inner.registry),
                std::mem::take(&mut inner.branches),
                inner.last_agent.take(),
            )
        };
        parent.adopt_subordinate(self, registry, branches, last_agent)
    }

    fn adopt_subordinate(
        &self,
        child: &Coordinator,
        registry: ResourceRegistry,
        branches: HashMap<TransactionId, BranchState>,
        last_agent: Option<Branch>,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.children.retain(|c| !std::ptr::eq(c.as_ref(), child));

        let conflict = last_agent.is_some() && inner.last_agent.is_some();
        if inner.status.is_completing() || conflict {
            drop(inner);
            for branch in registry.branches() {
                rollback_branch(branch);
            }
            return Err(TxError::Rollback(format!(
                "subordinate {} could not join {}",
                child.xid, self.xid
            )));
        }

        inner.registry.absorb(registry);
        inner.branches.extend(branches);
        if last_agent.is_some() {
            inner.last_agent = last_agent;
        }
        log::debug!("Subordinate {} merged into {}", child.xid, self.xid);
        Ok(())
    }

    fn detach_from_parent(&self) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent
                .lock()
                .children
                .retain(|c| !std::ptr::eq(c.as_ref(), self));
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.role == CoordinatorRole::Root {
            self.ctx.end_in_flight(&self.xid);
        }
    }
}

impl TimeoutTarget for Coordinator {
    fn on_active_timeout(&self) -> Result<()> {
        self.rollback_only()
    }

    fn replay_in_doubt(&self) -> Result<ReplayResult> {
        Coordinator::replay_in_doubt(self)
    }
}

fn rollback_branch(branch: &Branch) -> BranchState {
    match branch.resource.rollback(&branch.xid) {
        Ok(()) => BranchState::RolledBack,
        Err(e) if e.is_unknown_branch() || e.is_rollback() => BranchState::RolledBack,
        Err(e) => match heuristic_kind(&e) {
            Some(kind) => BranchState::Heuristic(kind),
            None => {
                log::warn!("rollback failed for branch {}: {}", branch.xid, e);
                BranchState::Unresolved
            }
        },
    }
}

/// Negative retry timeout retries forever; zero never retries
fn may_retry(retry_timeout_secs: i64, started: Instant) -> bool {
    match retry_timeout_secs {
        t if t < 0 => true,
        0 => false,
        t => started.elapsed() < Duration::from_secs(t as u64),
    }
}
