//! In-process resource manager
//!
//! A [`MemoryResource`] behaves like a connection to a small XA resource
//! manager: it tracks active, prepared, committed and heuristically completed
//! branches, answers `recover` with its in-doubt set, and journals every call
//! it receives. Errors and votes can be scripted, which makes it the stand-in
//! for real resource managers in tests and demos. Several connections to the
//! same resource manager share state (see [`MemoryResource::connection`]).

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::xa_codes::{XAER_DUPID, XAER_NOTA, XAER_PROTO};
use crate::error::{XaError, XaResult};
use crate::resource::flags::{TMNOFLAGS, TMSTARTRSCAN};
use crate::resource::{Vote, XaResource};
use crate::xid::TransactionId;

/// One call received by the resource manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(TransactionId, i32),
    End(TransactionId, i32),
    Prepare(TransactionId),
    Commit(TransactionId, bool),
    Rollback(TransactionId),
    Forget(TransactionId),
    Recover(i32),
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Start(..) => "start",
            Call::End(..) => "end",
            Call::Prepare(_) => "prepare",
            Call::Commit(..) => "commit",
            Call::Rollback(_) => "rollback",
            Call::Forget(_) => "forget",
            Call::Recover(_) => "recover",
        }
    }

    pub fn xid(&self) -> Option<&TransactionId> {
        match self {
            Call::Start(xid, _)
            | Call::End(xid, _)
            | Call::Prepare(xid)
            | Call::Commit(xid, _)
            | Call::Rollback(xid)
            | Call::Forget(xid) => Some(xid),
            Call::Recover(_) => None,
        }
    }
}

type CommitHook = Box<dyn Fn(&TransactionId) + Send + Sync>;

#[derive(Default)]
struct Faults {
    start: VecDeque<XaError>,
    end: VecDeque<XaError>,
    prepare: VecDeque<XaError>,
    commit: VecDeque<XaError>,
    rollback: VecDeque<XaError>,
    forget: VecDeque<XaError>,
    recover: VecDeque<XaError>,
}

struct RmState {
    calls: Vec<Call>,
    active: BTreeSet<TransactionId>,
    prepared: BTreeSet<TransactionId>,
    heuristic: BTreeSet<TransactionId>,
    committed: Vec<TransactionId>,
    rolled_back: Vec<TransactionId>,
    vote: Vote,
    timeout_secs: u32,
    faults: Faults,
    on_commit: Option<CommitHook>,
}

impl RmState {
    fn new() -> Self {
        Self {
            calls: Vec::new(),
            active: BTreeSet::new(),
            prepared: BTreeSet::new(),
            heuristic: BTreeSet::new(),
            committed: Vec::new(),
            rolled_back: Vec::new(),
            vote: Vote::Commit,
            timeout_secs: 0,
            faults: Faults::default(),
            on_commit: None,
        }
    }
}

/// Connection to an in-process resource manager
pub struct MemoryResource {
    id: String,
    two_phase: bool,
    state: Arc<Mutex<RmState>>,
}

impl MemoryResource {
    /// XA-capable resource manager named `id`
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            two_phase: true,
            state: Arc::new(Mutex::new(RmState::new())),
        }
    }

    /// Local resource that can only commit in one phase
    pub fn local(id: &str) -> Self {
        Self {
            two_phase: false,
            ..Self::new(id)
        }
    }

    /// Another connection (a distinct object) to the same resource manager
    pub fn connection(&self) -> Self {
        Self {
            id: self.id.clone(),
            two_phase: self.two_phase,
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RmState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Vote returned by every following successful prepare
    pub fn set_vote(&self, vote: Vote) {
        self.lock().vote = vote;
    }

    pub fn fail_start(&self, error: XaError) {
        self.lock().faults.start.push_back(error);
    }

    pub fn fail_end(&self, error: XaError) {
        self.lock().faults.end.push_back(error);
    }

    pub fn fail_prepare(&self, error: XaError) {
        self.lock().faults.prepare.push_back(error);
    }

    /// Queue an error for the next commit. Heuristic codes leave the branch
    /// heuristically completed until it is forgotten.
    pub fn fail_commit(&self, error: XaError) {
        self.lock().faults.commit.push_back(error);
    }

    pub fn fail_rollback(&self, error: XaError) {
        self.lock().faults.rollback.push_back(error);
    }

    pub fn fail_forget(&self, error: XaError) {
        self.lock().faults.forget.push_back(error);
    }

    pub fn fail_recover(&self, error: XaError) {
        self.lock().faults.recover.push_back(error);
    }

    /// Run `hook` at the start of every commit call
    pub fn on_commit(&self, hook: impl Fn(&TransactionId) + Send + Sync + 'static) {
        self.lock().on_commit = Some(Box::new(hook));
    }

    /// Pretend `xid` was prepared before a crash
    pub fn seed_in_doubt(&self, xid: TransactionId) {
        self.lock().prepared.insert(xid);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of calls named `name` ("prepare", "commit", ...)
    pub fn count(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.name() == name).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn in_doubt(&self) -> Vec<TransactionId> {
        self.lock().prepared.iter().cloned().collect()
    }

    pub fn committed(&self) -> Vec<TransactionId> {
        self.lock().committed.clone()
    }

    pub fn rolled_back(&self) -> Vec<TransactionId> {
        self.lock().rolled_back.clone()
    }

    pub fn transaction_timeout(&self) -> u32 {
        self.lock().timeout_secs
    }
}

impl XaResource for MemoryResource {
    fn start(&self, xid: &TransactionId, flags: i32) -> XaResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Start(xid.clone(), flags));
        if let Some(e) = state.faults.start.pop_front() {
            return Err(e);
        }
        if flags == TMNOFLAGS {
            if state.active.contains(xid) || state.prepared.contains(xid) {
                return Err(XaError::new(XAER_DUPID, format!("branch {} exists", xid)));
            }
            state.active.insert(xid.clone());
        }
        Ok(())
    }

    fn end(&self, xid: &TransactionId, flags: i32) -> XaResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::End(xid.clone(), flags));
        match state.faults.end.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn prepare(&self, xid: &TransactionId) -> XaResult<Vote> {
        let mut state = self.lock();
        state.calls.push(Call::Prepare(xid.clone()));
        if !self.two_phase {
            return Err(XaError::new(XAER_PROTO, "local resource cannot prepare"));
        }
        if let Some(e) = state.faults.prepare.pop_front() {
            if e.is_rollback() {
                state.active.remove(xid);
                state.rolled_back.push(xid.clone());
            }
            return Err(e);
        }
        if !state.active.remove(xid) {
            return Err(XaError::new(XAER_NOTA, format!("unknown branch {}", xid)));
        }
        let vote = state.vote;
        match vote {
            Vote::Commit => {
                state.prepared.insert(xid.clone());
            }
            Vote::Rollback => state.rolled_back.push(xid.clone()),
            Vote::ReadOnly => {}
        }
        Ok(vote)
    }

    fn commit(&self, xid: &TransactionId, one_phase: bool) -> XaResult<()> {
        let mut state = self.lock();
        if let Some(hook) = state.on_commit.as_ref() {
            hook(xid);
        }
        state.calls.push(Call::Commit(xid.clone(), one_phase));

        if let Some(e) = state.faults.commit.pop_front() {
            if e.is_heuristic() {
                state.prepared.remove(xid);
                state.active.remove(xid);
                state.heuristic.insert(xid.clone());
            } else if e.is_rollback() {
                state.prepared.remove(xid);
                state.active.remove(xid);
                state.rolled_back.push(xid.clone());
            }
            return Err(e);
        }

        let known = if one_phase {
            state.active.remove(xid) || state.prepared.remove(xid)
        } else {
            state.prepared.remove(xid)
        };
        if !known {
            return Err(XaError::new(XAER_NOTA, format!("unknown branch {}", xid)));
        }
        state.committed.push(xid.clone());
        Ok(())
    }

    fn rollback(&self, xid: &TransactionId) -> XaResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Rollback(xid.clone()));
        if let Some(e) = state.faults.rollback.pop_front() {
            if e.is_heuristic() {
                state.prepared.remove(xid);
                state.active.remove(xid);
                state.heuristic.insert(xid.clone());
            }
            return Err(e);
        }
        let active = state.active.remove(xid);
        let prepared = state.prepared.remove(xid);
        if !active && !prepared {
            return Err(XaError::new(XAER_NOTA, format!("unknown branch {}", xid)));
        }
        state.rolled_back.push(xid.clone());
        Ok(())
    }

    fn forget(&self, xid: &TransactionId) -> XaResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Forget(xid.clone()));
        if let Some(e) = state.faults.forget.pop_front() {
            return Err(e);
        }
        if !state.heuristic.remove(xid) {
            return Err(XaError::new(XAER_NOTA, format!("no heuristic branch {}", xid)));
        }
        Ok(())
    }

    fn recover(&self, flags: i32) -> XaResult<Vec<TransactionId>> {
        let mut state = self.lock();
        state.calls.push(Call::Recover(flags));
        if let Some(e) = state.faults.recover.pop_front() {
            return Err(e);
        }
        if flags & TMSTARTRSCAN == 0 {
            return Ok(Vec::new());
        }
        let mut xids: Vec<TransactionId> = state.prepared.iter().cloned().collect();
        xids.extend(state.heuristic.iter().cloned());
        Ok(xids)
    }

    fn resource_manager_id(&self) -> String {
        self.id.clone()
    }

    fn supports_two_phase(&self) -> bool {
        self.two_phase
    }

    fn set_transaction_timeout(&self, seconds: u32) -> XaResult<bool> {
        self.lock().timeout_secs = seconds;
        Ok(true)
    }
}
