//! Coordinator status, votes and outcome bookkeeping

use std::fmt;

use crate::error::xa_codes::{XA_HEURCOM, XA_HEURHAZ, XA_HEURMIX, XA_HEURRB};
use crate::error::{TxError, XaError};
use crate::txlog::HeuristicKind;

/// Transaction status as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Active,
    MarkedRollback,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Unknown,
    NoTransaction,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Committed | Status::RolledBack)
    }

    /// Completion has started; no more work may join
    pub fn is_completing(self) -> bool {
        !matches!(self, Status::Active | Status::MarkedRollback)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Active => "ACTIVE",
            Status::MarkedRollback => "MARKED_ROLLBACK",
            Status::Preparing => "PREPARING",
            Status::Prepared => "PREPARED",
            Status::Committing => "COMMITTING",
            Status::Committed => "COMMITTED",
            Status::RollingBack => "ROLLING_BACK",
            Status::RolledBack => "ROLLED_BACK",
            Status::Unknown => "UNKNOWN",
            Status::NoTransaction => "NO_TRANSACTION",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorRole {
    Root,
    Subordinate,
}

/// What the invocation-return path should do with a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    Forget,
    Retain,
}

/// Result of re-driving unresolved branches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayResult {
    Resolved(Status),
    StillUnknown,
}

/// Aggregate outcome of a protocol phase. Variants are ordered so that the
/// worst outcome compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    Commit,
    HeuristicHazard,
    HeuristicMixed,
    Rollback,
}

impl Outcome {
    pub fn worst(self, other: Outcome) -> Outcome {
        self.max(other)
    }
}

/// Protocol state of one branch inside a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Active,
    Prepared,
    ReadOnly,
    Committed,
    RolledBack,
    /// Completed by the resource manager on its own; must be forgotten
    Heuristic(HeuristicKind),
    /// Outcome not known after retries
    Unresolved,
}

impl BranchState {
    /// The branch still needs a second-phase directive
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            BranchState::Active | BranchState::Prepared | BranchState::Unresolved
        )
    }
}

/// Heuristic kind reported by an XA error, if any
pub fn heuristic_kind(error: &XaError) -> Option<HeuristicKind> {
    match error.code {
        XA_HEURCOM => Some(HeuristicKind::Commit),
        XA_HEURRB => Some(HeuristicKind::Rollback),
        XA_HEURMIX => Some(HeuristicKind::Mixed),
        XA_HEURHAZ => Some(HeuristicKind::Hazard),
        _ => None,
    }
}

/// Per-phase tally of branch results
#[derive(Debug, Default, Clone)]
pub struct PhaseTally {
    pub committed: usize,
    pub rolled_back: usize,
    pub heuristic_commit: usize,
    pub heuristic_rollback: usize,
    pub mixed: usize,
    pub hazard: usize,
}

impl PhaseTally {
    pub fn record(&mut self, state: BranchState) {
        match state {
            BranchState::Committed => self.committed += 1,
            BranchState::RolledBack => self.rolled_back += 1,
            BranchState::Heuristic(HeuristicKind::Commit) => self.heuristic_commit += 1,
            BranchState::Heuristic(HeuristicKind::Rollback) => self.heuristic_rollback += 1,
            BranchState::Heuristic(HeuristicKind::Mixed) => self.mixed += 1,
            BranchState::Heuristic(HeuristicKind::Hazard) | BranchState::Unresolved => {
                self.hazard += 1
            }
            BranchState::Active | BranchState::Prepared | BranchState::ReadOnly => {}
        }
    }

    pub fn any_heuristic(&self) -> bool {
        self.heuristic_commit + self.heuristic_rollback + self.mixed + self.hazard > 0
    }

    /// Heuristic kind to log after a commit phase
    pub fn commit_heuristic(&self) -> Option<HeuristicKind> {
        let committed = self.committed + self.heuristic_commit;
        let rolled_back = self.rolled_back + self.heuristic_rollback;
        if self.mixed > 0 || (committed > 0 && rolled_back > 0) {
            Some(HeuristicKind::Mixed)
        } else if rolled_back > 0 {
            Some(HeuristicKind::Rollback)
        } else if self.hazard > 0 {
            Some(HeuristicKind::Hazard)
        } else {
            None
        }
    }

    /// Caller-visible error after a commit phase
    pub fn commit_error(&self, xid: &dyn fmt::Display) -> Option<TxError> {
        match self.commit_heuristic()? {
            HeuristicKind::Mixed => Some(TxError::HeuristicMixed(format!(
                "{}: some branches committed and some rolled back",
                xid
            ))),
            HeuristicKind::Rollback => Some(TxError::HeuristicRollback(format!(
                "{}: all branches were rolled back",
                xid
            ))),
            _ => Some(TxError::HeuristicHazard(format!(
                "{}: outcome of some branches is unknown",
                xid
            ))),
        }
    }

    /// Heuristic kind to log after a rollback phase
    pub fn rollback_heuristic(&self) -> Option<HeuristicKind> {
        let committed = self.committed + self.heuristic_commit;
        let rolled_back = self.rolled_back + self.heuristic_rollback;
        if self.mixed > 0 || (committed > 0 && rolled_back > 0) {
            Some(HeuristicKind::Mixed)
        } else if committed > 0 {
            Some(HeuristicKind::Commit)
        } else if self.hazard > 0 {
            Some(HeuristicKind::Hazard)
        } else {
            None
        }
    }

    /// Caller-visible error after a rollback phase
    pub fn rollback_error(&self, xid: &dyn fmt::Display) -> Option<TxError> {
        match self.rollback_heuristic()? {
            HeuristicKind::Mixed => Some(TxError::HeuristicMixed(format!(
                "{}: some branches committed and some rolled back",
                xid
            ))),
            HeuristicKind::Commit => Some(TxError::HeuristicCommit(format!(
                "{}: branches committed although rollback was requested",
                xid
            ))),
            _ => Some(TxError::HeuristicHazard(format!(
                "{}: outcome of some branches is unknown",
                xid
            ))),
        }
    }
}
