use super::*;
use crate::config::TmConfig;
use crate::error::xa_codes::{XAER_RMERR, XAER_RMFAIL, XA_HEURHAZ, XA_HEURMIX, XA_RBROLLBACK};
use crate::resource::{Call, MemoryResource};
use crate::txlog::{LogEvent, MemoryLog};

struct Fixture {
    ctx: Arc<TxContext>,
    log: Arc<MemoryLog>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(TmConfig::default())
    }

    fn with_config(config: TmConfig) -> Self {
        let log = Arc::new(MemoryLog::new(&config.server_name, &config.instance_name));
        let ctx = TxContext::new(config, log.clone()).unwrap();
        Self { ctx, log }
    }

    fn coordinator(&self) -> Arc<Coordinator> {
        let (local_id, xid) = self.ctx.xids().next_global();
        Coordinator::new(Arc::clone(&self.ctx), local_id, xid)
    }
}

fn resource(id: &str) -> (Arc<MemoryResource>, ResourceHandle) {
    let rm = Arc::new(MemoryResource::new(id));
    let handle = ResourceHandle::from(Arc::clone(&rm));
    (rm, handle)
}

fn local_resource(id: &str) -> (Arc<MemoryResource>, ResourceHandle) {
    let rm = Arc::new(MemoryResource::local(id));
    let handle = ResourceHandle::from(Arc::clone(&rm));
    (rm, handle)
}

#[test]
fn test_two_resources_commit() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (rm2, r2) = resource("rm2");

    let b1 = coord.register_resource(&r1).unwrap();
    let b2 = coord.register_resource(&r2).unwrap();
    assert_ne!(b1, b2);
    assert!(b1.same_global(coord.xid()));

    assert_eq!(coord.prepare().unwrap(), Vote::Commit);
    assert_eq!(coord.status(), Status::Prepared);
    assert!(fx.log.is_prepared_durable(coord.xid()));

    coord.commit().unwrap();
    assert_eq!(coord.status(), Status::Committed);
    assert_eq!(rm1.committed(), vec![b1]);
    assert_eq!(rm2.committed(), vec![b2]);
    assert_eq!(fx.log.row_count(), 0);
}

#[test]
fn test_same_rm_joins_branch() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm, r1) = resource("rm");
    let r2 = ResourceHandle::from(Arc::new(rm.connection()));

    let b1 = coord.register_resource(&r1).unwrap();
    let b2 = coord.register_resource(&r2).unwrap();
    assert_eq!(b1, b2);
    assert_eq!(coord.branch_count(), 1);

    coord.prepare().unwrap();
    coord.commit().unwrap();
    assert_eq!(rm.count("prepare"), 1);
    assert_eq!(rm.count("commit"), 1);
}

#[test]
fn test_rollback_vote_rolls_back_everyone() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (rm2, r2) = resource("rm2");
    rm2.set_vote(Vote::Rollback);

    let b1 = coord.register_resource(&r1).unwrap();
    coord.register_resource(&r2).unwrap();

    assert_eq!(coord.prepare().unwrap(), Vote::Rollback);
    assert_eq!(coord.status(), Status::RolledBack);
    assert_eq!(rm1.rolled_back(), vec![b1]);
    assert!(rm1.committed().is_empty());
    assert!(!fx.log.is_prepared_durable(coord.xid()));
}

#[test]
fn test_rollback_error_at_prepare() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (_rm2, r2) = resource("rm2");
    rm1.fail_prepare(XaError::code(XA_RBROLLBACK));

    coord.register_resource(&r1).unwrap();
    let b2 = coord.register_resource(&r2).unwrap();

    assert_eq!(coord.prepare().unwrap(), Vote::Rollback);
    assert_eq!(coord.branch_state(&b2), Some(BranchState::RolledBack));
}

#[test]
fn test_read_only_votes_skip_commit() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (rm2, r2) = resource("rm2");
    rm1.set_vote(Vote::ReadOnly);

    coord.register_resource(&r1).unwrap();
    coord.register_resource(&r2).unwrap();
    coord.prepare().unwrap();
    coord.commit().unwrap();

    assert_eq!(rm1.count("commit"), 0);
    assert_eq!(rm2.count("commit"), 1);
}

#[test]
fn test_all_read_only() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    rm1.set_vote(Vote::ReadOnly);

    coord.register_resource(&r1).unwrap();
    assert_eq!(coord.prepare().unwrap(), Vote::ReadOnly);
    assert_eq!(coord.status(), Status::Committed);
    assert!(fx.log.events().is_empty());
}

#[test]
fn test_marked_rollback_fails_prepare_fast() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    coord.register_resource(&r1).unwrap();
    coord.rollback_only().unwrap();

    assert!(matches!(coord.prepare(), Err(TxError::Rollback(_))));
    assert_eq!(rm1.count("prepare"), 0);
    assert!(matches!(
        coord.register_resource(&resource("rm2").1),
        Err(TxError::Rollback(_))
    ));
}

#[test]
fn test_commit_requires_prepare() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    assert!(matches!(coord.commit(), Err(TxError::NotPrepared(_))));
}

#[test]
fn test_decision_logged_before_commit() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (_rm2, r2) = resource("rm2");

    let log = Arc::clone(&fx.log);
    let xid = coord.xid().clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    rm1.on_commit(move |_| {
        sink.lock().unwrap().push(log.is_prepared_durable(&xid));
    });

    coord.register_resource(&r1).unwrap();
    coord.register_resource(&r2).unwrap();
    coord.prepare().unwrap();
    coord.commit().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![true]);
}

#[test]
fn test_log_failure_rolls_back() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (rm2, r2) = resource("rm2");
    fx.log.fail_writes(true);

    coord.register_resource(&r1).unwrap();
    coord.register_resource(&r2).unwrap();
    assert!(matches!(coord.prepare(), Err(TxError::Rollback(_))));
    assert_eq!(coord.status(), Status::RolledBack);
    assert_eq!(rm1.rolled_back().len(), 1);
    assert_eq!(rm2.rolled_back().len(), 1);
    assert_eq!(rm1.count("commit"), 0);
}

#[test]
fn test_heuristic_mixed_at_commit() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (_rm2, r2) = resource("rm2");
    rm1.fail_commit(XaError::code(XA_HEURMIX));

    let b1 = coord.register_resource(&r1).unwrap();
    coord.register_resource(&r2).unwrap();
    coord.prepare().unwrap();

    assert!(matches!(coord.commit(), Err(TxError::HeuristicMixed(_))));
    assert_eq!(coord.status(), Status::Committed);
    assert!(rm1.calls().contains(&Call::Forget(b1)));
    assert!(fx
        .log
        .events()
        .iter()
        .any(|e| matches!(e, LogEvent::Appended { op: LogOperation::Heuristic { .. }, .. })));
    assert_eq!(fx.log.row_count(), 0);
}

#[test]
fn test_heuristic_hazard_at_prepare() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (rm2, r2) = resource("rm2");
    rm1.fail_prepare(XaError::code(XA_HEURHAZ));

    coord.register_resource(&r1).unwrap();
    let b2 = coord.register_resource(&r2).unwrap();
    assert!(matches!(coord.prepare(), Err(TxError::HeuristicHazard(_))));
    assert_eq!(rm2.rolled_back(), vec![b2]);
}

#[test]
fn test_transient_commit_failure_retried() {
    let mut config = TmConfig::default();
    config.retry_timeout_in_seconds = 5;
    config.commit_retry_wait_ms = 1;
    let fx = Fixture::with_config(config);
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (_rm2, r2) = resource("rm2");
    rm1.fail_commit(XaError::code(XAER_RMFAIL));

    let b1 = coord.register_resource(&r1).unwrap();
    coord.register_resource(&r2).unwrap();
    coord.prepare().unwrap();
    coord.commit().unwrap();

    assert_eq!(rm1.count("commit"), 2);
    assert_eq!(rm1.committed(), vec![b1]);
}

#[test]
fn test_unresolved_commit_is_replayed() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (_rm2, r2) = resource("rm2");
    rm1.fail_commit(XaError::code(XAER_RMERR));

    let b1 = coord.register_resource(&r1).unwrap();
    coord.register_resource(&r2).unwrap();
    coord.prepare().unwrap();

    assert!(matches!(coord.commit(), Err(TxError::HeuristicHazard(_))));
    assert_eq!(coord.status(), Status::Committing);
    assert_eq!(coord.branch_state(&b1), Some(BranchState::Unresolved));
    assert!(fx
        .ctx
        .timeouts()
        .is_scheduled(coord.local_id(), TimeoutKind::InDoubt));
    assert_eq!(fx.log.row_count(), 1);

    assert_eq!(
        coord.replay_in_doubt().unwrap(),
        ReplayResult::Resolved(Status::Committed)
    );
    assert_eq!(rm1.committed(), vec![b1]);
    assert_eq!(fx.log.row_count(), 0);
}

#[test]
fn test_last_agent_commits_after_votes() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (la, local) = local_resource("local");
    let (rm1, r1) = resource("rm1");

    coord.register_resource(&local).unwrap();
    coord.register_resource(&r1).unwrap();
    assert!(coord.has_last_agent());

    coord.prepare().unwrap();
    assert_eq!(la.count("prepare"), 0);
    assert_eq!(la.committed().len(), 1);
    assert!(matches!(la.calls().last(), Some(Call::Commit(_, true))));
    assert_eq!(rm1.count("prepare"), 1);
    assert_eq!(rm1.count("commit"), 0);

    coord.commit().unwrap();
    assert_eq!(rm1.count("commit"), 1);
}

#[test]
fn test_last_agent_rollback() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (la, local) = local_resource("local");
    let (rm1, r1) = resource("rm1");
    la.fail_commit(XaError::code(XA_RBROLLBACK));

    coord.register_resource(&local).unwrap();
    let b1 = coord.register_resource(&r1).unwrap();
    assert_eq!(coord.prepare().unwrap(), Vote::Rollback);
    assert_eq!(rm1.rolled_back(), vec![b1]);
    assert!(!fx.log.is_prepared_durable(coord.xid()));
}

#[test]
fn test_last_agent_unknown_outcome() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (la, local) = local_resource("local");
    let (rm1, r1) = resource("rm1");
    la.fail_commit(XaError::code(XAER_RMERR));

    coord.register_resource(&local).unwrap();
    coord.register_resource(&r1).unwrap();
    assert!(matches!(coord.prepare(), Err(TxError::HeuristicHazard(_))));
    assert_eq!(coord.status(), Status::Unknown);
    assert_eq!(rm1.rolled_back().len(), 1);
}

#[test]
fn test_second_local_resource_refused() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    coord.register_resource(&local_resource("a").1).unwrap();
    assert!(matches!(
        coord.register_resource(&local_resource("b").1),
        Err(TxError::System(_))
    ));
}

#[test]
fn test_one_phase_commit() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    coord.register_resource(&r1).unwrap();

    coord.commit_one_phase().unwrap();
    assert_eq!(coord.status(), Status::Committed);
    assert_eq!(rm1.count("prepare"), 0);
    assert!(matches!(rm1.calls().last(), Some(Call::Commit(_, true))));
    assert!(fx.log.events().is_empty());
}

#[test]
fn test_one_phase_rejects_many_branches() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    coord.register_resource(&resource("rm1").1).unwrap();
    coord.register_resource(&resource("rm2").1).unwrap();
    assert!(matches!(
        coord.commit_one_phase(),
        Err(TxError::IllegalState(_))
    ));
}

#[test]
fn test_rollback_active() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let b1 = coord.register_resource(&r1).unwrap();

    assert!(coord.rollback(false).unwrap());
    assert_eq!(coord.status(), Status::RolledBack);
    assert!(rm1.calls().contains(&Call::End(b1.clone(), TMFAIL)));
    assert_eq!(rm1.rolled_back(), vec![b1]);
    assert_eq!(coord.association_state(&r1), AssociationState::RollingBack);

    assert!(coord.rollback(false).unwrap());
}

#[test]
fn test_rollback_prepared_needs_force() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (_rm2, r2) = resource("rm2");
    coord.register_resource(&r1).unwrap();
    coord.register_resource(&r2).unwrap();
    coord.prepare().unwrap();

    assert!(!coord.rollback(false).unwrap());
    assert_eq!(coord.status(), Status::Prepared);

    assert!(coord.rollback(true).unwrap());
    assert_eq!(rm1.rolled_back().len(), 1);
    assert!(fx
        .log
        .events()
        .iter()
        .any(|e| matches!(
            e,
            LogEvent::Appended {
                op: LogOperation::Prepared {
                    decision: Decision::Rollback,
                    ..
                },
                ..
            }
        )));
    assert_eq!(fx.log.row_count(), 0);
}

#[test]
fn test_committed_cannot_roll_back() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    coord.register_resource(&resource("rm1").1).unwrap();
    coord.commit_one_phase().unwrap();
    assert!(matches!(coord.rollback(true), Err(TxError::IllegalState(_))));
}

#[test]
fn test_delist_with_fail_marks_rollback() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (_rm1, r1) = resource("rm1");
    coord.register_resource(&r1).unwrap();
    coord.delist_resource(&r1, TMFAIL).unwrap();
    assert_eq!(coord.status(), Status::MarkedRollback);
}

#[test]
fn test_suspend_and_resume() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let b1 = coord.register_resource(&r1).unwrap();

    assert!(coord.suspend_resources().is_empty());
    assert_eq!(coord.association_state(&r1), AssociationState::Suspended);
    assert!(coord.resume_resources().is_empty());
    assert_eq!(coord.association_state(&r1), AssociationState::Associated);
    assert!(rm1
        .calls()
        .contains(&Call::Start(b1, crate::resource::flags::TMRESUME)));
}

#[test]
fn test_subordinate_merges_into_parent() {
    let fx = Fixture::new();
    let root = fx.coordinator();
    let (rm1, r1) = resource("rm1");
    let (rm2, r2) = resource("rm2");
    root.register_resource(&r1).unwrap();

    let child = root.create_subordinate().unwrap();
    assert_eq!(child.role(), CoordinatorRole::Subordinate);
    assert_eq!(root.reply_action(), ReplyAction::Retain);
    child.register_resource(&r2).unwrap();

    assert!(matches!(root.prepare(), Err(TxError::InvalidTransaction(_))));

    assert_eq!(child.prepare().unwrap(), Vote::Commit);
    child.commit().unwrap();
    assert_eq!(root.reply_action(), ReplyAction::Forget);
    assert_eq!(root.branch_count(), 2);
    assert_eq!(rm2.count("prepare"), 0);

    root.prepare().unwrap();
    root.commit().unwrap();
    assert_eq!(rm1.committed().len(), 1);
    assert_eq!(rm2.committed().len(), 1);
}

#[test]
fn test_root_rollback_reaches_subordinates() {
    let fx = Fixture::new();
    let root = fx.coordinator();
    let (rm2, r2) = resource("rm2");
    let child = root.create_subordinate().unwrap();
    child.register_resource(&r2).unwrap();

    root.rollback(true).unwrap();
    assert_eq!(child.status(), Status::RolledBack);
    assert_eq!(rm2.rolled_back().len(), 1);
}

#[test]
fn test_subordinate_rollback_detaches() {
    let fx = Fixture::new();
    let root = fx.coordinator();
    let child = root.create_subordinate().unwrap();
    child.rollback(false).unwrap();
    assert_eq!(root.reply_action(), ReplyAction::Forget);
    assert_eq!(root.status(), Status::Active);
}

#[test]
fn test_active_timeout_marks_rollback() {
    let fx = Fixture::new();
    let coord = fx.coordinator();
    TimeoutTarget::on_active_timeout(coord.as_ref()).unwrap();
    assert_eq!(coord.status(), Status::MarkedRollback);
}

#[test]
fn test_may_retry_window() {
    let now = Instant::now();
    assert!(may_retry(-1, now));
    assert!(!may_retry(0, now));
    assert!(may_retry(30, now));
}
