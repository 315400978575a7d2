use super::*;
use crate::config::TmConfig;
use crate::error::xa_codes::XAER_RMERR;
use crate::error::XaError;
use crate::resource::flags::{TMFAIL, TMNOFLAGS, TMSUCCESS};
use crate::resource::{Call, MemoryResource, ResourceErrorHandler, Vote};
use crate::txlog::MemoryLog;
use std::thread;
use std::time::Duration;

fn manager_with(config: TmConfig) -> (TransactionManager, Arc<MemoryLog>) {
    let log = Arc::new(MemoryLog::new(&config.server_name, &config.instance_name));
    let ctx = TxContext::new(config, log.clone()).unwrap();
    (TransactionManager::new(ctx), log)
}

fn manager() -> (TransactionManager, Arc<MemoryLog>) {
    manager_with(TmConfig::default())
}

fn xa(id: &str) -> (Arc<MemoryResource>, ResourceHandle) {
    let rm = Arc::new(MemoryResource::new(id));
    (Arc::clone(&rm), ResourceHandle::from(rm))
}

fn local(id: &str) -> (Arc<MemoryResource>, ResourceHandle) {
    let rm = Arc::new(MemoryResource::local(id));
    (Arc::clone(&rm), ResourceHandle::from(rm))
}

#[derive(Default)]
struct Recorder {
    name: &'static str,
    fail_before: bool,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Synchronization for Recorder {
    fn before_completion(&self) -> Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("before:{}", self.name));
        if self.fail_before {
            return Err(TxError::System(format!("{} refused", self.name)));
        }
        Ok(())
    }

    fn after_completion(&self, status: Status) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("after:{}:{}", self.name, status));
    }
}

#[derive(Default)]
struct CollectingHandler {
    seen: Mutex<Vec<ResourceErrorAction>>,
}

impl ResourceErrorHandler for CollectingHandler {
    fn handle_resource_error(
        &self,
        _resource: &ResourceHandle,
        action: ResourceErrorAction,
        _error: &XaError,
    ) {
        self.seen.lock().unwrap().push(action);
    }
}

#[test]
fn test_begin_commit_without_resources() {
    let (tm, log) = manager();
    assert_eq!(tm.status(), Status::NoTransaction);

    let tx = tm.begin().unwrap();
    assert_eq!(tm.status(), Status::Active);
    assert_eq!(tm.active_count(), 1);

    tm.commit().unwrap();
    assert_eq!(tx.status(), Status::Committed);
    assert_eq!(tm.status(), Status::NoTransaction);
    assert_eq!(tm.active_count(), 0);
    assert!(log.events().is_empty());
}

#[test]
fn test_nested_begin_not_supported() {
    let (tm, _) = manager();
    tm.begin().unwrap();
    assert!(matches!(tm.begin(), Err(TxError::NotSupported(_))));
    tm.rollback().unwrap();
}

#[test]
fn test_commit_without_transaction() {
    let (tm, _) = manager();
    assert!(matches!(tm.commit(), Err(TxError::IllegalState(_))));
    assert!(matches!(tm.set_rollback_only(), Err(TxError::IllegalState(_))));
}

#[test]
fn test_local_resource_commits_one_phase() {
    let (tm, log) = manager();
    let (rm, res) = local("db");

    let tx = tm.begin().unwrap();
    tm.enlist_resource(&res).unwrap();
    assert!(!tx.is_distributed());

    tm.commit().unwrap();
    assert_eq!(
        rm.calls(),
        vec![
            Call::Start(tx.xid().clone(), TMNOFLAGS),
            Call::End(tx.xid().clone(), TMSUCCESS),
            Call::Commit(tx.xid().clone(), true),
        ]
    );
    assert!(log.events().is_empty());
}

#[test]
fn test_xa_resource_promotes() {
    let (tm, log) = manager();
    let (rm, res) = xa("rm1");

    let tx = tm.begin().unwrap();
    tm.enlist_resource(&res).unwrap();
    assert!(tx.is_distributed());

    // a single branch commits in one phase without logging
    tm.commit().unwrap();
    assert_eq!(rm.count("prepare"), 0);
    assert!(matches!(rm.calls().last(), Some(Call::Commit(_, true))));
    assert!(log.events().is_empty());
}

#[test]
fn test_local_then_xa_uses_last_agent() {
    let (tm, log) = manager();
    let (db, local_res) = local("db");
    let (rm, xa_res) = xa("queue");

    let tx = tm.begin().unwrap();
    tm.enlist_resource(&local_res).unwrap();
    tm.enlist_resource(&xa_res).unwrap();
    let coordinator = tx.coordinator().unwrap();
    assert!(coordinator.has_last_agent());

    tm.commit().unwrap();
    assert_eq!(db.count("prepare"), 0);
    assert_eq!(db.committed(), vec![tx.xid().clone()]);
    assert_eq!(rm.count("prepare"), 1);
    assert_eq!(rm.committed().len(), 1);
    assert!(log.is_prepared_durable(tx.xid()));
}

#[test]
fn test_promotion_without_last_agent_fails() {
    let mut config = TmConfig::default();
    config.use_last_agent_optimization = false;
    let (tm, _) = manager_with(config);

    tm.begin().unwrap();
    tm.enlist_resource(&local("db").1).unwrap();
    assert!(matches!(
        tm.enlist_resource(&xa("queue").1),
        Err(TxError::System(_))
    ));
    tm.rollback().unwrap();
}

#[test]
fn test_second_local_resource_fails() {
    let (tm, _) = manager();
    tm.begin().unwrap();
    tm.enlist_resource(&local("a").1).unwrap();
    assert!(matches!(
        tm.enlist_resource(&local("b").1),
        Err(TxError::System(_))
    ));
    tm.rollback().unwrap();
}

#[test]
fn test_rollback_only_blocks_enlist_and_promotion() {
    let (tm, _) = manager();
    tm.begin().unwrap();
    tm.enlist_resource(&local("db").1).unwrap();
    tm.set_rollback_only().unwrap();
    assert_eq!(tm.status(), Status::MarkedRollback);

    assert!(matches!(
        tm.enlist_resource(&xa("queue").1),
        Err(TxError::Rollback(_))
    ));
    assert!(matches!(tm.commit(), Err(TxError::Rollback(_))));
}

#[test]
fn test_legacy_flag_allows_promotion_but_keeps_rollback() {
    let mut config = TmConfig::default();
    config.disable_status_check_on_switch_to_xa = true;
    let (tm, _) = manager_with(config);
    let (db, local_res) = local("db");
    let (rm, xa_res) = xa("queue");

    let tx = tm.begin().unwrap();
    tm.enlist_resource(&local_res).unwrap();
    tm.set_rollback_only().unwrap();
    tm.enlist_resource(&xa_res).unwrap();
    assert!(tx.is_distributed());
    // promotion is allowed, the mark survives it
    assert!(tx.is_rollback_only());
    assert_eq!(tx.status(), Status::MarkedRollback);

    assert!(matches!(tm.commit(), Err(TxError::Rollback(_))));
    assert_eq!(db.rolled_back().len(), 1);
    assert_eq!(rm.rolled_back().len(), 1);
}

#[test]
fn test_synchronization_order() {
    let (tm, _) = manager();
    let journal = Arc::new(Mutex::new(Vec::new()));

    tm.begin().unwrap();
    tm.register_synchronization(Arc::new(Recorder {
        name: "regular",
        journal: Arc::clone(&journal),
        ..Default::default()
    }))
    .unwrap();
    tm.register_interposed_synchronization(Arc::new(Recorder {
        name: "interposed",
        journal: Arc::clone(&journal),
        ..Default::default()
    }))
    .unwrap();
    tm.commit().unwrap();

    assert_eq!(
        *journal.lock().unwrap(),
        vec![
            "before:interposed",
            "before:regular",
            "after:interposed:COMMITTED",
            "after:regular:COMMITTED",
        ]
    );
}

#[test]
fn test_failed_before_completion_rolls_back() {
    let (tm, _) = manager();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let (rm, res) = xa("rm1");

    tm.begin().unwrap();
    tm.enlist_resource(&res).unwrap();
    tm.register_interposed_synchronization(Arc::new(Recorder {
        name: "first",
        fail_before: true,
        journal: Arc::clone(&journal),
    }))
    .unwrap();
    tm.register_synchronization(Arc::new(Recorder {
        name: "second",
        journal: Arc::clone(&journal),
        ..Default::default()
    }))
    .unwrap();

    let err = tm.commit().unwrap_err();
    assert!(matches!(err, TxError::Rollback(ref m) if m.contains("first refused")));
    assert_eq!(rm.rolled_back().len(), 1);
    let journal = journal.lock().unwrap();
    assert!(journal.contains(&"before:second".to_string()));
    assert!(journal.contains(&"after:second:ROLLED_BACK".to_string()));
}

#[test]
fn test_rollback_skips_before_completion() {
    let (tm, _) = manager();
    let journal = Arc::new(Mutex::new(Vec::new()));
    tm.begin().unwrap();
    tm.register_synchronization(Arc::new(Recorder {
        name: "s",
        journal: Arc::clone(&journal),
        ..Default::default()
    }))
    .unwrap();
    tm.rollback().unwrap();
    assert_eq!(*journal.lock().unwrap(), vec!["after:s:ROLLED_BACK"]);
}

#[test]
fn test_vote_rollback_surfaces_as_rollback() {
    let (tm, _) = manager();
    let (rm1, r1) = xa("rm1");
    let (rm2, r2) = xa("rm2");
    rm2.set_vote(Vote::Rollback);

    let tx = tm.begin().unwrap();
    tm.enlist_resource(&r1).unwrap();
    tm.enlist_resource(&r2).unwrap();
    assert!(matches!(tm.commit(), Err(TxError::Rollback(_))));
    assert_eq!(tx.status(), Status::RolledBack);
    assert_eq!(rm1.count("commit"), 0);
    assert_eq!(rm1.rolled_back().len(), 1);
}

#[test]
fn test_timeout_rolls_back() {
    let (tm, _) = manager();
    let (rm, res) = xa("rm1");

    let tx = tm.begin_with_timeout(1).unwrap();
    tm.enlist_resource(&res).unwrap();
    assert_eq!(rm.transaction_timeout(), 1);
    thread::sleep(Duration::from_millis(1100));

    let err = tm.commit().unwrap_err();
    assert!(err.to_string().contains("rolled back due to time out"));
    assert!(tx.timed_out());
    assert_eq!(rm.count("commit"), 0);
    assert_eq!(rm.rolled_back().len(), 1);
}

#[test]
fn test_status_reports_expired_deadline() {
    let (tm, _) = manager();
    let (rm, res) = xa("rm1");
    let (_, other) = xa("rm2");

    let tx = tm.begin_with_timeout(1).unwrap();
    tm.enlist_resource(&res).unwrap();
    tm.enlist_resource(&other).unwrap();
    thread::sleep(Duration::from_millis(1100));

    // the scanner floor is 10s and was never run here
    assert_eq!(tm.context().timeouts().pending(), 1);
    assert_eq!(tm.status(), Status::MarkedRollback);
    assert!(tx.timed_out());
    assert_eq!(
        tx.coordinator().map(|c| c.status()),
        Some(Status::MarkedRollback)
    );

    let err = tm.commit().unwrap_err();
    assert!(err.to_string().contains("rolled back due to time out"));
    assert_eq!(rm.count("prepare"), 0);
}

#[test]
fn test_thread_timeout_applies_to_begin() {
    let (tm, _) = manager();
    tm.set_transaction_timeout(30);
    let tx = tm.begin().unwrap();
    assert_eq!(tx.timeout_secs(), 30);
    assert!(tm
        .context()
        .timeouts()
        .is_scheduled(tx.local_id(), crate::timeout::TimeoutKind::Active));
    tm.rollback().unwrap();
    assert!(!tm
        .context()
        .timeouts()
        .is_scheduled(tx.local_id(), crate::timeout::TimeoutKind::Active));
    tm.set_transaction_timeout(0);
}

#[test]
fn test_suspend_and_resume() {
    let (tm, _) = manager();
    let (rm, res) = xa("rm1");

    let tx = tm.begin().unwrap();
    tm.enlist_resource(&res).unwrap();
    let suspended = tm.suspend().unwrap().unwrap();
    assert_eq!(tm.status(), Status::NoTransaction);

    // the thread is free for other work
    tm.begin().unwrap();
    assert!(matches!(
        tm.resume(Arc::clone(&suspended)),
        Err(TxError::IllegalState(_))
    ));
    tm.commit().unwrap();

    tm.resume(suspended).unwrap();
    assert_eq!(tm.transaction().unwrap().xid(), tx.xid());
    tm.commit().unwrap();
    assert_eq!(rm.committed().len(), 1);
}

#[test]
fn test_resume_completed_is_invalid() {
    let (tm, _) = manager();
    let tx = tm.begin().unwrap();
    tm.commit().unwrap();
    assert!(matches!(tm.resume(tx), Err(TxError::InvalidTransaction(_))));
}

#[test]
fn test_delist_failure_goes_to_handler() {
    let (tm, _) = manager();
    let handler = Arc::new(CollectingHandler::default());
    tm.context().set_resource_error_handler(handler.clone());
    let (rm, res) = xa("rm1");
    rm.fail_end(XaError::code(XAER_RMERR));

    tm.begin().unwrap();
    tm.enlist_resource(&res).unwrap();
    assert!(!tm.delist_resource(&res, TMSUCCESS).unwrap());
    assert_eq!(*handler.seen.lock().unwrap(), vec![ResourceErrorAction::Destroy]);
    assert_eq!(tm.status(), Status::MarkedRollback);
    assert!(matches!(tm.commit(), Err(TxError::Rollback(_))));
}

#[test]
fn test_delist_with_fail_flag() {
    let (tm, _) = manager();
    let (_rm, res) = local("db");
    tm.begin().unwrap();
    tm.enlist_resource(&res).unwrap();
    assert!(tm.delist_resource(&res, TMFAIL).unwrap());
    assert_eq!(tm.status(), Status::MarkedRollback);
    tm.rollback().unwrap();
}

#[test]
fn test_invocation_resources() {
    let (tm, _) = manager();
    let (rm1, r1) = xa("rm1");
    let (rm2, r2) = xa("rm2");
    let mut invocation = Invocation::with_resources(vec![r1, r2]);

    let tx = tm.begin().unwrap();
    tm.enlist_invocation_resources(&mut invocation).unwrap();
    assert_eq!(invocation.transaction().unwrap().xid(), tx.xid());
    assert_eq!(tx.coordinator().unwrap().branch_count(), 2);

    tm.delist_invocation_resources(&mut invocation, TMSUCCESS)
        .unwrap();
    assert!(invocation.transaction().is_none());
    tm.commit().unwrap();
    assert_eq!(rm1.committed().len(), 1);
    assert_eq!(rm2.committed().len(), 1);
}

#[test]
fn test_association_is_per_thread() {
    let (tm, _) = manager();
    let tm = Arc::new(tm);
    tm.begin().unwrap();

    let other = Arc::clone(&tm);
    let seen = thread::spawn(move || other.status()).join().unwrap();
    assert_eq!(seen, Status::NoTransaction);
    tm.rollback().unwrap();
}

#[test]
fn test_associations_are_per_manager() {
    let (tm1, _) = manager();
    let (tm2, _) = manager();
    tm1.begin().unwrap();
    assert_eq!(tm2.status(), Status::NoTransaction);
    tm2.begin().unwrap();
    tm1.commit().unwrap();
    tm2.commit().unwrap();
}

#[test]
fn test_freeze_blocks_begin() {
    let (tm, _) = manager();
    let tm = Arc::new(tm);
    let guard = tm.freeze();

    let worker = Arc::clone(&tm);
    let handle = thread::spawn(move || {
        worker.begin().unwrap();
        worker.commit().unwrap();
    });
    thread::sleep(Duration::from_millis(50));
    assert_eq!(tm.active_count(), 0);
    drop(guard);
    handle.join().unwrap();
}
