//! Crash recovery
//!
//! At restart the log tells us which global transactions reached a decision
//! and the resource managers tell us which branches they still hold
//! prepared. Recovery matches the two:
//!
//! 1. Load resources from every registered [`RecoveryResourceHandler`]
//! 2. Ask each distinct resource manager for its in-doubt branches
//! 3. Keep the branches created by the server being recovered, skipping
//!    transactions a coordinator in this process is still driving
//! 4. Commit or roll back each one per the logged decision, or per the
//!    configured heuristic decision when the log has no entry
//! 5. Delete the log records once everything was resolved
//!
//! Delegated recovery does the same for another server's log, opened from
//! the path the caller supplies.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, TryLockError};

use crate::config::HeuristicDecision;
use crate::context::TxContext;
use crate::coordinator::state::heuristic_kind;
use crate::error::{Result, TxError, XaError};
use crate::resource::flags::{TMENDRSCAN, TMSTARTRSCAN};
use crate::resource::ResourceHandle;
use crate::txlog::{live_transactions, Decision, DurableLog, FileLog, HeuristicKind, LiveTransaction};
use crate::xid::{server_hash, TransactionId};

/// Supplies resources to scan during recovery
pub trait RecoveryResourceHandler: Send + Sync {
    fn load_resources(&self) -> Result<Vec<ResourceHandle>>;

    /// Called once recovery is done with everything `load_resources` returned
    fn close_resources(&self, resources: &[ResourceHandle]);
}

/// Observes recovery runs
pub trait RecoveryListener: Send + Sync {
    fn before_recovery(&self, delegated: bool, instance: &str);
    fn after_recovery(&self, success: bool, delegated: bool, instance: &str);
}

/// Whose log a recovery pass works from
enum Target<'a> {
    Local,
    Peer { dir: &'a Path, server: String },
}

/// What a recovery pass did to one branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Done,
    Failed,
}

pub struct RecoveryManager {
    ctx: Arc<TxContext>,
    running: Mutex<()>,
}

impl RecoveryManager {
    pub fn new(ctx: Arc<TxContext>) -> Self {
        Self {
            ctx,
            running: Mutex::new(()),
        }
    }

    /// Recover this server's transactions, but only when automatic recovery
    /// is configured or `force` is set
    pub fn recover_xa_resources(&self, force: bool) -> Result<bool> {
        if !self.ctx.config().automatic_recovery && !force {
            log::info!("Automatic recovery disabled; skipping");
            return Ok(false);
        }
        self.recover_incomplete_tx(false, None, None, true)
    }

    /// Resolve in-doubt branches. Returns true when every resource was
    /// scanned and every branch resolved.
    ///
    /// Delegated recovery treats `instance` as the failed peer's server name
    /// too; use [`RecoveryManager::recover_peer`] when the two differ.
    pub fn recover_incomplete_tx(
        &self,
        delegated: bool,
        log_path: Option<&Path>,
        instance: Option<&str>,
        notify_listeners: bool,
    ) -> Result<bool> {
        let config = self.ctx.config();
        let instance = instance.unwrap_or(&config.instance_name).to_string();
        let target = if delegated {
            let dir = log_path.ok_or_else(|| {
                TxError::Config("delegated recovery needs the failed server's log path".into())
            })?;
            Target::Peer {
                dir,
                server: instance.clone(),
            }
        } else {
            Target::Local
        };
        self.recover(target, &instance, notify_listeners)
    }

    /// Delegated recovery of a failed peer whose server name differs from its
    /// instance name
    pub fn recover_peer(
        &self,
        log_path: &Path,
        server: &str,
        instance: &str,
        notify_listeners: bool,
    ) -> Result<bool> {
        let target = Target::Peer {
            dir: log_path,
            server: server.to_string(),
        };
        self.recover(target, instance, notify_listeners)
    }

    fn recover(&self, target: Target<'_>, instance: &str, notify_listeners: bool) -> Result<bool> {
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(TxError::IllegalState("recovery already in progress".into()))
            }
        };

        let delegated = matches!(target, Target::Peer { .. });
        let listeners = if notify_listeners {
            self.ctx.recovery_listeners()
        } else {
            Vec::new()
        };
        for listener in &listeners {
            listener.before_recovery(delegated, instance);
        }

        let result = self.run(target, instance);
        let success = matches!(result, Ok(true));

        for listener in &listeners {
            listener.after_recovery(success, delegated, instance);
        }
        result
    }

    fn run(&self, target: Target<'_>, instance: &str) -> Result<bool> {
        let config = self.ctx.config();
        let delegated = matches!(target, Target::Peer { .. });
        let (server, log): (String, Arc<dyn DurableLog>) = match target {
            Target::Peer { dir, server } => {
                let log = FileLog::open(dir, &server, instance, &config.log, 0)?;
                (server, Arc::new(log))
            }
            Target::Local => (config.server_name.clone(), Arc::clone(self.ctx.log())),
        };

        let live = live_transactions(&log.read_all(&server)?);
        log::info!(
            "Recovering server '{}': {} transaction(s) in the log",
            server,
            live.len()
        );
        let decisions: HashMap<TransactionId, &LiveTransaction> =
            live.iter().map(|t| (t.xid.clone(), t)).collect();

        let mut success = true;
        let mut loaded = Vec::new();
        for handler in self.ctx.recovery_handlers() {
            match handler.load_resources() {
                Ok(resources) => loaded.push((handler, resources)),
                Err(e) => {
                    log::warn!("Could not load recovery resources: {}", e);
                    success = false;
                }
            }
        }

        let hash = server_hash(&server);
        let mut scanned = HashSet::new();
        for (_, resources) in &loaded {
            for resource in resources {
                let rm = resource.resource_manager_id();
                if !scanned.insert(rm.clone()) {
                    continue;
                }
                match self.recover_resource(resource, &hash, &decisions, delegated) {
                    Ok(true) => {}
                    Ok(false) => success = false,
                    Err(e) => {
                        log::warn!("Recovery scan of {} failed: {}", rm, e);
                        scanned.remove(&rm);
                        success = false;
                    }
                }
            }
        }

        for (handler, resources) in &loaded {
            handler.close_resources(resources);
        }

        if !success {
            log::warn!("Recovery of '{}' incomplete; log records kept", server);
            return Ok(false);
        }

        for txn in &live {
            let unscanned: Vec<&str> = txn
                .branches
                .iter()
                .map(|b| b.resource_manager.as_str())
                .filter(|rm| !scanned.contains(*rm))
                .collect();
            if !unscanned.is_empty() {
                log::warn!(
                    "Keeping log record of {}: resource manager(s) {:?} were not scanned",
                    txn.xid,
                    unscanned
                );
                continue;
            }
            if !delegated && self.ctx.is_in_flight(&txn.xid) {
                log::debug!("Keeping log record of {}: still in flight", txn.xid);
                continue;
            }
            if let Some(kind) = txn.heuristic {
                log::warn!("{} completed with a {:?} heuristic outcome", txn.xid, kind);
            }
            log.delete(&txn.xid, txn.local_id)?;
        }
        log::info!("Recovery of '{}' complete", server);
        Ok(true)
    }

    /// Resolve the in-doubt branches of one resource manager. Ok(false) means
    /// some branch could not be resolved.
    fn recover_resource(
        &self,
        resource: &ResourceHandle,
        hash: &[u8; 8],
        decisions: &HashMap<TransactionId, &LiveTransaction>,
        delegated: bool,
    ) -> Result<bool> {
        let in_doubt = resource.recover(TMSTARTRSCAN | TMENDRSCAN)?;
        let ours: Vec<TransactionId> = in_doubt
            .into_iter()
            .filter(|xid| xid.server_hash().as_ref() == Some(hash))
            .collect();
        if !ours.is_empty() {
            log::info!(
                "{} holds {} in-doubt branch(es)",
                resource.name(),
                ours.len()
            );
        }

        let fallback = match self.ctx.config().heuristic_decision {
            HeuristicDecision::Commit => Decision::Commit,
            HeuristicDecision::Rollback => Decision::Rollback,
        };

        let mut complete = true;
        for branch in ours {
            // registered before any of its branches prepared
            if !delegated && self.ctx.is_in_flight(&branch) {
                log::debug!("Skipping {}: its coordinator is still running", branch);
                continue;
            }
            let decision = match decisions.get(&branch.global()) {
                Some(txn) => txn.decision,
                None => {
                    log::warn!(
                        "No log entry for {}; applying heuristic decision {:?}",
                        branch,
                        fallback
                    );
                    fallback
                }
            };
            if resolve_branch(resource, &branch, decision) == Resolution::Failed {
                complete = false;
            }
        }
        Ok(complete)
    }
}

fn resolve_branch(resource: &ResourceHandle, branch: &TransactionId, decision: Decision) -> Resolution {
    let result = match decision {
        Decision::Commit => resource.commit(branch, false),
        Decision::Rollback => resource.rollback(branch),
    };
    match result {
        Ok(()) => {
            log::info!("Recovered {}: {:?}", branch, decision);
            Resolution::Done
        }
        Err(e) if e.is_unknown_branch() => Resolution::Done,
        Err(e) => match heuristic_kind(&e) {
            Some(kind) => {
                report_heuristic(branch, decision, kind, &e);
                if let Err(f) = resource.forget(branch) {
                    log::warn!("forget failed for {}: {}", branch, f);
                }
                Resolution::Done
            }
            None if e.is_rollback() && decision == Decision::Rollback => Resolution::Done,
            None => {
                log::warn!("Could not recover {}: {}", branch, e);
                Resolution::Failed
            }
        },
    }
}

fn report_heuristic(branch: &TransactionId, decision: Decision, kind: HeuristicKind, e: &XaError) {
    let agrees = matches!(
        (decision, kind),
        (Decision::Commit, HeuristicKind::Commit) | (Decision::Rollback, HeuristicKind::Rollback)
    );
    if agrees {
        log::info!("{} was already completed heuristically ({})", branch, e);
    } else {
        log::error!(
            "{} completed heuristically against the {:?} decision: {}",
            branch,
            decision,
            e
        );
    }
}
