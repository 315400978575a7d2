//! Keystone - a two-phase commit transaction coordinator
//!
//! Keystone coordinates transactions that span several resource managers
//! (databases, queues, remote services). It tracks the resources enlisted in
//! each transaction, drives prepare/commit/rollback with heuristic-outcome
//! handling, logs the commit decision durably before any branch commits, and
//! replays the log at restart to finish in-doubt transactions.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Application                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Transaction Manager                        │
//! │     (thread association, synchronizations, promotion)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Coordinator                             │
//! │        (2PC state machine, votes, heuristics)               │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │     Resource Registry    │ │       Durable Log              │
//! │  (XA associations)       │ │  (group commit, keypoints)     │
//! └──────────────────────────┘ └────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │   Resource Managers      │ │   Timeout + Recovery Managers  │
//! └──────────────────────────┘ └────────────────────────────────┘

use std::sync::Arc;

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod recovery;
pub mod resource;
pub mod timeout;
pub mod txlog;
pub mod xid;

pub use crate::config::{HeuristicDecision, LogConfig, TmConfig};
pub use crate::context::TxContext;
pub use crate::coordinator::{Coordinator, Status};
pub use crate::error::{Result, TxError, XaError};
pub use crate::manager::{Synchronization, Transaction, TransactionManager};
pub use crate::recovery::{RecoveryListener, RecoveryManager, RecoveryResourceHandler};
pub use crate::resource::{ResourceHandle, Vote, XaResource};
pub use crate::timeout::ShutdownMode;
pub use crate::xid::TransactionId;

/// Transaction services for one server: context, manager and recovery
pub struct Keystone {
    ctx: Arc<TxContext>,
    manager: TransactionManager,
    recovery: RecoveryManager,
}

impl Keystone {
    /// Open the file log, start the timeout scanner, and run recovery when
    /// `automatic_recovery` is set. Recovery handlers must be registered on
    /// the context for recovery to find anything; use [`Keystone::with_context`]
    /// to register them first.
    pub fn start(config: TmConfig) -> Result<Self> {
        let ctx = TxContext::open(config)?;
        Self::with_context(ctx)
    }

    /// Build on a prepared context and run startup recovery
    pub fn with_context(ctx: Arc<TxContext>) -> Result<Self> {
        let manager = TransactionManager::new(Arc::clone(&ctx));
        let recovery = RecoveryManager::new(Arc::clone(&ctx));
        if !recovery.recover_xa_resources(false)? && ctx.config().automatic_recovery {
            log::warn!("Startup recovery incomplete; run recovery again once resources are back");
        }
        Ok(Self {
            ctx,
            manager,
            recovery,
        })
    }

    pub fn context(&self) -> &Arc<TxContext> {
        &self.ctx
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn shutdown(&self, mode: ShutdownMode) {
        log::info!("Shutting down transaction services");
        self.ctx.shutdown(mode);
    }
}
