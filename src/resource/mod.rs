//! Participant resources
//!
//! Anything that can take part in a transaction implements [`XaResource`],
//! the X/Open XA resource-manager contract. The coordinator never owns a
//! resource outright: it holds a [`ResourceHandle`], a shared reference whose
//! identity is the underlying object. Two handles to the same object are the
//! same enlistment; two objects reporting the same resource manager share a
//! branch.

pub mod memory;
pub mod registry;

pub use memory::{Call, MemoryResource};
pub use registry::{AssociationState, ResourceRegistry};

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::xa_codes::{XAER_RMERR, XAER_RMFAIL};
use crate::error::{XaError, XaResult};
use crate::xid::TransactionId;

/// XA start/end/recover flags
pub mod flags {
    /// No flags set.
    pub const TMNOFLAGS: i32 = 0x0000_0000;
    /// Caller is joining an existing branch.
    pub const TMJOIN: i32 = 0x0020_0000;
    /// End a recovery scan.
    pub const TMENDRSCAN: i32 = 0x0080_0000;
    /// Start a recovery scan.
    pub const TMSTARTRSCAN: i32 = 0x0100_0000;
    /// Caller is suspending (not ending) its association.
    pub const TMSUSPEND: i32 = 0x0200_0000;
    /// Dissociate caller from the branch; work succeeded.
    pub const TMSUCCESS: i32 = 0x0400_0000;
    /// Caller is resuming a suspended association.
    pub const TMRESUME: i32 = 0x0800_0000;
    /// Dissociate caller from the branch; work failed and must roll back.
    pub const TMFAIL: i32 = 0x2000_0000;
    /// Use one-phase commit.
    pub const TMONEPHASE: i32 = 0x4000_0000;

    /// Symbolic rendering for log messages
    pub fn describe(flags: i32) -> String {
        if flags == TMNOFLAGS {
            return "TMNOFLAGS".to_string();
        }
        let names = [
            (TMJOIN, "TMJOIN"),
            (TMENDRSCAN, "TMENDRSCAN"),
            (TMSTARTRSCAN, "TMSTARTRSCAN"),
            (TMSUSPEND, "TMSUSPEND"),
            (TMSUCCESS, "TMSUCCESS"),
            (TMRESUME, "TMRESUME"),
            (TMFAIL, "TMFAIL"),
            (TMONEPHASE, "TMONEPHASE"),
        ];
        let parts: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        parts.join("|")
    }
}

/// A branch's answer to prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Commit,
    Rollback,
    /// No updates were made; the branch is already complete
    ReadOnly,
}

/// X/Open XA resource-manager contract
pub trait XaResource: Send + Sync {
    /// Associate the caller's work with `xid`
    fn start(&self, xid: &TransactionId, flags: i32) -> XaResult<()>;

    /// End (`TMSUCCESS`/`TMFAIL`) or suspend (`TMSUSPEND`) the association
    fn end(&self, xid: &TransactionId, flags: i32) -> XaResult<()>;

    fn prepare(&self, xid: &TransactionId) -> XaResult<Vote>;

    fn commit(&self, xid: &TransactionId, one_phase: bool) -> XaResult<()>;

    fn rollback(&self, xid: &TransactionId) -> XaResult<()>;

    /// Discard the resource manager's memory of a heuristically completed branch
    fn forget(&self, xid: &TransactionId) -> XaResult<()>;

    /// Prepared or heuristically completed branches
    fn recover(&self, flags: i32) -> XaResult<Vec<TransactionId>>;

    /// Stable identity of the resource manager behind this object
    fn resource_manager_id(&self) -> String;

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.resource_manager_id() == other.resource_manager_id()
    }

    /// False for local resources that can only commit in one phase
    fn supports_two_phase(&self) -> bool {
        true
    }

    fn set_transaction_timeout(&self, _seconds: u32) -> XaResult<bool> {
        Ok(false)
    }

    fn name(&self) -> String {
        self.resource_manager_id()
    }
}

/// Shared reference to an enlisted resource; equality is object identity
#[derive(Clone)]
pub struct ResourceHandle(Arc<dyn XaResource>);

impl ResourceHandle {
    pub fn new(resource: Arc<dyn XaResource>) -> Self {
        Self(resource)
    }

    pub fn same_object(&self, other: &ResourceHandle) -> bool {
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }

    pub fn same_rm(&self, other: &ResourceHandle) -> bool {
        self.0.is_same_rm(other.0.as_ref())
    }
}

impl<R: XaResource + 'static> From<Arc<R>> for ResourceHandle {
    fn from(resource: Arc<R>) -> Self {
        Self(resource)
    }
}

impl Deref for ResourceHandle {
    type Target = dyn XaResource;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl Eq for ResourceHandle {}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHandle({})", self.0.name())
    }
}

/// What to do with a resource that failed to delist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceErrorAction {
    /// Return the connection to its pool
    Close,
    /// The connection is unusable and must be destroyed
    Destroy,
}

impl ResourceErrorAction {
    /// Hard resource-manager errors destroy; timeouts and protocol errors close
    pub fn for_error(error: &XaError) -> Self {
        match error.code {
            XAER_RMERR | XAER_RMFAIL => ResourceErrorAction::Destroy,
            _ => ResourceErrorAction::Close,
        }
    }
}

/// Receives resources evicted after a failed delist
pub trait ResourceErrorHandler: Send + Sync {
    fn handle_resource_error(
        &self,
        resource: &ResourceHandle,
        action: ResourceErrorAction,
        error: &XaError,
    );
}

/// Default handler: log and drop
pub struct LoggingErrorHandler;

impl ResourceErrorHandler for LoggingErrorHandler {
    fn handle_resource_error(
        &self,
        resource: &ResourceHandle,
        action: ResourceErrorAction,
        error: &XaError,
    ) {
        log::warn!(
            "Resource {} failed to delist ({}); action {:?}",
            resource.name(),
            error,
            action
        );
    }
}
