//! Per-invocation resource bookkeeping
//!
//! The caller owns the context and hands it to the manager explicitly; the
//! manager never looks invocations up on its own.

use std::sync::Arc;

use crate::manager::Transaction;
use crate::resource::ResourceHandle;

pub trait InvocationContext {
    /// Resources opened during the invocation
    fn resources(&mut self) -> &mut Vec<ResourceHandle>;

    /// Transaction the resources were enlisted in, if any
    fn transaction(&self) -> Option<Arc<Transaction>>;

    fn set_transaction(&mut self, tx: Option<Arc<Transaction>>);
}

/// Plain invocation context
#[derive(Default)]
pub struct Invocation {
    resources: Vec<ResourceHandle>,
    transaction: Option<Arc<Transaction>>,
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(resources: Vec<ResourceHandle>) -> Self {
        Self {
            resources,
            transaction: None,
        }
    }

    pub fn add_resource(&mut self, resource: ResourceHandle) {
        self.resources.push(resource);
    }
}

impl InvocationContext for Invocation {
    fn resources(&mut self) -> &mut Vec<ResourceHandle> {
        &mut self.resources
    }

    fn transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.clone()
    }

    fn set_transaction(&mut self, tx: Option<Arc<Transaction>>) {
        self.transaction = tx;
    }
}
