//! Per-transaction resource registry
//!
//! Tracks which resource objects are enlisted in one transaction, the branch
//! each one works on, and the XA association state of each object. Objects
//! from the same resource manager share one branch; the first object seen for
//! a branch is the one the second phase talks to.

use crate::error::xa_codes::XAER_PROTO;
use crate::error::{XaError, XaResult};
use crate::resource::flags::{self, TMFAIL, TMJOIN, TMNOFLAGS, TMRESUME, TMSUSPEND};
use crate::resource::ResourceHandle;
use crate::xid::TransactionId;

/// XA association state of one resource object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    /// Enlisted, but the work was ended with TMSUCCESS
    NotAssociated,
    Associated,
    Suspended,
    /// Ended with TMFAIL or failed to end
    Failed,
    RollingBack,
    /// Never enlisted
    NotExist,
}

#[derive(Debug, Clone)]
struct Association {
    resource: ResourceHandle,
    branch: TransactionId,
    state: AssociationState,
}

/// A distinct branch of the transaction and the resource that drives it
#[derive(Debug, Clone)]
pub struct Branch {
    pub xid: TransactionId,
    pub resource: ResourceHandle,
}

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    branches: Vec<Branch>,
    associations: Vec<Association>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `resource` with the transaction, starting or rejoining its
    /// branch. `new_branch` is called only when no branch of the same resource
    /// manager exists yet.
    pub fn enlist(
        &mut self,
        resource: &ResourceHandle,
        new_branch: impl FnOnce() -> TransactionId,
    ) -> XaResult<TransactionId> {
        if let Some(assoc) = self
            .associations
            .iter_mut()
            .find(|a| a.resource.same_object(resource))
        {
            let flag = match assoc.state {
                AssociationState::Associated => return Ok(assoc.branch.clone()),
                AssociationState::Suspended => TMRESUME,
                AssociationState::NotAssociated => TMJOIN,
                state => {
                    return Err(XaError::new(
                        XAER_PROTO,
                        format!("cannot re-enlist resource in state {:?}", state),
                    ))
                }
            };
            assoc.resource.start(&assoc.branch, flag)?;
            log::debug!(
                "Re-enlisted {} on {} with {}",
                assoc.resource.name(),
                assoc.branch,
                flags::describe(flag)
            );
            assoc.state = AssociationState::Associated;
            return Ok(assoc.branch.clone());
        }

        let (branch, flag) = match self.branches.iter().find(|b| b.resource.same_rm(resource)) {
            Some(existing) => (existing.xid.clone(), TMJOIN),
            None => (new_branch(), TMNOFLAGS),
        };

        resource.start(&branch, flag)?;
        log::debug!(
            "Enlisted {} on {} with {}",
            resource.name(),
            branch,
            flags::describe(flag)
        );

        if flag == TMNOFLAGS {
            self.branches.push(Branch {
                xid: branch.clone(),
                resource: resource.clone(),
            });
        }
        self.associations.push(Association {
            resource: resource.clone(),
            branch: branch.clone(),
            state: AssociationState::Associated,
        });
        Ok(branch)
    }

    /// Register a resource that was already started on `branch` elsewhere
    pub fn adopt(&mut self, resource: &ResourceHandle, branch: TransactionId, state: AssociationState) {
        if !self.branches.iter().any(|b| b.xid == branch) {
            self.branches.push(Branch {
                xid: branch.clone(),
                resource: resource.clone(),
            });
        }
        self.associations.push(Association {
            resource: resource.clone(),
            branch,
            state,
        });
    }

    /// End the association of `resource` with `flag`. On error the object is
    /// evicted; its branch stays registered so it can still be rolled back.
    pub fn delist(&mut self, resource: &ResourceHandle, flag: i32) -> XaResult<()> {
        let pos = self
            .associations
            .iter()
            .position(|a| a.resource.same_object(resource))
            .ok_or_else(|| XaError::new(XAER_PROTO, "resource is not enlisted"))?;

        let assoc = &mut self.associations[pos];
        if !matches!(
            assoc.state,
            AssociationState::Associated | AssociationState::Suspended
        ) {
            return Err(XaError::new(
                XAER_PROTO,
                format!("cannot delist resource in state {:?}", assoc.state),
            ));
        }

        match assoc.resource.end(&assoc.branch, flag) {
            Ok(()) => {
                assoc.state = match flag {
                    TMSUSPEND => AssociationState::Suspended,
                    TMFAIL => AssociationState::Failed,
                    _ => AssociationState::NotAssociated,
                };
                Ok(())
            }
            Err(e) => {
                log::warn!("Evicting {} after failed end: {}", assoc.resource.name(), e);
                self.associations.remove(pos);
                Err(e)
            }
        }
    }

    /// End every live association with `flag`; returns the objects that failed.
    /// Failed objects are marked `Failed` and stay registered.
    pub fn end_all(&mut self, flag: i32) -> Vec<(ResourceHandle, XaError)> {
        let mut failures = Vec::new();
        for assoc in self.associations.iter_mut() {
            let live = match assoc.state {
                AssociationState::Associated => true,
                // a suspended association may be ended, but not suspended again
                AssociationState::Suspended => flag != TMSUSPEND,
                _ => false,
            };
            if !live {
                continue;
            }
            match assoc.resource.end(&assoc.branch, flag) {
                Ok(()) => {
                    assoc.state = match flag {
                        TMSUSPEND => AssociationState::Suspended,
                        TMFAIL => AssociationState::Failed,
                        _ => AssociationState::NotAssociated,
                    };
                }
                Err(e) => {
                    log::warn!(
                        "end({}) failed for {}: {}",
                        flags::describe(flag),
                        assoc.resource.name(),
                        e
                    );
                    assoc.state = AssociationState::Failed;
                    failures.push((assoc.resource.clone(), e));
                }
            }
        }
        failures
    }

    /// Re-start every suspended association with TMRESUME
    pub fn resume_all(&mut self) -> Vec<(ResourceHandle, XaError)> {
        let mut failures = Vec::new();
        for assoc in self.associations.iter_mut() {
            if assoc.state != AssociationState::Suspended {
                continue;
            }
            match assoc.resource.start(&assoc.branch, TMRESUME) {
                Ok(()) => assoc.state = AssociationState::Associated,
                Err(e) => {
                    log::warn!("resume failed for {}: {}", assoc.resource.name(), e);
                    assoc.state = AssociationState::Failed;
                    failures.push((assoc.resource.clone(), e));
                }
            }
        }
        failures
    }

    /// Flag every association as rolling back
    pub fn mark_rolling_back(&mut self) {
        for assoc in self.associations.iter_mut() {
            assoc.state = AssociationState::RollingBack;
        }
    }

    pub fn state_of(&self, resource: &ResourceHandle) -> AssociationState {
        self.associations
            .iter()
            .find(|a| a.resource.same_object(resource))
            .map(|a| a.state)
            .unwrap_or(AssociationState::NotExist)
    }

    pub fn branch_of(&self, resource: &ResourceHandle) -> Option<TransactionId> {
        self.associations
            .iter()
            .find(|a| a.resource.same_object(resource))
            .map(|a| a.branch.clone())
    }

    pub fn contains(&self, resource: &ResourceHandle) -> bool {
        self.state_of(resource) != AssociationState::NotExist
    }

    /// Any object still doing work on the transaction
    pub fn has_active(&self) -> bool {
        self.associations
            .iter()
            .any(|a| a.state == AssociationState::Associated)
    }

    /// Distinct branches in enlistment order
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Take over every branch and association of `other`
    pub fn absorb(&mut self, other: ResourceRegistry) {
        for branch in other.branches {
            if !self.branches.iter().any(|b| b.xid == branch.xid) {
                self.branches.push(branch);
            }
        }
        self.associations.extend(other.associations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::flags::TMSUCCESS;
    use crate::resource::{Call, MemoryResource};
    use crate::xid::XidFactory;
    use std::sync::Arc;

    struct Fixture {
        factory: XidFactory,
        global: TransactionId,
        registry: ResourceRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let factory = XidFactory::new("node-a");
            let (_, global) = factory.next_global();
            Self {
                factory,
                global,
                registry: ResourceRegistry::new(),
            }
        }

        fn enlist(&mut self, resource: &ResourceHandle) -> XaResult<TransactionId> {
            let factory = &self.factory;
            let global = &self.global;
            self.registry
                .enlist(resource, || global.branch(factory.next_branch()))
        }
    }

    fn handle(rm: &Arc<MemoryResource>) -> ResourceHandle {
        ResourceHandle::from(Arc::clone(rm))
    }

    #[test]
    fn test_new_branch_per_resource_manager() {
        let mut fx = Fixture::new();
        let r1 = Arc::new(MemoryResource::new("rm-1"));
        let r2 = Arc::new(MemoryResource::new("rm-2"));

        let b1 = fx.enlist(&handle(&r1)).unwrap();
        let b2 = fx.enlist(&handle(&r2)).unwrap();

        assert_ne!(b1, b2);
        assert!(b1.same_global(&b2));
        assert_eq!(fx.registry.branch_count(), 2);
        assert_eq!(r1.calls(), vec![Call::Start(b1, TMNOFLAGS)]);
    }

    #[test]
    fn test_same_rm_joins_branch() {
        let mut fx = Fixture::new();
        let r1 = Arc::new(MemoryResource::new("rm-1"));
        let r1b = Arc::new(r1.connection());

        let b1 = fx.enlist(&handle(&r1)).unwrap();
        let b2 = fx.enlist(&handle(&r1b)).unwrap();

        assert_eq!(b1, b2);
        assert_eq!(fx.registry.branch_count(), 1);
        assert!(r1b.calls().contains(&Call::Start(b1, TMJOIN)));
    }

    #[test]
    fn test_reenlist_same_object() {
        let mut fx = Fixture::new();
        let r1 = Arc::new(MemoryResource::new("rm-1"));
        let h = handle(&r1);

        let branch = fx.enlist(&h).unwrap();
        // already associated: no call
        fx.enlist(&h).unwrap();
        assert_eq!(r1.count("start"), 1);

        fx.registry.delist(&h, TMSUSPEND).unwrap();
        assert_eq!(fx.registry.state_of(&h), AssociationState::Suspended);
        fx.enlist(&h).unwrap();
        assert!(r1.calls().contains(&Call::Start(branch.clone(), TMRESUME)));

        fx.registry.delist(&h, TMSUCCESS).unwrap();
        assert_eq!(fx.registry.state_of(&h), AssociationState::NotAssociated);
        fx.enlist(&h).unwrap();
        assert!(r1.calls().contains(&Call::Start(branch, TMJOIN)));
        assert_eq!(fx.registry.state_of(&h), AssociationState::Associated);
    }

    #[test]
    fn test_failed_start_registers_nothing() {
        let mut fx = Fixture::new();
        let r1 = Arc::new(MemoryResource::new("rm-1"));
        r1.fail_start(XaError::code(crate::error::xa_codes::XAER_RMERR));
        let h = handle(&r1);

        assert!(fx.enlist(&h).is_err());
        assert_eq!(fx.registry.state_of(&h), AssociationState::NotExist);
        assert!(fx.registry.is_empty());
    }

    #[test]
    fn test_failed_delist_evicts_but_keeps_branch() {
        let mut fx = Fixture::new();
        let r1 = Arc::new(MemoryResource::new("rm-1"));
        let h = handle(&r1);
        fx.enlist(&h).unwrap();

        r1.fail_end(XaError::code(crate::error::xa_codes::XAER_RMFAIL));
        assert!(fx.registry.delist(&h, TMSUCCESS).is_err());
        assert_eq!(fx.registry.state_of(&h), AssociationState::NotExist);
        assert_eq!(fx.registry.branch_count(), 1);
    }

    #[test]
    fn test_end_all_and_resume_all() {
        let mut fx = Fixture::new();
        let r1 = Arc::new(MemoryResource::new("rm-1"));
        let r2 = Arc::new(MemoryResource::new("rm-2"));
        let (h1, h2) = (handle(&r1), handle(&r2));
        fx.enlist(&h1).unwrap();
        fx.enlist(&h2).unwrap();

        assert!(fx.registry.end_all(TMSUSPEND).is_empty());
        assert!(!fx.registry.has_active());
        assert!(fx.registry.resume_all().is_empty());
        assert!(fx.registry.has_active());

        r2.fail_end(XaError::code(crate::error::xa_codes::XAER_RMERR));
        let failures = fx.registry.end_all(TMSUCCESS);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, h2);
        assert_eq!(fx.registry.state_of(&h1), AssociationState::NotAssociated);
        assert_eq!(fx.registry.state_of(&h2), AssociationState::Failed);
    }

    #[test]
    fn test_absorb() {
        let mut fx = Fixture::new();
        let r1 = Arc::new(MemoryResource::new("rm-1"));
        fx.enlist(&handle(&r1)).unwrap();

        let mut child = ResourceRegistry::new();
        let r2 = Arc::new(MemoryResource::new("rm-2"));
        let h2 = handle(&r2);
        child
            .enlist(&h2, || fx.global.branch(fx.factory.next_branch()))
            .unwrap();

        fx.registry.absorb(child);
        assert_eq!(fx.registry.branch_count(), 2);
        assert!(fx.registry.contains(&h2));
    }
}
