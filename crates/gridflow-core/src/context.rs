// Copyright 2025 DataStax Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Per-operation context: actor, tenant scope, deadline, cancellation.
//!
//! Every engine operation and every store access receives an
//! [`OperationContext`] explicitly. Nothing is ambient: there is no
//! thread-local tenant, no implicit cancellation token. The context is built
//! once per request by the API collaborator and threaded through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::actor::Actor;
use crate::error::CoreError;
use crate::tenant::TenantId;

/// The set of tenants an operation may observe.
///
/// Derived from the actor: tenant-bound roles see exactly their own tenant,
/// `market_ops` sees everything. Store implementations apply this scope to
/// every query; callers never filter by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantScope {
    /// Visibility limited to a single tenant.
    One(TenantId),
    /// Cross-tenant visibility (`market_ops`).
    All,
}

impl TenantScope {
    pub fn permits(&self, tenant_id: TenantId) -> bool {
        match self {
            TenantScope::One(own) => *own == tenant_id,
            TenantScope::All => true,
        }
    }
}

/// Cancellation handle paired with an [`OperationContext`].
///
/// The holder (typically the API collaborator) flips the flag; the engine
/// checks it at operation boundaries. Events already appended are never
/// undone by cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Context for a single engine operation.
///
/// Cheap to clone; carries the actor, the derived tenant scope, an optional
/// deadline, and a cancellation flag.
#[derive(Debug, Clone)]
pub struct OperationContext {
    actor: Actor,
    deadline: Option<DateTime<Utc>>,
    cancelled: CancelHandle,
}

impl OperationContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            deadline: None,
            cancelled: CancelHandle::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancelled = handle;
        self
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// The tenant visibility of this operation.
    pub fn scope(&self) -> TenantScope {
        match self.actor.tenant_id {
            Some(tenant_id) => TenantScope::One(tenant_id),
            None => TenantScope::All,
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Fail if the operation has been cancelled or its deadline has passed.
    ///
    /// Checked at operation boundaries; long-running work re-checks between
    /// phases.
    pub fn check_live(&self) -> Result<(), CoreError> {
        if self.cancelled.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Utc::now() > deadline
        {
            return Err(CoreError::DeadlineExceeded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Role, UserId};

    fn tenant_admin(tenant: TenantId) -> Actor {
        Actor::new(UserId::new(), "admin", Role::TenantAdmin, Some(tenant)).unwrap()
    }

    #[test]
    fn test_scope_for_tenant_bound_actor() {
        let tenant = TenantId::new();
        let ctx = OperationContext::new(tenant_admin(tenant));
        assert_eq!(ctx.scope(), TenantScope::One(tenant));
        assert!(ctx.scope().permits(tenant));
        assert!(!ctx.scope().permits(TenantId::new()));
    }

    #[test]
    fn test_scope_for_market_ops() {
        let ctx = OperationContext::new(Actor::market_ops(UserId::new(), "ops"));
        assert_eq!(ctx.scope(), TenantScope::All);
        assert!(ctx.scope().permits(TenantId::new()));
    }

    #[test]
    fn test_cancellation() {
        let handle = CancelHandle::new();
        let ctx = OperationContext::new(Actor::market_ops(UserId::new(), "ops"))
            .with_cancel_handle(handle.clone());
        assert!(ctx.check_live().is_ok());
        handle.cancel();
        assert!(matches!(ctx.check_live(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn test_deadline() {
        let ctx = OperationContext::new(Actor::market_ops(UserId::new(), "ops"))
            .with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert!(matches!(
            ctx.check_live(),
            Err(CoreError::DeadlineExceeded)
        ));
    }
}
