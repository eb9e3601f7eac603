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

//! Execution context handed to step handlers.

use std::sync::Arc;

use gridflow_core::{Actor, StepId, TenantId, WorkflowId};

use crate::retry::RetryPolicy;
use crate::transport::{DynNotificationTransport, DynProvisioningClient};

/// Everything a handler may touch while executing a step.
///
/// Handlers get transports and identity, never stores: persistence of their
/// results is the engine's job, which is what keeps handler execution safe
/// to re-issue during crash recovery.
#[derive(Clone)]
pub struct HandlerContext {
    workflow_id: WorkflowId,
    tenant_id: TenantId,
    step_id: StepId,
    actor: Actor,
    idempotency_key: String,
    retry: RetryPolicy,
    notifications: Arc<DynNotificationTransport<'static>>,
    provisioning: Arc<DynProvisioningClient<'static>>,
}

impl HandlerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow_id: WorkflowId,
        tenant_id: TenantId,
        step_id: StepId,
        actor: Actor,
        retry: RetryPolicy,
        notifications: Arc<DynNotificationTransport<'static>>,
        provisioning: Arc<DynProvisioningClient<'static>>,
    ) -> Self {
        // The idempotency key is the step id within the workflow: stable
        // across process restarts, which is what recovery relies on.
        let idempotency_key = format!("{workflow_id}/{step_id}");
        Self {
            workflow_id,
            tenant_id,
            step_id,
            actor,
            idempotency_key,
            retry,
            notifications,
            provisioning,
        }
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// Idempotency key for external calls issued by this step.
    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn notifications(&self) -> &Arc<DynNotificationTransport<'static>> {
        &self.notifications
    }

    pub fn provisioning(&self) -> &Arc<DynProvisioningClient<'static>> {
        &self.provisioning
    }
}
