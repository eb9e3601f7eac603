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

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use gridflow_core::{
    MarketRole, OperationContext, StepId, TemplateId, TenantId, WorkflowId, WorkflowInstance,
    WorkflowStatus,
};
use serde::{Deserialize, Serialize};

use crate::StateError;

/// Flat, queryable projection of a workflow instance's header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRow {
    pub id: WorkflowId,
    pub tenant_id: TenantId,
    pub template_id: TemplateId,
    pub market_role: MarketRole,
    pub status: WorkflowStatus,
    pub current_step_id: Option<StepId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IndexRow {
    /// Project the index row from a full instance document.
    pub fn from_instance(instance: &WorkflowInstance) -> Self {
        Self {
            id: instance.id,
            tenant_id: instance.tenant_id,
            template_id: instance.template_id,
            market_role: instance.market_role,
            status: instance.status,
            current_step_id: instance.current_step_id.clone(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// Filter for listing workflows.
///
/// `tenant_id` narrows within the caller's scope; it never widens it. A
/// tenant-bound caller setting someone else's tenant id gets an empty
/// result, not an error. The scope wins.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<WorkflowStatus>,
    pub market_role: Option<MarketRole>,
    pub template_id: Option<TemplateId>,
}

impl WorkflowFilter {
    pub fn matches(&self, row: &IndexRow) -> bool {
        if self.tenant_id.is_some_and(|t| t != row.tenant_id) {
            return false;
        }
        if self.status.is_some_and(|s| s != row.status) {
            return false;
        }
        if self.market_role.is_some_and(|r| r != row.market_role) {
            return false;
        }
        if self.template_id.is_some_and(|t| t != row.template_id) {
            return false;
        }
        true
    }
}

/// Pagination window for listing queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Queryable projection of workflow headers with tenant-scoped reads.
///
/// Every query is filtered by the caller's tenant scope inside the store;
/// the scope is not an argument callers can forget to apply. Writes are
/// unscoped; only the engine's projector calls them, and rows it writes
/// were derived from events it already authorized.
pub trait IndexStore: Send + Sync {
    /// Insert a row for a newly created workflow.
    fn insert(&self, row: IndexRow) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Update the status and current step of a row.
    ///
    /// Idempotent under the same `(status, current_step_id)` pair.
    fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        current_step_id: Option<StepId>,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Fetch a row visible to the caller's tenant scope.
    fn get(
        &self,
        ctx: &OperationContext,
        id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Option<IndexRow>, StateError>>;

    /// List rows within the caller's tenant scope, newest first.
    fn query(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
        page: Page,
    ) -> BoxFuture<'_, error_stack::Result<Vec<IndexRow>, StateError>>;

    /// Count rows within the caller's tenant scope.
    fn count(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
    ) -> BoxFuture<'_, error_stack::Result<u64, StateError>>;

    /// Delete a row. Only the engine calls this, for cancelled, archived
    /// workflows.
    fn delete(&self, id: WorkflowId) -> BoxFuture<'_, error_stack::Result<(), StateError>>;
}
