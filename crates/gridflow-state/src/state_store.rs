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

use futures::future::BoxFuture;
use gridflow_core::{OperationContext, WorkflowId, WorkflowInstance, WorkflowStatus};

use crate::StateError;
use crate::index_store::WorkflowFilter;

/// Store of full workflow instance documents.
///
/// The document is a projection of the event log: fast to read, rebuildable
/// at any time. Writes use optimistic concurrency: each instance carries a
/// version counter, and an update whose expected version no longer matches
/// fails with [`StateError::StaleWrite`]; the caller reloads, re-validates
/// the transition, and retries.
///
/// Reads that can return cross-tenant data take an [`OperationContext`] and
/// apply its tenant scope inside the store. A `get` outside the caller's
/// scope returns `Ok(None)`, indistinguishable from absence, so existence
/// is never disclosed across tenants.
pub trait StateStore: Send + Sync {
    /// Fetch an instance visible to the caller's tenant scope.
    fn get(
        &self,
        ctx: &OperationContext,
        id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Option<WorkflowInstance>, StateError>>;

    /// Insert a freshly created instance (version 0).
    fn insert(
        &self,
        instance: WorkflowInstance,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Replace an instance document if `expected_version` still matches.
    ///
    /// On success the stored document's version is `expected_version + 1`.
    fn update(
        &self,
        instance: WorkflowInstance,
        expected_version: u64,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Update only the workflow-level status.
    ///
    /// Idempotent; used by projection repair where the full document is
    /// about to be rewritten anyway.
    fn update_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Find instances matching `filter` within the caller's tenant scope.
    fn find(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkflowInstance>, StateError>>;

    /// Delete an instance document. Only the engine calls this, and only for
    /// cancelled, archived workflows.
    fn delete(&self, id: WorkflowId) -> BoxFuture<'_, error_stack::Result<(), StateError>>;
}
