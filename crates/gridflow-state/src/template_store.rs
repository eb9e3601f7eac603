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

use std::sync::Arc;

use futures::future::BoxFuture;
use gridflow_core::{MarketRole, TemplateId, WorkflowTemplate};

use crate::StateError;

/// Store of published workflow templates.
///
/// `(market_role, version)` is unique; publishing an existing pair fails
/// with [`StateError::DuplicateTemplate`]. Templates are immutable once
/// stored; there is no update operation by design of the data model, not
/// as an omission.
pub trait TemplateStore: Send + Sync {
    /// Publish a template.
    fn put(
        &self,
        template: WorkflowTemplate,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Fetch a template by `(market_role, version)`.
    fn get(
        &self,
        market_role: MarketRole,
        version: u32,
    ) -> BoxFuture<'_, error_stack::Result<Option<Arc<WorkflowTemplate>>, StateError>>;

    /// Fetch a template by id.
    fn get_by_id(
        &self,
        template_id: TemplateId,
    ) -> BoxFuture<'_, error_stack::Result<Option<Arc<WorkflowTemplate>>, StateError>>;

    /// The highest published version for a market role.
    fn latest(
        &self,
        market_role: MarketRole,
    ) -> BoxFuture<'_, error_stack::Result<Option<Arc<WorkflowTemplate>>, StateError>>;

    /// All versions for a market role, oldest first.
    fn list(
        &self,
        market_role: MarketRole,
    ) -> BoxFuture<'_, error_stack::Result<Vec<Arc<WorkflowTemplate>>, StateError>>;
}
