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
use gridflow_core::{Tenant, TenantId, TenantStatus};

use crate::StateError;

/// Directory of market-participant organizations.
///
/// The engine only needs enough of the tenant record to enforce the
/// "tenant active" precondition on workflow creation; user and credential
/// management live with the authentication collaborator.
pub trait TenantStore: Send + Sync {
    /// Insert or replace a tenant record.
    fn put(&self, tenant: Tenant) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Fetch a tenant by id.
    fn get(
        &self,
        tenant_id: TenantId,
    ) -> BoxFuture<'_, error_stack::Result<Option<Tenant>, StateError>>;

    /// Update a tenant's lifecycle status.
    fn set_status(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;
}
