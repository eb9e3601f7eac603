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

//! Store contracts for the gridflow workflow engine.
//!
//! Three stores with distinct consistency roles:
//!
//! - the **event store** is the append-only source of truth,
//! - the **state store** holds the full projected instance document with an
//!   optimistic version counter,
//! - the **index store** holds a flat, queryable projection of workflow
//!   headers.
//!
//! Bookmarks and templates get their own contracts. Tenant isolation is
//! enforced *inside* store implementations: every read contract that can
//! return cross-tenant data takes an [`OperationContext`] and applies its
//! [`TenantScope`](gridflow_core::TenantScope) itself, so a caller that
//! forgets to filter is still safe.
//!
//! [`OperationContext`]: gridflow_core::OperationContext

mod bookmark_store;
mod error;
mod event_store;
mod in_memory;
mod index_store;
mod state_store;
mod template_store;
mod tenant_store;

pub use bookmark_store::BookmarkStore;
pub use error::{Result, StateError};
pub use event_store::{EventRange, EventStore};
pub use in_memory::InMemoryWorkflowStore;
pub use index_store::{IndexRow, IndexStore, Page, WorkflowFilter};
pub use state_store::StateStore;
pub use template_store::TemplateStore;
pub use tenant_store::TenantStore;
