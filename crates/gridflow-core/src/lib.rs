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

//! Core domain types for the gridflow workflow engine.
//!
//! This crate defines the vocabulary every other crate speaks:
//! tenants and actors, versioned workflow templates, workflow instances with
//! per-step state, the append-only event model, and bookmarks for suspended
//! steps. It carries no I/O; stores and orchestration live in the
//! `gridflow-state` and `gridflow-engine` crates.

mod actor;
mod bookmark;
mod context;
mod error;
mod event;
mod instance;
mod template;
mod tenant;
mod values;

pub use actor::{Actor, Permission, Role, UserId};
pub use bookmark::{Bookmark, BookmarkId, BookmarkKind};
pub use context::{CancelHandle, OperationContext, TenantScope};
pub use error::{CoreError, Result};
pub use event::{
    ErrorDetail, EventBody, EventId, EventType, FieldError, SequenceNumber, StepOutcome,
    WorkflowEvent,
};
pub use instance::{StepState, StepStatus, WorkflowId, WorkflowInstance, WorkflowStatus};
pub use template::{
    StepDefinition, StepId, StepKind, TemplateId, TemplateRule, WorkflowTemplate,
    WorkflowTemplateBuilder,
};
pub use tenant::{MarketRole, Tenant, TenantId, TenantStatus};
pub use values::ValueRef;
