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

//! The gridflow workflow engine.
//!
//! Orchestrates everything the other crates define: loads templates, holds
//! the per-workflow lock, validates transitions through the state machine,
//! dispatches step handlers, appends events (the commit point), projects the
//! state document and index row, coordinates compensation sagas on
//! rollback, and recovers open work after a crash.
//!
//! The engine's public operations are the in-process service surface the
//! API collaborator adapts to GraphQL. Every operation takes an
//! [`OperationContext`](gridflow_core::OperationContext) carrying actor,
//! tenant scope, deadline, and cancellation. Nothing is ambient.

mod bookmarks;
mod engine;
mod error;
mod locks;
mod projection;
mod recovery;
mod registry;
mod saga;
pub mod testing;

pub use bookmarks::BookmarkManager;
pub use engine::{
    ExecuteOutcome, ExecutionDisposition, ValidationReport, WorkflowEngine, WorkflowEngineBuilder,
};
pub use error::{EngineError, Result};
pub use locks::{WorkflowLockGuard, WorkflowLocks};
pub use projection::Projector;
pub use recovery::RecoveryReport;
pub use registry::TemplateRegistry;
pub use saga::SagaCoordinator;
