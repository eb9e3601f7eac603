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

//! Step handlers: the capability interface the engine dispatches step
//! execution through.
//!
//! A handler is any value implementing [`StepHandler`]; there is no
//! subclassing and no runtime discovery. The seven built-in handlers cover
//! the declared step kinds; the [`HandlerRegistry`] maps step kind to
//! implementation and is immutable once the process finishes startup
//! registration.
//!
//! Handlers never touch stores. Synchronous handlers return a completed
//! result the engine turns into events; asynchronous handlers return a
//! bookmark request and are re-entered through `on_resume` when the external
//! signal arrives. External I/O goes through the transport traits in
//! [`transport`], which the real collaborators implement and tests mock.

use gridflow_core::{StepDefinition, StepKind, ValueRef};

mod api_call;
mod approval;
mod context;
mod decision;
mod error;
mod form;
mod manual;
mod notification;
mod registry;
mod result;
mod retry;
pub mod testing;
mod transport;
mod validation;

pub use api_call::ApiCallHandler;
pub use approval::ApprovalHandler;
pub use context::HandlerContext;
pub use decision::DecisionHandler;
pub use error::{HandlerError, Result};
pub use form::FormHandler;
pub use manual::ManualHandler;
pub use notification::NotificationHandler;
pub use registry::HandlerRegistry;
pub use result::{BookmarkRequest, StepExecution, ValidationOutcome};
pub use retry::{ErrorClass, RetryPolicy, classify_report};
pub use transport::{
    DynNotificationTransport, DynProvisioningClient, NotificationReceipt, NotificationTransport,
    ProvisioningClient, ProvisioningRequest, TransportError,
};
pub use validation::ValidationHandler;

#[trait_variant::make(Send)]
#[dynosaur::dynosaur(pub DynStepHandler = dyn StepHandler)]
pub trait StepHandler: Send + Sync {
    /// The step kind this handler serves.
    fn kind(&self) -> StepKind;

    /// Validate submitted data against the step's declared rules.
    ///
    /// Pure; called before execution and again during workflow-level
    /// validation over accumulated data.
    fn validate(&self, step: &StepDefinition, data: &ValueRef) -> ValidationOutcome;

    /// Execute the step.
    ///
    /// Synchronous handlers return [`StepExecution::Completed`] or
    /// [`StepExecution::Failed`]; asynchronous handlers return
    /// [`StepExecution::Suspended`] with a bookmark request and complete
    /// later via [`StepHandler::on_resume`].
    async fn execute(
        &self,
        step: &StepDefinition,
        input: ValueRef,
        ctx: &HandlerContext,
    ) -> Result<StepExecution>;

    /// Re-enter a suspended step with the external signal's payload.
    async fn on_resume(
        &self,
        step: &StepDefinition,
        payload: ValueRef,
        ctx: &HandlerContext,
    ) -> Result<StepExecution>;

    /// Reverse the step's effects during rollback.
    ///
    /// Handlers whose effects are idempotent to reverse implement this as a
    /// no-op.
    async fn compensate(&self, step: &StepDefinition, ctx: &HandlerContext) -> Result<()>;
}
