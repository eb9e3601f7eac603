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

//! The workflow engine: orchestration of templates, state machine, handlers,
//! events, and projections.
//!
//! Every state-mutating operation follows the same shape: check liveness and
//! permission, take the per-workflow lock, load and validate, append events
//! (the commit point), fold the events into the instance, write the
//! projections, release. Handler I/O runs *outside* the lock; the engine
//! re-acquires it for the completion write and relies on the event store's
//! optimistic sequence check to reject interleaved writers.

use std::sync::Arc;

use error_stack::ResultExt as _;
use gridflow_config::{EngineConfig, GridflowStores};
use gridflow_core::{
    Actor, BookmarkId, BookmarkKind, ErrorDetail, EventBody, FieldError, MarketRole,
    OperationContext, Permission, SequenceNumber, StepDefinition, StepId, StepKind, StepOutcome,
    TemplateRule, TenantId, ValueRef, WorkflowEvent, WorkflowId, WorkflowInstance, WorkflowStatus,
    WorkflowTemplate,
};
use gridflow_handlers::{
    DynNotificationTransport, DynProvisioningClient, HandlerContext, HandlerRegistry, RetryPolicy,
    StepExecution, StepHandler as _,
};
use gridflow_machine::{MachineError, StateMachine};
use gridflow_observability::{StepIdGuard, WorkflowInfoGuard};
use gridflow_state::{
    EventRange, EventStore, IndexRow, IndexStore, Page, StateError, StateStore, TenantStore,
    WorkflowFilter,
};

use crate::bookmarks::BookmarkManager;
use crate::error::{EngineError, Result};
use crate::locks::WorkflowLocks;
use crate::projection::Projector;
use crate::registry::TemplateRegistry;
use crate::saga::SagaCoordinator;

/// What became of a dispatched step.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionDisposition {
    /// The step completed with the given outcome.
    Completed(StepOutcome),
    /// The step suspended on a bookmark awaiting an external signal.
    Suspended(BookmarkId),
    /// The step failed; it remains current and retryable.
    Failed(ErrorDetail),
}

/// Result of `execute_step` / `resume_bookmark`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOutcome {
    pub status: WorkflowStatus,
    pub next_step_id: Option<StepId>,
    pub disposition: ExecutionDisposition,
    pub output: Option<ValueRef>,
}

/// Aggregated result of workflow-level validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

/// Appends events for one workflow, tracking the dense sequence locally.
///
/// The append is the commit point: a sequence conflict means another writer
/// interleaved, surfaced as [`EngineError::Conflict`] with nothing written.
pub(crate) struct EventWriter<'a> {
    events: &'a dyn EventStore,
    workflow_id: WorkflowId,
    tenant_id: TenantId,
    performed_by: gridflow_core::UserId,
    next_seq: SequenceNumber,
    appended: Vec<WorkflowEvent>,
}

impl<'a> EventWriter<'a> {
    pub(crate) fn new(
        events: &'a dyn EventStore,
        instance: &WorkflowInstance,
        performed_by: gridflow_core::UserId,
    ) -> Self {
        Self {
            events,
            workflow_id: instance.id,
            tenant_id: instance.tenant_id,
            performed_by,
            next_seq: SequenceNumber::new(instance.projected_seq + 1),
            appended: Vec::new(),
        }
    }

    pub(crate) fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub(crate) async fn append(&mut self, body: EventBody) -> Result<()> {
        let event = WorkflowEvent::new(
            self.workflow_id,
            self.tenant_id,
            self.next_seq,
            self.performed_by,
            body,
        );
        self.events
            .append(event.clone())
            .await
            .map_err(|report| map_append_error(report, self.workflow_id))?;
        self.next_seq = self.next_seq.next();
        self.appended.push(event);
        Ok(())
    }

    pub(crate) fn appended(&self) -> &[WorkflowEvent] {
        &self.appended
    }
}

fn map_append_error(
    report: error_stack::Report<StateError>,
    workflow_id: WorkflowId,
) -> error_stack::Report<EngineError> {
    match report.current_context() {
        StateError::ConflictingWrite { .. } => {
            report.change_context(EngineError::Conflict { workflow_id })
        }
        StateError::NonDenseSequence { .. } => {
            report.change_context(EngineError::Integrity { workflow_id })
        }
        _ => report.change_context(EngineError::Internal),
    }
}

/// Builds per-step handler contexts with the engine's transports.
pub(crate) struct HandlerContextFactory {
    workflow_id: WorkflowId,
    tenant_id: TenantId,
    actor: Actor,
    retry: RetryPolicy,
    notifications: Arc<DynNotificationTransport<'static>>,
    provisioning: Arc<DynProvisioningClient<'static>>,
}

impl HandlerContextFactory {
    pub(crate) fn for_step(&self, step_id: &StepId) -> HandlerContext {
        HandlerContext::new(
            self.workflow_id,
            self.tenant_id,
            step_id.clone(),
            self.actor.clone(),
            self.retry.clone(),
            self.notifications.clone(),
            self.provisioning.clone(),
        )
    }
}

/// Builder for [`WorkflowEngine`].
pub struct WorkflowEngineBuilder {
    stores: GridflowStores,
    config: EngineConfig,
    handlers: Option<HandlerRegistry>,
    notifications: Option<Arc<DynNotificationTransport<'static>>>,
    provisioning: Option<Arc<DynProvisioningClient<'static>>>,
}

impl WorkflowEngineBuilder {
    pub fn new(stores: GridflowStores) -> Self {
        Self {
            stores,
            config: EngineConfig::default(),
            handlers: None,
            notifications: None,
            provisioning: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the built-in handler registry. Registration happens here, at
    /// startup; the registry is immutable once the engine is built.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn with_notifications(
        mut self,
        notifications: Arc<DynNotificationTransport<'static>>,
    ) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn with_provisioning(
        mut self,
        provisioning: Arc<DynProvisioningClient<'static>>,
    ) -> Self {
        self.provisioning = Some(provisioning);
        self
    }

    pub fn build(self) -> Result<Arc<WorkflowEngine>> {
        let notifications = self.notifications.ok_or(EngineError::Internal).attach_printable(
            "a notification transport is required; use with_notifications()",
        )?;
        let provisioning = self.provisioning.ok_or(EngineError::Internal).attach_printable(
            "a provisioning client is required; use with_provisioning()",
        )?;

        let handlers = Arc::new(self.handlers.unwrap_or_else(HandlerRegistry::builtin));
        let registry = Arc::new(TemplateRegistry::new(self.stores.templates.clone()));
        let projector = Projector::new(
            self.stores.events.clone(),
            self.stores.state.clone(),
            self.stores.index.clone(),
            registry.clone(),
            self.config.event_replay_snapshot_interval,
            self.config.projection_max_lag_events,
        );
        let saga = SagaCoordinator::new(handlers.clone(), self.config.handler_retry.clone());
        let bookmarks = BookmarkManager::new(
            self.stores.bookmarks.clone(),
            self.config.bookmark_expiry(),
        );

        Ok(Arc::new(WorkflowEngine {
            events: self.stores.events,
            state: self.stores.state,
            index: self.stores.index,
            tenants: self.stores.tenants,
            registry,
            handlers,
            saga,
            bookmarks,
            projector,
            locks: WorkflowLocks::default(),
            config: self.config,
            notifications,
            provisioning,
        }))
    }
}

pub struct WorkflowEngine {
    events: Arc<dyn EventStore>,
    state: Arc<dyn StateStore>,
    index: Arc<dyn IndexStore>,
    tenants: Arc<dyn TenantStore>,
    pub(crate) registry: Arc<TemplateRegistry>,
    handlers: Arc<HandlerRegistry>,
    saga: SagaCoordinator,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) projector: Projector,
    pub(crate) locks: WorkflowLocks,
    config: EngineConfig,
    notifications: Arc<DynNotificationTransport<'static>>,
    provisioning: Arc<DynProvisioningClient<'static>>,
}

impl WorkflowEngine {
    /// Access to the template registry (publication, lookups).
    pub fn templates(&self) -> &TemplateRegistry {
        &self.registry
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Create a workflow instance for a tenant.
    ///
    /// `template_version = None` selects the latest published version for
    /// the market role.
    pub async fn create(
        &self,
        ctx: &OperationContext,
        tenant_id: TenantId,
        market_role: MarketRole,
        template_version: Option<u32>,
    ) -> Result<WorkflowId> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowCreate, "create a workflow")?;
        if !ctx.scope().permits(tenant_id) {
            return Err(error_stack::report!(EngineError::TenantAccessDenied {
                tenant_id,
            }));
        }

        let tenant = self
            .tenants
            .get(tenant_id)
            .await
            .change_context(EngineError::Internal)?
            .ok_or(EngineError::TenantNotFound { tenant_id })?;
        if !tenant.is_active() {
            return Err(error_stack::report!(EngineError::TenantInactive {
                tenant_id,
            }));
        }

        let template = match template_version {
            Some(version) => self.registry.load(market_role, version).await?,
            None => self.registry.latest(market_role).await?,
        };

        let workflow_id = WorkflowId::new();
        let _workflow_guard = WorkflowInfoGuard::new(workflow_id.to_string());

        let event = WorkflowEvent::new(
            workflow_id,
            tenant_id,
            SequenceNumber::FIRST,
            ctx.actor().user_id,
            EventBody::WorkflowCreated {
                template_id: template.id,
                template_version: template.version,
                market_role,
            },
        );
        self.events
            .append(event.clone())
            .await
            .map_err(|report| map_append_error(report, workflow_id))?;

        let instance = gridflow_machine::initial_instance(&event)
            .map_err(|e| self.integrity(workflow_id, e))?;
        if let Err(report) = self.state.insert(instance.clone()).await {
            log::error!("state projection for new workflow {workflow_id} lagged: {report:?}");
        }
        if let Err(report) = self.index.insert(IndexRow::from_instance(&instance)).await {
            log::error!("index projection for new workflow {workflow_id} lagged: {report:?}");
        }

        log::info!(
            "created workflow for tenant {tenant_id} from template '{}' v{}",
            template.name,
            template.version
        );
        Ok(workflow_id)
    }

    /// Execute a step with submitted data.
    pub async fn execute_step(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        step_id: StepId,
        data: ValueRef,
    ) -> Result<ExecuteOutcome> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowExecute, "execute a step")?;
        let _workflow_guard = WorkflowInfoGuard::new(workflow_id.to_string());
        let _step_guard = StepIdGuard::new(step_id.to_string());

        // Phase 1, under the lock: validate, record the start, suspend-free
        // bookkeeping.
        let (template, step, handler, handler_input, instance) = {
            let _guard = self.locks.acquire(workflow_id).await?;
            let (instance, template) = self.load_visible(ctx, workflow_id).await?;

            StateMachine::new(&instance, &template)
                .check_transition(&step_id)
                .map_err(|e| self.map_machine_error(workflow_id, e))?;

            let step = template
                .step(&step_id)
                .ok_or(EngineError::InvalidTransition {
                    workflow_id,
                    step_id: step_id.clone(),
                })?
                .clone();
            let handler = self
                .handlers
                .get(step.kind)
                .map_err(|report| report.change_context(EngineError::Internal))?;

            let outcome = handler.validate(&step, &data);
            if !outcome.valid {
                let expected_version = instance.version;
                let mut instance = instance;
                let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
                writer
                    .append(EventBody::ValidationFailed {
                        step_id: Some(step_id.clone()),
                        errors: outcome.errors.clone(),
                    })
                    .await?;
                self.fold_and_project(&template, &mut instance, &writer, expected_version)
                    .await?;
                return Err(error_stack::report!(EngineError::Validation {
                    workflow_id,
                    step_id: Some(step_id),
                    errors: outcome.errors,
                }));
            }

            let expected_version = instance.version;
            let mut instance = instance;
            let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
            if instance.status == WorkflowStatus::Draft {
                writer.append(EventBody::WorkflowStarted {}).await?;
            }
            writer
                .append(EventBody::StepStarted {
                    step_id: step_id.clone(),
                    input: data.clone(),
                })
                .await?;
            self.fold_and_project(&template, &mut instance, &writer, expected_version)
                .await?;

            let handler_input = self.handler_input(&step, &data, &instance);
            (template, step, handler, handler_input, instance)
        };

        // Phase 2, lock released: dispatch the handler.
        let factory = self.context_factory(ctx, &instance);
        let hctx = factory.for_step(&step_id);
        let dispatched = tokio::time::timeout(
            self.config.step_timeout(),
            handler.execute(&step, handler_input, &hctx),
        )
        .await;

        // Phase 3, lock re-acquired: record what happened.
        self.complete_dispatch(ctx, workflow_id, &template, &step, dispatched, &factory)
            .await
    }

    /// Explicitly pause a workflow. Idempotent when already paused.
    pub async fn pause(&self, ctx: &OperationContext, workflow_id: WorkflowId) -> Result<()> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowExecute, "pause a workflow")?;
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, template) = self.load_visible(ctx, workflow_id).await?;

        match instance.status {
            WorkflowStatus::Paused => Ok(()),
            WorkflowStatus::InProgress => {
                let expected_version = instance.version;
                let mut instance = instance;
                let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
                writer.append(EventBody::WorkflowPaused {}).await?;
                self.fold_and_project(&template, &mut instance, &writer, expected_version)
                    .await
            }
            status => Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status,
                operation: "pause",
            })),
        }
    }

    /// Resume an explicitly paused (or rolled-back) workflow. Idempotent
    /// when already in progress.
    pub async fn resume(&self, ctx: &OperationContext, workflow_id: WorkflowId) -> Result<()> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowExecute, "resume a workflow")?;
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, template) = self.load_visible(ctx, workflow_id).await?;

        match instance.status {
            WorkflowStatus::InProgress => Ok(()),
            WorkflowStatus::Paused | WorkflowStatus::RolledBack => {
                let expected_version = instance.version;
                let mut instance = instance;
                let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
                writer.append(EventBody::WorkflowResumed {}).await?;
                self.fold_and_project(&template, &mut instance, &writer, expected_version)
                    .await
            }
            status => Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status,
                operation: "resume",
            })),
        }
    }

    /// Deliver an external signal to a suspended step, consuming its
    /// bookmark exactly once.
    pub async fn resume_bookmark(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        bookmark_id: BookmarkId,
        payload: ValueRef,
    ) -> Result<ExecuteOutcome> {
        self.check_live(ctx)?;
        let _workflow_guard = WorkflowInfoGuard::new(workflow_id.to_string());

        let (template, step, handler, instance) = {
            let _guard = self.locks.acquire(workflow_id).await?;
            let (instance, template) = self.load_visible(ctx, workflow_id).await?;

            let bookmark = self
                .bookmarks
                .find_active(workflow_id)
                .await?
                .into_iter()
                .find(|b| b.bookmark_id == bookmark_id);

            // A bookmark belonging to another workflow is indistinguishable
            // from a missing one.
            let Some(bookmark) = bookmark else {
                return self.consume_missing(workflow_id, bookmark_id, ctx, &template).await;
            };

            let permission = match bookmark.kind {
                BookmarkKind::Approval => Permission::ApprovalRespond,
                _ => Permission::WorkflowExecute,
            };
            self.require(ctx, permission, "resume a suspended step")?;

            if instance.status != WorkflowStatus::InProgress {
                return Err(error_stack::report!(EngineError::InvalidStatus {
                    workflow_id,
                    status: instance.status,
                    operation: "resume a suspended step",
                }));
            }

            let step_id = bookmark.step_id.clone();
            let _step_guard = StepIdGuard::new(step_id.to_string());
            let step = template
                .step(&step_id)
                .ok_or(EngineError::Integrity { workflow_id })?
                .clone();
            let handler = self
                .handlers
                .get(step.kind)
                .map_err(|report| report.change_context(EngineError::Internal))?;

            match self.bookmarks.consume(bookmark_id).await {
                Ok(_) => {}
                Err(report)
                    if matches!(report.current_context(), EngineError::BookmarkExpired { .. }) =>
                {
                    self.fail_step_for_expiry(ctx, &template, instance, &step_id).await?;
                    return Err(report);
                }
                Err(report) => return Err(report),
            }

            let expected_version = instance.version;
            let mut instance = instance;
            let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
            writer
                .append(EventBody::StepResumed {
                    step_id: step_id.clone(),
                    bookmark_id: bookmark_id.as_uuid(),
                    payload: Some(payload.clone()),
                })
                .await?;
            self.fold_and_project(&template, &mut instance, &writer, expected_version)
                .await?;

            (template, step, handler, instance)
        };

        let factory = self.context_factory(ctx, &instance);
        let hctx = factory.for_step(&step.id);
        let dispatched = tokio::time::timeout(
            self.config.step_timeout(),
            handler.on_resume(&step, payload, &hctx),
        )
        .await;

        self.complete_dispatch(ctx, workflow_id, &template, &step, dispatched, &factory)
            .await
    }

    /// Roll a workflow back to a previously completed step, compensating
    /// everything completed after it in reverse order.
    pub async fn rollback(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        to_step: StepId,
    ) -> Result<()> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowRollback, "roll back a workflow")?;
        let _workflow_guard = WorkflowInfoGuard::new(workflow_id.to_string());
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, template) = self.load_visible(ctx, workflow_id).await?;

        if instance.status.is_terminal() {
            return Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status: instance.status,
                operation: "rollback",
            }));
        }

        let history = self
            .events
            .get_events(workflow_id, EventRange::all())
            .await
            .change_context(EngineError::Internal)?;
        let target_completed = history.iter().any(|e| {
            matches!(&e.body, EventBody::StepCompleted { step_id, .. } if *step_id == to_step)
        });
        if !target_completed {
            return Err(error_stack::report!(EngineError::InvalidTransition {
                workflow_id,
                step_id: to_step,
            })
            .attach_printable("rollback target was never completed"));
        }

        self.return_workflow_to(ctx, &template, instance, &history, to_step)
            .await
    }

    /// Re-run validation over accumulated step data.
    pub async fn validate(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
    ) -> Result<ValidationReport> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowRead, "validate a workflow")?;
        let (instance, template) = self.load_visible(ctx, workflow_id).await?;
        Ok(self.validation_report(&template, &instance))
    }

    /// Submit a validated workflow for market-operations approval.
    pub async fn submit(&self, ctx: &OperationContext, workflow_id: WorkflowId) -> Result<()> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowSubmit, "submit a workflow")?;
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, template) = self.load_visible(ctx, workflow_id).await?;

        if !matches!(
            instance.status,
            WorkflowStatus::Draft | WorkflowStatus::InProgress | WorkflowStatus::AwaitingValidation
        ) {
            return Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status: instance.status,
                operation: "submit",
            }));
        }

        let report = self.validation_report(&template, &instance);
        let expected_version = instance.version;
        let mut instance = instance;
        let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);

        if !report.valid {
            writer
                .append(EventBody::ValidationFailed {
                    step_id: None,
                    errors: report.errors.clone(),
                })
                .await?;
            self.fold_and_project(&template, &mut instance, &writer, expected_version)
                .await?;
            return Err(error_stack::report!(EngineError::Validation {
                workflow_id,
                step_id: None,
                errors: report.errors,
            }));
        }

        writer.append(EventBody::ValidationPassed { step_id: None }).await?;
        writer.append(EventBody::WorkflowSubmitted {}).await?;
        self.fold_and_project(&template, &mut instance, &writer, expected_version)
            .await
    }

    /// Approve a submitted workflow (market operations only).
    pub async fn approve(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        comments: Option<String>,
    ) -> Result<()> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowApprove, "approve a workflow")?;
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, template) = self.load_visible(ctx, workflow_id).await?;

        if instance.status != WorkflowStatus::Submitted {
            return Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status: instance.status,
                operation: "approve",
            }));
        }

        let expected_version = instance.version;
        let mut instance = instance;
        let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
        writer.append(EventBody::WorkflowCompleted { comments }).await?;
        self.fold_and_project(&template, &mut instance, &writer, expected_version)
            .await?;
        log::info!("workflow {workflow_id} approved and completed");
        Ok(())
    }

    /// Reject a submitted workflow, returning it to `return_to` (or one
    /// step back by default) with compensation of everything after it.
    pub async fn reject(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        comments: Option<String>,
        return_to: Option<StepId>,
    ) -> Result<()> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowApprove, "reject a workflow")?;
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, template) = self.load_visible(ctx, workflow_id).await?;

        if instance.status != WorkflowStatus::Submitted {
            return Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status: instance.status,
                operation: "reject",
            }));
        }

        let history = self
            .events
            .get_events(workflow_id, EventRange::all())
            .await
            .change_context(EngineError::Internal)?;
        let target = return_to.or_else(|| instance.completed_steps().last().cloned());

        let expected_version = instance.version;
        let mut instance = instance;
        let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
        writer
            .append(EventBody::ApprovalRejected {
                step_id: None,
                comments,
                return_to: target.clone(),
            })
            .await?;
        self.fold_and_project(&template, &mut instance, &writer, expected_version)
            .await?;

        match target {
            Some(target) => {
                self.return_workflow_to(ctx, &template, instance, &history, target)
                    .await
            }
            // Nothing was ever completed; the rejection event alone returns
            // the workflow to in_progress.
            None => Ok(()),
        }
    }

    /// Cancel a workflow from any non-terminal state.
    ///
    /// Compensation is never automatic here; an operator who needs effects
    /// reversed runs `rollback` first.
    pub async fn cancel(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowCancel, "cancel a workflow")?;
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, template) = self.load_visible(ctx, workflow_id).await?;

        if instance.status.is_terminal() {
            return Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status: instance.status,
                operation: "cancel",
            }));
        }

        let expected_version = instance.version;
        let mut instance = instance;
        let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
        writer
            .append(EventBody::WorkflowCancelled {
                reason: reason.into(),
            })
            .await?;
        self.fold_and_project(&template, &mut instance, &writer, expected_version)
            .await
    }

    // ========================================================================
    // Read operations
    // ========================================================================

    /// Fetch a workflow instance visible to the caller.
    ///
    /// Cross-tenant ids surface as `WorkflowNotFound`, never as an access
    /// error that would disclose existence.
    pub async fn get(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowInstance> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowRead, "read a workflow")?;
        let (instance, _) = self.load_visible(ctx, workflow_id).await?;
        Ok(instance)
    }

    /// List workflow headers within the caller's tenant scope.
    pub async fn list(
        &self,
        ctx: &OperationContext,
        filter: WorkflowFilter,
        page: Page,
    ) -> Result<Vec<IndexRow>> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowRead, "list workflows")?;
        self.index
            .query(ctx, filter, page)
            .await
            .change_context(EngineError::Internal)
    }

    /// Count workflow headers within the caller's tenant scope.
    pub async fn count(&self, ctx: &OperationContext, filter: WorkflowFilter) -> Result<u64> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowRead, "count workflows")?;
        self.index
            .count(ctx, filter)
            .await
            .change_context(EngineError::Internal)
    }

    /// Events for a workflow, for the audit surface.
    pub async fn history(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        range: EventRange,
    ) -> Result<Vec<WorkflowEvent>> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowRead, "read workflow history")?;
        // Visibility check first; the event store itself is unscoped.
        self.load_visible(ctx, workflow_id).await?;
        self.events
            .get_events(workflow_id, range)
            .await
            .change_context(EngineError::Internal)
    }

    /// Delete a cancelled, archived workflow instance and its bookmarks.
    ///
    /// Events are retained for the configured horizon regardless.
    pub async fn delete(&self, ctx: &OperationContext, workflow_id: WorkflowId) -> Result<()> {
        self.check_live(ctx)?;
        self.require(ctx, Permission::WorkflowApprove, "delete a workflow")?;
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, _) = self.load_visible(ctx, workflow_id).await?;

        if instance.status != WorkflowStatus::Cancelled {
            return Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status: instance.status,
                operation: "delete",
            }));
        }

        self.state
            .delete(workflow_id)
            .await
            .change_context(EngineError::Internal)?;
        self.index
            .delete(workflow_id)
            .await
            .change_context(EngineError::Internal)?;
        self.bookmarks
            .delete_for_workflow(workflow_id)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_live(&self, ctx: &OperationContext) -> Result<()> {
        ctx.check_live()
            .map_err(|_| error_stack::report!(EngineError::Cancelled))
    }

    fn require(
        &self,
        ctx: &OperationContext,
        permission: Permission,
        operation: &'static str,
    ) -> Result<()> {
        if ctx.actor().can(permission) {
            Ok(())
        } else {
            Err(error_stack::report!(EngineError::PermissionDenied {
                operation,
            }))
        }
    }

    pub(crate) async fn load_visible(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
    ) -> Result<(WorkflowInstance, Arc<WorkflowTemplate>)> {
        let instance = self
            .state
            .get(ctx, workflow_id)
            .await
            .change_context(EngineError::Internal)?
            .ok_or(EngineError::WorkflowNotFound { workflow_id })?;
        let template = self.registry.load_by_id(instance.template_id).await?;
        Ok((instance, template))
    }

    /// Fold freshly appended events into the instance and write projections.
    async fn fold_and_project(
        &self,
        template: &WorkflowTemplate,
        instance: &mut WorkflowInstance,
        writer: &EventWriter<'_>,
        expected_version: u64,
    ) -> Result<()> {
        for event in writer.appended() {
            gridflow_machine::apply_event(template, instance, event)
                .map_err(|e| self.integrity(instance.id, e))?;
        }
        self.projector.write_through(instance, expected_version).await;
        instance.version = expected_version + 1;
        Ok(())
    }

    fn context_factory(
        &self,
        ctx: &OperationContext,
        instance: &WorkflowInstance,
    ) -> HandlerContextFactory {
        HandlerContextFactory {
            workflow_id: instance.id,
            tenant_id: instance.tenant_id,
            actor: ctx.actor().clone(),
            retry: self.config.handler_retry.clone(),
            notifications: self.notifications.clone(),
            provisioning: self.provisioning.clone(),
        }
    }

    /// Input handed to the handler: aggregate handlers see all accumulated
    /// step data, everything else sees its own submission.
    pub(crate) fn handler_input(
        &self,
        step: &StepDefinition,
        data: &ValueRef,
        instance: &WorkflowInstance,
    ) -> ValueRef {
        match step.kind {
            StepKind::Validation | StepKind::Decision => accumulated_data(instance),
            _ => data.clone(),
        }
    }

    /// Shared completion path for `execute_step`, `resume_bookmark`, and
    /// crash recovery: record what the handler produced.
    pub(crate) async fn complete_dispatch(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        template: &WorkflowTemplate,
        step: &StepDefinition,
        dispatched: std::result::Result<
            gridflow_handlers::Result<StepExecution>,
            tokio::time::error::Elapsed,
        >,
        _factory: &HandlerContextFactory,
    ) -> Result<ExecuteOutcome> {
        let _guard = self.locks.acquire(workflow_id).await?;
        let (instance, _) = self.load_visible(ctx, workflow_id).await?;
        if instance.status.is_terminal() {
            // The workflow was cancelled or failed while the handler ran.
            // Its result is not recorded; terminal logs stay final.
            return Err(error_stack::report!(EngineError::InvalidStatus {
                workflow_id,
                status: instance.status,
                operation: "record a step result",
            }));
        }

        let expected_version = instance.version;
        let mut instance = instance;
        let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
        let step_id = step.id.clone();

        let outcome = match dispatched {
            Err(_elapsed) => {
                let error = ErrorDetail::new("Timeout", "step handler exceeded start-to-close timeout");
                writer
                    .append(EventBody::StepFailed {
                        step_id: step_id.clone(),
                        error,
                    })
                    .await?;
                self.fold_and_project(template, &mut instance, &writer, expected_version)
                    .await?;
                return Err(error_stack::report!(EngineError::Timeout {
                    workflow_id,
                    step_id,
                }));
            }
            Ok(Err(report)) => {
                let error = ErrorDetail::new("Internal", format!("handler error: {report:?}"));
                writer
                    .append(EventBody::StepFailed {
                        step_id: step_id.clone(),
                        error,
                    })
                    .await?;
                self.fold_and_project(template, &mut instance, &writer, expected_version)
                    .await?;
                return Err(report.change_context(EngineError::StepFailed {
                    workflow_id,
                    step_id,
                }));
            }
            Ok(Ok(StepExecution::Completed {
                outcome,
                output,
                side_events,
            })) => {
                if step.kind == StepKind::Approval && outcome == StepOutcome::Rejected {
                    return self
                        .record_approval_rejection(ctx, template, instance, step, output)
                        .await;
                }

                for body in side_events {
                    writer.append(body).await?;
                }
                if step.kind == StepKind::Approval && outcome == StepOutcome::Approved {
                    let comments = output
                        .as_ref()
                        .and_then(|p| p.get("comments"))
                        .and_then(|c| c.as_str())
                        .map(str::to_string);
                    writer
                        .append(EventBody::ApprovalGranted {
                            step_id: Some(step_id.clone()),
                            comments,
                        })
                        .await?;
                }
                writer
                    .append(EventBody::StepCompleted {
                        step_id: step_id.clone(),
                        outcome: outcome.clone(),
                        output: output.clone(),
                    })
                    .await?;
                self.fold_and_project(template, &mut instance, &writer, expected_version)
                    .await?;

                ExecuteOutcome {
                    status: instance.status,
                    next_step_id: template.successors(&step_id).first().cloned(),
                    disposition: ExecutionDisposition::Completed(outcome),
                    output,
                }
            }
            Ok(Ok(StepExecution::Suspended(request))) => {
                let bookmark = self
                    .bookmarks
                    .create(workflow_id, instance.tenant_id, step_id.clone(), &request)
                    .await?;
                if let Some(announcement) = request.announcement {
                    writer.append(announcement).await?;
                }
                writer
                    .append(EventBody::StepPaused {
                        step_id: step_id.clone(),
                        bookmark_id: bookmark.bookmark_id.as_uuid(),
                    })
                    .await?;
                self.fold_and_project(template, &mut instance, &writer, expected_version)
                    .await?;
                log::info!(
                    "step '{step_id}' suspended on {} bookmark {}",
                    bookmark.kind,
                    bookmark.bookmark_id
                );

                ExecuteOutcome {
                    status: instance.status,
                    next_step_id: None,
                    disposition: ExecutionDisposition::Suspended(bookmark.bookmark_id),
                    output: None,
                }
            }
            Ok(Ok(StepExecution::Failed { error, side_events })) => {
                for body in side_events {
                    writer.append(body).await?;
                }
                writer
                    .append(EventBody::StepFailed {
                        step_id: step_id.clone(),
                        error: error.clone(),
                    })
                    .await?;
                self.fold_and_project(template, &mut instance, &writer, expected_version)
                    .await?;
                log::warn!("step '{step_id}' failed: {}", error.message);

                ExecuteOutcome {
                    status: instance.status,
                    next_step_id: None,
                    disposition: ExecutionDisposition::Failed(error),
                    output: None,
                }
            }
        };

        Ok(outcome)
    }

    /// An approval came back rejected: record it and return the workflow to
    /// the requested (or previous) step, compensating anything in between.
    async fn record_approval_rejection(
        &self,
        ctx: &OperationContext,
        template: &WorkflowTemplate,
        instance: WorkflowInstance,
        step: &StepDefinition,
        payload: Option<ValueRef>,
    ) -> Result<ExecuteOutcome> {
        let workflow_id = instance.id;
        let comments = payload
            .as_ref()
            .and_then(|p| p.get("comments"))
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let return_to = payload
            .as_ref()
            .and_then(|p| p.get("returnTo"))
            .and_then(|c| c.as_str())
            .map(StepId::from);
        let target = return_to.or_else(|| instance.completed_steps().last().cloned());

        let expected_version = instance.version;
        let mut instance = instance;
        let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
        writer
            .append(EventBody::ApprovalRejected {
                step_id: Some(step.id.clone()),
                comments,
                return_to: target.clone(),
            })
            .await?;
        self.fold_and_project(template, &mut instance, &writer, expected_version)
            .await?;

        if let Some(target) = target {
            let history = self
                .events
                .get_events(workflow_id, EventRange::all())
                .await
                .change_context(EngineError::Internal)?;
            self.return_workflow_to(ctx, template, instance.clone(), &history, target.clone())
                .await?;
            return Ok(ExecuteOutcome {
                status: WorkflowStatus::InProgress,
                next_step_id: Some(target),
                disposition: ExecutionDisposition::Completed(StepOutcome::Rejected),
                output: payload,
            });
        }

        Ok(ExecuteOutcome {
            status: instance.status,
            next_step_id: instance.current_step_id.clone(),
            disposition: ExecutionDisposition::Completed(StepOutcome::Rejected),
            output: payload,
        })
    }

    /// Compensate everything completed strictly after `to_step` (reverse
    /// order), then record the rollback. Shared by `rollback`, `reject`,
    /// and approval rejections.
    async fn return_workflow_to(
        &self,
        ctx: &OperationContext,
        template: &WorkflowTemplate,
        instance: WorkflowInstance,
        history: &[WorkflowEvent],
        to_step: StepId,
    ) -> Result<()> {
        let workflow_id = instance.id;
        let path = SagaCoordinator::forward_path(history, Some(&to_step));
        log::info!(
            "rolling workflow {workflow_id} back to '{to_step}' ({} compensations)",
            path.len()
        );

        let factory = self.context_factory(ctx, &instance);
        let expected_version = instance.version;
        let mut instance = instance;
        let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);

        if let Err(report) = self
            .saga
            .compensate(template, &path, &factory, &mut writer)
            .await
        {
            writer
                .append(EventBody::WorkflowFailed {
                    error: ErrorDetail::new(
                        "ExternalFailure",
                        "compensation exhausted its retry budget",
                    ),
                })
                .await?;
            self.fold_and_project(template, &mut instance, &writer, expected_version)
                .await?;
            return Err(report);
        }

        writer
            .append(EventBody::WorkflowRolledBack {
                to_step: to_step.clone(),
            })
            .await?;
        self.fold_and_project(template, &mut instance, &writer, expected_version)
            .await
    }

    /// A resume raced a missing bookmark: distinguish "consumed earlier"
    /// from "never existed" without leaking cross-workflow bookmarks.
    async fn consume_missing(
        &self,
        workflow_id: WorkflowId,
        bookmark_id: BookmarkId,
        _ctx: &OperationContext,
        _template: &WorkflowTemplate,
    ) -> Result<ExecuteOutcome> {
        match self.bookmarks.consume(bookmark_id).await {
            Err(report)
                if matches!(
                    report.current_context(),
                    EngineError::BookmarkAlreadyConsumed { .. }
                ) =>
            {
                Err(report)
            }
            _ => Err(error_stack::report!(EngineError::BookmarkNotFound {
                bookmark_id,
            })
            .attach_printable(format!("no active bookmark on workflow {workflow_id}"))),
        }
    }

    /// Fail a step whose bookmark expired.
    pub(crate) async fn fail_step_for_expiry(
        &self,
        ctx: &OperationContext,
        template: &WorkflowTemplate,
        instance: WorkflowInstance,
        step_id: &StepId,
    ) -> Result<()> {
        let expected_version = instance.version;
        let mut instance = instance;
        let mut writer = EventWriter::new(&*self.events, &instance, ctx.actor().user_id);
        writer
            .append(EventBody::StepFailed {
                step_id: step_id.clone(),
                error: ErrorDetail::new("BookmarkExpired", "bookmark expired before resumption"),
            })
            .await?;
        self.fold_and_project(template, &mut instance, &writer, expected_version)
            .await
    }

    fn validation_report(
        &self,
        template: &WorkflowTemplate,
        instance: &WorkflowInstance,
    ) -> ValidationReport {
        let mut errors = Vec::new();

        let required: Vec<&StepDefinition> = template.required_steps().collect();
        if required.is_empty() && !template.allows_empty_submission() {
            errors.push(FieldError::new(
                "workflow",
                "no required step completed",
            ));
        }

        for step in &required {
            let state = instance.step_state(&step.id);
            if !state.is_some_and(|s| s.is_completed()) {
                errors.push(FieldError::new(
                    step.id.as_str(),
                    "required step not completed",
                ));
                continue;
            }

            if let (Ok(handler), Some(state)) = (self.handlers.get(step.kind), state) {
                let outcome = handler.validate(step, &state.data);
                errors.extend(outcome.errors);
            }
        }

        for rule in &template.rules {
            match rule {
                TemplateRule::RequiredStepsCompleted { steps } => {
                    for step_id in steps {
                        let completed = instance
                            .step_state(step_id)
                            .is_some_and(|s| s.is_completed());
                        if !completed {
                            errors.push(FieldError::new(
                                step_id.as_str(),
                                "required step not completed",
                            ));
                        }
                    }
                }
                TemplateRule::FieldPresent { step, field } => {
                    let present = instance
                        .step_state(step)
                        .and_then(|s| s.data.get(field))
                        .is_some_and(|v| !v.is_null());
                    if !present {
                        errors.push(FieldError::new(
                            format!("{step}.{field}"),
                            "field is required",
                        ));
                    }
                }
                TemplateRule::AllowEmptySubmission => {}
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub(crate) fn integrity(
        &self,
        workflow_id: WorkflowId,
        err: MachineError,
    ) -> error_stack::Report<EngineError> {
        log::error!("integrity violation for workflow {workflow_id}: {err}");
        error_stack::report!(EngineError::Integrity { workflow_id })
            .attach_printable(err.to_string())
    }

    fn map_machine_error(
        &self,
        workflow_id: WorkflowId,
        err: MachineError,
    ) -> error_stack::Report<EngineError> {
        match err {
            MachineError::TerminalState { status, .. }
            | MachineError::NotExecutable { status, .. } => {
                error_stack::report!(EngineError::InvalidStatus {
                    workflow_id,
                    status,
                    operation: "execute a step",
                })
            }
            MachineError::StepBusy { step_id, .. } => {
                error_stack::report!(EngineError::Conflict { workflow_id })
                    .attach_printable(format!("step '{step_id}' is already executing"))
            }
            MachineError::InvalidTransition { to, .. } => {
                error_stack::report!(EngineError::InvalidTransition {
                    workflow_id,
                    step_id: to,
                })
            }
            MachineError::UnknownStep { step_id, .. } => {
                error_stack::report!(EngineError::InvalidTransition {
                    workflow_id,
                    step_id,
                })
            }
            other => self.integrity(workflow_id, other),
        }
    }

    pub(crate) fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub(crate) fn step_timeout(&self) -> std::time::Duration {
        self.config.step_timeout()
    }

    pub(crate) fn make_factory(
        &self,
        ctx: &OperationContext,
        instance: &WorkflowInstance,
    ) -> HandlerContextFactory {
        self.context_factory(ctx, instance)
    }
}

/// Accumulated step data keyed by step id, as handed to aggregate handlers.
pub(crate) fn accumulated_data(instance: &WorkflowInstance) -> ValueRef {
    let mut map = serde_json::Map::new();
    for (step_id, state) in &instance.step_states {
        map.insert(step_id.as_str().to_string(), state.data.value().clone());
    }
    ValueRef::new(serde_json::Value::Object(map))
}
