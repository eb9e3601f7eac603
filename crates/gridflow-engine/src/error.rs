use gridflow_core::{
    BookmarkId, FieldError, MarketRole, StepId, TenantId, WorkflowId, WorkflowStatus,
};

/// The engine's error taxonomy.
///
/// Kinds, not causes: rich context (field lists, underlying reports) rides
/// on the `error_stack::Report`. The API collaborator maps kinds to
/// user-facing codes; `TenantAccessDenied` is deliberately never produced
/// for cross-tenant *reads*, which surface as `WorkflowNotFound` to avoid
/// existence disclosure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("step data failed validation for workflow {workflow_id}")]
    Validation {
        workflow_id: WorkflowId,
        step_id: Option<StepId>,
        errors: Vec<FieldError>,
    },

    #[error("invalid transition to step '{step_id}' for workflow {workflow_id}")]
    InvalidTransition {
        workflow_id: WorkflowId,
        step_id: StepId,
    },

    #[error("workflow {workflow_id} status '{status}' does not permit {operation}")]
    InvalidStatus {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        operation: &'static str,
    },

    #[error("workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: WorkflowId },

    #[error("tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: TenantId },

    #[error("no active template for market role {market_role}")]
    TemplateNotFound { market_role: MarketRole },

    #[error("bookmark not found: {bookmark_id}")]
    BookmarkNotFound { bookmark_id: BookmarkId },

    #[error("access to tenant {tenant_id} denied")]
    TenantAccessDenied { tenant_id: TenantId },

    #[error("tenant {tenant_id} is not active")]
    TenantInactive { tenant_id: TenantId },

    #[error("actor is not permitted to {operation}")]
    PermissionDenied { operation: &'static str },

    #[error("conflicting concurrent operation on workflow {workflow_id}")]
    Conflict { workflow_id: WorkflowId },

    #[error("bookmark already consumed: {bookmark_id}")]
    BookmarkAlreadyConsumed { bookmark_id: BookmarkId },

    #[error("bookmark expired: {bookmark_id}")]
    BookmarkExpired { bookmark_id: BookmarkId },

    #[error("step '{step_id}' of workflow {workflow_id} failed")]
    StepFailed {
        workflow_id: WorkflowId,
        step_id: StepId,
    },

    #[error("step '{step_id}' of workflow {workflow_id} timed out")]
    Timeout {
        workflow_id: WorkflowId,
        step_id: StepId,
    },

    #[error("compensation failed for workflow {workflow_id} at step '{step_id}'")]
    CompensationFailed {
        workflow_id: WorkflowId,
        step_id: StepId,
    },

    #[error("integrity violation for workflow {workflow_id}")]
    Integrity { workflow_id: WorkflowId },

    #[error("operation cancelled or past its deadline")]
    Cancelled,

    #[error("internal engine error")]
    Internal,
}

pub type Result<T, E = error_stack::Report<EngineError>> = std::result::Result<T, E>;
