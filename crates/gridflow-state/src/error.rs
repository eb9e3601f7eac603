use gridflow_core::{BookmarkId, MarketRole, StepId, TenantId, WorkflowId};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Store initialization error")]
    Initialization,

    #[error("Store connection error")]
    Connection,

    #[error("Internal store error")]
    Internal,

    #[error("Serialization error")]
    Serialization,

    #[error("Conflicting write for workflow {workflow_id}")]
    ConflictingWrite { workflow_id: WorkflowId },

    #[error("Stale write for workflow {workflow_id}: expected version {expected}, found {found}")]
    StaleWrite {
        workflow_id: WorkflowId,
        expected: u64,
        found: u64,
    },

    #[error(
        "Non-dense event sequence for workflow {workflow_id}: expected {expected}, got {got}"
    )]
    NonDenseSequence {
        workflow_id: WorkflowId,
        expected: u64,
        got: u64,
    },

    #[error("Workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: WorkflowId },

    #[error("Tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: TenantId },

    #[error("Template not found: {market_role} v{version}")]
    TemplateNotFound {
        market_role: MarketRole,
        version: u32,
    },

    #[error("Template already published: {market_role} v{version}")]
    DuplicateTemplate {
        market_role: MarketRole,
        version: u32,
    },

    #[error("Bookmark not found: {bookmark_id}")]
    BookmarkNotFound { bookmark_id: BookmarkId },

    #[error("Bookmark already consumed: {bookmark_id}")]
    BookmarkAlreadyConsumed { bookmark_id: BookmarkId },

    #[error("Workflow {workflow_id} already has an active bookmark for step '{step_id}'")]
    ActiveBookmarkExists {
        workflow_id: WorkflowId,
        step_id: StepId,
    },
}

pub type Result<T, E = error_stack::Report<StateError>> = std::result::Result<T, E>;
