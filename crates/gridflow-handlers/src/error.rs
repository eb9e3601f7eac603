use gridflow_core::{StepId, StepKind};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid configuration for step '{step_id}'")]
    InvalidConfig { step_id: StepId },

    #[error("no handler registered for step kind '{0}'")]
    UnregisteredKind(StepKind),

    #[error("step '{step_id}' does not support resumption")]
    UnexpectedResume { step_id: StepId },

    #[error("resume payload for step '{step_id}' is missing field '{field}'")]
    MissingResumePayload { step_id: StepId, field: String },

    #[error("transport error")]
    Transport,

    #[error("internal handler error")]
    Internal,
}

pub type Result<T, E = error_stack::Report<HandlerError>> = std::result::Result<T, E>;
