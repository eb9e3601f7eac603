use gridflow_core::{StepId, WorkflowId, WorkflowStatus};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MachineError {
    #[error("workflow {workflow_id} is in terminal status '{status}'")]
    TerminalState {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    },

    #[error("step '{to}' is not reachable from the current step")]
    InvalidTransition {
        from: Option<StepId>,
        to: StepId,
    },

    #[error("step '{step_id}' is not defined in template '{template}'")]
    UnknownStep { step_id: StepId, template: String },

    #[error("workflow {workflow_id} status '{status}' does not allow step execution")]
    NotExecutable {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    },

    #[error("step '{step_id}' of workflow {workflow_id} is already executing")]
    StepBusy {
        workflow_id: WorkflowId,
        step_id: StepId,
    },

    #[error("event log for workflow {workflow_id} does not start with WORKFLOW_CREATED")]
    MissingCreationEvent { workflow_id: WorkflowId },

    #[error("cannot replay an empty event log")]
    EmptyEventLog,

    #[error("unexpected WORKFLOW_CREATED at sequence {sequence} for workflow {workflow_id}")]
    UnexpectedCreationEvent {
        workflow_id: WorkflowId,
        sequence: u64,
    },

    #[error(
        "non-dense event sequence for workflow {workflow_id}: expected {expected}, got {got}"
    )]
    NonDenseSequence {
        workflow_id: WorkflowId,
        expected: u64,
        got: u64,
    },
}

pub type Result<T, E = error_stack::Report<MachineError>> = std::result::Result<T, E>;
