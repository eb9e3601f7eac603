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

//! The append-only workflow event model.
//!
//! Events are the source of truth: the instance document and the index row
//! are projections rebuilt by folding events in sequence order. Every event
//! carries a dense, per-workflow `sequence_no` starting at 1; the event body
//! is a closed tagged enum, so an unrecognized event type fails
//! deserialization instead of being silently ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actor::UserId;
use crate::instance::WorkflowId;
use crate::template::{StepId, TemplateId};
use crate::tenant::{MarketRole, TenantId};
use crate::values::ValueRef;

/// Identifier of a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-workflow event sequence number, dense and starting at 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// The sequence assigned to a workflow's first event.
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured error carried in failure events and surfaced step errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    /// Stable error kind, e.g. `Timeout`, `ExternalFailure`.
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Outcome of a completed step, recorded in `STEP_COMPLETED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "branch", rename_all = "snake_case")]
pub enum StepOutcome {
    Default,
    Approved,
    Rejected,
    Passed,
    Failed,
    /// Decision steps complete with one of their configured branches.
    Branch(String),
}

/// Typed event payloads, tagged with the wire event-type name.
///
/// The enum is closed: deserializing an unknown tag is an error by
/// construction, which is what keeps replay total: every event a store can
/// return has a defined application to state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventBody {
    // =========================================================================
    // Workflow lifecycle
    // =========================================================================
    WorkflowCreated {
        template_id: TemplateId,
        template_version: u32,
        market_role: MarketRole,
    },
    WorkflowStarted {},
    WorkflowPaused {},
    WorkflowResumed {},
    WorkflowSubmitted {},
    WorkflowCompleted {
        #[serde(skip_serializing_if = "Option::is_none")]
        comments: Option<String>,
    },
    WorkflowFailed {
        error: ErrorDetail,
    },
    WorkflowCancelled {
        reason: String,
    },
    WorkflowRolledBack {
        to_step: StepId,
    },

    // =========================================================================
    // Step lifecycle
    // =========================================================================
    StepStarted {
        step_id: StepId,
        input: ValueRef,
    },
    StepCompleted {
        step_id: StepId,
        outcome: StepOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<ValueRef>,
    },
    StepFailed {
        step_id: StepId,
        error: ErrorDetail,
    },
    StepValidated {
        step_id: StepId,
    },
    StepPaused {
        step_id: StepId,
        bookmark_id: Uuid,
    },
    StepResumed {
        step_id: StepId,
        bookmark_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<ValueRef>,
    },
    StepSkipped {
        step_id: StepId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    StepCompensated {
        step_id: StepId,
        /// False when compensation attempts were exhausted; the event is then
        /// an operator-inspection record, not a successful reversal.
        compensated: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
    },

    // =========================================================================
    // Approvals
    // =========================================================================
    ApprovalRequested {
        step_id: StepId,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        approvers: Vec<String>,
    },
    ApprovalGranted {
        /// The approval step, or `None` for workflow-level approval.
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<StepId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        comments: Option<String>,
    },
    ApprovalRejected {
        /// The approval step, or `None` for workflow-level rejection.
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<StepId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        comments: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        return_to: Option<StepId>,
    },

    // =========================================================================
    // Data & validation
    // =========================================================================
    DataUpdated {
        step_id: StepId,
        data: ValueRef,
    },
    ValidationFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<StepId>,
        errors: Vec<FieldError>,
    },
    ValidationPassed {
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<StepId>,
    },

    // =========================================================================
    // External I/O
    // =========================================================================
    ApiCallStarted {
        step_id: StepId,
        idempotency_key: String,
    },
    ApiCallCompleted {
        step_id: StepId,
        response: ValueRef,
    },
    ApiCallFailed {
        step_id: StepId,
        error: ErrorDetail,
    },
    NotificationSent {
        step_id: StepId,
        recipients: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    NotificationFailed {
        step_id: StepId,
        error: ErrorDetail,
    },
}

impl EventBody {
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::WorkflowCreated { .. } => EventType::WorkflowCreated,
            EventBody::WorkflowStarted {} => EventType::WorkflowStarted,
            EventBody::WorkflowPaused {} => EventType::WorkflowPaused,
            EventBody::WorkflowResumed {} => EventType::WorkflowResumed,
            EventBody::WorkflowSubmitted {} => EventType::WorkflowSubmitted,
            EventBody::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            EventBody::WorkflowFailed { .. } => EventType::WorkflowFailed,
            EventBody::WorkflowCancelled { .. } => EventType::WorkflowCancelled,
            EventBody::WorkflowRolledBack { .. } => EventType::WorkflowRolledBack,
            EventBody::StepStarted { .. } => EventType::StepStarted,
            EventBody::StepCompleted { .. } => EventType::StepCompleted,
            EventBody::StepFailed { .. } => EventType::StepFailed,
            EventBody::StepValidated { .. } => EventType::StepValidated,
            EventBody::StepPaused { .. } => EventType::StepPaused,
            EventBody::StepResumed { .. } => EventType::StepResumed,
            EventBody::StepSkipped { .. } => EventType::StepSkipped,
            EventBody::StepCompensated { .. } => EventType::StepCompensated,
            EventBody::ApprovalRequested { .. } => EventType::ApprovalRequested,
            EventBody::ApprovalGranted { .. } => EventType::ApprovalGranted,
            EventBody::ApprovalRejected { .. } => EventType::ApprovalRejected,
            EventBody::DataUpdated { .. } => EventType::DataUpdated,
            EventBody::ValidationFailed { .. } => EventType::ValidationFailed,
            EventBody::ValidationPassed { .. } => EventType::ValidationPassed,
            EventBody::ApiCallStarted { .. } => EventType::ApiCallStarted,
            EventBody::ApiCallCompleted { .. } => EventType::ApiCallCompleted,
            EventBody::ApiCallFailed { .. } => EventType::ApiCallFailed,
            EventBody::NotificationSent { .. } => EventType::NotificationSent,
            EventBody::NotificationFailed { .. } => EventType::NotificationFailed,
        }
    }

    /// The step this event concerns, when it concerns one.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            EventBody::StepStarted { step_id, .. }
            | EventBody::StepCompleted { step_id, .. }
            | EventBody::StepFailed { step_id, .. }
            | EventBody::StepValidated { step_id }
            | EventBody::StepPaused { step_id, .. }
            | EventBody::StepResumed { step_id, .. }
            | EventBody::StepSkipped { step_id, .. }
            | EventBody::StepCompensated { step_id, .. }
            | EventBody::ApprovalRequested { step_id, .. }
            | EventBody::DataUpdated { step_id, .. }
            | EventBody::ApiCallStarted { step_id, .. }
            | EventBody::ApiCallCompleted { step_id, .. }
            | EventBody::ApiCallFailed { step_id, .. }
            | EventBody::NotificationSent { step_id, .. }
            | EventBody::NotificationFailed { step_id, .. } => Some(step_id),
            EventBody::ValidationFailed { step_id, .. }
            | EventBody::ValidationPassed { step_id }
            | EventBody::ApprovalGranted { step_id, .. }
            | EventBody::ApprovalRejected { step_id, .. } => step_id.as_ref(),
            _ => None,
        }
    }
}

/// The closed set of event types, matching the wire tags of [`EventBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowCreated,
    WorkflowStarted,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowSubmitted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowRolledBack,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepValidated,
    StepPaused,
    StepResumed,
    StepSkipped,
    StepCompensated,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalRejected,
    DataUpdated,
    ValidationFailed,
    ValidationPassed,
    ApiCallStarted,
    ApiCallCompleted,
    ApiCallFailed,
    NotificationSent,
    NotificationFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowCreated => "WORKFLOW_CREATED",
            EventType::WorkflowStarted => "WORKFLOW_STARTED",
            EventType::WorkflowPaused => "WORKFLOW_PAUSED",
            EventType::WorkflowResumed => "WORKFLOW_RESUMED",
            EventType::WorkflowSubmitted => "WORKFLOW_SUBMITTED",
            EventType::WorkflowCompleted => "WORKFLOW_COMPLETED",
            EventType::WorkflowFailed => "WORKFLOW_FAILED",
            EventType::WorkflowCancelled => "WORKFLOW_CANCELLED",
            EventType::WorkflowRolledBack => "WORKFLOW_ROLLED_BACK",
            EventType::StepStarted => "STEP_STARTED",
            EventType::StepCompleted => "STEP_COMPLETED",
            EventType::StepFailed => "STEP_FAILED",
            EventType::StepValidated => "STEP_VALIDATED",
            EventType::StepPaused => "STEP_PAUSED",
            EventType::StepResumed => "STEP_RESUMED",
            EventType::StepSkipped => "STEP_SKIPPED",
            EventType::StepCompensated => "STEP_COMPENSATED",
            EventType::ApprovalRequested => "APPROVAL_REQUESTED",
            EventType::ApprovalGranted => "APPROVAL_GRANTED",
            EventType::ApprovalRejected => "APPROVAL_REJECTED",
            EventType::DataUpdated => "DATA_UPDATED",
            EventType::ValidationFailed => "VALIDATION_FAILED",
            EventType::ValidationPassed => "VALIDATION_PASSED",
            EventType::ApiCallStarted => "API_CALL_STARTED",
            EventType::ApiCallCompleted => "API_CALL_COMPLETED",
            EventType::ApiCallFailed => "API_CALL_FAILED",
            EventType::NotificationSent => "NOTIFICATION_SENT",
            EventType::NotificationFailed => "NOTIFICATION_FAILED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable record of a workflow state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub event_id: EventId,
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    pub sequence_no: SequenceNumber,
    pub performed_by: UserId,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl WorkflowEvent {
    /// Create an event with a fresh id and the current timestamp.
    ///
    /// The sequence number is assigned by the event store at append time;
    /// callers pass the expected next sequence.
    pub fn new(
        workflow_id: WorkflowId,
        tenant_id: TenantId,
        sequence_no: SequenceNumber,
        performed_by: UserId,
        body: EventBody,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            workflow_id,
            tenant_id,
            sequence_no,
            performed_by,
            occurred_at: Utc::now(),
            body,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_body_wire_tag() {
        let body = EventBody::WorkflowCancelled {
            reason: "duplicate request".to_string(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["type"], json!("WORKFLOW_CANCELLED"));
        assert_eq!(value["reason"], json!("duplicate request"));
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let result: Result<EventBody, _> =
            serde_json::from_value(json!({"type": "WORKFLOW_TELEPORTED"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_event_type_matches_tag() {
        let body = EventBody::StepCompleted {
            step_id: StepId::from("portfolio"),
            outcome: StepOutcome::Default,
            output: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["type"], json!(body.event_type().as_str()));
    }

    #[test]
    fn test_event_round_trip() {
        let event = WorkflowEvent::new(
            WorkflowId::new(),
            TenantId::new(),
            SequenceNumber::FIRST,
            UserId::new(),
            EventBody::StepStarted {
                step_id: StepId::from("company_info"),
                input: ValueRef::new(json!({"companyName": "Engie"})),
            },
        );
        let serialized = serde_json::to_string(&event).unwrap();
        let deserialized: WorkflowEvent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn test_sequence_number_ordering() {
        assert!(SequenceNumber::FIRST < SequenceNumber::FIRST.next());
        assert_eq!(SequenceNumber::new(5).next().value(), 6);
    }

    #[test]
    fn test_step_id_extraction() {
        let body = EventBody::ApiCallFailed {
            step_id: StepId::from("provision"),
            error: ErrorDetail::new("ExternalFailure", "gateway unreachable"),
        };
        assert_eq!(body.step_id(), Some(&StepId::from("provision")));

        let body = EventBody::WorkflowStarted {};
        assert_eq!(body.step_id(), None);
    }
}
