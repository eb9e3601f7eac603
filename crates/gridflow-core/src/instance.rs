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

//! Workflow instances and per-step state.
//!
//! The instance document held here is a projection: the event log is
//! authoritative, and an instance can be rebuilt from its events at any time
//! (see `gridflow-machine::replay`). The `version` counter exists for
//! optimistic concurrency on the state store; `projected_seq` records the
//! last event sequence folded into this document.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actor::UserId;
use crate::event::{ErrorDetail, FieldError};
use crate::template::{StepId, TemplateId};
use crate::tenant::{MarketRole, TenantId};
use crate::values::ValueRef;

/// Identifier of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
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

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workflow-level status.
///
/// `Paused` means explicitly paused by a user. A step suspended on a bookmark
/// leaves the workflow `InProgress` with the step itself in
/// [`StepStatus::Paused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    InProgress,
    Paused,
    AwaitingValidation,
    Submitted,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::AwaitingValidation => "awaiting_validation",
            WorkflowStatus::Submitted => "submitted",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::RolledBack => "rolled_back",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Statuses from which step execution may proceed.
    pub fn allows_step_execution(&self) -> bool {
        matches!(self, WorkflowStatus::Draft | WorkflowStatus::InProgress)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(WorkflowStatus::Draft),
            "in_progress" => Ok(WorkflowStatus::InProgress),
            "paused" => Ok(WorkflowStatus::Paused),
            "awaiting_validation" => Ok(WorkflowStatus::AwaitingValidation),
            "submitted" => Ok(WorkflowStatus::Submitted),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "rolled_back" => Ok(WorkflowStatus::RolledBack),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            _ => Err(format!("unknown workflow status: {s}")),
        }
    }
}

/// Status of an individual step within a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Paused,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Paused => "paused",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Projected state of one step within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub status: Option<StepStatus>,
    /// Submitted step data. Reset when the step is compensated; the original
    /// submission stays reachable only through event history.
    #[serde(default)]
    pub data: ValueRef,
    /// Handler output from the most recent completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ValueRef>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub validation_errors: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl StepState {
    pub fn is_completed(&self) -> bool {
        self.status == Some(StepStatus::Completed)
    }
}

/// A running execution of a template on behalf of a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    /// Owning tenant. Immutable for the life of the instance.
    pub tenant_id: TenantId,
    pub template_id: TemplateId,
    /// Template version pinned at creation. Immutable.
    pub template_version: u32,
    pub market_role: MarketRole,
    pub status: WorkflowStatus,
    /// `None` while the workflow is a draft.
    pub current_step_id: Option<StepId>,
    #[serde(default)]
    pub step_states: IndexMap<StepId, StepState>,
    #[serde(default)]
    pub metadata: ValueRef,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter for the state store.
    #[serde(default)]
    pub version: u64,
    /// Sequence number of the last event folded into this document.
    #[serde(default)]
    pub projected_seq: u64,
}

impl WorkflowInstance {
    pub fn step_state(&self, step_id: &StepId) -> Option<&StepState> {
        self.step_states.get(step_id)
    }

    /// Step state entry, created as pending on first access.
    pub fn step_state_mut(&mut self, step_id: &StepId) -> &mut StepState {
        self.step_states.entry(step_id.clone()).or_default()
    }

    /// Ids of completed steps, in completion order.
    pub fn completed_steps(&self) -> Vec<StepId> {
        let mut completed: Vec<(&StepId, DateTime<Utc>)> = self
            .step_states
            .iter()
            .filter(|(_, s)| s.is_completed())
            .filter_map(|(id, s)| s.completed_at.map(|at| (id, at)))
            .collect();
        completed.sort_by_key(|(_, at)| *at);
        completed.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::RolledBack.is_terminal());
        assert!(!WorkflowStatus::Submitted.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&WorkflowStatus::AwaitingValidation).unwrap();
        assert_eq!(json, "\"awaiting_validation\"");

        let deserialized: WorkflowStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, WorkflowStatus::AwaitingValidation);
    }

    #[test]
    fn test_step_execution_allowed() {
        assert!(WorkflowStatus::Draft.allows_step_execution());
        assert!(WorkflowStatus::InProgress.allows_step_execution());
        assert!(!WorkflowStatus::Paused.allows_step_execution());
        assert!(!WorkflowStatus::Submitted.allows_step_execution());
    }
}
