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

//! The event-sourcing projection: folding events into an instance.
//!
//! [`apply_event`] is total over every event body: there is no "ignore
//! unknown" arm, and the event enum is closed, so any event a store can
//! return has a defined application. Replaying the prefix `[1..n]` of a log
//! always yields the same instance, which makes the state store's document a
//! rebuildable cache.

use gridflow_core::{
    EventBody, SequenceNumber, StepState, StepStatus, WorkflowEvent, WorkflowInstance,
    WorkflowStatus, WorkflowTemplate,
};

use crate::error::MachineError;

/// Build the canonical initial instance from a `WORKFLOW_CREATED` event.
pub fn initial_instance(event: &WorkflowEvent) -> Result<WorkflowInstance, MachineError> {
    let EventBody::WorkflowCreated {
        template_id,
        template_version,
        market_role,
    } = &event.body
    else {
        return Err(MachineError::MissingCreationEvent {
            workflow_id: event.workflow_id,
        });
    };
    if event.sequence_no != SequenceNumber::FIRST {
        return Err(MachineError::UnexpectedCreationEvent {
            workflow_id: event.workflow_id,
            sequence: event.sequence_no.value(),
        });
    }

    Ok(WorkflowInstance {
        id: event.workflow_id,
        tenant_id: event.tenant_id,
        template_id: *template_id,
        template_version: *template_version,
        market_role: *market_role,
        status: WorkflowStatus::Draft,
        current_step_id: None,
        step_states: Default::default(),
        metadata: Default::default(),
        created_by: event.performed_by,
        created_at: event.occurred_at,
        updated_at: event.occurred_at,
        version: 0,
        projected_seq: SequenceNumber::FIRST.value(),
    })
}

/// Apply one event to an instance.
///
/// Enforces density: the event's sequence must be exactly one past the
/// instance's `projected_seq`. The template is needed to recognize the final
/// step, which moves a workflow to `awaiting_validation` on completion.
pub fn apply_event(
    template: &WorkflowTemplate,
    instance: &mut WorkflowInstance,
    event: &WorkflowEvent,
) -> Result<(), MachineError> {
    let expected = instance.projected_seq + 1;
    let got = event.sequence_no.value();
    if got != expected {
        return Err(MachineError::NonDenseSequence {
            workflow_id: instance.id,
            expected,
            got,
        });
    }

    match &event.body {
        EventBody::WorkflowCreated { .. } => {
            return Err(MachineError::UnexpectedCreationEvent {
                workflow_id: instance.id,
                sequence: got,
            });
        }
        EventBody::WorkflowStarted {} => {
            instance.status = WorkflowStatus::InProgress;
        }
        EventBody::WorkflowPaused {} => {
            instance.status = WorkflowStatus::Paused;
        }
        EventBody::WorkflowResumed {} => {
            instance.status = WorkflowStatus::InProgress;
        }
        EventBody::WorkflowSubmitted {} => {
            instance.status = WorkflowStatus::Submitted;
        }
        EventBody::WorkflowCompleted { .. } => {
            instance.status = WorkflowStatus::Completed;
        }
        EventBody::WorkflowFailed { error } => {
            instance.status = WorkflowStatus::Failed;
            if let Some(step_id) = instance.current_step_id.clone() {
                instance.step_state_mut(&step_id).error = Some(error.clone());
            }
        }
        EventBody::WorkflowCancelled { .. } => {
            instance.status = WorkflowStatus::Cancelled;
        }
        EventBody::WorkflowRolledBack { to_step } => {
            instance.current_step_id = Some(to_step.clone());
            instance.status = WorkflowStatus::InProgress;
        }

        EventBody::StepStarted { step_id, input } => {
            if instance.status == WorkflowStatus::Draft {
                instance.status = WorkflowStatus::InProgress;
            }
            instance.current_step_id = Some(step_id.clone());
            let state = instance.step_state_mut(step_id);
            // A fresh start replaces prior data; retries and re-executions
            // after rollback must not see stale submissions.
            *state = StepState {
                status: Some(StepStatus::InProgress),
                data: input.clone(),
                started_at: Some(event.occurred_at),
                ..Default::default()
            };
        }
        EventBody::StepCompleted {
            step_id, output, ..
        } => {
            let performed_by = event.performed_by;
            let occurred_at = event.occurred_at;
            let state = instance.step_state_mut(step_id);
            state.status = Some(StepStatus::Completed);
            state.completed_at = Some(occurred_at);
            state.completed_by = Some(performed_by);
            state.output = output.clone();
            state.error = None;
            if template.is_final_step(step_id) && instance.status == WorkflowStatus::InProgress {
                instance.status = WorkflowStatus::AwaitingValidation;
            }
        }
        EventBody::StepFailed { step_id, error } => {
            let state = instance.step_state_mut(step_id);
            state.status = Some(StepStatus::Failed);
            state.error = Some(error.clone());
        }
        EventBody::StepValidated { step_id } => {
            instance.step_state_mut(step_id).validation_errors.clear();
        }
        EventBody::StepPaused { step_id, .. } => {
            let state = instance.step_state_mut(step_id);
            state.status = Some(StepStatus::Paused);
            state.paused_at = Some(event.occurred_at);
        }
        EventBody::StepResumed {
            step_id, payload, ..
        } => {
            let state = instance.step_state_mut(step_id);
            state.status = Some(StepStatus::InProgress);
            state.paused_at = None;
            if let Some(payload) = payload {
                state.data = state.data.merged_with(payload);
            }
        }
        EventBody::StepSkipped { step_id, .. } => {
            instance.step_state_mut(step_id).status = Some(StepStatus::Skipped);
        }
        EventBody::StepCompensated {
            step_id,
            compensated,
            error,
        } => {
            let state = instance.step_state_mut(step_id);
            if *compensated {
                // The step's effects are reversed; its prior data stays
                // reachable only through event history.
                *state = StepState {
                    status: Some(StepStatus::Pending),
                    ..Default::default()
                };
            } else {
                state.status = Some(StepStatus::Failed);
                state.error = error.clone();
            }
        }

        EventBody::ApprovalRequested { .. } => {
            // Audit record; the matching STEP_PAUSED carries the state change.
        }
        EventBody::ApprovalGranted { .. } => {
            // Audit record; completion arrives as STEP_COMPLETED.
        }
        EventBody::ApprovalRejected { step_id, .. } => {
            match step_id {
                Some(step_id) => {
                    // The approval never completed; leave the step runnable.
                    let state = instance.step_state_mut(step_id);
                    state.status = Some(StepStatus::Pending);
                    state.paused_at = None;
                }
                // Workflow-level rejection returns a submitted workflow to
                // work; a following WORKFLOW_ROLLED_BACK moves the current
                // step when there is somewhere to return to.
                None => {
                    instance.status = WorkflowStatus::InProgress;
                }
            }
        }

        EventBody::DataUpdated { step_id, data } => {
            let state = instance.step_state_mut(step_id);
            state.data = state.data.merged_with(data);
        }
        EventBody::ValidationFailed { step_id, errors } => {
            if let Some(step_id) = step_id {
                instance.step_state_mut(step_id).validation_errors = errors.clone();
            }
        }
        EventBody::ValidationPassed { step_id } => {
            if let Some(step_id) = step_id {
                instance.step_state_mut(step_id).validation_errors.clear();
            }
        }

        EventBody::ApiCallStarted { .. } => {
            // Audit record used by crash recovery; no state change.
        }
        EventBody::ApiCallCompleted { step_id, response } => {
            instance.step_state_mut(step_id).output = Some(response.clone());
        }
        EventBody::ApiCallFailed { step_id, error } => {
            instance.step_state_mut(step_id).error = Some(error.clone());
        }
        EventBody::NotificationSent { .. } => {
            // Best-effort send; the STEP_COMPLETED carries the state change.
        }
        EventBody::NotificationFailed { step_id, error } => {
            // Recorded without failing the step unless the handler decided
            // delivery was required, in which case STEP_FAILED follows.
            instance.step_state_mut(step_id).error = Some(error.clone());
        }
    }

    instance.projected_seq = got;
    instance.updated_at = event.occurred_at;
    Ok(())
}

/// Replay a workflow's event log into an instance.
///
/// `until` bounds the replay to events with sequence `<= until`, which is
/// how rollback computes the state "immediately after" a given completion.
/// The log must start with `WORKFLOW_CREATED` and be dense.
pub fn replay(
    template: &WorkflowTemplate,
    events: &[WorkflowEvent],
    until: Option<SequenceNumber>,
) -> Result<WorkflowInstance, MachineError> {
    let mut events = events.iter();
    let first = events.next().ok_or(MachineError::EmptyEventLog)?;

    let mut instance = initial_instance(first)?;
    for event in events {
        if until.is_some_and(|until| event.sequence_no > until) {
            break;
        }
        apply_event(template, &mut instance, event)?;
    }
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridflow_core::{
        ErrorDetail, EventId, MarketRole, StepId, StepKind, StepOutcome, TenantId, UserId,
        ValueRef, WorkflowId, WorkflowTemplateBuilder,
    };
    use serde_json::json;

    struct LogBuilder {
        workflow_id: WorkflowId,
        tenant_id: TenantId,
        user: UserId,
        events: Vec<WorkflowEvent>,
    }

    impl LogBuilder {
        fn new() -> Self {
            Self {
                workflow_id: WorkflowId::new(),
                tenant_id: TenantId::new(),
                user: UserId::new(),
                events: Vec::new(),
            }
        }

        fn push(&mut self, body: EventBody) -> &mut Self {
            let seq = SequenceNumber::new(self.events.len() as u64 + 1);
            self.events.push(WorkflowEvent {
                event_id: EventId::new(),
                workflow_id: self.workflow_id,
                tenant_id: self.tenant_id,
                sequence_no: seq,
                performed_by: self.user,
                occurred_at: Utc::now(),
                body,
            });
            self
        }
    }

    fn template() -> WorkflowTemplate {
        WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, 1)
            .step(
                "company_info",
                "Company information",
                StepKind::Form,
                ValueRef::default(),
                true,
                vec![StepId::from("portfolio")],
            )
            .step(
                "portfolio",
                "Portfolio",
                StepKind::Form,
                ValueRef::default(),
                true,
                vec![],
            )
            .build()
            .unwrap()
    }

    fn created(template: &WorkflowTemplate) -> EventBody {
        EventBody::WorkflowCreated {
            template_id: template.id,
            template_version: template.version,
            market_role: template.market_role,
        }
    }

    #[test]
    fn test_replay_happy_path() {
        let template = template();
        let mut log = LogBuilder::new();
        log.push(created(&template))
            .push(EventBody::WorkflowStarted {})
            .push(EventBody::StepStarted {
                step_id: StepId::from("company_info"),
                input: ValueRef::new(json!({"companyName": "Engie"})),
            })
            .push(EventBody::StepCompleted {
                step_id: StepId::from("company_info"),
                outcome: StepOutcome::Default,
                output: None,
            });

        let instance = replay(&template, &log.events, None).unwrap();
        assert_eq!(instance.status, WorkflowStatus::InProgress);
        assert_eq!(instance.current_step_id, Some(StepId::from("company_info")));
        assert_eq!(instance.projected_seq, 4);

        let state = instance.step_state(&StepId::from("company_info")).unwrap();
        assert!(state.is_completed());
        assert_eq!(state.data.value(), &json!({"companyName": "Engie"}));
    }

    #[test]
    fn test_final_step_completion_awaits_validation() {
        let template = template();
        let mut log = LogBuilder::new();
        log.push(created(&template))
            .push(EventBody::WorkflowStarted {})
            .push(EventBody::StepStarted {
                step_id: StepId::from("portfolio"),
                input: ValueRef::default(),
            })
            .push(EventBody::StepCompleted {
                step_id: StepId::from("portfolio"),
                outcome: StepOutcome::Default,
                output: None,
            });

        let instance = replay(&template, &log.events, None).unwrap();
        assert_eq!(instance.status, WorkflowStatus::AwaitingValidation);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let template = template();
        let mut log = LogBuilder::new();
        log.push(created(&template))
            .push(EventBody::WorkflowStarted {})
            .push(EventBody::StepStarted {
                step_id: StepId::from("company_info"),
                input: ValueRef::new(json!({"a": 1})),
            })
            .push(EventBody::StepFailed {
                step_id: StepId::from("company_info"),
                error: ErrorDetail::new("Timeout", "handler timed out"),
            });

        let once = replay(&template, &log.events, None).unwrap();
        let twice = replay(&template, &log.events, None).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_replay_until_truncates() {
        let template = template();
        let mut log = LogBuilder::new();
        log.push(created(&template))
            .push(EventBody::WorkflowStarted {})
            .push(EventBody::StepStarted {
                step_id: StepId::from("company_info"),
                input: ValueRef::new(json!({"v": "first"})),
            })
            .push(EventBody::StepCompleted {
                step_id: StepId::from("company_info"),
                outcome: StepOutcome::Default,
                output: None,
            })
            .push(EventBody::StepStarted {
                step_id: StepId::from("portfolio"),
                input: ValueRef::default(),
            });

        let truncated = replay(&template, &log.events, Some(SequenceNumber::new(4))).unwrap();
        assert_eq!(truncated.projected_seq, 4);
        assert_eq!(
            truncated.current_step_id,
            Some(StepId::from("company_info"))
        );
        assert!(truncated.step_state(&StepId::from("portfolio")).is_none());
    }

    #[test]
    fn test_compensation_resets_step_but_history_remains() {
        let template = template();
        let mut log = LogBuilder::new();
        log.push(created(&template))
            .push(EventBody::WorkflowStarted {})
            .push(EventBody::StepStarted {
                step_id: StepId::from("portfolio"),
                input: ValueRef::new(json!({"accessPoints": ["EAN-1"]})),
            })
            .push(EventBody::StepCompleted {
                step_id: StepId::from("portfolio"),
                outcome: StepOutcome::Default,
                output: None,
            })
            .push(EventBody::StepCompensated {
                step_id: StepId::from("portfolio"),
                compensated: true,
                error: None,
            })
            .push(EventBody::WorkflowRolledBack {
                to_step: StepId::from("company_info"),
            })
            .push(EventBody::StepStarted {
                step_id: StepId::from("portfolio"),
                input: ValueRef::new(json!({"accessPoints": ["EAN-2"]})),
            });

        let instance = replay(&template, &log.events, None).unwrap();
        let state = instance.step_state(&StepId::from("portfolio")).unwrap();
        // Only the re-submitted data is visible in projected state.
        assert_eq!(state.data.value(), &json!({"accessPoints": ["EAN-2"]}));
    }

    #[test]
    fn test_non_dense_sequence_rejected() {
        let template = template();
        let mut log = LogBuilder::new();
        log.push(created(&template)).push(EventBody::WorkflowStarted {});
        // Corrupt the second event's sequence.
        log.events[1].sequence_no = SequenceNumber::new(5);

        let err = replay(&template, &log.events, None).unwrap_err();
        assert!(matches!(
            err,
            MachineError::NonDenseSequence {
                expected: 2,
                got: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_log_must_start_with_creation() {
        let template = template();
        let mut log = LogBuilder::new();
        log.push(EventBody::WorkflowStarted {});

        assert!(matches!(
            replay(&template, &log.events, None).unwrap_err(),
            MachineError::MissingCreationEvent { .. }
        ));
    }

    #[test]
    fn test_cancelled_reason_in_history_only() {
        let template = template();
        let mut log = LogBuilder::new();
        log.push(created(&template)).push(EventBody::WorkflowCancelled {
            reason: "duplicate request".to_string(),
        });

        let instance = replay(&template, &log.events, None).unwrap();
        assert_eq!(instance.status, WorkflowStatus::Cancelled);
        assert!(instance.status.is_terminal());
    }
}
