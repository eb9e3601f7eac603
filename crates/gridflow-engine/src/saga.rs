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

//! Compensation ordering during rollback.
//!
//! The coordinator derives the forward path from event history: the steps
//! whose latest completion lies strictly after the rollback target's
//! completion and was not already compensated. That path is reversed, and
//! compensated strictly sequentially in reverse completion order; parallel
//! compensation is disallowed even where forward execution interleaved.

use std::collections::HashMap;
use std::sync::Arc;

use gridflow_core::{
    ErrorDetail, EventBody, StepId, WorkflowEvent, WorkflowTemplate,
};
use gridflow_handlers::{HandlerRegistry, RetryPolicy, StepHandler as _};

use crate::engine::{EventWriter, HandlerContextFactory};
use crate::error::{EngineError, Result};

pub struct SagaCoordinator {
    handlers: Arc<HandlerRegistry>,
    retry: RetryPolicy,
}

impl SagaCoordinator {
    pub fn new(handlers: Arc<HandlerRegistry>, retry: RetryPolicy) -> Self {
        Self { handlers, retry }
    }

    /// Steps to compensate, in forward completion order.
    ///
    /// A step is on the path when its latest completion lies strictly after
    /// `to_step`'s latest completion and no later compensation reversed it.
    /// `to_step = None` means the path starts at the beginning of history
    /// (rollback to the initial step).
    pub fn forward_path(history: &[WorkflowEvent], to_step: Option<&StepId>) -> Vec<StepId> {
        let mut last_completion: HashMap<&StepId, u64> = HashMap::new();
        let mut last_compensation: HashMap<&StepId, u64> = HashMap::new();

        for event in history {
            match &event.body {
                EventBody::StepCompleted { step_id, .. } => {
                    last_completion.insert(step_id, event.sequence_no.value());
                }
                EventBody::StepCompensated {
                    step_id,
                    compensated: true,
                    ..
                } => {
                    last_compensation.insert(step_id, event.sequence_no.value());
                }
                _ => {}
            }
        }

        let cutoff = to_step
            .and_then(|step| last_completion.get(step).copied())
            .unwrap_or(0);

        let mut path: Vec<(&StepId, u64)> = last_completion
            .iter()
            .filter(|(step, completed_at)| {
                to_step != Some(*step)
                    && **completed_at > cutoff
                    && last_compensation.get(*step).copied().unwrap_or(0) < **completed_at
            })
            .map(|(step, completed_at)| (*step, *completed_at))
            .collect();
        path.sort_by_key(|(_, completed_at)| *completed_at);
        path.into_iter().map(|(step, _)| step.clone()).collect()
    }

    /// Compensate `path` (given in forward completion order) in reverse,
    /// appending `STEP_COMPENSATED` after each successful reversal.
    ///
    /// Attempts per step are bounded by the retry policy with exponential
    /// backoff. Exhaustion appends a failed `STEP_COMPENSATED` record for
    /// operator inspection and fails the saga fast; later steps on the
    /// path are not attempted.
    pub(crate) async fn compensate(
        &self,
        template: &WorkflowTemplate,
        path: &[StepId],
        contexts: &HandlerContextFactory,
        writer: &mut EventWriter<'_>,
    ) -> Result<()> {
        for step_id in path.iter().rev() {
            let step = template.step(step_id).ok_or_else(|| {
                error_stack::report!(EngineError::Integrity {
                    workflow_id: writer.workflow_id(),
                })
                .attach_printable(format!("completed step '{step_id}' missing from template"))
            })?;
            let handler = self
                .handlers
                .get(step.kind)
                .map_err(|report| report.change_context(EngineError::Internal))?;
            let ctx = contexts.for_step(step_id);

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match handler.compensate(step, &ctx).await {
                    Ok(()) => {
                        log::info!("compensated step '{step_id}'");
                        writer
                            .append(EventBody::StepCompensated {
                                step_id: step_id.clone(),
                                compensated: true,
                                error: None,
                            })
                            .await?;
                        break;
                    }
                    Err(report) if self.retry.allows_retry(attempt) => {
                        let delay = self.retry.backoff(attempt);
                        log::warn!(
                            "compensation of step '{step_id}' attempt {attempt} failed; retrying in {delay:?}: {report:?}"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(report) => {
                        let error = ErrorDetail::new(
                            "ExternalFailure",
                            format!("compensation exhausted {attempt} attempts: {report:?}"),
                        );
                        writer
                            .append(EventBody::StepCompensated {
                                step_id: step_id.clone(),
                                compensated: false,
                                error: Some(error),
                            })
                            .await?;
                        return Err(report.change_context(EngineError::CompensationFailed {
                            workflow_id: writer.workflow_id(),
                            step_id: step_id.clone(),
                        }));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridflow_core::{
        EventId, SequenceNumber, StepOutcome, TenantId, UserId, ValueRef, WorkflowId,
    };

    fn history(bodies: Vec<EventBody>) -> Vec<WorkflowEvent> {
        let workflow_id = WorkflowId::new();
        let tenant_id = TenantId::new();
        let user = UserId::new();
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| WorkflowEvent {
                event_id: EventId::new(),
                workflow_id,
                tenant_id,
                sequence_no: SequenceNumber::new(i as u64 + 1),
                performed_by: user,
                occurred_at: Utc::now(),
                body,
            })
            .collect()
    }

    fn completed(step: &str) -> EventBody {
        EventBody::StepCompleted {
            step_id: StepId::from(step),
            outcome: StepOutcome::Default,
            output: None,
        }
    }

    fn started(step: &str) -> EventBody {
        EventBody::StepStarted {
            step_id: StepId::from(step),
            input: ValueRef::default(),
        }
    }

    #[test]
    fn test_forward_path_after_target() {
        let history = history(vec![
            started("company_info"),
            completed("company_info"),
            started("portfolio"),
            completed("portfolio"),
            started("compliance"),
            completed("compliance"),
        ]);

        let path =
            SagaCoordinator::forward_path(&history, Some(&StepId::from("company_info")));
        assert_eq!(
            path,
            vec![StepId::from("portfolio"), StepId::from("compliance")]
        );
    }

    #[test]
    fn test_forward_path_excludes_compensated() {
        let history = history(vec![
            completed("company_info"),
            completed("portfolio"),
            EventBody::StepCompensated {
                step_id: StepId::from("portfolio"),
                compensated: true,
                error: None,
            },
        ]);

        let path =
            SagaCoordinator::forward_path(&history, Some(&StepId::from("company_info")));
        assert!(path.is_empty());
    }

    #[test]
    fn test_forward_path_uses_latest_completion() {
        // portfolio completed, was compensated, then re-completed: the
        // re-completion puts it back on the path.
        let history = history(vec![
            completed("company_info"),
            completed("portfolio"),
            EventBody::StepCompensated {
                step_id: StepId::from("portfolio"),
                compensated: true,
                error: None,
            },
            completed("portfolio"),
        ]);

        let path =
            SagaCoordinator::forward_path(&history, Some(&StepId::from("company_info")));
        assert_eq!(path, vec![StepId::from("portfolio")]);
    }

    #[test]
    fn test_forward_path_to_none_covers_everything() {
        let history = history(vec![completed("company_info"), completed("portfolio")]);
        let path = SagaCoordinator::forward_path(&history, None);
        assert_eq!(
            path,
            vec![StepId::from("company_info"), StepId::from("portfolio")]
        );
    }

    #[test]
    fn test_forward_path_nothing_between() {
        let history = history(vec![completed("company_info"), completed("portfolio")]);
        let path = SagaCoordinator::forward_path(&history, Some(&StepId::from("portfolio")));
        assert!(path.is_empty());
    }
}
