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

use gridflow_core::{ErrorDetail, EventBody, StepDefinition, StepKind, StepOutcome, ValueRef};
use serde::Deserialize;
use serde_json::json;

use crate::StepHandler;
use crate::context::HandlerContext;
use crate::error::{HandlerError, Result};
use crate::result::{StepExecution, ValidationOutcome};
use crate::transport::NotificationTransport as _;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationConfig {
    template: String,
    recipients: Vec<String>,
    #[serde(default)]
    variables: ValueRef,
    /// When set, a failed send fails the step instead of being recorded
    /// best-effort.
    #[serde(default)]
    required_delivery: bool,
}

/// Synchronous best-effort notification send.
#[derive(Default)]
pub struct NotificationHandler;

impl NotificationHandler {
    pub fn new() -> Self {
        Self
    }

    fn config(step: &StepDefinition) -> Result<NotificationConfig> {
        serde_json::from_value(step.config.value().clone()).map_err(|e| {
            error_stack::report!(HandlerError::InvalidConfig {
                step_id: step.id.clone(),
            })
            .attach_printable(e.to_string())
        })
    }
}

impl StepHandler for NotificationHandler {
    fn kind(&self) -> StepKind {
        StepKind::Notification
    }

    fn validate(&self, _step: &StepDefinition, _data: &ValueRef) -> ValidationOutcome {
        ValidationOutcome::ok()
    }

    async fn execute(
        &self,
        step: &StepDefinition,
        input: ValueRef,
        ctx: &HandlerContext,
    ) -> Result<StepExecution> {
        let config = Self::config(step)?;
        let variables = config.variables.merged_with(&input);

        match ctx
            .notifications()
            .send(&config.template, &config.recipients, variables)
            .await
        {
            Ok(receipt) => {
                let side_events = vec![EventBody::NotificationSent {
                    step_id: step.id.clone(),
                    recipients: config.recipients.clone(),
                    message_id: receipt.message_id.clone(),
                }];
                Ok(StepExecution::Completed {
                    outcome: StepOutcome::Default,
                    output: Some(ValueRef::new(json!({
                        "delivered": receipt.delivered,
                        "messageId": receipt.message_id,
                    }))),
                    side_events,
                })
            }
            Err(report) => {
                let error = ErrorDetail::new(
                    "ExternalFailure",
                    format!("notification '{}' failed: {report:?}", config.template),
                );
                let side_events = vec![EventBody::NotificationFailed {
                    step_id: step.id.clone(),
                    error: error.clone(),
                }];
                if config.required_delivery {
                    Ok(StepExecution::Failed { error, side_events })
                } else {
                    log::warn!(
                        "notification '{}' failed; continuing (delivery not required)",
                        config.template
                    );
                    Ok(StepExecution::Completed {
                        outcome: StepOutcome::Default,
                        output: None,
                        side_events,
                    })
                }
            }
        }
    }

    async fn on_resume(
        &self,
        step: &StepDefinition,
        _payload: ValueRef,
        _ctx: &HandlerContext,
    ) -> Result<StepExecution> {
        Err(error_stack::report!(HandlerError::UnexpectedResume {
            step_id: step.id.clone(),
        }))
    }

    async fn compensate(&self, _step: &StepDefinition, _ctx: &HandlerContext) -> Result<()> {
        // A sent notification cannot be unsent.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockNotificationTransport, test_context_with_notifications};
    use gridflow_core::StepId;

    fn notify_step(required_delivery: bool) -> StepDefinition {
        StepDefinition {
            id: StepId::from("notify"),
            name: "Notify applicant".to_string(),
            kind: StepKind::Notification,
            config: ValueRef::new(json!({
                "template": "onboarding-complete",
                "recipients": ["ops@example.test"],
                "requiredDelivery": required_delivery,
            })),
            required: false,
            order: 4,
            allowed_transitions: vec![],
        }
    }

    #[tokio::test]
    async fn test_send_records_receipt() {
        let step = notify_step(false);
        let transport = MockNotificationTransport::delivering();
        let ctx = test_context_with_notifications(&step.id, transport.clone());

        let result = NotificationHandler::new()
            .execute(&step, ValueRef::default(), &ctx)
            .await
            .unwrap();
        let StepExecution::Completed { side_events, .. } = result else {
            panic!("expected completion");
        };
        assert!(matches!(side_events[0], EventBody::NotificationSent { .. }));
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_best_effort_failure_completes_step() {
        let step = notify_step(false);
        let transport = MockNotificationTransport::failing();
        let ctx = test_context_with_notifications(&step.id, transport);

        let result = NotificationHandler::new()
            .execute(&step, ValueRef::default(), &ctx)
            .await
            .unwrap();
        let StepExecution::Completed { side_events, .. } = result else {
            panic!("best-effort failure must not fail the step");
        };
        assert!(matches!(
            side_events[0],
            EventBody::NotificationFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_required_delivery_failure_fails_step() {
        let step = notify_step(true);
        let transport = MockNotificationTransport::failing();
        let ctx = test_context_with_notifications(&step.id, transport);

        let result = NotificationHandler::new()
            .execute(&step, ValueRef::default(), &ctx)
            .await
            .unwrap();
        assert!(matches!(result, StepExecution::Failed { .. }));
    }
}
