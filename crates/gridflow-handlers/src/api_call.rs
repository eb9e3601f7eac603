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

use crate::StepHandler;
use crate::context::HandlerContext;
use crate::error::{HandlerError, Result};
use crate::result::{StepExecution, ValidationOutcome};
use crate::retry::{ErrorClass, classify_report};
use crate::transport::{ProvisioningClient as _, ProvisioningRequest};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCallConfig {
    operation: String,
    #[serde(default)]
    payload: ValueRef,
    /// Counter-request issued during rollback. Absent means the target is
    /// idempotent and compensation is a no-op.
    #[serde(default)]
    compensation: Option<CompensationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompensationConfig {
    operation: String,
    #[serde(default)]
    payload: ValueRef,
}

/// External API call with bounded retries.
///
/// The request payload is the step's configured payload merged with the
/// submitted input; the idempotency key is stable across process restarts,
/// so a crash-recovery re-issue either observes the prior success or retries
/// safely.
#[derive(Default)]
pub struct ApiCallHandler;

impl ApiCallHandler {
    pub fn new() -> Self {
        Self
    }

    fn config(step: &StepDefinition) -> Result<ApiCallConfig> {
        serde_json::from_value(step.config.value().clone()).map_err(|e| {
            error_stack::report!(HandlerError::InvalidConfig {
                step_id: step.id.clone(),
            })
            .attach_printable(e.to_string())
        })
    }
}

impl StepHandler for ApiCallHandler {
    fn kind(&self) -> StepKind {
        StepKind::ApiCall
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
        let request = ProvisioningRequest {
            operation: config.operation.clone(),
            payload: config.payload.merged_with(&input),
            idempotency_key: ctx.idempotency_key().to_string(),
        };

        let mut side_events = vec![EventBody::ApiCallStarted {
            step_id: step.id.clone(),
            idempotency_key: request.idempotency_key.clone(),
        }];

        let policy = ctx.retry().clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match ctx.provisioning().call(request.clone()).await {
                Ok(response) => {
                    side_events.push(EventBody::ApiCallCompleted {
                        step_id: step.id.clone(),
                        response: response.clone(),
                    });
                    return Ok(StepExecution::Completed {
                        outcome: StepOutcome::Default,
                        output: Some(response),
                        side_events,
                    });
                }
                Err(report) => {
                    let transient = classify_report(&report) == ErrorClass::Transient;
                    if transient && policy.allows_retry(attempt) {
                        let delay = policy.backoff(attempt);
                        log::debug!(
                            "provisioning call '{}' attempt {attempt} failed; retrying in {delay:?}",
                            config.operation
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let error = ErrorDetail::new(
                        "ExternalFailure",
                        if transient {
                            format!(
                                "operation '{}' failed after {attempt} attempts: {report:?}",
                                config.operation
                            )
                        } else {
                            format!("operation '{}' failed permanently: {report:?}", config.operation)
                        },
                    );
                    side_events.push(EventBody::ApiCallFailed {
                        step_id: step.id.clone(),
                        error: error.clone(),
                    });
                    return Ok(StepExecution::Failed { error, side_events });
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

    async fn compensate(&self, step: &StepDefinition, ctx: &HandlerContext) -> Result<()> {
        let config = Self::config(step)?;
        let Some(compensation) = config.compensation else {
            // No counter-request configured: the target is idempotent.
            return Ok(());
        };

        let request = ProvisioningRequest {
            operation: compensation.operation,
            payload: compensation.payload,
            idempotency_key: format!("{}/compensate", ctx.idempotency_key()),
        };
        ctx.provisioning()
            .compensate(request)
            .await
            .map_err(|report| report.change_context(HandlerError::Transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testing::{MockProvisioningClient, test_context_with};
    use gridflow_core::StepId;
    use serde_json::json;

    fn api_step(compensation: bool) -> StepDefinition {
        let mut config = json!({
            "operation": "grid/provision-access",
            "payload": {"marketRole": "BRP"}
        });
        if compensation {
            config["compensation"] = json!({"operation": "grid/revoke-access"});
        }
        StepDefinition {
            id: StepId::from("provision"),
            name: "Provision access".to_string(),
            kind: StepKind::ApiCall,
            config: ValueRef::new(config),
            required: true,
            order: 3,
            allowed_transitions: vec![],
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_success_carries_response_and_events() {
        let step = api_step(false);
        let provisioning =
            MockProvisioningClient::succeeding(ValueRef::new(json!({"accessId": "ACC-1"})));
        let ctx = test_context_with(&step.id, fast_retry(), provisioning.clone());

        let result = handler_execute(&step, &ctx).await;
        let StepExecution::Completed {
            output, side_events, ..
        } = result
        else {
            panic!("expected completion");
        };
        assert_eq!(
            output.unwrap().get("accessId").and_then(|v| v.as_str()),
            Some("ACC-1")
        );
        assert!(matches!(side_events[0], EventBody::ApiCallStarted { .. }));
        assert!(matches!(side_events[1], EventBody::ApiCallCompleted { .. }));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let step = api_step(false);
        let provisioning = MockProvisioningClient::failing_times(
            2,
            ValueRef::new(json!({"accessId": "ACC-2"})),
        );
        let ctx = test_context_with(&step.id, fast_retry(), provisioning.clone());

        let result = handler_execute(&step, &ctx).await;
        assert!(matches!(result, StepExecution::Completed { .. }));
        assert_eq!(provisioning.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_step() {
        let step = api_step(false);
        let provisioning = MockProvisioningClient::always_transient();
        let ctx = test_context_with(&step.id, fast_retry(), provisioning.clone());

        let result = handler_execute(&step, &ctx).await;
        let StepExecution::Failed { error, side_events } = result else {
            panic!("expected failure");
        };
        assert_eq!(error.kind, "ExternalFailure");
        assert!(matches!(
            side_events.last(),
            Some(EventBody::ApiCallFailed { .. })
        ));
        assert_eq!(provisioning.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_retry() {
        let step = api_step(false);
        let provisioning = MockProvisioningClient::always_permanent();
        let ctx = test_context_with(&step.id, fast_retry(), provisioning.clone());

        let result = handler_execute(&step, &ctx).await;
        assert!(matches!(result, StepExecution::Failed { .. }));
        assert_eq!(provisioning.call_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_is_stable() {
        let step = api_step(false);
        let provisioning = MockProvisioningClient::succeeding(ValueRef::default());
        let ctx = test_context_with(&step.id, fast_retry(), provisioning.clone());

        handler_execute(&step, &ctx).await;
        handler_execute(&step, &ctx).await;

        let keys = provisioning.recorded_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn test_compensation_sends_counter_request() {
        let step = api_step(true);
        let provisioning = MockProvisioningClient::succeeding(ValueRef::default());
        let ctx = test_context_with(&step.id, fast_retry(), provisioning.clone());

        ApiCallHandler::new().compensate(&step, &ctx).await.unwrap();
        assert_eq!(provisioning.compensate_count(), 1);
    }

    #[tokio::test]
    async fn test_compensation_without_config_is_noop() {
        let step = api_step(false);
        let provisioning = MockProvisioningClient::succeeding(ValueRef::default());
        let ctx = test_context_with(&step.id, fast_retry(), provisioning.clone());

        ApiCallHandler::new().compensate(&step, &ctx).await.unwrap();
        assert_eq!(provisioning.compensate_count(), 0);
    }

    async fn handler_execute(step: &StepDefinition, ctx: &HandlerContext) -> StepExecution {
        ApiCallHandler::new()
            .execute(step, ValueRef::default(), ctx)
            .await
            .unwrap()
    }
}
