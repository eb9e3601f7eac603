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

use gridflow_core::{
    ErrorDetail, EventBody, FieldError, StepDefinition, StepKind, StepOutcome, ValueRef,
};
use serde::Deserialize;

use crate::StepHandler;
use crate::context::HandlerContext;
use crate::error::{HandlerError, Result};
use crate::result::{StepExecution, ValidationOutcome};

/// One aggregate validation rule over accumulated step data.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateRule {
    /// The step whose data the rule inspects.
    step: String,
    field: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ValidationConfig {
    rules: Vec<AggregateRule>,
}

/// Aggregate validation over accumulated step data.
///
/// The engine passes the accumulated data as input: an object keyed by step
/// id. Outcome is `passed` or `failed`; failure records the field errors
/// without advancing workflow state.
#[derive(Default)]
pub struct ValidationHandler;

impl ValidationHandler {
    pub fn new() -> Self {
        Self
    }

    fn config(step: &StepDefinition) -> Result<ValidationConfig> {
        serde_json::from_value(step.config.value().clone()).map_err(|e| {
            error_stack::report!(HandlerError::InvalidConfig {
                step_id: step.id.clone(),
            })
            .attach_printable(e.to_string())
        })
    }

    fn check(rule: &AggregateRule, accumulated: &ValueRef) -> Option<FieldError> {
        let field_path = format!("{}.{}", rule.step, rule.field);
        let value = accumulated
            .get(&rule.step)
            .and_then(|step_data| step_data.get(&rule.field));

        let Some(value) = value.filter(|v| !v.is_null()) else {
            return Some(FieldError::new(
                &field_path,
                rule.message
                    .clone()
                    .unwrap_or_else(|| "field is required".to_string()),
            ));
        };

        if let Some(pattern) = &rule.pattern {
            let matches = value
                .as_str()
                .zip(regex::Regex::new(pattern).ok())
                .is_some_and(|(s, re)| re.is_match(s));
            if !matches {
                return Some(FieldError::new(
                    &field_path,
                    rule.message
                        .clone()
                        .unwrap_or_else(|| format!("does not match pattern '{pattern}'")),
                ));
            }
        }
        None
    }
}

impl StepHandler for ValidationHandler {
    fn kind(&self) -> StepKind {
        StepKind::Validation
    }

    fn validate(&self, _step: &StepDefinition, _data: &ValueRef) -> ValidationOutcome {
        ValidationOutcome::ok()
    }

    async fn execute(
        &self,
        step: &StepDefinition,
        input: ValueRef,
        _ctx: &HandlerContext,
    ) -> Result<StepExecution> {
        let config = Self::config(step)?;
        let errors: Vec<FieldError> = config
            .rules
            .iter()
            .filter_map(|rule| Self::check(rule, &input))
            .collect();

        if errors.is_empty() {
            Ok(StepExecution::Completed {
                outcome: StepOutcome::Passed,
                output: None,
                side_events: vec![EventBody::ValidationPassed {
                    step_id: Some(step.id.clone()),
                }],
            })
        } else {
            Ok(StepExecution::Failed {
                error: ErrorDetail::new("Validation", "aggregate validation failed"),
                side_events: vec![EventBody::ValidationFailed {
                    step_id: Some(step.id.clone()),
                    errors,
                }],
            })
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
        Ok(())
    }
}
