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

use gridflow_core::{StepDefinition, StepKind, StepOutcome, ValueRef};
use serde::Deserialize;

use crate::StepHandler;
use crate::context::HandlerContext;
use crate::error::{HandlerError, Result};
use crate::result::{StepExecution, ValidationOutcome};

/// One decision branch: taken when the inspected value equals `equals`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Branch {
    /// Dotted path into the accumulated data, e.g. `company_info.country`.
    field: String,
    equals: serde_json::Value,
    then: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionConfig {
    branches: Vec<Branch>,
    /// Branch taken when nothing matches.
    default: String,
}

/// Pure predicate over accumulated step data; completes with one of the
/// configured branch names as its outcome.
#[derive(Default)]
pub struct DecisionHandler;

impl DecisionHandler {
    pub fn new() -> Self {
        Self
    }

    fn config(step: &StepDefinition) -> Result<DecisionConfig> {
        serde_json::from_value(step.config.value().clone()).map_err(|e| {
            error_stack::report!(HandlerError::InvalidConfig {
                step_id: step.id.clone(),
            })
            .attach_printable(e.to_string())
        })
    }

    fn lookup<'a>(data: &'a ValueRef, path: &str) -> Option<&'a serde_json::Value> {
        let mut current = data.value();
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }
}

impl StepHandler for DecisionHandler {
    fn kind(&self) -> StepKind {
        StepKind::Decision
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
        let branch = config
            .branches
            .iter()
            .find(|b| Self::lookup(&input, &b.field).is_some_and(|v| *v == b.equals))
            .map(|b| b.then.clone())
            .unwrap_or(config.default);

        Ok(StepExecution::completed(StepOutcome::Branch(branch), None))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;
    use gridflow_core::StepId;
    use serde_json::json;

    fn decision_step() -> StepDefinition {
        StepDefinition {
            id: StepId::from("route"),
            name: "Route by country".to_string(),
            kind: StepKind::Decision,
            config: ValueRef::new(json!({
                "branches": [
                    {"field": "company_info.country", "equals": "BE", "then": "domestic"},
                ],
                "default": "foreign"
            })),
            required: false,
            order: 1,
            allowed_transitions: vec![],
        }
    }

    #[tokio::test]
    async fn test_matching_branch() {
        let step = decision_step();
        let ctx = test_context(&step.id);
        let result = DecisionHandler::new()
            .execute(
                &step,
                ValueRef::new(json!({"company_info": {"country": "BE"}})),
                &ctx,
            )
            .await
            .unwrap();
        let StepExecution::Completed { outcome, .. } = result else {
            panic!("expected completion");
        };
        assert_eq!(outcome, StepOutcome::Branch("domestic".to_string()));
    }

    #[tokio::test]
    async fn test_default_branch() {
        let step = decision_step();
        let ctx = test_context(&step.id);
        let result = DecisionHandler::new()
            .execute(
                &step,
                ValueRef::new(json!({"company_info": {"country": "FR"}})),
                &ctx,
            )
            .await
            .unwrap();
        let StepExecution::Completed { outcome, .. } = result else {
            panic!("expected completion");
        };
        assert_eq!(outcome, StepOutcome::Branch("foreign".to_string()));
    }
}
