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

use gridflow_core::{BookmarkKind, StepDefinition, StepKind, StepOutcome, ValueRef};

use crate::StepHandler;
use crate::context::HandlerContext;
use crate::error::Result;
use crate::result::{BookmarkRequest, StepExecution, ValidationOutcome};

/// Opaque human task: suspends until an explicit completion signal arrives,
/// then records whatever payload the signal carried.
#[derive(Default)]
pub struct ManualHandler;

impl ManualHandler {
    pub fn new() -> Self {
        Self
    }
}

impl StepHandler for ManualHandler {
    fn kind(&self) -> StepKind {
        StepKind::Manual
    }

    fn validate(&self, _step: &StepDefinition, _data: &ValueRef) -> ValidationOutcome {
        ValidationOutcome::ok()
    }

    async fn execute(
        &self,
        step: &StepDefinition,
        _input: ValueRef,
        _ctx: &HandlerContext,
    ) -> Result<StepExecution> {
        // The expected payload shape is whatever the template declares; the
        // task itself is opaque to the engine.
        Ok(StepExecution::Suspended(BookmarkRequest::new(
            BookmarkKind::Form,
            step.config.clone(),
        )))
    }

    async fn on_resume(
        &self,
        _step: &StepDefinition,
        payload: ValueRef,
        _ctx: &HandlerContext,
    ) -> Result<StepExecution> {
        Ok(StepExecution::completed(
            StepOutcome::Default,
            Some(payload),
        ))
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

    #[tokio::test]
    async fn test_suspends_then_completes_with_payload() {
        let step = StepDefinition {
            id: StepId::from("site_visit"),
            name: "Site visit".to_string(),
            kind: StepKind::Manual,
            config: ValueRef::new(json!({"report": "string"})),
            required: false,
            order: 0,
            allowed_transitions: vec![],
        };
        let ctx = test_context(&step.id);
        let handler = ManualHandler::new();

        let result = handler.execute(&step, ValueRef::default(), &ctx).await.unwrap();
        let StepExecution::Suspended(request) = result else {
            panic!("expected suspension");
        };
        assert_eq!(request.kind, BookmarkKind::Form);

        let resumed = handler
            .on_resume(&step, ValueRef::new(json!({"report": "all good"})), &ctx)
            .await
            .unwrap();
        let StepExecution::Completed { output, .. } = resumed else {
            panic!("expected completion");
        };
        assert_eq!(
            output.unwrap().get("report").and_then(|v| v.as_str()),
            Some("all good")
        );
    }
}
