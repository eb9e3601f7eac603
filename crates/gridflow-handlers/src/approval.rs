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
    BookmarkKind, EventBody, StepDefinition, StepKind, StepOutcome, ValueRef,
};
use serde::Deserialize;
use serde_json::json;

use crate::StepHandler;
use crate::context::HandlerContext;
use crate::error::{HandlerError, Result};
use crate::result::{BookmarkRequest, StepExecution, ValidationOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalConfig {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    approvers: Vec<String>,
}

/// Asynchronous approval step.
///
/// `execute` announces the approval request and suspends on an approval
/// bookmark; the decision arrives through `on_resume` with an `approved`
/// flag, optional comments, and (for rejections) an optional step to
/// return the workflow to.
///
/// Compensation is a no-op: granting an approval authorizes downstream
/// steps, and reversing those is the downstream compensations' job.
#[derive(Default)]
pub struct ApprovalHandler;

impl ApprovalHandler {
    pub fn new() -> Self {
        Self
    }

    fn config(step: &StepDefinition) -> Result<ApprovalConfig> {
        serde_json::from_value(step.config.value().clone()).map_err(|e| {
            error_stack::report!(HandlerError::InvalidConfig {
                step_id: step.id.clone(),
            })
            .attach_printable(e.to_string())
        })
    }
}

impl StepHandler for ApprovalHandler {
    fn kind(&self) -> StepKind {
        StepKind::Approval
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
        let config = Self::config(step)?;
        let request = BookmarkRequest::new(
            BookmarkKind::Approval,
            ValueRef::new(json!({
                "approved": "boolean",
                "comments": "string?",
                "returnTo": "string?",
            })),
        )
        .with_announcement(EventBody::ApprovalRequested {
            step_id: step.id.clone(),
            title: config.title,
            description: config.description,
            approvers: config.approvers,
        });
        Ok(StepExecution::Suspended(request))
    }

    async fn on_resume(
        &self,
        step: &StepDefinition,
        payload: ValueRef,
        _ctx: &HandlerContext,
    ) -> Result<StepExecution> {
        let approved = payload
            .get("approved")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| {
                error_stack::report!(HandlerError::MissingResumePayload {
                    step_id: step.id.clone(),
                    field: "approved".to_string(),
                })
            })?;

        let outcome = if approved {
            StepOutcome::Approved
        } else {
            StepOutcome::Rejected
        };
        Ok(StepExecution::completed(outcome, Some(payload)))
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

    fn approval_step() -> StepDefinition {
        StepDefinition {
            id: StepId::from("compliance"),
            name: "Compliance review".to_string(),
            kind: StepKind::Approval,
            config: ValueRef::new(json!({
                "title": "Compliance review",
                "description": "Verify regulatory documents",
                "approvers": ["compliance@example.test"]
            })),
            required: true,
            order: 2,
            allowed_transitions: vec![],
        }
    }

    #[tokio::test]
    async fn test_execute_suspends_with_announcement() {
        let handler = ApprovalHandler::new();
        let step = approval_step();
        let ctx = test_context(&step.id);

        let result = handler.execute(&step, ValueRef::default(), &ctx).await.unwrap();
        let StepExecution::Suspended(request) = result else {
            panic!("expected suspension");
        };
        assert_eq!(request.kind, BookmarkKind::Approval);
        assert!(matches!(
            request.announcement,
            Some(EventBody::ApprovalRequested { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_approved() {
        let handler = ApprovalHandler::new();
        let step = approval_step();
        let ctx = test_context(&step.id);

        let result = handler
            .on_resume(&step, ValueRef::new(json!({"approved": true})), &ctx)
            .await
            .unwrap();
        let StepExecution::Completed { outcome, .. } = result else {
            panic!("expected completion");
        };
        assert_eq!(outcome, StepOutcome::Approved);
    }

    #[tokio::test]
    async fn test_resume_rejected() {
        let handler = ApprovalHandler::new();
        let step = approval_step();
        let ctx = test_context(&step.id);

        let result = handler
            .on_resume(
                &step,
                ValueRef::new(json!({"approved": false, "returnTo": "portfolio"})),
                &ctx,
            )
            .await
            .unwrap();
        let StepExecution::Completed { outcome, output, .. } = result else {
            panic!("expected completion");
        };
        assert_eq!(outcome, StepOutcome::Rejected);
        assert_eq!(
            output.unwrap().get("returnTo").and_then(|v| v.as_str()),
            Some("portfolio")
        );
    }

    #[tokio::test]
    async fn test_resume_without_decision_fails() {
        let handler = ApprovalHandler::new();
        let step = approval_step();
        let ctx = test_context(&step.id);

        let err = handler
            .on_resume(&step, ValueRef::new(json!({})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            HandlerError::MissingResumePayload { .. }
        ));
    }
}
