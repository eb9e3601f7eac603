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

//! Lifecycle laws: idempotent pause/resume, cancellation, terminal
//! finality, validation gates, and permission checks.

use gridflow_core::{
    EventType, MarketRole, StepId, TemplateRule, ValueRef, WorkflowStatus,
    WorkflowTemplateBuilder,
};
use gridflow_engine::testing::{
    TestHarness, market_ops_ctx, tenant_admin_ctx, tenant_viewer_ctx,
};
use gridflow_engine::EngineError;
use gridflow_state::{EventRange, EventStore as _, TenantStore as _};
use serde_json::json;

fn step(id: &str) -> StepId {
    StepId::from(id)
}

async fn started_workflow(h: &TestHarness) -> gridflow_core::WorkflowId {
    let ops = market_ops_ctx();
    let id = h
        .engine
        .create(&ops, h.tenant_id, MarketRole::Brp, None)
        .await
        .unwrap();
    h.engine
        .execute_step(
            &ops,
            id,
            step("company_info"),
            ValueRef::new(json!({"companyName": "Engie", "vatNumber": "BE0403170701"})),
        )
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn test_pause_is_idempotent() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();
    let id = started_workflow(&h).await;

    h.engine.pause(&ops, id).await.unwrap();
    h.engine.pause(&ops, id).await.unwrap();

    let events = h.engine.history(&ops, id, EventRange::all()).await.unwrap();
    let paused = events
        .iter()
        .filter(|e| e.event_type() == EventType::WorkflowPaused)
        .count();
    assert_eq!(paused, 1, "pause; pause must equal pause");

    h.engine.resume(&ops, id).await.unwrap();
    h.engine.resume(&ops, id).await.unwrap();

    let events = h.engine.history(&ops, id, EventRange::all()).await.unwrap();
    let resumed = events
        .iter()
        .filter(|e| e.event_type() == EventType::WorkflowResumed)
        .count();
    assert_eq!(resumed, 1, "resume; resume must equal resume");

    let instance = h.engine.get(&ops, id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::InProgress);
}

#[tokio::test]
async fn test_paused_workflow_rejects_execution() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();
    let id = started_workflow(&h).await;

    h.engine.pause(&ops, id).await.unwrap();
    let err = h
        .engine
        .execute_step(&ops, id, step("portfolio"), ValueRef::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::InvalidStatus {
            status: WorkflowStatus::Paused,
            ..
        }
    ));
}

#[tokio::test]
async fn test_create_then_cancel_history() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();

    let id = h
        .engine
        .create(&ops, h.tenant_id, MarketRole::Brp, None)
        .await
        .unwrap();
    h.engine.cancel(&ops, id, "duplicate request").await.unwrap();

    let events = h.engine.history(&ops, id, EventRange::all()).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![EventType::WorkflowCreated, EventType::WorkflowCancelled]
    );

    let instance = h.engine.get(&ops, id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Cancelled);
    assert!(instance.status.is_terminal());
}

#[tokio::test]
async fn test_terminal_workflows_admit_no_operations() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();

    let id = h
        .engine
        .create(&ops, h.tenant_id, MarketRole::Brp, None)
        .await
        .unwrap();
    h.engine.cancel(&ops, id, "abandoned").await.unwrap();
    let history_len = h
        .engine
        .history(&ops, id, EventRange::all())
        .await
        .unwrap()
        .len();

    assert!(h
        .engine
        .execute_step(&ops, id, step("company_info"), ValueRef::default())
        .await
        .is_err());
    assert!(h.engine.pause(&ops, id).await.is_err());
    assert!(h.engine.resume(&ops, id).await.is_err());
    assert!(h.engine.submit(&ops, id).await.is_err());
    assert!(h.engine.cancel(&ops, id, "again").await.is_err());
    assert!(h
        .engine
        .rollback(&ops, id, step("company_info"))
        .await
        .is_err());

    // No events of any kind were appended after the terminal one.
    let events = h.engine.history(&ops, id, EventRange::all()).await.unwrap();
    assert_eq!(events.len(), history_len);
}

#[tokio::test]
async fn test_validation_failure_keeps_step_and_records_event() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();

    let id = h
        .engine
        .create(&ops, h.tenant_id, MarketRole::Brp, None)
        .await
        .unwrap();
    let err = h
        .engine
        .execute_step(
            &ops,
            id,
            step("company_info"),
            ValueRef::new(json!({"companyName": "E"})),
        )
        .await
        .unwrap_err();

    let EngineError::Validation { errors, .. } = err.current_context() else {
        panic!("expected a validation error");
    };
    // Per-field list: short name and missing VAT number.
    assert_eq!(errors.len(), 2);

    let events = h.engine.history(&ops, id, EventRange::all()).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type() == EventType::ValidationFailed)
    );
    // The step never started.
    assert!(
        !events
            .iter()
            .any(|e| e.event_type() == EventType::StepStarted)
    );
}

#[tokio::test]
async fn test_submit_requires_validation() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();
    let id = started_workflow(&h).await;

    // Only company_info is complete; submit must fail and record it.
    let err = h.engine.submit(&ops, id).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::Validation { .. }
    ));

    let events = h.engine.history(&ops, id, EventRange::all()).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type() == EventType::ValidationFailed)
    );
}

#[tokio::test]
async fn test_zero_step_template_submission() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();

    // A zero-step template without the empty-submission rule.
    let strict = WorkflowTemplateBuilder::new("SA-onboarding", MarketRole::Sa, 1)
        .build()
        .unwrap();
    h.engine.templates().publish(&ops, strict).await.unwrap();

    let id = h
        .engine
        .create(&ops, h.tenant_id, MarketRole::Sa, None)
        .await
        .unwrap();
    let err = h.engine.submit(&ops, id).await.unwrap_err();
    let EngineError::Validation { errors, .. } = err.current_context() else {
        panic!("expected a validation error");
    };
    assert_eq!(errors[0].message, "no required step completed");

    // The same shape with the rule declared submits fine.
    let lenient = WorkflowTemplateBuilder::new("OPA-onboarding", MarketRole::Opa, 1)
        .rule(TemplateRule::AllowEmptySubmission)
        .build()
        .unwrap();
    h.engine.templates().publish(&ops, lenient).await.unwrap();

    let id = h
        .engine
        .create(&ops, h.tenant_id, MarketRole::Opa, None)
        .await
        .unwrap();
    h.engine.submit(&ops, id).await.unwrap();
    let instance = h.engine.get(&ops, id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Submitted);
}

#[tokio::test]
async fn test_viewer_cannot_execute() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();
    let id = h
        .engine
        .create(&ops, h.tenant_id, MarketRole::Brp, None)
        .await
        .unwrap();

    let viewer = tenant_viewer_ctx(h.tenant_id);
    let err = h
        .engine
        .execute_step(&viewer, id, step("company_info"), ValueRef::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::PermissionDenied { .. }
    ));

    // Reading is fine.
    assert!(h.engine.get(&viewer, id).await.is_ok());
}

#[tokio::test]
async fn test_approve_requires_market_ops() {
    let h = TestHarness::new().await;
    let admin = tenant_admin_ctx(h.tenant_id);
    let ops = market_ops_ctx();

    let id = h
        .engine
        .create(&ops, h.tenant_id, MarketRole::Brp, None)
        .await
        .unwrap();
    let err = h.engine.approve(&admin, id, None).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::PermissionDenied { .. }
    ));
}

#[tokio::test]
async fn test_create_for_inactive_tenant_fails() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();

    let dormant = gridflow_core::Tenant::new("Dormant");
    let dormant_id = dormant.id;
    h.stores.tenants.put(dormant).await.unwrap();

    let err = h
        .engine
        .create(&ops, dormant_id, MarketRole::Brp, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::TenantInactive { .. }
    ));
}

#[tokio::test]
async fn test_bookmark_consumed_exactly_once() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();
    let id = started_workflow(&h).await;
    h.engine
        .execute_step(
            &ops,
            id,
            step("portfolio"),
            ValueRef::new(json!({"accessPoints": ["EAN-1"]})),
        )
        .await
        .unwrap();
    let r = h
        .engine
        .execute_step(&ops, id, step("compliance"), ValueRef::default())
        .await
        .unwrap();
    let gridflow_engine::ExecutionDisposition::Suspended(bookmark_id) = r.disposition else {
        panic!("expected suspension");
    };

    h.engine
        .resume_bookmark(&ops, id, bookmark_id, ValueRef::new(json!({"approved": true})))
        .await
        .unwrap();

    let err = h
        .engine
        .resume_bookmark(&ops, id, bookmark_id, ValueRef::new(json!({"approved": true})))
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::BookmarkAlreadyConsumed { .. }
    ));

    // Exactly one resume event for the bookmark exists.
    let events = h.engine.history(&ops, id, EventRange::all()).await.unwrap();
    let resumes = events
        .iter()
        .filter(|e| {
            matches!(
                &e.body,
                gridflow_core::EventBody::StepResumed { bookmark_id: b, .. }
                    if *b == bookmark_id.as_uuid()
            )
        })
        .count();
    assert_eq!(resumes, 1);
}

#[tokio::test]
async fn test_rollback_target_must_be_completed() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();
    let id = started_workflow(&h).await;

    let err = h
        .engine
        .rollback(&ops, id, step("portfolio"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn test_delete_only_for_cancelled() {
    let h = TestHarness::new().await;
    let ops = market_ops_ctx();
    let id = started_workflow(&h).await;

    let err = h.engine.delete(&ops, id).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::InvalidStatus { .. }
    ));

    h.engine.cancel(&ops, id, "abandoned").await.unwrap();
    h.engine.delete(&ops, id).await.unwrap();

    // The instance document is gone, but events are retained.
    let err = h.engine.get(&ops, id).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::WorkflowNotFound { .. }
    ));
    let events = h.stores.events.get_events(id, EventRange::all()).await.unwrap();
    assert!(!events.is_empty());
}
