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

//! Test fixtures for the engine: an in-memory harness wired to mock
//! transports, plus the reference BRP onboarding template.

use std::sync::Arc;

use gridflow_config::{EngineConfig, GridflowStores};
use gridflow_core::{
    Actor, MarketRole, OperationContext, Role, StepId, StepKind, Tenant, TenantId, TenantStatus,
    UserId, ValueRef, WorkflowTemplate, WorkflowTemplateBuilder,
};
use gridflow_handlers::testing::{MockNotificationTransport, MockProvisioningClient};
use gridflow_handlers::{DynNotificationTransport, DynProvisioningClient, RetryPolicy};
use gridflow_state::TenantStore as _;
use serde_json::json;

use crate::engine::{WorkflowEngine, WorkflowEngineBuilder};

/// The reference BRP onboarding template:
/// `company_info → portfolio → compliance → provision → notify`.
pub fn brp_template() -> WorkflowTemplate {
    WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, 1)
        .step(
            "company_info",
            "Company information",
            StepKind::Form,
            ValueRef::new(json!({
                "fields": [
                    {"name": "companyName", "required": true, "minLength": 2},
                    {"name": "vatNumber", "required": true, "pattern": "^BE[0-9]{10}$"}
                ]
            })),
            true,
            vec![StepId::from("portfolio")],
        )
        .step(
            "portfolio",
            "Portfolio registration",
            StepKind::Form,
            ValueRef::new(json!({
                "fields": [{"name": "accessPoints", "required": true, "minItems": 1}]
            })),
            true,
            vec![StepId::from("compliance")],
        )
        .step(
            "compliance",
            "Compliance review",
            StepKind::Approval,
            ValueRef::new(json!({
                "title": "Compliance review",
                "description": "Verify regulatory documents",
                "approvers": ["compliance@market.test"]
            })),
            true,
            vec![StepId::from("provision")],
        )
        .step(
            "provision",
            "Provision market access",
            StepKind::ApiCall,
            ValueRef::new(json!({
                "operation": "market/provision-access",
                "payload": {"marketRole": "BRP"},
                "compensation": {"operation": "market/revoke-access"}
            })),
            true,
            vec![StepId::from("notify")],
        )
        .step(
            "notify",
            "Notify applicant",
            StepKind::Notification,
            ValueRef::new(json!({
                "template": "onboarding-complete",
                "recipients": ["applicant@market.test"]
            })),
            false,
            vec![],
        )
        .build()
        .expect("reference template is valid")
}

/// Fully wired in-memory engine with mock transports.
pub struct TestHarness {
    pub engine: Arc<WorkflowEngine>,
    pub tenant_id: TenantId,
    pub template: Arc<WorkflowTemplate>,
    pub notifications: MockNotificationTransport,
    pub provisioning: MockProvisioningClient,
    pub stores: GridflowStores,
}

impl TestHarness {
    /// Harness with a provisioning mock that always succeeds.
    pub async fn new() -> Self {
        Self::with_provisioning(MockProvisioningClient::succeeding(ValueRef::new(
            json!({"accessId": "ACC-1"}),
        )))
        .await
    }

    /// Harness with a custom provisioning script.
    pub async fn with_provisioning(provisioning: MockProvisioningClient) -> Self {
        let stores = GridflowStores::in_memory();
        let notifications = MockNotificationTransport::delivering();

        let config = EngineConfig {
            // Fast retries keep failure-path tests quick.
            handler_retry: RetryPolicy {
                max_attempts: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
                jitter: false,
            },
            ..EngineConfig::default()
        };

        let engine = WorkflowEngineBuilder::new(stores.clone())
            .with_config(config)
            .with_notifications(Arc::from(DynNotificationTransport::boxed(
                notifications.clone(),
            )))
            .with_provisioning(Arc::from(DynProvisioningClient::boxed(provisioning.clone())))
            .build()
            .expect("engine builds");

        let ctx = market_ops_ctx();
        let template = engine
            .templates()
            .publish(&ctx, brp_template())
            .await
            .expect("template publishes");

        let tenant = Tenant {
            status: TenantStatus::Active,
            ..Tenant::new("Engie")
        };
        let tenant_id = tenant.id;
        stores.tenants.put(tenant).await.expect("tenant stored");

        Self {
            engine,
            tenant_id,
            template,
            notifications,
            provisioning,
            stores,
        }
    }

    /// An admin context bound to the harness tenant.
    pub fn admin_ctx(&self) -> OperationContext {
        tenant_admin_ctx(self.tenant_id)
    }
}

pub fn market_ops_ctx() -> OperationContext {
    OperationContext::new(Actor::market_ops(UserId::new(), "market-ops"))
}

pub fn tenant_admin_ctx(tenant_id: TenantId) -> OperationContext {
    OperationContext::new(
        Actor::new(UserId::new(), "tenant-admin", Role::TenantAdmin, Some(tenant_id))
            .expect("valid actor"),
    )
}

pub fn tenant_viewer_ctx(tenant_id: TenantId) -> OperationContext {
    OperationContext::new(
        Actor::new(UserId::new(), "tenant-viewer", Role::TenantViewer, Some(tenant_id))
            .expect("valid actor"),
    )
}

pub fn compliance_ctx(tenant_id: TenantId) -> OperationContext {
    OperationContext::new(
        Actor::new(
            UserId::new(),
            "compliance-reviewer",
            Role::ComplianceReviewer,
            Some(tenant_id),
        )
        .expect("valid actor"),
    )
}
