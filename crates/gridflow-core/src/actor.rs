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

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::tenant::TenantId;

/// Identifier of a user principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role an actor holds when performing an operation.
///
/// `MarketOps` is the only cross-tenant role; every other role is bound to
/// exactly one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    MarketOps,
    TenantAdmin,
    TenantOperator,
    TenantViewer,
    ComplianceReviewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::MarketOps => "market_ops",
            Role::TenantAdmin => "tenant_admin",
            Role::TenantOperator => "tenant_operator",
            Role::TenantViewer => "tenant_viewer",
            Role::ComplianceReviewer => "compliance_reviewer",
        }
    }

    pub fn is_cross_tenant(&self) -> bool {
        matches!(self, Role::MarketOps)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operations an actor can be authorized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    WorkflowCreate,
    WorkflowExecute,
    WorkflowRead,
    WorkflowSubmit,
    WorkflowRollback,
    WorkflowCancel,
    WorkflowApprove,
    ApprovalRespond,
    TemplatePublish,
}

/// The principal an operation is performed on behalf of.
///
/// Constructed through [`Actor::new`], which enforces the tenant-binding
/// invariant: a `market_ops` actor carries no tenant, every other role
/// carries exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub tenant_id: Option<TenantId>,
}

impl Actor {
    pub fn new(
        user_id: UserId,
        display_name: impl Into<String>,
        role: Role,
        tenant_id: Option<TenantId>,
    ) -> Result<Self, CoreError> {
        match (role.is_cross_tenant(), tenant_id) {
            (true, Some(tenant_id)) => Err(CoreError::CrossTenantActorBoundToTenant {
                role,
                tenant_id,
            }),
            (false, None) => Err(CoreError::TenantActorWithoutTenant { role }),
            _ => Ok(Self {
                user_id,
                display_name: display_name.into(),
                role,
                tenant_id,
            }),
        }
    }

    /// Convenience constructor for the cross-tenant operations role.
    pub fn market_ops(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            role: Role::MarketOps,
            tenant_id: None,
        }
    }

    /// Whether this actor is authorized for `permission`.
    ///
    /// Tenant visibility is a separate question answered by
    /// [`TenantScope`](crate::TenantScope); this only covers the role's
    /// capability set.
    pub fn can(&self, permission: Permission) -> bool {
        use Permission::*;
        match self.role {
            Role::MarketOps => true,
            Role::TenantAdmin => matches!(
                permission,
                WorkflowCreate
                    | WorkflowExecute
                    | WorkflowRead
                    | WorkflowSubmit
                    | WorkflowRollback
                    | WorkflowCancel
            ),
            Role::TenantOperator => {
                matches!(permission, WorkflowCreate | WorkflowExecute | WorkflowRead)
            }
            Role::TenantViewer => matches!(permission, WorkflowRead),
            Role::ComplianceReviewer => matches!(permission, WorkflowRead | ApprovalRespond),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_ops_must_not_bind_tenant() {
        let err = Actor::new(
            UserId::new(),
            "ops",
            Role::MarketOps,
            Some(TenantId::new()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::CrossTenantActorBoundToTenant { .. }
        ));
    }

    #[test]
    fn test_tenant_role_requires_tenant() {
        let err = Actor::new(UserId::new(), "admin", Role::TenantAdmin, None).unwrap_err();
        assert!(matches!(err, CoreError::TenantActorWithoutTenant { .. }));
    }

    #[test]
    fn test_valid_bindings() {
        assert!(Actor::new(UserId::new(), "ops", Role::MarketOps, None).is_ok());
        assert!(
            Actor::new(
                UserId::new(),
                "admin",
                Role::TenantAdmin,
                Some(TenantId::new())
            )
            .is_ok()
        );
    }

    #[test]
    fn test_permissions_by_role() {
        let tenant = TenantId::new();
        let viewer = Actor::new(UserId::new(), "v", Role::TenantViewer, Some(tenant)).unwrap();
        assert!(viewer.can(Permission::WorkflowRead));
        assert!(!viewer.can(Permission::WorkflowExecute));

        let admin = Actor::new(UserId::new(), "a", Role::TenantAdmin, Some(tenant)).unwrap();
        assert!(admin.can(Permission::WorkflowRollback));
        assert!(!admin.can(Permission::WorkflowApprove));

        let ops = Actor::market_ops(UserId::new(), "ops");
        assert!(ops.can(Permission::WorkflowApprove));
        assert!(ops.can(Permission::TemplatePublish));
    }
}
