use crate::actor::Role;
use crate::tenant::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("actor with cross-tenant role '{role}' must not be bound to tenant {tenant_id}")]
    CrossTenantActorBoundToTenant { role: Role, tenant_id: TenantId },

    #[error("actor with tenant-bound role '{role}' has no tenant binding")]
    TenantActorWithoutTenant { role: Role },

    #[error("template '{name}' is invalid")]
    InvalidTemplate { name: String },

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = error_stack::Report<CoreError>> = std::result::Result<T, E>;
