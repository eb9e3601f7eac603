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

//! Process-wide template cache over the template store.
//!
//! Templates are immutable once published, so the cache never invalidates:
//! publication of a new version adds an entry, it does not change one.

use std::collections::HashMap;
use std::sync::Arc;

use error_stack::ResultExt as _;
use gridflow_core::{
    MarketRole, OperationContext, Permission, TemplateId, WorkflowTemplate,
};
use gridflow_state::TemplateStore;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};

type TemplateKey = (MarketRole, u32);

pub struct TemplateRegistry {
    store: Arc<dyn TemplateStore>,
    cache: RwLock<HashMap<TemplateKey, Arc<WorkflowTemplate>>>,
    by_id: RwLock<HashMap<TemplateId, Arc<WorkflowTemplate>>>,
}

impl TemplateRegistry {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
        }
    }

    /// Publish a template.
    ///
    /// Graph validation happened at construction
    /// ([`WorkflowTemplateBuilder`](gridflow_core::WorkflowTemplateBuilder));
    /// this enforces the permission, writes through the store, and warms the
    /// cache.
    pub async fn publish(
        &self,
        ctx: &OperationContext,
        template: WorkflowTemplate,
    ) -> Result<Arc<WorkflowTemplate>> {
        if !ctx.actor().can(Permission::TemplatePublish) {
            return Err(error_stack::report!(EngineError::PermissionDenied {
                operation: "publish a template",
            }));
        }

        self.store
            .put(template.clone())
            .await
            .change_context(EngineError::Internal)?;

        let template = Arc::new(template);
        self.insert_cached(template.clone()).await;
        log::info!(
            "published template '{}' for {} v{}",
            template.name,
            template.market_role,
            template.version
        );
        Ok(template)
    }

    /// Fetch a template by `(market_role, version)`, cache-through.
    pub async fn load(
        &self,
        market_role: MarketRole,
        version: u32,
    ) -> Result<Arc<WorkflowTemplate>> {
        if let Some(template) = self.cache.read().await.get(&(market_role, version)) {
            return Ok(template.clone());
        }

        let template = self
            .store
            .get(market_role, version)
            .await
            .change_context(EngineError::Internal)?
            .ok_or(EngineError::TemplateNotFound { market_role })?;
        self.insert_cached(template.clone()).await;
        Ok(template)
    }

    /// Fetch a template by id, cache-through.
    pub async fn load_by_id(&self, template_id: TemplateId) -> Result<Arc<WorkflowTemplate>> {
        if let Some(template) = self.by_id.read().await.get(&template_id) {
            return Ok(template.clone());
        }

        let template = self
            .store
            .get_by_id(template_id)
            .await
            .change_context(EngineError::Internal)?
            .ok_or(EngineError::Internal)
            .attach_printable_lazy(|| format!("template {template_id} referenced but missing"))?;
        self.insert_cached(template.clone()).await;
        Ok(template)
    }

    /// The highest published version for a market role.
    pub async fn latest(&self, market_role: MarketRole) -> Result<Arc<WorkflowTemplate>> {
        // Always asks the store: "latest" changes with every publication,
        // including publications from other processes.
        let template = self
            .store
            .latest(market_role)
            .await
            .change_context(EngineError::Internal)?
            .ok_or(EngineError::TemplateNotFound { market_role })?;
        self.insert_cached(template.clone()).await;
        Ok(template)
    }

    async fn insert_cached(&self, template: Arc<WorkflowTemplate>) {
        self.cache
            .write()
            .await
            .insert((template.market_role, template.version), template.clone());
        self.by_id.write().await.insert(template.id, template);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{Actor, StepKind, UserId, ValueRef, WorkflowTemplateBuilder};
    use gridflow_state::InMemoryWorkflowStore;

    fn template(version: u32) -> WorkflowTemplate {
        WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, version)
            .step("a", "A", StepKind::Form, ValueRef::default(), true, vec![])
            .build()
            .unwrap()
    }

    fn ops_ctx() -> OperationContext {
        OperationContext::new(Actor::market_ops(UserId::new(), "ops"))
    }

    #[tokio::test]
    async fn test_publish_and_load() {
        let registry = TemplateRegistry::new(Arc::new(InMemoryWorkflowStore::new()));
        let published = registry.publish(&ops_ctx(), template(1)).await.unwrap();

        let loaded = registry.load(MarketRole::Brp, 1).await.unwrap();
        assert_eq!(loaded.id, published.id);

        let by_id = registry.load_by_id(published.id).await.unwrap();
        assert_eq!(by_id.version, 1);
    }

    #[tokio::test]
    async fn test_latest_tracks_new_versions() {
        let registry = TemplateRegistry::new(Arc::new(InMemoryWorkflowStore::new()));
        registry.publish(&ops_ctx(), template(1)).await.unwrap();
        assert_eq!(registry.latest(MarketRole::Brp).await.unwrap().version, 1);

        registry.publish(&ops_ctx(), template(2)).await.unwrap();
        assert_eq!(registry.latest(MarketRole::Brp).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_publish_requires_permission() {
        let registry = TemplateRegistry::new(Arc::new(InMemoryWorkflowStore::new()));
        let tenant = gridflow_core::TenantId::new();
        let ctx = OperationContext::new(
            Actor::new(
                UserId::new(),
                "admin",
                gridflow_core::Role::TenantAdmin,
                Some(tenant),
            )
            .unwrap(),
        );

        let err = registry.publish(&ctx, template(1)).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            EngineError::PermissionDenied { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_template() {
        let registry = TemplateRegistry::new(Arc::new(InMemoryWorkflowStore::new()));
        let err = registry.load(MarketRole::Tso, 1).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            EngineError::TemplateNotFound {
                market_role: MarketRole::Tso,
            }
        ));
    }
}
