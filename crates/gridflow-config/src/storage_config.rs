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

use std::sync::Arc;

use error_stack::ResultExt as _;
use gridflow_state::{
    BookmarkStore, EventStore, InMemoryWorkflowStore, IndexStore, StateStore, TemplateStore,
    TenantStore,
};
use gridflow_state_sql::{SqliteConfig, SqliteWorkflowStore};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "camelCase")]
pub enum StoreConfig {
    /// Volatile, single-process store. Tests and local development.
    InMemory,
    /// SQLite-backed store.
    Sqlite(SqliteConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::InMemory
    }
}

/// The resolved store set the engine runs against.
///
/// All five handles may point at the same concrete store (they do for both
/// built-in backends); the engine only sees the traits, so deployments can
/// split the relational index from a document-oriented state/event backend
/// by providing their own implementations.
#[derive(Clone)]
pub struct GridflowStores {
    pub events: Arc<dyn EventStore>,
    pub state: Arc<dyn StateStore>,
    pub index: Arc<dyn IndexStore>,
    pub bookmarks: Arc<dyn BookmarkStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub tenants: Arc<dyn TenantStore>,
}

impl GridflowStores {
    /// An in-memory store set, mostly for tests.
    pub fn in_memory() -> Self {
        Self::from_shared(Arc::new(InMemoryWorkflowStore::new()))
    }

    fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: EventStore
            + StateStore
            + IndexStore
            + BookmarkStore
            + TemplateStore
            + TenantStore
            + 'static,
    {
        Self {
            events: store.clone(),
            state: store.clone(),
            index: store.clone(),
            bookmarks: store.clone(),
            templates: store.clone(),
            tenants: store,
        }
    }
}

impl StoreConfig {
    /// Build the concrete store set for this configuration.
    pub async fn create_stores(&self) -> Result<GridflowStores> {
        match self {
            StoreConfig::InMemory => Ok(GridflowStores::in_memory()),
            StoreConfig::Sqlite(sqlite_config) => {
                let store = SqliteWorkflowStore::new(sqlite_config.clone())
                    .await
                    .change_context(ConfigError::Storage)?;
                Ok(GridflowStores::from_shared(Arc::new(store)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_tag() {
        let config: StoreConfig = serde_json::from_str(r#"{"backend": "inMemory"}"#).unwrap();
        assert!(matches!(config, StoreConfig::InMemory));

        let config: StoreConfig = serde_json::from_str(
            r#"{"backend": "sqlite", "databaseUrl": "sqlite::memory:"}"#,
        )
        .unwrap();
        assert!(matches!(config, StoreConfig::Sqlite(_)));
    }

    #[tokio::test]
    async fn test_in_memory_store_set() {
        let stores = StoreConfig::InMemory.create_stores().await.unwrap();
        // All handles must resolve; a smoke call proves wiring.
        let latest = stores
            .events
            .latest_sequence(gridflow_core::WorkflowId::new())
            .await
            .unwrap();
        assert!(latest.is_none());
    }
}
