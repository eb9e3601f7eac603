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

//! Configuration surface for the gridflow engine.
//!
//! All knobs are plain serde structs with `#[serde(default)]` and constants
//! for the defaults, so a partial configuration file always deserializes.
//! [`StoreConfig`] additionally knows how to build the concrete store set.

mod engine_config;
mod storage_config;

pub use engine_config::{
    DEFAULT_BOOKMARK_EXPIRY_SECS, DEFAULT_EVENT_RETENTION_YEARS, DEFAULT_PROJECTION_MAX_LAG,
    DEFAULT_SNAPSHOT_INTERVAL, DEFAULT_STEP_TIMEOUT_SECS, EngineConfig,
};
pub use gridflow_state_sql::SqliteConfig;
pub use storage_config::{GridflowStores, StoreConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration")]
    Configuration,

    #[error("Failed to initialize storage backend")]
    Storage,
}

pub type Result<T, E = error_stack::Report<ConfigError>> = std::result::Result<T, E>;
