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

use gridflow_handlers::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Default: a step handler may run for five minutes before timing out.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default: bookmarks expire after 14 days.
pub const DEFAULT_BOOKMARK_EXPIRY_SECS: u64 = 14 * 24 * 3600;

/// Default: alert when projections lag the event log by more than one event.
pub const DEFAULT_PROJECTION_MAX_LAG: u64 = 1;

/// Default: events are retained for seven years.
pub const DEFAULT_EVENT_RETENTION_YEARS: u32 = 7;

/// Default: the projector caches a replay snapshot every 100 events.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;

/// Engine-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Retry policy for external I/O handlers and compensations.
    pub handler_retry: RetryPolicy,

    /// Per-step start-to-close timeout in seconds. A handler exceeding it
    /// fails its step with a `Timeout` error; the step stays retryable.
    pub step_timeout_secs: u64,

    /// Default bookmark expiry in seconds. An expired bookmark fails its
    /// step with `BookmarkExpired`.
    pub bookmark_expiry_secs: u64,

    /// Alert threshold: projections lagging the event log by more than this
    /// many events trigger an operator alert.
    pub projection_max_lag_events: u64,

    /// Retention horizon for events, in years. Events outlive archived
    /// instances until this horizon passes.
    pub event_retention_years: u32,

    /// Interval (in events) at which the projector caches replay snapshots.
    /// Snapshots are an in-process optimization, never persisted.
    pub event_replay_snapshot_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handler_retry: RetryPolicy::default(),
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            bookmark_expiry_secs: DEFAULT_BOOKMARK_EXPIRY_SECS,
            projection_max_lag_events: DEFAULT_PROJECTION_MAX_LAG,
            event_retention_years: DEFAULT_EVENT_RETENTION_YEARS,
            event_replay_snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.step_timeout_secs)
    }

    pub fn bookmark_expiry(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.bookmark_expiry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_deserializes() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"stepTimeoutSecs": 60}"#).unwrap();
        assert_eq!(config.step_timeout_secs, 60);
        assert_eq!(config.event_retention_years, DEFAULT_EVENT_RETENTION_YEARS);
        assert_eq!(config.handler_retry, RetryPolicy::default());
    }

    #[test]
    fn test_defaults_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
