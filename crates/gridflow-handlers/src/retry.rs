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

//! Retry policy for external I/O: bounded attempts, exponential backoff,
//! jitter.
//!
//! Used by the `api_call` handler for forward execution and by the saga
//! coordinator for compensation attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Default maximum attempts (first try + retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base backoff duration.
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 250;

/// Default backoff ceiling.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Classification of an external failure for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Classify a transport error report.
pub fn classify_report(report: &error_stack::Report<TransportError>) -> ErrorClass {
    match report.current_context() {
        TransportError::Transient => ErrorClass::Transient,
        TransportError::Permanent => ErrorClass::Permanent,
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub base_backoff_ms: u64,
    /// Ceiling on the computed backoff, before jitter.
    pub max_backoff_ms: u64,
    /// Whether to add 0-50ms of jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based: the delay after the
    /// first failure is `backoff(1)`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base_backoff_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_backoff_ms);
        let jitter = if self.jitter { rand_jitter() } else { 0 };
        Duration::from_millis(capped + jitter)
    }

    /// Whether another attempt is allowed after `attempt` attempts failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Generates random jitter for backoff (0-50ms).
fn rand_jitter() -> u64 {
    // Simple linear congruential generator seeded from the clock
    // (avoids a rand dependency for this simple case)
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    (seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407)
        >> 33)
        % 51
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 400,
            jitter: false,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        // Capped.
        assert_eq!(policy.backoff(4), Duration::from_millis(400));
        assert_eq!(policy.backoff(40), Duration::from_millis(400));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff_ms: 100,
            max_backoff_ms: 100,
            jitter: true,
        };
        for _ in 0..32 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_classification() {
        let transient = error_stack::report!(TransportError::Transient);
        assert_eq!(classify_report(&transient), ErrorClass::Transient);

        let permanent = error_stack::report!(TransportError::Permanent);
        assert_eq!(classify_report(&permanent), ErrorClass::Permanent);
    }
}
