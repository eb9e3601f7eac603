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

//! Per-workflow serialization of state-mutating operations.
//!
//! One async mutex per workflow id, acquired with a bounded wait. Handlers
//! performing long-lived I/O never run under this lock; the engine releases
//! it around handler dispatch and re-acquires for the completion write, with
//! the event store's optimistic sequence check as the backstop against
//! interleaved writers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridflow_core::WorkflowId;
use tokio::sync::OwnedMutexGuard;

use crate::error::EngineError;

/// Default bounded wait for the per-workflow lock.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Map of per-workflow async locks.
pub struct WorkflowLocks {
    locks: Mutex<HashMap<WorkflowId, Arc<tokio::sync::Mutex<()>>>>,
    acquire_timeout: Duration,
}

/// Holds the per-workflow lock until dropped.
#[derive(Debug)]
pub struct WorkflowLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl WorkflowLocks {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    /// Acquire the lock for `workflow_id`, waiting at most the configured
    /// timeout. A timed-out wait surfaces as [`EngineError::Conflict`]; the
    /// caller retries or propagates.
    pub async fn acquire(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowLockGuard, EngineError> {
        let lock = {
            let mut locks = self.locks.lock().expect("lock map poisoned");
            locks
                .entry(workflow_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        match tokio::time::timeout(self.acquire_timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(WorkflowLockGuard { _guard: guard }),
            Err(_) => Err(EngineError::Conflict { workflow_id }),
        }
    }

    /// Drop lock entries for workflows nothing currently holds.
    ///
    /// Called opportunistically by the expiry sweep so the map does not grow
    /// with every workflow ever touched.
    pub fn prune(&self) {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
    }
}

impl Default for WorkflowLocks {
    fn default() -> Self {
        Self::new(DEFAULT_ACQUIRE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_serializes_same_workflow() {
        let locks = Arc::new(WorkflowLocks::new(Duration::from_millis(50)));
        let workflow_id = WorkflowId::new();

        let guard = locks.acquire(workflow_id).await.unwrap();

        // Second acquire on the same workflow times out to Conflict.
        let err = locks.acquire(workflow_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));

        drop(guard);
        assert!(locks.acquire(workflow_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_different_workflows_do_not_contend() {
        let locks = WorkflowLocks::new(Duration::from_millis(50));
        let _a = locks.acquire(WorkflowId::new()).await.unwrap();
        let _b = locks.acquire(WorkflowId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = WorkflowLocks::new(Duration::from_millis(50));
        let held = WorkflowId::new();
        let released = WorkflowId::new();

        let guard = locks.acquire(held).await.unwrap();
        drop(locks.acquire(released).await.unwrap());

        locks.prune();

        // The held workflow still contends; the released one was pruned and
        // re-acquires freshly.
        assert!(locks.acquire(held).await.is_err());
        drop(guard);
        assert!(locks.acquire(released).await.is_ok());
    }
}
