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

//! Projection of the event log into the state document and index row.
//!
//! The event append is the commit point; the writes here are idempotent
//! caches that may lag and may be rebuilt at any time. `project_to_latest`
//! is the repair path: full (snapshot-accelerated) replay, force-written
//! over whatever the stores hold.
//!
//! Snapshots are kept only in process memory, keyed by sequence number.
//! Because the log is append-only (rollback appends compensation events
//! rather than truncating), a cached snapshot can never disagree with the
//! log, and replay from a snapshot equals replay from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use error_stack::ResultExt as _;
use gridflow_core::{
    OperationContext, WorkflowEvent, WorkflowId, WorkflowInstance, WorkflowTemplate,
};
use gridflow_state::{EventRange, EventStore, IndexRow, IndexStore, StateStore};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::registry::TemplateRegistry;

pub struct Projector {
    events: Arc<dyn EventStore>,
    state: Arc<dyn StateStore>,
    index: Arc<dyn IndexStore>,
    registry: Arc<TemplateRegistry>,
    snapshot_interval: u64,
    max_lag_events: u64,
    snapshots: Mutex<HashMap<WorkflowId, WorkflowInstance>>,
}

impl Projector {
    pub fn new(
        events: Arc<dyn EventStore>,
        state: Arc<dyn StateStore>,
        index: Arc<dyn IndexStore>,
        registry: Arc<TemplateRegistry>,
        snapshot_interval: u64,
        max_lag_events: u64,
    ) -> Self {
        Self {
            events,
            state,
            index,
            registry,
            snapshot_interval: snapshot_interval.max(1),
            max_lag_events,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Write the projections for an instance the caller already folded
    /// events into.
    ///
    /// Failures are logged, not propagated: the events are committed, and
    /// the recovery path reprojects from the log. Callers hold the
    /// per-workflow lock.
    pub async fn write_through(&self, instance: &WorkflowInstance, expected_version: u64) {
        if let Err(report) = self.state.update(instance.clone(), expected_version).await {
            log::error!(
                "state projection for workflow {} lagged at seq {}: {report:?}",
                instance.id,
                instance.projected_seq
            );
        }
        if let Err(report) = self
            .index
            .update_status(
                instance.id,
                instance.status,
                instance.current_step_id.clone(),
            )
            .await
        {
            log::error!("index projection for workflow {} lagged: {report:?}", instance.id);
        }

        self.maybe_snapshot(instance).await;
    }

    /// Rebuild both projections from the event log.
    ///
    /// Used by recovery and lag repair. Replay starts from the cached
    /// snapshot when one exists and applies only the suffix.
    pub async fn project_to_latest(
        &self,
        ctx: &OperationContext,
        workflow_id: WorkflowId,
        template: &WorkflowTemplate,
    ) -> Result<WorkflowInstance> {
        let events = self
            .events
            .get_events(workflow_id, EventRange::all())
            .await
            .change_context(EngineError::Internal)?;
        if events.is_empty() {
            return Err(error_stack::report!(EngineError::WorkflowNotFound {
                workflow_id,
            }));
        }

        let mut instance = self.replay_from_snapshot(template, workflow_id, &events)?;

        // Preserve the optimistic version chain of the stored document.
        let stored = self
            .state
            .get(ctx, workflow_id)
            .await
            .change_context(EngineError::Internal)?;
        let stored_version = stored.as_ref().map(|s| s.version).unwrap_or(0);

        let stored_seq = stored.as_ref().map(|s| s.projected_seq).unwrap_or(0);
        let lag = instance.projected_seq.saturating_sub(stored_seq);
        if lag > self.max_lag_events {
            log::error!(
                "projection for workflow {workflow_id} lagged {lag} events (threshold {}); repairing",
                self.max_lag_events
            );
        }

        instance.version = stored_version + 1;
        self.state
            .insert(instance.clone())
            .await
            .change_context(EngineError::Internal)?;
        self.index
            .insert(IndexRow::from_instance(&instance))
            .await
            .change_context(EngineError::Internal)?;

        self.maybe_snapshot(&instance).await;
        Ok(instance)
    }

    fn replay_from_snapshot(
        &self,
        template: &WorkflowTemplate,
        workflow_id: WorkflowId,
        events: &[WorkflowEvent],
    ) -> Result<WorkflowInstance> {
        let snapshot = self
            .snapshots
            .try_lock()
            .ok()
            .and_then(|snapshots| snapshots.get(&workflow_id).cloned());

        match snapshot {
            Some(mut instance) => {
                let projected_seq = instance.projected_seq;
                for event in events
                    .iter()
                    .filter(|e| e.sequence_no.value() > projected_seq)
                {
                    gridflow_machine::apply_event(template, &mut instance, event)
                        .map_err(|e| integrity(workflow_id, e))?;
                }
                Ok(instance)
            }
            None => gridflow_machine::replay(template, events, None)
                .map_err(|e| integrity(workflow_id, e)),
        }
    }

    async fn maybe_snapshot(&self, instance: &WorkflowInstance) {
        if instance.projected_seq % self.snapshot_interval != 0 {
            return;
        }
        let mut snapshots = self.snapshots.lock().await;
        snapshots.insert(instance.id, instance.clone());
    }

    /// Look up a template through the registry; helper for recovery, which
    /// only has the instance header.
    pub async fn template_for(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Arc<WorkflowTemplate>> {
        self.registry.load_by_id(instance.template_id).await
    }
}

fn integrity(
    workflow_id: WorkflowId,
    err: gridflow_machine::MachineError,
) -> error_stack::Report<EngineError> {
    error_stack::report!(EngineError::Integrity { workflow_id })
        .attach_printable(format!("replay failed: {err}"))
}
