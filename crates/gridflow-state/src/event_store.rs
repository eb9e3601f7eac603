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

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use gridflow_core::{SequenceNumber, TenantId, WorkflowEvent, WorkflowId};

use crate::StateError;

/// Bounds for reading a workflow's event log.
///
/// All bounds are inclusive. `to_time` selects the prefix of events that
/// occurred at or before the given instant; it composes with the sequence
/// bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventRange {
    pub from_seq: Option<SequenceNumber>,
    pub to_seq: Option<SequenceNumber>,
    pub to_time: Option<DateTime<Utc>>,
}

impl EventRange {
    /// The full log.
    pub fn all() -> Self {
        Self::default()
    }

    /// Events from `seq` (inclusive) onward.
    pub fn from(seq: SequenceNumber) -> Self {
        Self {
            from_seq: Some(seq),
            ..Self::default()
        }
    }

    /// Events up to `seq` (inclusive).
    pub fn until(seq: SequenceNumber) -> Self {
        Self {
            to_seq: Some(seq),
            ..Self::default()
        }
    }

    pub fn contains(&self, seq: SequenceNumber, occurred_at: DateTime<Utc>) -> bool {
        if self.from_seq.is_some_and(|from| seq < from) {
            return false;
        }
        if self.to_seq.is_some_and(|to| seq > to) {
            return false;
        }
        if self.to_time.is_some_and(|to| occurred_at > to) {
            return false;
        }
        true
    }
}

/// Append-only log of workflow events; the authoritative store.
///
/// # Sequence discipline
///
/// Appends carry the sequence number the writer expects to occupy
/// (`latest + 1`). The store validates this optimistically:
///
/// - an event whose sequence is already taken fails with
///   [`StateError::ConflictingWrite`]: another writer got there first, the
///   caller reloads and retries,
/// - an event that would leave a gap fails with
///   [`StateError::NonDenseSequence`], an invariant violation that is never
///   retried.
///
/// Writers are additionally serialized by the engine's per-workflow lock;
/// the optimistic check is the backstop, not the primary mechanism.
///
/// Readers always observe a prefix of the log. Partially written batches are
/// never visible.
pub trait EventStore: Send + Sync {
    /// Append a single event.
    ///
    /// # Returns
    /// The sequence number the event was committed at.
    fn append(
        &self,
        event: WorkflowEvent,
    ) -> BoxFuture<'_, error_stack::Result<SequenceNumber, StateError>>;

    /// Append a batch of events atomically.
    ///
    /// The batch must be contiguous (each event's sequence one past the
    /// previous). Either every event becomes visible or none does.
    ///
    /// # Returns
    /// The sequence number of the last event in the batch.
    fn append_many(
        &self,
        events: Vec<WorkflowEvent>,
    ) -> BoxFuture<'_, error_stack::Result<SequenceNumber, StateError>>;

    /// Read a workflow's events within `range`, in sequence order.
    fn get_events(
        &self,
        workflow_id: WorkflowId,
        range: EventRange,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkflowEvent>, StateError>>;

    /// Read events across all of a tenant's workflows within a time window,
    /// ordered by occurrence time. Used by the audit surface.
    fn get_events_by_tenant(
        &self,
        tenant_id: TenantId,
        from_time: DateTime<Utc>,
        to_time: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, error_stack::Result<Vec<WorkflowEvent>, StateError>>;

    /// The highest committed sequence number for a workflow, if any events
    /// exist.
    fn latest_sequence(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Option<SequenceNumber>, StateError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds_inclusive() {
        let now = Utc::now();
        let range = EventRange {
            from_seq: Some(SequenceNumber::new(2)),
            to_seq: Some(SequenceNumber::new(4)),
            to_time: None,
        };
        assert!(!range.contains(SequenceNumber::new(1), now));
        assert!(range.contains(SequenceNumber::new(2), now));
        assert!(range.contains(SequenceNumber::new(4), now));
        assert!(!range.contains(SequenceNumber::new(5), now));
    }

    #[test]
    fn test_range_time_bound() {
        let cutoff = Utc::now();
        let range = EventRange {
            to_time: Some(cutoff),
            ..EventRange::default()
        };
        assert!(range.contains(SequenceNumber::FIRST, cutoff));
        assert!(!range.contains(
            SequenceNumber::FIRST,
            cutoff + chrono::Duration::seconds(1)
        ));
    }
}
