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
use gridflow_core::{Bookmark, BookmarkId, WorkflowId};

use crate::StateError;

/// Store of durable suspension points.
///
/// Two invariants live here rather than in the engine, so they hold under
/// concurrent resume attempts:
///
/// - at most one *active* bookmark per `(workflow_id, step_id)`, with
///   [`StateError::ActiveBookmarkExists`] otherwise,
/// - a bookmark is consumed exactly once: the consume is a compare-and-set
///   on `consumed_at`, and the loser gets
///   [`StateError::BookmarkAlreadyConsumed`].
pub trait BookmarkStore: Send + Sync {
    /// Persist a new bookmark.
    fn put(&self, bookmark: Bookmark) -> BoxFuture<'_, error_stack::Result<(), StateError>>;

    /// Fetch a bookmark by id, consumed or not.
    fn get(
        &self,
        bookmark_id: BookmarkId,
    ) -> BoxFuture<'_, error_stack::Result<Option<Bookmark>, StateError>>;

    /// Atomically mark a bookmark consumed and return it.
    ///
    /// Exactly one caller wins; all later callers fail with
    /// [`StateError::BookmarkAlreadyConsumed`].
    fn consume(
        &self,
        bookmark_id: BookmarkId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, error_stack::Result<Bookmark, StateError>>;

    /// Active (unconsumed) bookmarks for a workflow.
    fn find_active(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<Vec<Bookmark>, StateError>>;

    /// Active bookmarks whose expiry has passed, across all workflows.
    ///
    /// The engine's expiry sweep consumes each and fails the owning step.
    fn find_expired(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, error_stack::Result<Vec<Bookmark>, StateError>>;

    /// Delete all bookmarks for a workflow. Only used when an archived,
    /// cancelled instance is deleted.
    fn delete_for_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> BoxFuture<'_, error_stack::Result<(), StateError>>;
}
