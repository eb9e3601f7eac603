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

//! Durable suspension points: creation, exactly-once consumption, expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gridflow_core::{Bookmark, BookmarkId, StepId, TenantId, WorkflowId};
use gridflow_handlers::BookmarkRequest;
use gridflow_state::{BookmarkStore, StateError};

use crate::error::{EngineError, Result};

pub struct BookmarkManager {
    store: Arc<dyn BookmarkStore>,
    default_expiry: Duration,
}

impl BookmarkManager {
    pub fn new(store: Arc<dyn BookmarkStore>, default_expiry: Duration) -> Self {
        Self {
            store,
            default_expiry,
        }
    }

    /// Persist a bookmark for a suspending step.
    ///
    /// The request's TTL overrides the configured default expiry. The store
    /// enforces one active bookmark per `(workflow, step)`.
    pub async fn create(
        &self,
        workflow_id: WorkflowId,
        tenant_id: TenantId,
        step_id: StepId,
        request: &BookmarkRequest,
    ) -> Result<Bookmark> {
        let ttl = request.ttl.unwrap_or(self.default_expiry);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(14));

        let bookmark = Bookmark::new(
            workflow_id,
            tenant_id,
            step_id,
            request.kind,
            request.expected_payload_shape.clone(),
        )
        .with_expiry(expires_at);

        self.store
            .put(bookmark.clone())
            .await
            .map_err(|report| map_store_error(report, workflow_id))?;
        Ok(bookmark)
    }

    /// Consume a bookmark exactly once.
    ///
    /// An expired bookmark is consumed (so it cannot be raced) but surfaces
    /// [`EngineError::BookmarkExpired`]; the caller fails the owning step.
    pub async fn consume(&self, bookmark_id: BookmarkId) -> Result<Bookmark> {
        let now = Utc::now();
        let bookmark = self.store.consume(bookmark_id, now).await.map_err(|report| {
            match report.current_context() {
                StateError::BookmarkNotFound { .. } => {
                    report.change_context(EngineError::BookmarkNotFound { bookmark_id })
                }
                StateError::BookmarkAlreadyConsumed { .. } => {
                    report.change_context(EngineError::BookmarkAlreadyConsumed { bookmark_id })
                }
                _ => report.change_context(EngineError::Internal),
            }
        })?;

        if bookmark.is_expired_at(now) {
            return Err(error_stack::report!(EngineError::BookmarkExpired {
                bookmark_id,
            }));
        }
        Ok(bookmark)
    }

    /// Active bookmarks for a workflow.
    pub async fn find_active(&self, workflow_id: WorkflowId) -> Result<Vec<Bookmark>> {
        self.store
            .find_active(workflow_id)
            .await
            .map_err(|report| report.change_context(EngineError::Internal))
    }

    /// Remove all bookmarks for a deleted workflow instance.
    pub async fn delete_for_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        self.store
            .delete_for_workflow(workflow_id)
            .await
            .map_err(|report| report.change_context(EngineError::Internal))
    }

    /// Expired-but-active bookmarks across all workflows, consumed so the
    /// caller can fail their steps without racing a late resume.
    pub async fn take_expired(&self) -> Result<Vec<Bookmark>> {
        let now = Utc::now();
        let expired = self
            .store
            .find_expired(now)
            .await
            .map_err(|report| report.change_context(EngineError::Internal))?;

        let mut taken = Vec::with_capacity(expired.len());
        for bookmark in expired {
            match self.store.consume(bookmark.bookmark_id, now).await {
                Ok(consumed) => taken.push(consumed),
                // Lost the race to a concurrent resume; that resume now owns
                // the step.
                Err(report)
                    if matches!(
                        report.current_context(),
                        StateError::BookmarkAlreadyConsumed { .. }
                    ) => {}
                Err(report) => return Err(report.change_context(EngineError::Internal)),
            }
        }
        Ok(taken)
    }
}

fn map_store_error(
    report: error_stack::Report<StateError>,
    workflow_id: WorkflowId,
) -> error_stack::Report<EngineError> {
    match report.current_context() {
        StateError::ActiveBookmarkExists { .. } => {
            report.change_context(EngineError::Conflict { workflow_id })
        }
        _ => report.change_context(EngineError::Internal),
    }
}
