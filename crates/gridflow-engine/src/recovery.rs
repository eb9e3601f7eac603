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

//! Crash recovery and bookmark expiry.
//!
//! The event store is authoritative, so recovery is two sweeps over it:
//!
//! 1. **Reprojection**: every non-terminal workflow's state document and
//!    index row are rebuilt by replay, repairing any projection lag left by
//!    a crash between the event append and the projection write.
//! 2. **Open steps**: a step with `STEP_STARTED` recorded but neither a
//!    terminal step event nor an active bookmark was interrupted mid-flight.
//!    Its handler is re-issued with the same idempotency key (stable per
//!    workflow and step), so the external side either reports the prior
//!    success or performs the work once.
//!
//! Expired bookmarks are swept here too: each is consumed (winning any race
//! with a late resume) and its step failed with `BookmarkExpired`.

use gridflow_core::{OperationContext, Role, StepStatus, WorkflowStatus};
use gridflow_handlers::StepHandler as _;
use gridflow_state::{Page, WorkflowFilter};

use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};

/// Summary of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Workflows whose projections were rebuilt from events.
    pub reprojected: usize,
    /// Interrupted steps whose handlers were re-issued.
    pub resumed_steps: usize,
    /// Expired bookmarks swept, each failing its step.
    pub expired_bookmarks: usize,
}

impl WorkflowEngine {
    /// Recover after a restart: reproject every non-terminal workflow and
    /// re-issue handlers for steps interrupted mid-flight.
    ///
    /// Requires the cross-tenant operations role; recovery sees every
    /// tenant's workflows by construction.
    pub async fn recover(&self, ctx: &OperationContext) -> Result<RecoveryReport> {
        if ctx.actor().role != Role::MarketOps {
            return Err(error_stack::report!(EngineError::PermissionDenied {
                operation: "run recovery",
            }));
        }

        let mut report = RecoveryReport::default();

        let rows = self
            .list(ctx, WorkflowFilter::default(), Page { limit: usize::MAX, offset: 0 })
            .await?;

        for row in rows.into_iter().filter(|r| !r.status.is_terminal()) {
            let workflow_id = row.id;

            // Phase 1, under the lock: repair projections and detect an
            // interrupted step.
            let interrupted = {
                let _guard = self.locks.acquire(workflow_id).await?;
                let (stored, template) = self.load_visible(ctx, workflow_id).await?;
                let instance = self
                    .projector
                    .project_to_latest(ctx, workflow_id, &template)
                    .await?;
                if instance.projected_seq > stored.projected_seq {
                    report.reprojected += 1;
                }

                let open_step = instance
                    .current_step_id
                    .clone()
                    .filter(|_| instance.status == WorkflowStatus::InProgress)
                    .filter(|step_id| {
                        instance
                            .step_state(step_id)
                            .and_then(|s| s.status)
                            == Some(StepStatus::InProgress)
                    });

                match open_step {
                    Some(step_id) => {
                        let has_bookmark = self
                            .bookmarks
                            .find_active(workflow_id)
                            .await?
                            .iter()
                            .any(|b| b.step_id == step_id);
                        if has_bookmark {
                            // Suspended, not interrupted: resumption will
                            // arrive through the bookmark.
                            None
                        } else {
                            let step = template
                                .step(&step_id)
                                .ok_or(EngineError::Integrity { workflow_id })?
                                .clone();
                            let data = instance
                                .step_state(&step_id)
                                .map(|s| s.data.clone())
                                .unwrap_or_default();
                            let input = self.handler_input(&step, &data, &instance);
                            Some((template, step, input, instance))
                        }
                    }
                    None => None,
                }
            };

            // Phase 2, lock released: re-issue the interrupted handler and
            // record its result through the normal completion path.
            if let Some((template, step, input, instance)) = interrupted {
                log::info!(
                    "recovery re-issuing step '{}' of workflow {workflow_id}",
                    step.id
                );
                let handler = self
                    .handlers()
                    .get(step.kind)
                    .map_err(|report| report.change_context(EngineError::Internal))?;
                let factory = self.make_factory(ctx, &instance);
                let hctx = factory.for_step(&step.id);
                let dispatched = tokio::time::timeout(
                    self.step_timeout(),
                    handler.execute(&step, input, &hctx),
                )
                .await;

                self.complete_dispatch(ctx, workflow_id, &template, &step, dispatched, &factory)
                    .await?;
                report.resumed_steps += 1;
            }
        }

        report.expired_bookmarks = self.expire_bookmarks(ctx).await?;
        Ok(report)
    }

    /// Sweep expired bookmarks, failing their steps with `BookmarkExpired`.
    ///
    /// Safe to call periodically from a timer; also part of every recovery
    /// pass.
    pub async fn expire_bookmarks(&self, ctx: &OperationContext) -> Result<usize> {
        if ctx.actor().role != Role::MarketOps {
            return Err(error_stack::report!(EngineError::PermissionDenied {
                operation: "expire bookmarks",
            }));
        }

        let expired = self.bookmarks.take_expired().await?;
        let count = expired.len();

        for bookmark in expired {
            let _guard = self.locks.acquire(bookmark.workflow_id).await?;
            let (instance, template) = self.load_visible(ctx, bookmark.workflow_id).await?;
            if instance.status.is_terminal() {
                continue;
            }
            log::warn!(
                "bookmark {} for step '{}' of workflow {} expired",
                bookmark.bookmark_id,
                bookmark.step_id,
                bookmark.workflow_id
            );
            self.fail_step_for_expiry(ctx, &template, instance, &bookmark.step_id)
                .await?;
        }

        self.locks.prune();
        Ok(count)
    }
}
