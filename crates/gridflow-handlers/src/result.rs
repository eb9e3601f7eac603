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

use gridflow_core::{BookmarkKind, ErrorDetail, EventBody, FieldError, StepOutcome, ValueRef};

/// Result of validating step data against declared rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<FieldError>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }

    /// Collapse a list of field errors into an outcome.
    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        if errors.is_empty() {
            Self::ok()
        } else {
            Self::invalid(errors)
        }
    }
}

/// A handler's request to suspend its step on a bookmark.
#[derive(Debug, Clone)]
pub struct BookmarkRequest {
    pub kind: BookmarkKind,
    /// Shape of the payload the resume signal must carry, published to the
    /// collaborator delivering it.
    pub expected_payload_shape: ValueRef,
    /// Override of the configured default bookmark expiry.
    pub ttl: Option<std::time::Duration>,
    /// Event announcing the suspension to interested parties, e.g.
    /// `APPROVAL_REQUESTED`. Appended by the engine alongside `STEP_PAUSED`.
    pub announcement: Option<EventBody>,
}

impl BookmarkRequest {
    pub fn new(kind: BookmarkKind, expected_payload_shape: ValueRef) -> Self {
        Self {
            kind,
            expected_payload_shape,
            ttl: None,
            announcement: None,
        }
    }

    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_announcement(mut self, announcement: EventBody) -> Self {
        self.announcement = Some(announcement);
        self
    }
}

/// What executing (or resuming) a step produced.
///
/// Business failures are values, not `Err`: a failed provisioning call is a
/// recorded outcome the engine turns into `STEP_FAILED`, while `Err` from a
/// handler means the handler itself misbehaved (bad config, broken
/// invariant).
#[derive(Debug)]
pub enum StepExecution {
    /// The step finished; the engine appends `STEP_COMPLETED`.
    Completed {
        outcome: StepOutcome,
        output: Option<ValueRef>,
        /// Events the handler wants recorded before the completion, e.g.
        /// `API_CALL_COMPLETED` or `NOTIFICATION_SENT`.
        side_events: Vec<EventBody>,
    },
    /// The step is waiting on an external signal.
    Suspended(BookmarkRequest),
    /// The step failed permanently (retryable by the caller).
    Failed {
        error: ErrorDetail,
        side_events: Vec<EventBody>,
    },
}

impl StepExecution {
    pub fn completed(outcome: StepOutcome, output: Option<ValueRef>) -> Self {
        Self::Completed {
            outcome,
            output,
            side_events: Vec::new(),
        }
    }

    pub fn failed(error: ErrorDetail) -> Self {
        Self::Failed {
            error,
            side_events: Vec::new(),
        }
    }
}
