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

//! Durable suspension points.
//!
//! A bookmark marks a step waiting on an external signal: a form
//! submission, an approval decision, an API callback, or a timer. There is
//! exactly one active bookmark per paused step, and a bookmark is consumed
//! exactly once; the store enforces both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::WorkflowId;
use crate::template::StepId;
use crate::tenant::TenantId;
use crate::values::ValueRef;

/// Identifier of a bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookmarkId(Uuid);

impl BookmarkId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BookmarkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BookmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of external signal a bookmark waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkKind {
    Form,
    Approval,
    ApiReturn,
    Timer,
}

impl BookmarkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookmarkKind::Form => "form",
            BookmarkKind::Approval => "approval",
            BookmarkKind::ApiReturn => "api_return",
            BookmarkKind::Timer => "timer",
        }
    }
}

impl std::fmt::Display for BookmarkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BookmarkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form" => Ok(BookmarkKind::Form),
            "approval" => Ok(BookmarkKind::Approval),
            "api_return" => Ok(BookmarkKind::ApiReturn),
            "timer" => Ok(BookmarkKind::Timer),
            _ => Err(format!("unknown bookmark kind: {s}")),
        }
    }
}

/// A durable marker that a step is suspended awaiting an external signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub bookmark_id: BookmarkId,
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    pub step_id: StepId,
    pub kind: BookmarkKind,
    /// Description of the payload the resume signal must carry, published to
    /// the collaborator that will deliver it.
    #[serde(default)]
    pub expected_payload_shape: ValueRef,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the bookmark is consumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
}

impl Bookmark {
    pub fn new(
        workflow_id: WorkflowId,
        tenant_id: TenantId,
        step_id: StepId,
        kind: BookmarkKind,
        expected_payload_shape: ValueRef,
    ) -> Self {
        Self {
            bookmark_id: BookmarkId::new(),
            workflow_id,
            tenant_id,
            step_id,
            kind,
            expected_payload_shape,
            created_at: Utc::now(),
            expires_at: None,
            consumed_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.consumed_at.is_none()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}
