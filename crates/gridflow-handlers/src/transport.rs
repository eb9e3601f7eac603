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

//! Transport contracts for external collaborators.
//!
//! The engine never speaks HTTP or SMTP itself; the notification transport
//! and the provisioning gateway are collaborators that implement these
//! traits. Errors carry a transient/permanent classification that drives the
//! retry policy.

use gridflow_core::ValueRef;
use serde::{Deserialize, Serialize};

/// Transport-level failure, classified for retry.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Worth retrying: timeouts, connection resets, throttling.
    #[error("transient transport failure")]
    Transient,

    /// Not worth retrying: rejected requests, permanent faults.
    #[error("permanent transport failure")]
    Permanent,
}

/// Receipt for a notification send attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReceipt {
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Outbound notification transport (implemented by a collaborator).
#[trait_variant::make(Send)]
#[dynosaur::dynosaur(pub DynNotificationTransport = dyn NotificationTransport)]
pub trait NotificationTransport: Send + Sync {
    /// Send a templated notification.
    async fn send(
        &self,
        template_id: &str,
        recipients: &[String],
        variables: ValueRef,
    ) -> error_stack::Result<NotificationReceipt, TransportError>;
}

/// A provisioning request with retry-safe semantics.
///
/// The handler owns the idempotency key; the gateway must deduplicate on it,
/// which is what makes crash recovery's re-issue safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    pub operation: String,
    pub payload: ValueRef,
    pub idempotency_key: String,
}

/// Generic call surface of the provisioning gateway (implemented by a
/// collaborator).
#[trait_variant::make(Send)]
#[dynosaur::dynosaur(pub DynProvisioningClient = dyn ProvisioningClient)]
pub trait ProvisioningClient: Send + Sync {
    /// Issue the configured call. Deduplicated by idempotency key.
    async fn call(
        &self,
        request: ProvisioningRequest,
    ) -> error_stack::Result<ValueRef, TransportError>;

    /// Issue the configured counter-request (e.g. revoke credentials).
    async fn compensate(
        &self,
        request: ProvisioningRequest,
    ) -> error_stack::Result<(), TransportError>;
}
