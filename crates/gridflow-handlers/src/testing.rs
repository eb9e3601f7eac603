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

//! Mock transports and context builders for handler and engine tests.
//!
//! The mocks share state through an inner `Arc`, so a cloned handle kept by
//! the test observes the calls made through the handle given to the context.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use error_stack::ResultExt as _;
use gridflow_core::{Actor, StepId, TenantId, UserId, ValueRef, WorkflowId};

use crate::context::HandlerContext;
use crate::retry::RetryPolicy;
use crate::transport::{
    DynNotificationTransport, DynProvisioningClient, NotificationReceipt, NotificationTransport,
    ProvisioningClient, ProvisioningRequest, TransportError,
};

/// Scripted notification transport.
#[derive(Clone)]
pub struct MockNotificationTransport {
    inner: Arc<NotificationInner>,
}

struct NotificationInner {
    deliver: bool,
    sent: std::sync::Mutex<Vec<(String, Vec<String>)>>,
}

impl MockNotificationTransport {
    /// Every send succeeds with a message id.
    pub fn delivering() -> Self {
        Self {
            inner: Arc::new(NotificationInner {
                deliver: true,
                sent: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every send fails permanently.
    pub fn failing() -> Self {
        Self {
            inner: Arc::new(NotificationInner {
                deliver: false,
                sent: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.inner.sent.lock().expect("mock lock poisoned").len()
    }
}

impl NotificationTransport for MockNotificationTransport {
    async fn send(
        &self,
        template_id: &str,
        recipients: &[String],
        _variables: ValueRef,
    ) -> error_stack::Result<NotificationReceipt, TransportError> {
        if !self.inner.deliver {
            return Err(error_stack::report!(TransportError::Permanent))
                .attach_printable("mock transport configured to fail");
        }
        self.inner
            .sent
            .lock()
            .expect("mock lock poisoned")
            .push((template_id.to_string(), recipients.to_vec()));
        Ok(NotificationReceipt {
            delivered: true,
            message_id: Some(format!("msg-{}", self.sent_count())),
        })
    }
}

enum ProvisioningScript {
    Succeed { response: ValueRef },
    FailTimes { failures: usize, response: ValueRef },
    AlwaysTransient,
    AlwaysPermanent,
}

/// Scripted provisioning gateway recording calls and idempotency keys.
#[derive(Clone)]
pub struct MockProvisioningClient {
    inner: Arc<ProvisioningInner>,
}

struct ProvisioningInner {
    script: ProvisioningScript,
    calls: AtomicUsize,
    compensations: AtomicUsize,
    keys: std::sync::Mutex<Vec<String>>,
}

impl MockProvisioningClient {
    fn with_script(script: ProvisioningScript) -> Self {
        Self {
            inner: Arc::new(ProvisioningInner {
                script,
                calls: AtomicUsize::new(0),
                compensations: AtomicUsize::new(0),
                keys: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every call succeeds with `response`.
    pub fn succeeding(response: ValueRef) -> Self {
        Self::with_script(ProvisioningScript::Succeed { response })
    }

    /// The first `failures` calls fail transiently, then calls succeed.
    pub fn failing_times(failures: usize, response: ValueRef) -> Self {
        Self::with_script(ProvisioningScript::FailTimes { failures, response })
    }

    pub fn always_transient() -> Self {
        Self::with_script(ProvisioningScript::AlwaysTransient)
    }

    pub fn always_permanent() -> Self {
        Self::with_script(ProvisioningScript::AlwaysPermanent)
    }

    pub fn call_count(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn compensate_count(&self) -> usize {
        self.inner.compensations.load(Ordering::SeqCst)
    }

    /// Idempotency keys seen across all calls, in order.
    pub fn recorded_keys(&self) -> Vec<String> {
        self.inner.keys.lock().expect("mock lock poisoned").clone()
    }
}

impl ProvisioningClient for MockProvisioningClient {
    async fn call(
        &self,
        request: ProvisioningRequest,
    ) -> error_stack::Result<ValueRef, TransportError> {
        let call_no = self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .keys
            .lock()
            .expect("mock lock poisoned")
            .push(request.idempotency_key);

        match &self.inner.script {
            ProvisioningScript::Succeed { response } => Ok(response.clone()),
            ProvisioningScript::FailTimes { failures, response } => {
                if call_no < *failures {
                    Err(error_stack::report!(TransportError::Transient))
                } else {
                    Ok(response.clone())
                }
            }
            ProvisioningScript::AlwaysTransient => {
                Err(error_stack::report!(TransportError::Transient))
            }
            ProvisioningScript::AlwaysPermanent => {
                Err(error_stack::report!(TransportError::Permanent))
            }
        }
    }

    async fn compensate(
        &self,
        _request: ProvisioningRequest,
    ) -> error_stack::Result<(), TransportError> {
        self.inner.compensations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A handler context wired to successful mocks.
pub fn test_context(step_id: &StepId) -> HandlerContext {
    test_context_with(
        step_id,
        RetryPolicy::no_retries(),
        MockProvisioningClient::succeeding(ValueRef::default()),
    )
}

/// A handler context with a custom retry policy and provisioning mock.
pub fn test_context_with(
    step_id: &StepId,
    retry: RetryPolicy,
    provisioning: MockProvisioningClient,
) -> HandlerContext {
    build_context(
        step_id,
        retry,
        MockNotificationTransport::delivering(),
        provisioning,
    )
}

/// A handler context with a custom notification mock.
pub fn test_context_with_notifications(
    step_id: &StepId,
    notifications: MockNotificationTransport,
) -> HandlerContext {
    build_context(
        step_id,
        RetryPolicy::no_retries(),
        notifications,
        MockProvisioningClient::succeeding(ValueRef::default()),
    )
}

fn build_context(
    step_id: &StepId,
    retry: RetryPolicy,
    notifications: MockNotificationTransport,
    provisioning: MockProvisioningClient,
) -> HandlerContext {
    HandlerContext::new(
        WorkflowId::new(),
        TenantId::new(),
        step_id.clone(),
        Actor::market_ops(UserId::new(), "test-ops"),
        retry,
        Arc::from(DynNotificationTransport::boxed(notifications)),
        Arc::from(DynProvisioningClient::boxed(provisioning)),
    )
}
