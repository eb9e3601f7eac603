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

use std::collections::HashMap;
use std::sync::Arc;

use gridflow_core::StepKind;

use crate::error::{HandlerError, Result};
use crate::{
    ApiCallHandler, ApprovalHandler, DecisionHandler, DynStepHandler, FormHandler, ManualHandler,
    NotificationHandler, StepHandler, ValidationHandler,
};

/// Mapping from step kind to handler implementation.
///
/// Handlers are registered explicitly at process start and the registry is
/// immutable afterwards: the engine holds it behind an `Arc` and there is
/// no way to mutate a shared registry.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepKind, Arc<DynStepHandler<'static>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with all seven built-in handlers registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(FormHandler::new());
        registry.register(ApprovalHandler::new());
        registry.register(ApiCallHandler::new());
        registry.register(NotificationHandler::new());
        registry.register(ValidationHandler::new());
        registry.register(DecisionHandler::new());
        registry.register(ManualHandler::new());
        registry
    }

    /// Register a handler for its declared kind, replacing any previous
    /// registration for that kind.
    pub fn register<H: StepHandler + 'static>(&mut self, handler: H) {
        let kind = handler.kind();
        let handler = DynStepHandler::boxed(handler);
        self.handlers.insert(kind, Arc::from(handler));
    }

    pub fn get(&self, kind: StepKind) -> Result<Arc<DynStepHandler<'static>>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| error_stack::report!(HandlerError::UnregisteredKind(kind)))
    }

    pub fn registered_kinds(&self) -> Vec<StepKind> {
        self.handlers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_kind() {
        let registry = HandlerRegistry::builtin();
        for kind in [
            StepKind::Form,
            StepKind::Approval,
            StepKind::ApiCall,
            StepKind::Notification,
            StepKind::Validation,
            StepKind::Decision,
            StepKind::Manual,
        ] {
            assert!(registry.get(kind).is_ok(), "missing handler for {kind}");
        }
    }

    #[test]
    fn test_unregistered_kind() {
        let registry = HandlerRegistry::new();
        let err = registry.get(StepKind::Form).unwrap_err();
        assert!(matches!(
            err.current_context(),
            HandlerError::UnregisteredKind(StepKind::Form)
        ));
    }
}
