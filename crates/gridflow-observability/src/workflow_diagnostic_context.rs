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

//! Workflow diagnostic context for engine operations
//!
//! This module provides thread-local storage for workflow_id and step_id
//! that gets automatically injected into all log records via a custom
//! diagnostic.
//!
//! - `workflow_id`: Set once per engine operation (rarely changes)
//! - `step_id`: Set/cleared as execution enters/exits steps

use std::cell::RefCell;

thread_local! {
    static WORKFLOW_ID: RefCell<Option<String>> = const { RefCell::new(None) };
    static STEP_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// RAII guard that sets workflow_id on creation and clears it on drop
pub struct WorkflowInfoGuard {
    _private: (),
}

impl WorkflowInfoGuard {
    /// Create a new guard and set the workflow_id for the current thread
    pub fn new(workflow_id: impl Into<String>) -> Self {
        WORKFLOW_ID.with(|w| {
            *w.borrow_mut() = Some(workflow_id.into());
        });
        Self { _private: () }
    }
}

impl Drop for WorkflowInfoGuard {
    fn drop(&mut self) {
        WORKFLOW_ID.with(|w| {
            *w.borrow_mut() = None;
        });
    }
}

/// RAII guard that sets step_id on creation and clears it on drop
pub struct StepIdGuard {
    _private: (),
}

impl StepIdGuard {
    /// Create a new guard and set the step_id for the current thread
    pub fn new(step_id: impl Into<String>) -> Self {
        STEP_ID.with(|s| {
            *s.borrow_mut() = Some(step_id.into());
        });
        Self { _private: () }
    }
}

impl Drop for StepIdGuard {
    fn drop(&mut self) {
        STEP_ID.with(|s| {
            *s.borrow_mut() = None;
        });
    }
}

/// Get the current workflow_id if set
pub fn get_workflow_id() -> Option<String> {
    WORKFLOW_ID.with(|w| w.borrow().clone())
}

/// Get the current step_id if set
pub fn get_step_id() -> Option<String> {
    STEP_ID.with(|s| s.borrow().clone())
}

/// Custom diagnostic that injects workflow_id and step_id into logs
#[derive(Debug, Default)]
pub struct WorkflowDiagnostic;

impl logforth::diagnostic::Diagnostic for WorkflowDiagnostic {
    fn visit(&self, visitor: &mut dyn logforth::diagnostic::Visitor) -> anyhow::Result<()> {
        use std::borrow::Cow;

        if let Some(workflow_id) = get_workflow_id() {
            visitor.visit(Cow::Borrowed("workflow_id"), Cow::Owned(workflow_id))?;
        }

        if let Some(step_id) = get_step_id() {
            visitor.visit(Cow::Borrowed("step_id"), Cow::Owned(step_id))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_info_guard() {
        assert!(get_workflow_id().is_none());

        {
            let _guard = WorkflowInfoGuard::new("wf-123");
            assert_eq!(get_workflow_id(), Some("wf-123".to_string()));
        }

        // workflow_id is cleared when guard drops
        assert!(get_workflow_id().is_none());
    }

    #[test]
    fn test_step_id_guard() {
        assert!(get_step_id().is_none());

        {
            let _guard = StepIdGuard::new("company_info");
            assert_eq!(get_step_id(), Some("company_info".to_string()));
        }

        assert!(get_step_id().is_none());
    }

    #[test]
    fn test_nested_guards() {
        {
            let _workflow_guard = WorkflowInfoGuard::new("wf-456");

            {
                let _step_guard = StepIdGuard::new("portfolio");
                assert_eq!(get_workflow_id(), Some("wf-456".to_string()));
                assert_eq!(get_step_id(), Some("portfolio".to_string()));
            }

            // step_id cleared, workflow_id still set
            assert_eq!(get_workflow_id(), Some("wf-456".to_string()));
            assert!(get_step_id().is_none());
        }

        assert!(get_workflow_id().is_none());
        assert!(get_step_id().is_none());
    }
}
