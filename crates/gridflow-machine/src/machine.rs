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

use gridflow_core::{StepDefinition, StepId, WorkflowInstance, WorkflowTemplate};

use crate::error::MachineError;

/// Transition validator over an `(instance, template)` pair.
///
/// Borrows both; the engine constructs one per operation after loading the
/// instance under the per-workflow lock. Validation happens *before* any
/// event is appended; `current_step_id` only ever moves once the
/// corresponding event committed.
pub struct StateMachine<'a> {
    instance: &'a WorkflowInstance,
    template: &'a WorkflowTemplate,
}

impl<'a> StateMachine<'a> {
    pub fn new(instance: &'a WorkflowInstance, template: &'a WorkflowTemplate) -> Self {
        Self { instance, template }
    }

    /// The definition of the workflow's current step, if it has entered one.
    pub fn current_step(&self) -> Option<&'a StepDefinition> {
        self.instance
            .current_step_id
            .as_ref()
            .and_then(|id| self.template.step(id))
    }

    pub fn can_transition(&self, to_step: &StepId) -> bool {
        self.check_transition(to_step).is_ok()
    }

    /// Validate a transition to `to_step`.
    ///
    /// Checks in contract order: terminal status first, then reachability
    /// from the current step, then that the target is defined at all. A
    /// draft workflow may only enter the template's first step; re-entering
    /// the current step is allowed so failed steps stay retryable.
    pub fn check_transition(&self, to_step: &StepId) -> Result<(), MachineError> {
        if self.instance.status.is_terminal() {
            return Err(MachineError::TerminalState {
                workflow_id: self.instance.id,
                status: self.instance.status,
            });
        }
        if !self.instance.status.allows_step_execution() {
            return Err(MachineError::NotExecutable {
                workflow_id: self.instance.id,
                status: self.instance.status,
            });
        }

        match &self.instance.current_step_id {
            None => {
                let first = self.template.first_step();
                if first.is_none_or(|f| &f.id != to_step) {
                    return Err(MachineError::InvalidTransition {
                        from: None,
                        to: to_step.clone(),
                    });
                }
            }
            Some(current) if current == to_step => {
                use gridflow_core::StepStatus;
                match self.instance.step_state(current).and_then(|s| s.status) {
                    // Failed steps are retryable; compensated or rejected
                    // steps return to pending and may re-run.
                    Some(StepStatus::Failed) | Some(StepStatus::Pending) | None => {}
                    // An executing or suspended step admits no second
                    // writer; the caller sees a conflict, not a retry.
                    Some(StepStatus::InProgress) | Some(StepStatus::Paused) => {
                        return Err(MachineError::StepBusy {
                            workflow_id: self.instance.id,
                            step_id: to_step.clone(),
                        });
                    }
                    Some(StepStatus::Completed) | Some(StepStatus::Skipped) => {
                        if !self.template.successors(current).contains(to_step) {
                            return Err(MachineError::InvalidTransition {
                                from: Some(current.clone()),
                                to: to_step.clone(),
                            });
                        }
                    }
                }
            }
            Some(current) => {
                if !self.template.successors(current).contains(to_step) {
                    return Err(MachineError::InvalidTransition {
                        from: Some(current.clone()),
                        to: to_step.clone(),
                    });
                }
            }
        }

        if !self.template.contains_step(to_step) {
            return Err(MachineError::UnknownStep {
                step_id: to_step.clone(),
                template: self.template.name.clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridflow_core::{
        MarketRole, StepKind, StepStatus, TemplateId, TenantId, UserId, ValueRef, WorkflowId,
        WorkflowStatus, WorkflowTemplateBuilder,
    };

    fn template() -> WorkflowTemplate {
        WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, 1)
            .step(
                "company_info",
                "Company information",
                StepKind::Form,
                ValueRef::default(),
                true,
                vec![StepId::from("portfolio")],
            )
            .step(
                "portfolio",
                "Portfolio",
                StepKind::Form,
                ValueRef::default(),
                true,
                vec![StepId::from("compliance")],
            )
            .step(
                "compliance",
                "Compliance review",
                StepKind::Approval,
                ValueRef::default(),
                true,
                vec![],
            )
            .build()
            .unwrap()
    }

    fn instance(template: &WorkflowTemplate) -> WorkflowInstance {
        WorkflowInstance {
            id: WorkflowId::new(),
            tenant_id: TenantId::new(),
            template_id: template.id,
            template_version: template.version,
            market_role: template.market_role,
            status: WorkflowStatus::Draft,
            current_step_id: None,
            step_states: Default::default(),
            metadata: Default::default(),
            created_by: UserId::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 0,
            projected_seq: 1,
        }
    }

    #[test]
    fn test_draft_may_only_enter_first_step() {
        let template = template();
        let instance = instance(&template);
        let machine = StateMachine::new(&instance, &template);

        assert!(machine.can_transition(&StepId::from("company_info")));
        assert!(matches!(
            machine.check_transition(&StepId::from("portfolio")),
            Err(MachineError::InvalidTransition { from: None, .. })
        ));
    }

    #[test]
    fn test_transition_follows_template_edges() {
        let template = template();
        let mut instance = instance(&template);
        instance.status = WorkflowStatus::InProgress;
        instance.current_step_id = Some(StepId::from("company_info"));
        instance
            .step_state_mut(&StepId::from("company_info"))
            .status = Some(StepStatus::Completed);
        instance
            .step_state_mut(&StepId::from("company_info"))
            .completed_at = Some(Utc::now());

        let machine = StateMachine::new(&instance, &template);
        assert!(machine.can_transition(&StepId::from("portfolio")));
        assert!(!machine.can_transition(&StepId::from("compliance")));
    }

    #[test]
    fn test_failed_step_is_retryable() {
        let template = template();
        let mut instance = instance(&template);
        instance.status = WorkflowStatus::InProgress;
        instance.current_step_id = Some(StepId::from("portfolio"));
        instance.step_state_mut(&StepId::from("portfolio")).status = Some(StepStatus::Failed);

        let machine = StateMachine::new(&instance, &template);
        assert!(machine.can_transition(&StepId::from("portfolio")));
    }

    #[test]
    fn test_in_progress_step_rejects_second_writer() {
        let template = template();
        let mut instance = instance(&template);
        instance.status = WorkflowStatus::InProgress;
        instance.current_step_id = Some(StepId::from("portfolio"));
        instance.step_state_mut(&StepId::from("portfolio")).status =
            Some(StepStatus::InProgress);

        let machine = StateMachine::new(&instance, &template);
        assert!(matches!(
            machine.check_transition(&StepId::from("portfolio")),
            Err(MachineError::StepBusy { .. })
        ));
    }

    #[test]
    fn test_completed_step_is_not_reentrant() {
        let template = template();
        let mut instance = instance(&template);
        instance.status = WorkflowStatus::InProgress;
        instance.current_step_id = Some(StepId::from("portfolio"));
        let state = instance.step_state_mut(&StepId::from("portfolio"));
        state.status = Some(StepStatus::Completed);
        state.completed_at = Some(Utc::now());

        let machine = StateMachine::new(&instance, &template);
        assert!(!machine.can_transition(&StepId::from("portfolio")));
    }

    #[test]
    fn test_terminal_rejects_everything() {
        let template = template();
        let mut instance = instance(&template);
        instance.status = WorkflowStatus::Completed;

        let machine = StateMachine::new(&instance, &template);
        assert!(matches!(
            machine.check_transition(&StepId::from("company_info")),
            Err(MachineError::TerminalState { .. })
        ));
    }

    #[test]
    fn test_paused_is_not_executable() {
        let template = template();
        let mut instance = instance(&template);
        instance.status = WorkflowStatus::Paused;
        instance.current_step_id = Some(StepId::from("company_info"));

        let machine = StateMachine::new(&instance, &template);
        assert!(matches!(
            machine.check_transition(&StepId::from("portfolio")),
            Err(MachineError::NotExecutable { .. })
        ));
    }

    #[test]
    fn test_unknown_step_with_unknown_template_id() {
        // A step that is a successor of nothing and undefined: the
        // reachability error wins, matching the contract's check order.
        let template = template();
        let mut instance = instance(&template);
        instance.status = WorkflowStatus::InProgress;
        instance.current_step_id = Some(StepId::from("company_info"));

        let machine = StateMachine::new(&instance, &template);
        assert!(matches!(
            machine.check_transition(&StepId::from("nonexistent")),
            Err(MachineError::InvalidTransition { .. })
        ));
    }
}
