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

//! Versioned workflow templates.
//!
//! A template is the immutable definition of a workflow for one market role:
//! its ordered steps, the transition map between them, template-level
//! validation rules, and per-step compensation references. Publishing a new
//! version supersedes but never modifies prior versions; running instances
//! keep executing the version they were created from.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::tenant::MarketRole;
use crate::values::ValueRef;

/// Identifier of a workflow template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(Uuid);

impl TemplateId {
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

impl Default for TemplateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Semantic identifier of a step within a template, e.g. `company_info`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StepId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The kind of work a step performs, selecting its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Form,
    Approval,
    ApiCall,
    Notification,
    Validation,
    Decision,
    Manual,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Form => "form",
            StepKind::Approval => "approval",
            StepKind::ApiCall => "api_call",
            StepKind::Notification => "notification",
            StepKind::Validation => "validation",
            StepKind::Decision => "decision",
            StepKind::Manual => "manual",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Definition of one step in a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: StepId,
    pub name: String,
    pub kind: StepKind,
    /// Handler-specific configuration (form schema, approval metadata,
    /// api_call request description, decision branches, ...).
    #[serde(default)]
    pub config: ValueRef,
    /// Whether the step must be completed before submission.
    pub required: bool,
    /// Position in the template's declared order, dense from 0.
    pub order: u32,
    /// Steps reachable from this one. Empty for the final step.
    #[serde(default)]
    pub allowed_transitions: Vec<StepId>,
}

/// A template-level validation rule applied over accumulated step data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum TemplateRule {
    /// All steps named here must be completed before submission.
    RequiredStepsCompleted { steps: Vec<StepId> },
    /// A field must be present in the named step's data.
    FieldPresent { step: StepId, field: String },
    /// Declares an empty workflow (zero required steps) valid for submission.
    AllowEmptySubmission,
}

/// An immutable, versioned workflow definition for one market role.
///
/// `(market_role, version)` is unique. Instances reference the template by id
/// and pin the version for their lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub name: String,
    pub market_role: MarketRole,
    pub version: u32,
    /// Steps in declared order.
    pub steps: IndexMap<StepId, StepDefinition>,
    /// Transition map. Mirrors the per-step `allowed_transitions`; kept
    /// denormalized so reachability checks are a single lookup.
    pub transitions: HashMap<StepId, Vec<StepId>>,
    #[serde(default)]
    pub rules: Vec<TemplateRule>,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl WorkflowTemplate {
    /// The first step in declared order, if the template has any steps.
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.values().min_by_key(|s| s.order)
    }

    pub fn step(&self, id: &StepId) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    pub fn contains_step(&self, id: &StepId) -> bool {
        self.steps.contains_key(id)
    }

    /// Steps reachable from `from`. Unknown steps have no successors.
    pub fn successors(&self, from: &StepId) -> &[StepId] {
        self.transitions.get(from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `step` terminates the template (no outgoing transitions).
    pub fn is_final_step(&self, step: &StepId) -> bool {
        self.successors(step).is_empty()
    }

    /// Required steps in declared order.
    pub fn required_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.values().filter(|s| s.required)
    }

    /// Whether the template declares an empty workflow valid for submission.
    pub fn allows_empty_submission(&self) -> bool {
        self.rules
            .iter()
            .any(|r| matches!(r, TemplateRule::AllowEmptySubmission))
    }
}

/// Builder validating the template graph at publication time.
///
/// Validation failures are construction errors, not runtime errors: a
/// template that names an unknown transition target or duplicates a step id
/// never becomes visible to the registry.
pub struct WorkflowTemplateBuilder {
    name: String,
    market_role: MarketRole,
    version: u32,
    steps: Vec<StepDefinition>,
    rules: Vec<TemplateRule>,
}

impl WorkflowTemplateBuilder {
    pub fn new(name: impl Into<String>, market_role: MarketRole, version: u32) -> Self {
        Self {
            name: name.into(),
            market_role,
            version,
            steps: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Append a step. Order is assigned from the append position.
    pub fn step(
        mut self,
        id: impl Into<StepId>,
        name: impl Into<String>,
        kind: StepKind,
        config: ValueRef,
        required: bool,
        allowed_transitions: Vec<StepId>,
    ) -> Self {
        let order = self.steps.len() as u32;
        self.steps.push(StepDefinition {
            id: id.into(),
            name: name.into(),
            kind,
            config,
            required,
            order,
            allowed_transitions,
        });
        self
    }

    pub fn rule(mut self, rule: TemplateRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn build(self) -> Result<WorkflowTemplate, CoreError> {
        let mut steps = IndexMap::with_capacity(self.steps.len());
        for step in &self.steps {
            if steps.insert(step.id.clone(), step.clone()).is_some() {
                return Err(CoreError::InvalidTemplate {
                    name: format!("{}: duplicate step id '{}'", self.name, step.id),
                });
            }
        }

        let mut transitions = HashMap::with_capacity(self.steps.len());
        for step in &self.steps {
            for target in &step.allowed_transitions {
                if !steps.contains_key(target) {
                    return Err(CoreError::InvalidTemplate {
                        name: format!(
                            "{}: step '{}' transitions to unknown step '{}'",
                            self.name, step.id, target
                        ),
                    });
                }
            }
            transitions.insert(step.id.clone(), step.allowed_transitions.clone());
        }

        Ok(WorkflowTemplate {
            id: TemplateId::new(),
            name: self.name,
            market_role: self.market_role,
            version: self.version,
            steps,
            transitions,
            rules: self.rules,
            published_at: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_template() -> WorkflowTemplate {
        WorkflowTemplateBuilder::new("BRP-onboarding", MarketRole::Brp, 1)
            .step(
                "company_info",
                "Company information",
                StepKind::Form,
                ValueRef::new(json!({"fields": []})),
                true,
                vec![StepId::from("portfolio")],
            )
            .step(
                "portfolio",
                "Portfolio",
                StepKind::Form,
                ValueRef::default(),
                true,
                vec![],
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_first_and_final_steps() {
        let template = linear_template();
        assert_eq!(
            template.first_step().unwrap().id,
            StepId::from("company_info")
        );
        assert!(!template.is_final_step(&StepId::from("company_info")));
        assert!(template.is_final_step(&StepId::from("portfolio")));
    }

    #[test]
    fn test_successors() {
        let template = linear_template();
        assert_eq!(
            template.successors(&StepId::from("company_info")),
            &[StepId::from("portfolio")]
        );
        assert!(template.successors(&StepId::from("unknown")).is_empty());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let err = WorkflowTemplateBuilder::new("bad", MarketRole::Brp, 1)
            .step("a", "A", StepKind::Form, ValueRef::default(), true, vec![])
            .step("a", "A again", StepKind::Form, ValueRef::default(), true, vec![])
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_unknown_transition_target_rejected() {
        let err = WorkflowTemplateBuilder::new("bad", MarketRole::Brp, 1)
            .step(
                "a",
                "A",
                StepKind::Form,
                ValueRef::default(),
                true,
                vec![StepId::from("missing")],
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_template_serde_round_trip() {
        let template = linear_template();
        let json = serde_json::to_string(&template).unwrap();
        let deserialized: WorkflowTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, template);
    }
}
