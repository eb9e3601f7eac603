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

use gridflow_core::{FieldError, StepDefinition, StepKind, StepOutcome, ValueRef};
use serde::Deserialize;

use crate::StepHandler;
use crate::context::HandlerContext;
use crate::error::{HandlerError, Result};
use crate::result::{StepExecution, ValidationOutcome};

/// Declared validation rules for one form field.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct FieldRule {
    name: String,
    required: bool,
    pattern: Option<String>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    min_items: Option<usize>,
    max_items: Option<usize>,
    options: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct FormConfig {
    fields: Vec<FieldRule>,
}

/// Synchronous form step: validates submitted data against the declared
/// schema rules and records it.
///
/// Persistence is the engine's concern: the submitted data rides in
/// `STEP_STARTED` and lands in the step state through projection, so this
/// handler has no compensation side effects of its own: compensating a form
/// step is the projection reset performed by `STEP_COMPENSATED`.
#[derive(Default)]
pub struct FormHandler;

impl FormHandler {
    pub fn new() -> Self {
        Self
    }

    fn config(step: &StepDefinition) -> Result<FormConfig> {
        serde_json::from_value(step.config.value().clone()).map_err(|e| {
            error_stack::report!(HandlerError::InvalidConfig {
                step_id: step.id.clone(),
            })
            .attach_printable(e.to_string())
        })
    }

    fn check_field(rule: &FieldRule, data: &ValueRef, errors: &mut Vec<FieldError>) {
        let value = match data.get(&rule.name) {
            Some(value) if !value.is_null() => value,
            _ => {
                if rule.required {
                    errors.push(FieldError::new(&rule.name, "field is required"));
                }
                return;
            }
        };

        if let Some(s) = value.as_str() {
            if rule.min_length.is_some_and(|min| s.chars().count() < min) {
                errors.push(FieldError::new(
                    &rule.name,
                    format!("must be at least {} characters", rule.min_length.unwrap_or(0)),
                ));
            }
            if rule.max_length.is_some_and(|max| s.chars().count() > max) {
                errors.push(FieldError::new(
                    &rule.name,
                    format!("must be at most {} characters", rule.max_length.unwrap_or(0)),
                ));
            }
            if let Some(pattern) = &rule.pattern {
                match regex::Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(s) {
                            errors.push(FieldError::new(
                                &rule.name,
                                format!("does not match pattern '{pattern}'"),
                            ));
                        }
                    }
                    Err(_) => {
                        errors.push(FieldError::new(
                            &rule.name,
                            format!("declared pattern '{pattern}' is not a valid expression"),
                        ));
                    }
                }
            }
        }

        if let Some(items) = value.as_array() {
            if rule.min_items.is_some_and(|min| items.len() < min) {
                errors.push(FieldError::new(
                    &rule.name,
                    format!("must contain at least {} items", rule.min_items.unwrap_or(0)),
                ));
            }
            if rule.max_items.is_some_and(|max| items.len() > max) {
                errors.push(FieldError::new(
                    &rule.name,
                    format!("must contain at most {} items", rule.max_items.unwrap_or(0)),
                ));
            }
            if let Some(options) = &rule.options
                && items.iter().any(|item| !options.contains(item))
            {
                errors.push(FieldError::new(&rule.name, "contains a value not in options"));
            }
        } else if let Some(options) = &rule.options
            && !options.contains(value)
        {
            errors.push(FieldError::new(&rule.name, "value is not in options"));
        }
    }
}

impl StepHandler for FormHandler {
    fn kind(&self) -> StepKind {
        StepKind::Form
    }

    fn validate(&self, step: &StepDefinition, data: &ValueRef) -> ValidationOutcome {
        let config = match Self::config(step) {
            Ok(config) => config,
            Err(_) => {
                return ValidationOutcome::invalid(vec![FieldError::new(
                    step.id.as_str(),
                    "form configuration is invalid",
                )]);
            }
        };

        let mut errors = Vec::new();
        for rule in &config.fields {
            Self::check_field(rule, data, &mut errors);
        }
        ValidationOutcome::from_errors(errors)
    }

    async fn execute(
        &self,
        step: &StepDefinition,
        input: ValueRef,
        _ctx: &HandlerContext,
    ) -> Result<StepExecution> {
        let outcome = self.validate(step, &input);
        if !outcome.valid {
            // The engine validates before dispatch; hitting this means data
            // changed between validation and execution.
            return Ok(StepExecution::failed(gridflow_core::ErrorDetail::new(
                "Validation",
                "submitted form data failed validation",
            )));
        }
        Ok(StepExecution::completed(StepOutcome::Default, None))
    }

    async fn on_resume(
        &self,
        step: &StepDefinition,
        _payload: ValueRef,
        _ctx: &HandlerContext,
    ) -> Result<StepExecution> {
        Err(error_stack::report!(HandlerError::UnexpectedResume {
            step_id: step.id.clone(),
        }))
    }

    async fn compensate(&self, _step: &StepDefinition, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::StepId;
    use serde_json::json;

    fn step(config: serde_json::Value) -> StepDefinition {
        StepDefinition {
            id: StepId::from("company_info"),
            name: "Company information".to_string(),
            kind: StepKind::Form,
            config: ValueRef::new(config),
            required: true,
            order: 0,
            allowed_transitions: vec![],
        }
    }

    #[test]
    fn test_required_field() {
        let handler = FormHandler::new();
        let step = step(json!({"fields": [{"name": "companyName", "required": true}]}));

        let outcome = handler.validate(&step, &ValueRef::new(json!({})));
        assert!(!outcome.valid);
        assert_eq!(outcome.errors[0].field, "companyName");

        let outcome = handler.validate(&step, &ValueRef::new(json!({"companyName": "Engie"})));
        assert!(outcome.valid);
    }

    #[test]
    fn test_pattern_rule() {
        let handler = FormHandler::new();
        let step = step(json!({
            "fields": [{"name": "vatNumber", "required": true, "pattern": "^BE[0-9]{10}$"}]
        }));

        let ok = handler.validate(&step, &ValueRef::new(json!({"vatNumber": "BE0403170701"})));
        assert!(ok.valid);

        let bad = handler.validate(&step, &ValueRef::new(json!({"vatNumber": "FR123"})));
        assert!(!bad.valid);
    }

    #[test]
    fn test_length_bounds() {
        let handler = FormHandler::new();
        let step = step(json!({
            "fields": [{"name": "companyName", "minLength": 2, "maxLength": 5}]
        }));

        assert!(!handler.validate(&step, &ValueRef::new(json!({"companyName": "E"}))).valid);
        assert!(handler.validate(&step, &ValueRef::new(json!({"companyName": "Engie"}))).valid);
        assert!(
            !handler
                .validate(&step, &ValueRef::new(json!({"companyName": "too long"})))
                .valid
        );
    }

    #[test]
    fn test_item_bounds_and_options() {
        let handler = FormHandler::new();
        let step = step(json!({
            "fields": [{
                "name": "accessPoints",
                "minItems": 1,
                "maxItems": 2,
                "options": ["EAN-1", "EAN-2", "EAN-3"]
            }]
        }));

        assert!(!handler.validate(&step, &ValueRef::new(json!({"accessPoints": []}))).valid);
        assert!(
            handler
                .validate(&step, &ValueRef::new(json!({"accessPoints": ["EAN-1"]})))
                .valid
        );
        assert!(
            !handler
                .validate(&step, &ValueRef::new(json!({"accessPoints": ["EAN-9"]})))
                .valid
        );
        assert!(
            !handler
                .validate(
                    &step,
                    &ValueRef::new(json!({"accessPoints": ["EAN-1", "EAN-2", "EAN-3"]}))
                )
                .valid
        );
    }

    #[test]
    fn test_optional_absent_field_passes() {
        let handler = FormHandler::new();
        let step = step(json!({"fields": [{"name": "website", "minLength": 4}]}));
        assert!(handler.validate(&step, &ValueRef::new(json!({}))).valid);
    }
}
