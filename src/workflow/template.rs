//! Workflow templates and step configuration
//!
//! Step configuration is a closed set of tagged structures. Templates are
//! validated once when written, so the engine never has to interpret loosely
//! typed configuration at run time.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{is_valid_permission_name, LocationId, RoleId};

/// Which part of the hierarchy an approver query covers, relative to the
/// workflow's location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationScope {
    /// The workflow location only
    #[default]
    Same,
    /// The workflow location and its direct parent
    Parent,
    /// The workflow location and everything below it
    Descendants,
    /// Anywhere
    All,
}

impl LocationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationScope::Same => "same",
            LocationScope::Parent => "parent",
            LocationScope::Descendants => "descendants",
            LocationScope::All => "all",
        }
    }
}

/// How the candidate approvers of a step are computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverStrategy {
    /// Everyone holding the step's permission in scope
    Permission {
        #[serde(default)]
        include_manager: bool,
    },
    /// The creator's direct manager, if they hold the permission
    Manager,
    /// Holders of one of the listed roles who also hold the permission
    Role { required_roles: BTreeSet<RoleId> },
    /// Union of `Manager` and `Role`
    Combined { required_roles: BTreeSet<RoleId> },
}

impl ApproverStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ApproverStrategy::Permission { .. } => "permission",
            ApproverStrategy::Manager => "manager",
            ApproverStrategy::Role { .. } => "role",
            ApproverStrategy::Combined { .. } => "combined",
        }
    }

    fn validate(&self, step_order: i64) -> Result<()> {
        match self {
            ApproverStrategy::Role { required_roles }
            | ApproverStrategy::Combined { required_roles }
                if required_roles.is_empty() =>
            {
                Err(AppError::Validation(format!(
                    "step {}: {} strategy needs at least one required role",
                    step_order,
                    self.name()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Predicate over the submitted resource, used by conditional rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    GreaterThan { field: String, value: f64 },
    AtLeast { field: String, value: f64 },
    LessThan { field: String, value: f64 },
    AtMost { field: String, value: f64 },
    Equals { field: String, value: Value },
    ResourceTypeIs { resource_type: String },
}

impl Condition {
    /// Evaluate against a resource. Missing or non-numeric fields never
    /// satisfy a numeric comparison.
    pub fn holds(&self, resource_type: &str, fields: &Map<String, Value>) -> bool {
        match self {
            Condition::Always => true,
            Condition::GreaterThan { field, value } => {
                numeric(fields, field).is_some_and(|v| v > *value)
            }
            Condition::AtLeast { field, value } => {
                numeric(fields, field).is_some_and(|v| v >= *value)
            }
            Condition::LessThan { field, value } => {
                numeric(fields, field).is_some_and(|v| v < *value)
            }
            Condition::AtMost { field, value } => {
                numeric(fields, field).is_some_and(|v| v <= *value)
            }
            Condition::Equals { field, value } => fields.get(field) == Some(value),
            Condition::ResourceTypeIs {
                resource_type: expected,
            } => expected == resource_type,
        }
    }

    fn validate(&self, step_order: i64) -> Result<()> {
        let invalid = |msg: &str| {
            Err(AppError::Validation(format!(
                "step {}: conditional rule {}",
                step_order, msg
            )))
        };
        match self {
            Condition::Always => Ok(()),
            Condition::GreaterThan { field, value }
            | Condition::AtLeast { field, value }
            | Condition::LessThan { field, value }
            | Condition::AtMost { field, value } => {
                if field.trim().is_empty() {
                    invalid("has an empty field name")
                } else if !value.is_finite() {
                    invalid("compares against a non-finite number")
                } else {
                    Ok(())
                }
            }
            Condition::Equals { field, .. } if field.trim().is_empty() => {
                invalid("has an empty field name")
            }
            Condition::Equals { .. } => Ok(()),
            Condition::ResourceTypeIs { resource_type } if resource_type.trim().is_empty() => {
                invalid("has an empty resource type")
            }
            Condition::ResourceTypeIs { .. } => Ok(()),
        }
    }
}

fn numeric(fields: &Map<String, Value>, field: &str) -> Option<f64> {
    match fields.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// When `condition` holds, resolve with `strategy` (and `location_scope`, if
/// given) instead of the step's own configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub condition: Condition,
    pub strategy: ApproverStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_scope: Option<LocationScope>,
}

fn default_true() -> bool {
    true
}

/// One configured step of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_order: i64,
    #[serde(default)]
    pub name: String,
    pub required_permission: String,
    pub strategy: ApproverStrategy,
    #[serde(default)]
    pub location_scope: LocationScope,
    #[serde(default)]
    pub conditional_rules: Vec<ConditionalRule>,
    #[serde(default = "default_true")]
    pub allow_decline: bool,
    #[serde(default)]
    pub allow_adjust: bool,
}

impl WorkflowStep {
    pub fn new(step_order: i64, required_permission: &str, strategy: ApproverStrategy) -> Self {
        Self {
            step_order,
            name: format!("Step {}", step_order),
            required_permission: required_permission.to_string(),
            strategy,
            location_scope: LocationScope::default(),
            conditional_rules: Vec::new(),
            allow_decline: true,
            allow_adjust: false,
        }
    }

    pub fn with_scope(mut self, scope: LocationScope) -> Self {
        self.location_scope = scope;
        self
    }

    pub fn with_rule(mut self, rule: ConditionalRule) -> Self {
        self.conditional_rules.push(rule);
        self
    }

    pub fn without_decline(mut self) -> Self {
        self.allow_decline = false;
        self
    }
}

/// Check the step list of a template: non-empty, `step_order` contiguous
/// from 1 in declared order, well-formed permissions, roles and rules
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<()> {
    if steps.is_empty() {
        return Err(AppError::Validation(
            "a template needs at least one step".to_string(),
        ));
    }

    for (index, step) in steps.iter().enumerate() {
        let expected = index as i64 + 1;
        if step.step_order != expected {
            return Err(AppError::Validation(format!(
                "step orders must be contiguous from 1: expected {}, found {}",
                expected, step.step_order
            )));
        }
        if !is_valid_permission_name(&step.required_permission) {
            return Err(AppError::Validation(format!(
                "step {}: permission '{}' is not of the form resource.action",
                step.step_order, step.required_permission
            )));
        }
        step.strategy.validate(step.step_order)?;
        for rule in &step.conditional_rules {
            rule.condition.validate(step.step_order)?;
            rule.strategy.validate(step.step_order)?;
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Active,
    Deprecated,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Active => "active",
            TemplateStatus::Deprecated => "deprecated",
        }
    }
}

impl std::str::FromStr for TemplateStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(TemplateStatus::Active),
            "deprecated" => Ok(TemplateStatus::Deprecated),
            _ => Err(format!("Invalid template status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub name: String,
    pub resource_type: String,
    /// `None` = applies at every location
    pub location_id: Option<LocationId>,
    pub status: TemplateStatus,
    pub version: i64,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    pub fn step(&self, step_order: i64) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_order == step_order)
    }

    pub fn final_step_order(&self) -> i64 {
        self.steps.iter().map(|s| s.step_order).max().unwrap_or(0)
    }

    pub fn is_final_step(&self, step_order: i64) -> bool {
        step_order == self.final_step_order()
    }
}

/// Request to create a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflowTemplate {
    pub name: String,
    pub resource_type: String,
    #[serde(default)]
    pub location_id: Option<LocationId>,
    pub steps: Vec<WorkflowStep>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_contiguous_steps_accepted() {
        let steps = vec![
            WorkflowStep::new(1, "leave.approve", ApproverStrategy::Manager),
            WorkflowStep::new(
                2,
                "leave.approve",
                ApproverStrategy::Permission {
                    include_manager: false,
                },
            ),
        ];
        assert!(validate_steps(&steps).is_ok());
    }

    #[test]
    fn test_gap_in_step_order_rejected() {
        let steps = vec![
            WorkflowStep::new(1, "leave.approve", ApproverStrategy::Manager),
            WorkflowStep::new(3, "leave.approve", ApproverStrategy::Manager),
        ];
        assert!(matches!(
            validate_steps(&steps),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_steps_must_start_at_one() {
        let steps = vec![WorkflowStep::new(
            0,
            "leave.approve",
            ApproverStrategy::Manager,
        )];
        assert!(validate_steps(&steps).is_err());
        assert!(validate_steps(&[]).is_err());
    }

    #[test]
    fn test_role_strategy_needs_roles() {
        let steps = vec![WorkflowStep::new(
            1,
            "leave.approve",
            ApproverStrategy::Role {
                required_roles: BTreeSet::new(),
            },
        )];
        assert!(validate_steps(&steps).is_err());

        let steps = vec![WorkflowStep::new(
            1,
            "leave.approve",
            ApproverStrategy::Manager,
        )
        .with_rule(ConditionalRule {
            condition: Condition::Always,
            strategy: ApproverStrategy::Combined {
                required_roles: BTreeSet::new(),
            },
            location_scope: None,
        })];
        assert!(validate_steps(&steps).is_err());
    }

    #[test]
    fn test_bad_permission_rejected() {
        let steps = vec![WorkflowStep::new(1, "approve", ApproverStrategy::Manager)];
        assert!(validate_steps(&steps).is_err());
    }

    #[test]
    fn test_numeric_conditions() {
        let f = fields(json!({ "days": 5, "amount": "120.5" }));

        assert!(Condition::GreaterThan {
            field: "days".into(),
            value: 3.0
        }
        .holds("leave", &f));
        assert!(!Condition::GreaterThan {
            field: "days".into(),
            value: 5.0
        }
        .holds("leave", &f));
        assert!(Condition::AtLeast {
            field: "days".into(),
            value: 5.0
        }
        .holds("leave", &f));
        assert!(Condition::LessThan {
            field: "amount".into(),
            value: 200.0
        }
        .holds("leave", &f));
        assert!(!Condition::AtMost {
            field: "missing".into(),
            value: 1.0
        }
        .holds("leave", &f));
    }

    #[test]
    fn test_equality_and_resource_conditions() {
        let f = fields(json!({ "kind": "sick" }));
        assert!(Condition::Equals {
            field: "kind".into(),
            value: json!("sick")
        }
        .holds("leave", &f));
        assert!(Condition::ResourceTypeIs {
            resource_type: "leave".into()
        }
        .holds("leave", &f));
        assert!(!Condition::ResourceTypeIs {
            resource_type: "timesheet".into()
        }
        .holds("leave", &f));
    }

    #[test]
    fn test_step_config_deserializes_with_defaults() {
        let raw = json!({
            "step_order": 1,
            "required_permission": "timesheet.approve",
            "strategy": { "kind": "role", "required_roles": [3, 1] },
            "conditional_rules": [
                {
                    "condition": { "op": "greater_than", "field": "hours", "value": 40 },
                    "strategy": { "kind": "manager" },
                    "location_scope": "parent"
                }
            ]
        });
        let step: WorkflowStep = serde_json::from_value(raw).unwrap();

        assert_eq!(step.location_scope, LocationScope::Same);
        assert!(step.allow_decline);
        assert!(!step.allow_adjust);
        assert_eq!(
            step.strategy,
            ApproverStrategy::Role {
                required_roles: [1, 3].into_iter().collect()
            }
        );
        assert_eq!(
            step.conditional_rules[0].location_scope,
            Some(LocationScope::Parent)
        );
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let raw = json!({
            "step_order": 1,
            "required_permission": "leave.approve",
            "strategy": { "kind": "anyone" }
        });
        assert!(serde_json::from_value::<WorkflowStep>(raw).is_err());
    }

    #[test]
    fn test_final_step() {
        let template = WorkflowTemplate {
            id: Uuid::new_v4(),
            name: "Leave".into(),
            resource_type: "leave".into(),
            location_id: None,
            status: TemplateStatus::Active,
            version: 1,
            steps: vec![
                WorkflowStep::new(1, "leave.approve", ApproverStrategy::Manager),
                WorkflowStep::new(2, "leave.approve", ApproverStrategy::Manager),
            ],
            created_at: Utc::now(),
        };
        assert_eq!(template.final_step_order(), 2);
        assert!(template.is_final_step(2));
        assert!(!template.is_final_step(1));
        assert!(template.step(3).is_none());
    }
}
