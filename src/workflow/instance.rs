//! Workflow instances, step instances, change events and the read model

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{LocationId, UserId};

/// Status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Handed back to the creator; owned by the caller until resubmitted
    Draft,
    UnderReview,
    Approved,
    Declined,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Draft => "draft",
            InstanceStatus::UnderReview => "under_review",
            InstanceStatus::Approved => "approved",
            InstanceStatus::Declined => "declined",
        }
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Approved | InstanceStatus::Declined)
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InstanceStatus::Draft),
            "under_review" => Ok(InstanceStatus::UnderReview),
            "approved" => Ok(InstanceStatus::Approved),
            "declined" => Ok(InstanceStatus::Declined),
            _ => Err(format!("Invalid instance status: {}", s)),
        }
    }
}

/// Status of one step of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Declined,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Approved => "approved",
            StepStatus::Declined => "declined",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "approved" => Ok(StepStatus::Approved),
            "declined" => Ok(StepStatus::Declined),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// A submitted resource travelling through a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub template_id: Uuid,
    pub resource_id: String,
    pub resource_type: String,
    pub creator_id: UserId,
    pub location_id: LocationId,
    /// Resource attributes consulted by conditional rules
    pub fields: Map<String, Value>,
    pub current_step_order: i64,
    pub status: InstanceStatus,
    /// Bumped on every transition; part of the transition guard
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Reject anything but a review action on the current step of a live instance
    pub fn ensure_actionable(&self, step_order: i64) -> Result<()> {
        match self.status {
            InstanceStatus::UnderReview => {}
            InstanceStatus::Draft => {
                return Err(AppError::Conflict(format!(
                    "instance {} is back with its creator",
                    self.id
                )))
            }
            status => {
                return Err(AppError::Conflict(format!(
                    "instance {} is already {}",
                    self.id,
                    status.as_str()
                )))
            }
        }

        if step_order != self.current_step_order {
            return Err(AppError::Conflict(format!(
                "step {} is not current for instance {} (current is {}); refresh and retry",
                step_order, self.id, self.current_step_order
            )));
        }

        Ok(())
    }
}

/// Execution record of one step of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStepInstance {
    pub instance_id: Uuid,
    pub step_order: i64,
    pub status: StepStatus,
    pub acted_by: Option<UserId>,
    pub acted_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    /// Operator who triggered an automated approval
    pub automated_by: Option<UserId>,
}

/// Request to start a workflow for a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub resource_id: String,
    pub resource_type: String,
    pub creator_id: UserId,
    /// Defaults to the creator's primary location
    #[serde(default)]
    pub location_id: Option<LocationId>,
    /// Use this template instead of looking one up by resource type
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Approved,
    Declined,
    RoutedBack,
}

/// Change event consumed by audit logging and notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub instance_id: Uuid,
    pub step_order: i64,
    pub action: WorkflowAction,
    pub actor_id: UserId,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated_by: Option<UserId>,
}

/// Read model of one step, for rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub step_order: i64,
    pub name: String,
    pub status: StepStatus,
    pub resolved_approvers: BTreeSet<UserId>,
    pub acted_by: Option<UserId>,
    pub acted_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub allow_decline: bool,
    pub allow_adjust: bool,
}

/// Read model of an instance, for rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowView {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub current_step_order: i64,
    pub steps: Vec<StepView>,
}

/// Outcome of a completed auto-run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRunReport {
    pub instance_id: Uuid,
    pub steps_performed: u32,
    pub status: InstanceStatus,
    pub current_step_order: i64,
}
