//! WebSocket message types for the Ladder protocol
//!
//! These types mirror the server's protocol. Some fields may not be used
//! directly by the CLI but are part of the complete protocol.

#![allow(dead_code)]

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Draft,
    UnderReview,
    Approved,
    Declined,
}

impl InstanceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            InstanceStatus::Draft => "draft",
            InstanceStatus::UnderReview => "under review",
            InstanceStatus::Approved => "approved",
            InstanceStatus::Declined => "declined",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub template_id: Uuid,
    pub resource_id: String,
    pub resource_type: String,
    pub creator_id: i64,
    pub location_id: i64,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub current_step_order: i64,
    pub status: InstanceStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub step_order: i64,
    pub name: String,
    pub status: StepStatus,
    pub resolved_approvers: BTreeSet<i64>,
    pub acted_by: Option<i64>,
    pub acted_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub allow_decline: bool,
    pub allow_adjust: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowView {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub current_step_order: i64,
    pub steps: Vec<StepView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRunReport {
    pub instance_id: Uuid,
    pub steps_performed: u32,
    pub status: InstanceStatus,
    pub current_step_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: Uuid,
    pub delegator_id: i64,
    pub delegate_id: i64,
    pub permission: String,
    pub location_id: Option<i64>,
    pub include_descendants: bool,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: DelegationStatus,
    pub revoked_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Approved,
    Declined,
    RoutedBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub instance_id: Uuid,
    pub step_order: i64,
    pub action: WorkflowAction,
    pub actor_id: i64,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub automated_by: Option<i64>,
}

/// Messages from client to server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Submit {
        resource_id: String,
        resource_type: String,
        creator_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        location_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        template_id: Option<Uuid>,
        fields: Map<String, Value>,
    },
    GetView {
        instance_id: Uuid,
    },
    Approve {
        instance_id: Uuid,
        step_order: i64,
        actor_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    Decline {
        instance_id: Uuid,
        step_order: i64,
        actor_id: i64,
        comment: String,
    },
    RouteBack {
        instance_id: Uuid,
        target_step: i64,
        actor_id: i64,
        comment: String,
    },
    Resubmit {
        instance_id: Uuid,
        actor_id: i64,
    },
    AutoRun {
        instance_id: Uuid,
        max_steps: u32,
        operator_id: i64,
    },
    CreateDelegation {
        delegator_id: i64,
        delegate_id: i64,
        permission: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        location_id: Option<i64>,
        include_descendants: bool,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        created_by: i64,
    },
    RevokeDelegation {
        delegation_id: Uuid,
        actor_id: i64,
    },
    ListDelegations {
        user_id: i64,
        as_delegator: bool,
    },
    Subscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_id: Option<Uuid>,
    },
}

/// Messages from server to client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TemplateCreated { template: Value },
    Instance { instance: WorkflowInstance },
    View { view: WorkflowView },
    AutoRunReport { report: AutoRunReport },
    Delegation { delegation: Delegation },
    Delegations { delegations: Vec<Delegation> },
    Subscribed { instance_id: Option<Uuid> },
    Event { event: WorkflowEvent },
    Error { kind: String, message: String },
}
