//! Read models for the organization directory and delegated authority

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = i64;
pub type LocationId = i64;
pub type RoleId = i64;

/// A node of the organizational location tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub parent_id: Option<LocationId>,
    /// Materialized path, e.g. `1.4.2`
    pub path: String,
    pub level: i64,
    pub status: LocationStatus,
}

impl Location {
    /// Number of segments in the materialized path
    pub fn depth(&self) -> usize {
        self.path.split('.').count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    Active,
    Inactive,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Active => "active",
            LocationStatus::Inactive => "inactive",
        }
    }
}

impl std::str::FromStr for LocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LocationStatus::Active),
            "inactive" => Ok(LocationStatus::Inactive),
            _ => Err(format!("Invalid location status: {}", s)),
        }
    }
}

/// A dotted `resource.action` permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: i64,
    pub name: String,
    pub module: String,
}

/// Check that a permission name has the `resource.action` shape
pub fn is_valid_permission_name(name: &str) -> bool {
    let mut parts = name.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(resource), Some(action), None) => {
            let ok = |s: &str| {
                !s.is_empty()
                    && s.chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            };
            ok(resource) && ok(action)
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub manager_id: Option<UserId>,
    pub primary_location_id: Option<LocationId>,
    pub active: bool,
    pub deleted: bool,
}

impl User {
    /// Only active, non-deleted users may appear as approvers
    pub fn is_eligible(&self) -> bool {
        self.active && !self.deleted
    }
}

/// A role assignment. `location_id == None` means organization-wide;
/// otherwise the assignment covers that location and everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub id: i64,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub location_id: Option<LocationId>,
    pub active: bool,
}

/// Lifecycle status of a delegation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Active,
    Revoked,
    Expired,
}

impl DelegationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationStatus::Active => "active",
            DelegationStatus::Revoked => "revoked",
            DelegationStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for DelegationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DelegationStatus::Active),
            "revoked" => Ok(DelegationStatus::Revoked),
            "expired" => Ok(DelegationStatus::Expired),
            _ => Err(format!("Invalid delegation status: {}", s)),
        }
    }
}

/// A time-bounded, scope-bounded grant letting `delegate_id` act with
/// `delegator_id`'s permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: Uuid,
    pub delegator_id: UserId,
    pub delegate_id: UserId,
    pub permission: String,
    /// `None` = global
    pub location_id: Option<LocationId>,
    pub include_descendants: bool,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: DelegationStatus,
    pub revoked_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Delegation {
    /// Usable right now: active, never revoked, and `now` inside the closed window
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status == DelegationStatus::Active
            && self.revoked_at.is_none()
            && self.valid_from <= now
            && now <= self.valid_until
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            from: self.valid_from,
            until: self.valid_until,
        }
    }
}

/// Closed time interval `[from, until]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { from, until }
    }

    pub fn intersects(&self, other: &TimeWindow) -> bool {
        self.from <= other.until && other.from <= self.until
    }
}

/// Request to create a delegation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDelegationRequest {
    pub delegator_id: UserId,
    pub delegate_id: UserId,
    pub permission: String,
    #[serde(default)]
    pub location_id: Option<LocationId>,
    #[serde(default)]
    pub include_descendants: bool,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Who is creating it; the delegator or an administrator acting for them
    pub created_by: UserId,
}
