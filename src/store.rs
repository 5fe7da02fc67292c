//! Database store for the directory read models, workflows and delegations

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    Delegation, Location, LocationId, Permission, Role, RoleId, User, UserId, UserRole,
};
use crate::workflow::{
    InstanceStatus, StepStatus, WorkflowInstance, WorkflowStep, WorkflowStepInstance,
    WorkflowTemplate,
};

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// The state an instance must still be in for a transition to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionGuard {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub step_order: i64,
    pub version: i64,
}

impl TransitionGuard {
    pub fn of(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id,
            status: instance.status,
            step_order: instance.current_step_order,
            version: instance.version,
        }
    }
}

/// Who acted on a step, and how
#[derive(Debug, Clone)]
pub struct StepAction<'a> {
    pub actor_id: UserId,
    pub comment: Option<&'a str>,
    pub automated_by: Option<UserId>,
    pub acted_at: DateTime<Utc>,
}

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // Location operations

    pub async fn insert_location_row(
        &self,
        name: &str,
        parent_id: Option<LocationId>,
        path: &str,
        level: i64,
    ) -> Result<Location> {
        let result = sqlx::query(
            r#"
            INSERT INTO locations (name, parent_id, path, level, status)
            VALUES (?, ?, ?, ?, 'active')
            "#,
        )
        .bind(name)
        .bind(parent_id)
        .bind(path)
        .bind(level)
        .execute(&self.pool)
        .await?;

        Ok(Location {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            parent_id,
            path: path.to_string(),
            level,
            status: crate::models::LocationStatus::Active,
        })
    }

    pub async fn find_location(&self, id: LocationId) -> Result<Option<Location>> {
        let row = sqlx::query_as::<_, LocationRow>(
            r#"
            SELECT id, name, parent_id, path, level, status
            FROM locations
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    pub async fn get_location(&self, id: LocationId) -> Result<Location> {
        self.find_location(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Location {} not found", id)))
    }

    /// Children of `parent_id`, or the roots when `None`
    pub async fn list_child_locations(&self, parent_id: Option<LocationId>) -> Result<Vec<Location>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            r#"
            SELECT id, name, parent_id, path, level, status
            FROM locations
            WHERE parent_id IS ?
            ORDER BY id ASC
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Every location strictly below the node at `path`
    pub async fn list_locations_below(&self, path: &str) -> Result<Vec<Location>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            r#"
            SELECT id, name, parent_id, path, level, status
            FROM locations
            WHERE path LIKE ?
            ORDER BY path ASC
            "#,
        )
        .bind(format!("{}.%", path))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn list_locations_by_paths(&self, paths: &[String]) -> Result<Vec<Location>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT id, name, parent_id, path, level, status FROM locations WHERE path IN ({}) ORDER BY level ASC",
            placeholders(paths.len())
        );
        let mut query = sqlx::query_as::<_, LocationRow>(&sql);
        for path in paths {
            query = query.bind(path);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.try_into()).collect()
    }

    // Directory operations

    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, manager_id, primary_location_id, active, deleted)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                manager_id = excluded.manager_id,
                primary_location_id = excluded.primary_location_id,
                active = excluded.active,
                deleted = excluded.deleted
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(user.manager_id)
        .bind(user.primary_location_id)
        .bind(user.active)
        .bind(user.deleted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, name, manager_id, primary_location_id, active, deleted
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    pub async fn get_user(&self, id: UserId) -> Result<User> {
        self.find_user(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", id)))
    }

    pub async fn create_permission(&self, name: &str, module: &str) -> Result<Permission> {
        let result = sqlx::query(
            r#"
            INSERT INTO permissions (name, module) VALUES (?, ?)
            "#,
        )
        .bind(name)
        .bind(module)
        .execute(&self.pool)
        .await?;

        Ok(Permission {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            module: module.to_string(),
        })
    }

    pub async fn find_permission(&self, name: &str) -> Result<Option<Permission>> {
        let row: Option<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT id, name, module FROM permissions WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name, module)| Permission { id, name, module }))
    }

    pub async fn create_role(&self, name: &str) -> Result<Role> {
        let result = sqlx::query(
            r#"
            INSERT INTO roles (name) VALUES (?)
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(Role {
            id: result.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    pub async fn grant_permission(&self, role_id: RoleId, permission_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?, ?)
            "#,
        )
        .bind(role_id)
        .bind(permission_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn assign_role(
        &self,
        user_id: UserId,
        role_id: RoleId,
        location_id: Option<LocationId>,
    ) -> Result<UserRole> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id, location_id, active) VALUES (?, ?, ?, 1)
            "#,
        )
        .bind(user_id)
        .bind(role_id)
        .bind(location_id)
        .execute(&self.pool)
        .await?;

        Ok(UserRole {
            id: result.last_insert_rowid(),
            user_id,
            role_id,
            location_id,
            active: true,
        })
    }

    /// Active, non-deleted users holding `permission` through an active role assignment
    pub async fn list_users_with_permission(&self, permission: &str) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT DISTINCT u.id, u.name, u.manager_id, u.primary_location_id, u.active, u.deleted
            FROM users u
            JOIN user_roles ur ON ur.user_id = u.id AND ur.active = 1
            JOIN role_permissions rp ON rp.role_id = ur.role_id
            JOIN permissions p ON p.id = rp.permission_id
            WHERE p.name = ? AND u.active = 1 AND u.deleted = 0
            ORDER BY u.id ASC
            "#,
        )
        .bind(permission)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(User::from).collect())
    }

    /// Users with an active assignment to at least one of `roles`
    pub async fn user_ids_with_any_role(&self, roles: &BTreeSet<RoleId>) -> Result<HashSet<UserId>> {
        if roles.is_empty() {
            return Ok(HashSet::new());
        }

        let sql = format!(
            "SELECT DISTINCT user_id FROM user_roles WHERE active = 1 AND role_id IN ({})",
            placeholders(roles.len())
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for role in roles {
            query = query.bind(*role);
        }

        Ok(query.fetch_all(&self.pool).await?.into_iter().collect())
    }

    /// Scopes of the user's active assignments granting `permission`;
    /// `None` entries are organization-wide grants
    pub async fn permission_grant_scopes(
        &self,
        user_id: UserId,
        permission: &str,
    ) -> Result<Vec<Option<LocationId>>> {
        let scopes = sqlx::query_scalar::<_, Option<i64>>(
            r#"
            SELECT ur.location_id
            FROM user_roles ur
            JOIN users u ON u.id = ur.user_id
            JOIN role_permissions rp ON rp.role_id = ur.role_id
            JOIN permissions p ON p.id = rp.permission_id
            WHERE ur.user_id = ? AND ur.active = 1 AND p.name = ?
              AND u.active = 1 AND u.deleted = 0
            "#,
        )
        .bind(user_id)
        .bind(permission)
        .fetch_all(&self.pool)
        .await?;

        Ok(scopes)
    }

    // Template operations

    pub async fn insert_template(&self, template: &WorkflowTemplate) -> Result<()> {
        let steps = serde_json::to_string(&template.steps)
            .map_err(|e| AppError::Internal(format!("Failed to encode steps: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_templates (id, name, resource_type, location_id, status, version, steps, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(&template.resource_type)
        .bind(template.location_id)
        .bind(template.status.as_str())
        .bind(template.version)
        .bind(steps)
        .bind(template.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_template(&self, id: Uuid) -> Result<WorkflowTemplate> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, name, resource_type, location_id, status, version, steps, created_at
            FROM workflow_templates
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Template {} not found", id)))?;

        row.try_into()
    }

    pub async fn list_active_templates(&self, resource_type: &str) -> Result<Vec<WorkflowTemplate>> {
        let rows = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, name, resource_type, location_id, status, version, steps, created_at
            FROM workflow_templates
            WHERE resource_type = ? AND status = 'active'
            ORDER BY version DESC, created_at DESC
            "#,
        )
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Highest version ever written for a resource type at a location, or 0
    pub async fn latest_template_version(
        &self,
        resource_type: &str,
        location_id: Option<LocationId>,
    ) -> Result<i64> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(version) FROM workflow_templates
            WHERE resource_type = ? AND location_id IS ?
            "#,
        )
        .bind(resource_type)
        .bind(location_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(version.unwrap_or(0))
    }

    pub async fn deprecate_template(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_templates SET status = 'deprecated' WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Template {} not found", id)));
        }
        Ok(())
    }

    // Instance operations

    /// Insert a new instance together with its first pending step
    pub async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        let fields = serde_json::to_string(&instance.fields)
            .map_err(|e| AppError::Internal(format!("Failed to encode fields: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances (id, template_id, resource_id, resource_type, creator_id, location_id, fields, current_step_order, status, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance.id.to_string())
        .bind(instance.template_id.to_string())
        .bind(&instance.resource_id)
        .bind(&instance.resource_type)
        .bind(instance.creator_id)
        .bind(instance.location_id)
        .bind(fields)
        .bind(instance.current_step_order)
        .bind(instance.status.as_str())
        .bind(instance.version)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&mut *tx)
        .await?;

        open_step(&mut tx, instance.id, instance.current_step_order).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, template_id, resource_id, resource_type, creator_id, location_id, fields, current_step_order, status, version, created_at, updated_at
            FROM workflow_instances
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Instance {} not found", id)))?;

        row.try_into()
    }

    pub async fn get_step_instances(&self, instance_id: Uuid) -> Result<Vec<WorkflowStepInstance>> {
        let rows = sqlx::query_as::<_, StepInstanceRow>(
            r#"
            SELECT instance_id, step_order, status, acted_by, acted_at, comment, automated_by
            FROM workflow_step_instances
            WHERE instance_id = ?
            ORDER BY step_order ASC
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Close the guarded current step as approved. `next_step` is opened as
    /// pending; `None` finishes the instance as approved.
    pub async fn record_approval(
        &self,
        guard: TransitionGuard,
        action: &StepAction<'_>,
        next_step: Option<i64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let (status, step_order) = match next_step {
            Some(next) => (InstanceStatus::UnderReview, next),
            None => (InstanceStatus::Approved, guard.step_order),
        };
        update_instance_guarded(&mut tx, guard, status, step_order, action.acted_at).await?;
        close_step(&mut tx, guard, StepStatus::Approved, action).await?;
        if let Some(next) = next_step {
            open_step(&mut tx, guard.instance_id, next).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Close the guarded current step as declined and terminate the instance
    pub async fn record_decline(&self, guard: TransitionGuard, action: &StepAction<'_>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        update_instance_guarded(
            &mut tx,
            guard,
            InstanceStatus::Declined,
            guard.step_order,
            action.acted_at,
        )
        .await?;
        close_step(&mut tx, guard, StepStatus::Declined, action).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Reset every step at or after `target` to pending. `target == 0` hands
    /// the instance back to its creator as a draft.
    pub async fn record_route_back(
        &self,
        guard: TransitionGuard,
        target: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let (status, step_order) = if target == 0 {
            (InstanceStatus::Draft, guard.step_order)
        } else {
            (InstanceStatus::UnderReview, target)
        };
        update_instance_guarded(&mut tx, guard, status, step_order, now).await?;

        sqlx::query(
            r#"
            UPDATE workflow_step_instances
            SET status = 'pending', acted_by = NULL, acted_at = NULL, comment = NULL, automated_by = NULL
            WHERE instance_id = ? AND step_order >= ?
            "#,
        )
        .bind(guard.instance_id.to_string())
        .bind(target)
        .execute(&mut *tx)
        .await?;

        if target > 0 {
            open_step(&mut tx, guard.instance_id, target).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Put a draft back under review at step 1
    pub async fn record_resubmission(&self, guard: TransitionGuard, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        update_instance_guarded(&mut tx, guard, InstanceStatus::UnderReview, 1, now).await?;
        open_step(&mut tx, guard.instance_id, 1).await?;

        tx.commit().await?;
        Ok(())
    }

    // Delegation operations

    /// Insert a delegation unless an active one for the same delegator,
    /// delegate and permission overlaps it in both time and location scope.
    /// Returns whether the row was written.
    ///
    /// The overlap test and the insert are one statement, so SQLite holds the
    /// write lock across both and concurrent creations cannot both pass.
    pub async fn insert_delegation(&self, delegation: &Delegation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO delegations (id, delegator_id, delegate_id, permission, location_id, include_descendants, valid_from, valid_until, status, revoked_at, reason, created_by, created_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1
                FROM delegations d
                LEFT JOIN locations held ON held.id = d.location_id
                LEFT JOIN locations wanted ON wanted.id = ?
                WHERE d.delegator_id = ? AND d.delegate_id = ? AND d.permission = ?
                  AND d.status = 'active'
                  AND d.valid_from <= ? AND ? <= d.valid_until
                  AND (
                      d.location_id IS NULL
                      OR wanted.id IS NULL
                      OR held.id = wanted.id
                      OR (d.include_descendants = 1 AND wanted.path LIKE held.path || '.%')
                      OR (? = 1 AND held.path LIKE wanted.path || '.%')
                  )
            )
            "#,
        )
        .bind(delegation.id.to_string())
        .bind(delegation.delegator_id)
        .bind(delegation.delegate_id)
        .bind(&delegation.permission)
        .bind(delegation.location_id)
        .bind(delegation.include_descendants)
        .bind(delegation.valid_from)
        .bind(delegation.valid_until)
        .bind(delegation.status.as_str())
        .bind(delegation.revoked_at)
        .bind(&delegation.reason)
        .bind(delegation.created_by)
        .bind(delegation.created_at)
        .bind(delegation.location_id)
        .bind(delegation.delegator_id)
        .bind(delegation.delegate_id)
        .bind(&delegation.permission)
        .bind(delegation.valid_until)
        .bind(delegation.valid_from)
        .bind(delegation.include_descendants)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_delegation(&self, id: Uuid) -> Result<Delegation> {
        let row = sqlx::query_as::<_, DelegationRow>(&format!(
            "SELECT {} FROM delegations WHERE id = ?",
            DELEGATION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Delegation {} not found", id)))?;

        row.try_into()
    }

    /// Active delegations for one (delegator, delegate, permission) triple
    pub async fn list_active_delegations_between(
        &self,
        delegator_id: UserId,
        delegate_id: UserId,
        permission: &str,
    ) -> Result<Vec<Delegation>> {
        let rows = sqlx::query_as::<_, DelegationRow>(&format!(
            "SELECT {} FROM delegations WHERE delegator_id = ? AND delegate_id = ? AND permission = ? AND status = 'active' ORDER BY valid_from ASC",
            DELEGATION_COLUMNS
        ))
        .bind(delegator_id)
        .bind(delegate_id)
        .bind(permission)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Active delegations naming `delegate_id` for `permission`, oldest first
    pub async fn list_active_delegations_for_delegate(
        &self,
        delegate_id: UserId,
        permission: &str,
    ) -> Result<Vec<Delegation>> {
        let rows = sqlx::query_as::<_, DelegationRow>(&format!(
            "SELECT {} FROM delegations WHERE delegate_id = ? AND permission = ? AND status = 'active' ORDER BY created_at ASC, id ASC",
            DELEGATION_COLUMNS
        ))
        .bind(delegate_id)
        .bind(permission)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn list_delegations_for_delegate(&self, delegate_id: UserId) -> Result<Vec<Delegation>> {
        let rows = sqlx::query_as::<_, DelegationRow>(&format!(
            "SELECT {} FROM delegations WHERE delegate_id = ? ORDER BY valid_from DESC",
            DELEGATION_COLUMNS
        ))
        .bind(delegate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn list_delegations_by_delegator(&self, delegator_id: UserId) -> Result<Vec<Delegation>> {
        let rows = sqlx::query_as::<_, DelegationRow>(&format!(
            "SELECT {} FROM delegations WHERE delegator_id = ? ORDER BY valid_from DESC",
            DELEGATION_COLUMNS
        ))
        .bind(delegator_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Returns false when the delegation was not active anymore
    pub async fn revoke_delegation(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegations SET status = 'revoked', revoked_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move every active delegation whose window closed before `now` to expired
    pub async fn expire_delegations(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delegations SET status = 'expired'
            WHERE status = 'active' AND valid_until < ?
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

async fn update_instance_guarded(
    conn: &mut SqliteConnection,
    guard: TransitionGuard,
    status: InstanceStatus,
    step_order: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET status = ?, current_step_order = ?, version = version + 1, updated_at = ?
        WHERE id = ? AND status = ? AND current_step_order = ? AND version = ?
        "#,
    )
    .bind(status.as_str())
    .bind(step_order)
    .bind(now)
    .bind(guard.instance_id.to_string())
    .bind(guard.status.as_str())
    .bind(guard.step_order)
    .bind(guard.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::Conflict(format!(
            "instance {} changed while step {} was being processed; refresh and retry",
            guard.instance_id, guard.step_order
        )));
    }
    Ok(())
}

/// Materialize a step as pending, clearing any earlier action on it
async fn open_step(conn: &mut SqliteConnection, instance_id: Uuid, step_order: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_step_instances (instance_id, step_order, status)
        VALUES (?, ?, 'pending')
        ON CONFLICT(instance_id, step_order) DO UPDATE SET
            status = 'pending', acted_by = NULL, acted_at = NULL, comment = NULL, automated_by = NULL
        "#,
    )
    .bind(instance_id.to_string())
    .bind(step_order)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Record the action on a pending step; a step that was already acted on is a conflict
async fn close_step(
    conn: &mut SqliteConnection,
    guard: TransitionGuard,
    status: StepStatus,
    action: &StepAction<'_>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO workflow_step_instances (instance_id, step_order, status, acted_by, acted_at, comment, automated_by)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(instance_id, step_order) DO UPDATE SET
            status = excluded.status,
            acted_by = excluded.acted_by,
            acted_at = excluded.acted_at,
            comment = excluded.comment,
            automated_by = excluded.automated_by
        WHERE workflow_step_instances.status = 'pending'
        "#,
    )
    .bind(guard.instance_id.to_string())
    .bind(guard.step_order)
    .bind(status.as_str())
    .bind(action.actor_id)
    .bind(action.acted_at)
    .bind(action.comment)
    .bind(action.automated_by)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::Conflict(format!(
            "step {} of instance {} was already acted on",
            guard.step_order, guard.instance_id
        )));
    }
    Ok(())
}

// Internal row types for sqlx

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))
}

#[derive(sqlx::FromRow)]
struct LocationRow {
    id: i64,
    name: String,
    parent_id: Option<i64>,
    path: String,
    level: i64,
    status: String,
}

impl TryFrom<LocationRow> for Location {
    type Error = AppError;

    fn try_from(row: LocationRow) -> Result<Self> {
        Ok(Location {
            id: row.id,
            name: row.name,
            parent_id: row.parent_id,
            path: row.path,
            level: row.level,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    manager_id: Option<i64>,
    primary_location_id: Option<i64>,
    active: bool,
    deleted: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            manager_id: row.manager_id,
            primary_location_id: row.primary_location_id,
            active: row.active,
            deleted: row.deleted,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    resource_type: String,
    location_id: Option<i64>,
    status: String,
    version: i64,
    steps: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TemplateRow> for WorkflowTemplate {
    type Error = AppError;

    fn try_from(row: TemplateRow) -> Result<Self> {
        let steps: Vec<WorkflowStep> = serde_json::from_str(&row.steps)
            .map_err(|e| AppError::Internal(format!("Invalid step configuration: {}", e)))?;

        Ok(WorkflowTemplate {
            id: parse_uuid(&row.id)?,
            name: row.name,
            resource_type: row.resource_type,
            location_id: row.location_id,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            version: row.version,
            steps,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    template_id: String,
    resource_id: String,
    resource_type: String,
    creator_id: i64,
    location_id: i64,
    fields: String,
    current_step_order: i64,
    status: String,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for WorkflowInstance {
    type Error = AppError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let fields: Map<String, Value> = serde_json::from_str(&row.fields)
            .map_err(|e| AppError::Internal(format!("Invalid fields: {}", e)))?;

        Ok(WorkflowInstance {
            id: parse_uuid(&row.id)?,
            template_id: parse_uuid(&row.template_id)?,
            resource_id: row.resource_id,
            resource_type: row.resource_type,
            creator_id: row.creator_id,
            location_id: row.location_id,
            fields,
            current_step_order: row.current_step_order,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepInstanceRow {
    instance_id: String,
    step_order: i64,
    status: String,
    acted_by: Option<i64>,
    acted_at: Option<DateTime<Utc>>,
    comment: Option<String>,
    automated_by: Option<i64>,
}

impl TryFrom<StepInstanceRow> for WorkflowStepInstance {
    type Error = AppError;

    fn try_from(row: StepInstanceRow) -> Result<Self> {
        Ok(WorkflowStepInstance {
            instance_id: parse_uuid(&row.instance_id)?,
            step_order: row.step_order,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            acted_by: row.acted_by,
            acted_at: row.acted_at,
            comment: row.comment,
            automated_by: row.automated_by,
        })
    }
}

const DELEGATION_COLUMNS: &str = "id, delegator_id, delegate_id, permission, location_id, include_descendants, valid_from, valid_until, status, revoked_at, reason, created_by, created_at";

#[derive(sqlx::FromRow)]
struct DelegationRow {
    id: String,
    delegator_id: i64,
    delegate_id: i64,
    permission: String,
    location_id: Option<i64>,
    include_descendants: bool,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    status: String,
    revoked_at: Option<DateTime<Utc>>,
    reason: Option<String>,
    created_by: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<DelegationRow> for Delegation {
    type Error = AppError;

    fn try_from(row: DelegationRow) -> Result<Self> {
        Ok(Delegation {
            id: parse_uuid(&row.id)?,
            delegator_id: row.delegator_id,
            delegate_id: row.delegate_id,
            permission: row.permission,
            location_id: row.location_id,
            include_descendants: row.include_descendants,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            revoked_at: row.revoked_at,
            reason: row.reason,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}
