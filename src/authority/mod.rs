//! Delegated authority
//!
//! Decides whether a user may act with a permission at a location, either
//! through their own role assignments or through a delegation someone else
//! granted them. Also owns the delegation lifecycle: creation with overlap
//! detection, revocation and the expiry sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::hierarchy::LocationHierarchy;
use crate::models::{
    CreateDelegationRequest, Delegation, DelegationStatus, LocationId, TimeWindow, UserId,
};
use crate::store::Store;

/// Lets a user create delegations on behalf of the delegator
pub const DELEGATION_ADMIN_PERMISSION: &str = "delegation.admin";

/// Where a delegation applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationScope {
    /// `None` = global
    pub location_id: Option<LocationId>,
    pub include_descendants: bool,
}

impl DelegationScope {
    pub fn global() -> Self {
        Self {
            location_id: None,
            include_descendants: false,
        }
    }

    pub fn at(location_id: LocationId, include_descendants: bool) -> Self {
        Self {
            location_id: Some(location_id),
            include_descendants,
        }
    }

    fn of(delegation: &Delegation) -> Self {
        Self {
            location_id: delegation.location_id,
            include_descendants: delegation.include_descendants,
        }
    }
}

/// How an authorized user came to hold the permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthoritySource {
    Direct,
    Delegation {
        delegation_id: Uuid,
        delegator_id: UserId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityDecision {
    pub authorized: bool,
    pub source: Option<AuthoritySource>,
}

impl AuthorityDecision {
    pub fn denied() -> Self {
        Self {
            authorized: false,
            source: None,
        }
    }

    fn granted(source: AuthoritySource) -> Self {
        Self {
            authorized: true,
            source: Some(source),
        }
    }
}

#[derive(Clone)]
pub struct DelegationAuthority {
    store: Store,
    hierarchy: LocationHierarchy,
}

impl DelegationAuthority {
    pub fn new(store: Store, hierarchy: LocationHierarchy) -> Self {
        Self { store, hierarchy }
    }

    /// Does `user_id` hold `permission` at `location_id`?
    ///
    /// Role assignments are consulted first; an organization-wide assignment
    /// or one at an ancestor of the location grants it. Failing that, any
    /// valid delegation to the user whose scope covers the location does.
    /// Subtree tests read the store directly, never the descendant cache.
    pub async fn check_authority(
        &self,
        user_id: UserId,
        permission: &str,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> Result<AuthorityDecision> {
        if self.holds_directly(user_id, permission, location_id).await? {
            return Ok(AuthorityDecision::granted(AuthoritySource::Direct));
        }

        let delegations = self
            .store
            .list_active_delegations_for_delegate(user_id, permission)
            .await?;
        for delegation in delegations.iter().filter(|d| d.is_valid(now)) {
            if self
                .scope_covers(DelegationScope::of(delegation), location_id)
                .await?
            {
                tracing::debug!(
                    user_id,
                    permission,
                    location_id,
                    delegation_id = %delegation.id,
                    delegator_id = delegation.delegator_id,
                    "Authorized through delegation"
                );
                return Ok(AuthorityDecision::granted(AuthoritySource::Delegation {
                    delegation_id: delegation.id,
                    delegator_id: delegation.delegator_id,
                }));
            }
        }

        Ok(AuthorityDecision::denied())
    }

    async fn holds_directly(
        &self,
        user_id: UserId,
        permission: &str,
        location_id: LocationId,
    ) -> Result<bool> {
        for scope in self.store.permission_grant_scopes(user_id, permission).await? {
            match scope {
                None => return Ok(true),
                Some(granted_at) => {
                    if self
                        .hierarchy
                        .is_descendant_uncached(location_id, granted_at)
                        .await?
                    {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Creating a delegation on someone else's behalf needs
    /// [`DELEGATION_ADMIN_PERMISSION`] over the delegation's scope; a global
    /// delegation needs it organization-wide.
    async fn ensure_delegation_admin(
        &self,
        user_id: UserId,
        location_id: Option<LocationId>,
    ) -> Result<()> {
        self.store.get_user(user_id).await?;
        let allowed = match location_id {
            Some(location_id) => {
                self.holds_directly(user_id, DELEGATION_ADMIN_PERMISSION, location_id)
                    .await?
            }
            None => self
                .store
                .permission_grant_scopes(user_id, DELEGATION_ADMIN_PERMISSION)
                .await?
                .contains(&None),
        };
        if !allowed {
            return Err(AppError::Authorization(format!(
                "user {} may not create delegations for other users",
                user_id
            )));
        }
        Ok(())
    }

    async fn scope_covers(&self, scope: DelegationScope, location_id: LocationId) -> Result<bool> {
        match scope.location_id {
            None => Ok(true),
            Some(at) if at == location_id => Ok(true),
            Some(at) if scope.include_descendants => {
                self.hierarchy.is_descendant_uncached(location_id, at).await
            }
            Some(_) => Ok(false),
        }
    }

    /// Would a delegation with these parameters collide with an existing
    /// active one for the same delegator, delegate and permission?
    pub async fn has_overlap(
        &self,
        delegator_id: UserId,
        delegate_id: UserId,
        permission: &str,
        scope: DelegationScope,
        window: TimeWindow,
        exclude_id: Option<Uuid>,
    ) -> Result<bool> {
        let existing = self
            .store
            .list_active_delegations_between(delegator_id, delegate_id, permission)
            .await?;

        for other in existing {
            if Some(other.id) == exclude_id || !other.window().intersects(&window) {
                continue;
            }
            if self.scopes_intersect(scope, DelegationScope::of(&other)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn scopes_intersect(&self, a: DelegationScope, b: DelegationScope) -> Result<bool> {
        let (Some(a_loc), Some(b_loc)) = (a.location_id, b.location_id) else {
            return Ok(true);
        };
        if a_loc == b_loc {
            return Ok(true);
        }
        if b.include_descendants && self.hierarchy.is_descendant_uncached(a_loc, b_loc).await? {
            return Ok(true);
        }
        if a.include_descendants && self.hierarchy.is_descendant_uncached(b_loc, a_loc).await? {
            return Ok(true);
        }
        Ok(false)
    }

    /// Validate and store a new active delegation
    pub async fn create_delegation(
        &self,
        request: CreateDelegationRequest,
        now: DateTime<Utc>,
    ) -> Result<Delegation> {
        if request.delegator_id == request.delegate_id {
            return Err(AppError::Validation(
                "cannot delegate to yourself".to_string(),
            ));
        }
        if request.valid_from >= request.valid_until {
            return Err(AppError::Validation(
                "valid_from must be before valid_until".to_string(),
            ));
        }
        if request.valid_until <= now {
            return Err(AppError::Validation(
                "delegation window has already ended".to_string(),
            ));
        }

        self.store.get_user(request.delegator_id).await?;
        self.store.get_user(request.delegate_id).await?;
        if self.store.find_permission(&request.permission).await?.is_none() {
            return Err(AppError::Validation(format!(
                "unknown permission '{}'",
                request.permission
            )));
        }
        if let Some(location_id) = request.location_id {
            self.store.get_location(location_id).await?;
        }
        if request.created_by != request.delegator_id {
            self.ensure_delegation_admin(request.created_by, request.location_id)
                .await?;
        }

        // A delegator can only hand on what they hold through their own roles
        let grants = self
            .store
            .permission_grant_scopes(request.delegator_id, &request.permission)
            .await?;
        if grants.is_empty() {
            return Err(AppError::Authorization(format!(
                "user {} does not hold '{}'",
                request.delegator_id, request.permission
            )));
        }

        let scope = DelegationScope {
            location_id: request.location_id,
            include_descendants: request.include_descendants,
        };
        let window = TimeWindow::new(request.valid_from, request.valid_until);
        if self
            .has_overlap(
                request.delegator_id,
                request.delegate_id,
                &request.permission,
                scope,
                window,
                None,
            )
            .await?
        {
            return Err(AppError::Conflict(format!(
                "an active delegation of '{}' from {} to {} already covers this period and location",
                request.permission, request.delegator_id, request.delegate_id
            )));
        }

        let delegation = Delegation {
            id: Uuid::new_v4(),
            delegator_id: request.delegator_id,
            delegate_id: request.delegate_id,
            permission: request.permission,
            location_id: request.location_id,
            include_descendants: request.include_descendants,
            valid_from: request.valid_from,
            valid_until: request.valid_until,
            status: DelegationStatus::Active,
            revoked_at: None,
            reason: request.reason,
            created_by: request.created_by,
            created_at: now,
        };
        if !self.store.insert_delegation(&delegation).await? {
            return Err(AppError::Conflict(format!(
                "an active delegation of '{}' from {} to {} already covers this period and location",
                delegation.permission, delegation.delegator_id, delegation.delegate_id
            )));
        }

        tracing::info!(
            delegation_id = %delegation.id,
            delegator_id = delegation.delegator_id,
            delegate_id = delegation.delegate_id,
            permission = %delegation.permission,
            "Delegation created"
        );
        Ok(delegation)
    }

    /// Revoke an active delegation; only its delegator may do so
    pub async fn revoke_delegation(
        &self,
        id: Uuid,
        actor_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Delegation> {
        let delegation = self.store.get_delegation(id).await?;
        if delegation.delegator_id != actor_id {
            tracing::warn!(delegation_id = %id, actor_id, "Revocation refused");
            return Err(AppError::Authorization(format!(
                "only the delegator can revoke delegation {}",
                id
            )));
        }

        if !self.store.revoke_delegation(id, now).await? {
            return Err(AppError::Conflict(format!(
                "delegation {} is {} and cannot be revoked",
                id,
                delegation.status.as_str()
            )));
        }

        tracing::info!(delegation_id = %id, actor_id, "Delegation revoked");
        self.store.get_delegation(id).await
    }

    /// Expire every active delegation whose window has closed
    pub async fn expire_delegations(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.store.expire_delegations(now).await?;
        if expired > 0 {
            tracing::info!(expired, "Expired delegations");
        }
        Ok(expired)
    }

    /// Delegations naming `user_id` as delegate, newest window first
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Delegation>> {
        self.store.list_delegations_for_delegate(user_id).await
    }

    pub async fn list_by_delegator(&self, user_id: UserId) -> Result<Vec<Delegation>> {
        self.store.list_delegations_by_delegator(user_id).await
    }

    pub async fn get_delegation(&self, id: Uuid) -> Result<Delegation> {
        self.store.get_delegation(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::NoCache;
    use crate::models::User;
    use crate::store::tests::setup_test_db;
    use chrono::Duration;
    use std::sync::Arc;

    struct Fixture {
        authority: DelegationAuthority,
        root: LocationId,
        branch: LocationId,
        leaf: LocationId,
        sibling: LocationId,
    }

    async fn setup() -> Fixture {
        let store = setup_test_db().await;
        let hierarchy = LocationHierarchy::new(store.clone(), Arc::new(NoCache));
        let root = hierarchy.create_location("HQ", None).await.unwrap().id;
        let branch = hierarchy.create_location("Branch", Some(root)).await.unwrap().id;
        let leaf = hierarchy.create_location("Leaf", Some(branch)).await.unwrap().id;
        let sibling = hierarchy.create_location("Sibling", Some(root)).await.unwrap().id;

        let perm = store.create_permission("leave.approve", "leave").await.unwrap();
        let role = store.create_role("approver").await.unwrap();
        store.grant_permission(role.id, perm.id).await.unwrap();

        for id in 1..=3 {
            store
                .upsert_user(&User {
                    id,
                    name: format!("user-{}", id),
                    manager_id: None,
                    primary_location_id: Some(branch),
                    active: true,
                    deleted: false,
                })
                .await
                .unwrap();
        }
        // 1 holds the permission at the branch subtree
        store.assign_role(1, role.id, Some(branch)).await.unwrap();

        Fixture {
            authority: DelegationAuthority::new(store, hierarchy),
            root,
            branch,
            leaf,
            sibling,
        }
    }

    fn request(scope: DelegationScope, from: DateTime<Utc>, until: DateTime<Utc>) -> CreateDelegationRequest {
        CreateDelegationRequest {
            delegator_id: 1,
            delegate_id: 2,
            permission: "leave.approve".into(),
            location_id: scope.location_id,
            include_descendants: scope.include_descendants,
            valid_from: from,
            valid_until: until,
            reason: Some("holiday".into()),
            created_by: 1,
        }
    }

    #[tokio::test]
    async fn test_direct_authority_follows_assignment_scope() {
        let f = setup().await;
        let now = Utc::now();

        let at_leaf = f.authority.check_authority(1, "leave.approve", f.leaf, now).await.unwrap();
        assert!(at_leaf.authorized);
        assert_eq!(at_leaf.source, Some(AuthoritySource::Direct));

        let at_root = f.authority.check_authority(1, "leave.approve", f.root, now).await.unwrap();
        assert!(!at_root.authorized);
        let at_sibling = f
            .authority
            .check_authority(1, "leave.approve", f.sibling, now)
            .await
            .unwrap();
        assert!(!at_sibling.authorized);
    }

    #[tokio::test]
    async fn test_delegation_grants_within_scope() {
        let f = setup().await;
        let now = Utc::now();
        let delegation = f
            .authority
            .create_delegation(
                request(DelegationScope::at(f.branch, true), now - Duration::hours(1), now + Duration::days(1)),
                now,
            )
            .await
            .unwrap();

        let decision = f.authority.check_authority(2, "leave.approve", f.leaf, now).await.unwrap();
        assert_eq!(
            decision.source,
            Some(AuthoritySource::Delegation {
                delegation_id: delegation.id,
                delegator_id: 1
            })
        );

        let outside = f
            .authority
            .check_authority(2, "leave.approve", f.sibling, now)
            .await
            .unwrap();
        assert!(!outside.authorized);

        // Not yet valid, or past the window
        let before = f
            .authority
            .check_authority(2, "leave.approve", f.leaf, now - Duration::hours(2))
            .await
            .unwrap();
        assert!(!before.authorized);
        let after = f
            .authority
            .check_authority(2, "leave.approve", f.leaf, now + Duration::days(2))
            .await
            .unwrap();
        assert!(!after.authorized);
    }

    #[tokio::test]
    async fn test_exact_location_delegation_does_not_reach_descendants() {
        let f = setup().await;
        let now = Utc::now();
        f.authority
            .create_delegation(
                request(DelegationScope::at(f.branch, false), now - Duration::hours(1), now + Duration::days(1)),
                now,
            )
            .await
            .unwrap();

        assert!(f.authority.check_authority(2, "leave.approve", f.branch, now).await.unwrap().authorized);
        assert!(!f.authority.check_authority(2, "leave.approve", f.leaf, now).await.unwrap().authorized);
    }

    #[tokio::test]
    async fn test_overlap_detection() {
        let f = setup().await;
        let now = Utc::now();
        let existing = f
            .authority
            .create_delegation(
                request(DelegationScope::at(f.branch, true), now, now + Duration::days(5)),
                now,
            )
            .await
            .unwrap();
        let window = TimeWindow::new(now + Duration::days(1), now + Duration::days(2));

        // Leaf is inside the existing subtree
        assert!(f
            .authority
            .has_overlap(1, 2, "leave.approve", DelegationScope::at(f.leaf, false), window, None)
            .await
            .unwrap());
        // Global intersects everything
        assert!(f
            .authority
            .has_overlap(1, 2, "leave.approve", DelegationScope::global(), window, None)
            .await
            .unwrap());
        // Disjoint location
        assert!(!f
            .authority
            .has_overlap(1, 2, "leave.approve", DelegationScope::at(f.sibling, false), window, None)
            .await
            .unwrap());
        // Disjoint time
        let later = TimeWindow::new(now + Duration::days(6), now + Duration::days(7));
        assert!(!f
            .authority
            .has_overlap(1, 2, "leave.approve", DelegationScope::at(f.branch, true), later, None)
            .await
            .unwrap());
        // Closed intervals touch at the boundary
        let touching = TimeWindow::new(now + Duration::days(5), now + Duration::days(6));
        assert!(f
            .authority
            .has_overlap(1, 2, "leave.approve", DelegationScope::at(f.branch, false), touching, None)
            .await
            .unwrap());
        // Excluding itself
        assert!(!f
            .authority
            .has_overlap(
                1,
                2,
                "leave.approve",
                DelegationScope::at(f.branch, true),
                window,
                Some(existing.id)
            )
            .await
            .unwrap());
        // Another delegate is a different triple
        assert!(!f
            .authority
            .has_overlap(1, 3, "leave.approve", DelegationScope::global(), window, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_parent_scope_with_descendants_overlaps_existing_child() {
        let f = setup().await;
        let now = Utc::now();
        f.authority
            .create_delegation(
                request(DelegationScope::at(f.leaf, false), now, now + Duration::days(1)),
                now,
            )
            .await
            .unwrap();

        let result = f
            .authority
            .create_delegation(
                request(DelegationScope::at(f.branch, true), now, now + Duration::days(1)),
                now,
            )
            .await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let f = setup().await;
        let now = Utc::now();
        let scope = DelegationScope::global();

        let mut to_self = request(scope, now, now + Duration::days(1));
        to_self.delegate_id = 1;
        assert!(matches!(
            f.authority.create_delegation(to_self, now).await,
            Err(AppError::Validation(_))
        ));

        let inverted = request(scope, now + Duration::days(1), now);
        assert!(matches!(
            f.authority.create_delegation(inverted, now).await,
            Err(AppError::Validation(_))
        ));

        let past = request(scope, now - Duration::days(2), now - Duration::days(1));
        assert!(matches!(
            f.authority.create_delegation(past, now).await,
            Err(AppError::Validation(_))
        ));

        let mut unknown = request(scope, now, now + Duration::days(1));
        unknown.permission = "expense.approve".into();
        assert!(matches!(
            f.authority.create_delegation(unknown, now).await,
            Err(AppError::Validation(_))
        ));

        let mut not_held = request(scope, now, now + Duration::days(1));
        not_held.delegator_id = 3;
        assert!(matches!(
            f.authority.create_delegation(not_held, now).await,
            Err(AppError::Authorization(_))
        ));

        let missing_location = request(DelegationScope::at(999, false), now, now + Duration::days(1));
        assert!(matches!(
            f.authority.create_delegation(missing_location, now).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke() {
        let f = setup().await;
        let now = Utc::now();
        let delegation = f
            .authority
            .create_delegation(request(DelegationScope::global(), now, now + Duration::days(1)), now)
            .await
            .unwrap();

        assert!(matches!(
            f.authority.revoke_delegation(delegation.id, 2, now).await,
            Err(AppError::Authorization(_))
        ));

        let revoked = f.authority.revoke_delegation(delegation.id, 1, now).await.unwrap();
        assert_eq!(revoked.status, DelegationStatus::Revoked);
        assert!(revoked.revoked_at.is_some());
        assert!(!f.authority.check_authority(2, "leave.approve", f.branch, now).await.unwrap().authorized);

        assert!(matches!(
            f.authority.revoke_delegation(delegation.id, 1, now).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_and_listing() {
        let f = setup().await;
        let now = Utc::now();
        f.authority
            .create_delegation(request(DelegationScope::global(), now, now + Duration::hours(1)), now)
            .await
            .unwrap();

        let later = now + Duration::hours(2);
        assert_eq!(f.authority.expire_delegations(later).await.unwrap(), 1);
        assert_eq!(f.authority.expire_delegations(later).await.unwrap(), 0);

        let for_delegate = f.authority.list_for_user(2).await.unwrap();
        assert_eq!(for_delegate.len(), 1);
        assert_eq!(for_delegate[0].status, DelegationStatus::Expired);
        assert_eq!(f.authority.list_by_delegator(1).await.unwrap().len(), 1);
        assert!(f.authority.list_by_delegator(2).await.unwrap().is_empty());
    }
}
