//! Approver resolution
//!
//! Computes, for one step of one instance, the set of users who may act on
//! it. Resolution only reads; an empty set is a valid answer and callers
//! decide what it means for them.

use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::hierarchy::{DescendantSet, LocationHierarchy};
use crate::models::{LocationId, RoleId, User, UserId};
use crate::store::Store;
use crate::workflow::{ApproverStrategy, LocationScope, WorkflowInstance, WorkflowStep};

/// Run-time inputs of a resolution
#[derive(Debug, Clone)]
pub struct ResolutionContext<'a> {
    pub instance_id: Option<Uuid>,
    pub creator_id: UserId,
    /// The workflow's location; scopes are relative to it
    pub location_id: LocationId,
    pub resource_type: &'a str,
    pub fields: &'a Map<String, Value>,
}

impl<'a> ResolutionContext<'a> {
    pub fn for_instance(instance: &'a WorkflowInstance) -> Self {
        Self {
            instance_id: Some(instance.id),
            creator_id: instance.creator_id,
            location_id: instance.location_id,
            resource_type: &instance.resource_type,
            fields: &instance.fields,
        }
    }
}

/// Strategy and scope actually used for a step after conditional rules
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveStep<'a> {
    pub strategy: &'a ApproverStrategy,
    pub location_scope: LocationScope,
    /// Index of the rule that fired, if any
    pub rule_index: Option<usize>,
}

/// The first rule whose condition holds overrides the step's configuration
pub fn effective_step<'a>(step: &'a WorkflowStep, ctx: &ResolutionContext<'_>) -> EffectiveStep<'a> {
    step.conditional_rules
        .iter()
        .enumerate()
        .find(|(_, rule)| rule.condition.holds(ctx.resource_type, ctx.fields))
        .map(|(index, rule)| EffectiveStep {
            strategy: &rule.strategy,
            location_scope: rule.location_scope.unwrap_or(step.location_scope),
            rule_index: Some(index),
        })
        .unwrap_or(EffectiveStep {
            strategy: &step.strategy,
            location_scope: step.location_scope,
            rule_index: None,
        })
}

/// Which primary locations pass a step's location scope
enum ScopeFilter {
    Any,
    Within(HashSet<LocationId>),
    Subtree(DescendantSet),
}

impl ScopeFilter {
    fn admits(&self, user: &User) -> bool {
        match (self, user.primary_location_id) {
            (ScopeFilter::Any, _) => true,
            (_, None) => false,
            (ScopeFilter::Within(ids), Some(loc)) => ids.contains(&loc),
            (ScopeFilter::Subtree(ids), Some(loc)) => ids.contains(&loc),
        }
    }
}

#[derive(Clone)]
pub struct ApproverResolver {
    store: Store,
    hierarchy: LocationHierarchy,
}

impl ApproverResolver {
    pub fn new(store: Store, hierarchy: LocationHierarchy) -> Self {
        Self { store, hierarchy }
    }

    /// Candidate approvers for `step`, ascending by user id
    pub async fn resolve(
        &self,
        step: &WorkflowStep,
        ctx: &ResolutionContext<'_>,
    ) -> Result<BTreeSet<UserId>> {
        let effective = effective_step(step, ctx);
        let scope = self.scope_filter(effective.location_scope, ctx.location_id).await?;
        let permission = step.required_permission.as_str();

        let candidates = match effective.strategy {
            ApproverStrategy::Permission { include_manager } => {
                self.by_permission(permission, &scope, *include_manager, ctx)
                    .await?
            }
            ApproverStrategy::Manager => self.by_manager(permission, &scope, ctx).await?,
            ApproverStrategy::Role { required_roles } => {
                self.by_role(permission, &scope, required_roles).await?
            }
            ApproverStrategy::Combined { required_roles } => {
                let mut all = self.by_manager(permission, &scope, ctx).await?;
                all.extend(self.by_role(permission, &scope, required_roles).await?);
                all
            }
        };

        tracing::debug!(
            instance_id = ?ctx.instance_id,
            step_order = step.step_order,
            strategy = effective.strategy.name(),
            rule = ?effective.rule_index,
            candidates = candidates.len(),
            "Resolved approvers"
        );

        Ok(candidates)
    }

    async fn scope_filter(&self, scope: LocationScope, location_id: LocationId) -> Result<ScopeFilter> {
        Ok(match scope {
            LocationScope::All => ScopeFilter::Any,
            LocationScope::Same => ScopeFilter::Within(HashSet::from([location_id])),
            LocationScope::Parent => {
                let mut ids = HashSet::from([location_id]);
                if let Some(parent) = self.hierarchy.get_parent(location_id).await? {
                    ids.insert(parent.id);
                }
                ScopeFilter::Within(ids)
            }
            LocationScope::Descendants => {
                ScopeFilter::Subtree(self.hierarchy.descendant_ids(location_id).await?)
            }
        })
    }

    async fn by_permission(
        &self,
        permission: &str,
        scope: &ScopeFilter,
        include_manager: bool,
        ctx: &ResolutionContext<'_>,
    ) -> Result<BTreeSet<UserId>> {
        let mut candidates: BTreeSet<UserId> = self
            .store
            .list_users_with_permission(permission)
            .await?
            .iter()
            .filter(|u| scope.admits(u))
            .map(|u| u.id)
            .collect();

        if include_manager {
            // The manager joins on the strength of the permission alone
            if let Some(manager) = self.eligible_manager(ctx.creator_id).await? {
                if self.holds_permission(manager.id, permission).await? {
                    candidates.insert(manager.id);
                }
            }
        }

        Ok(candidates)
    }

    /// The direct manager only; there is no escalation further up the chain
    async fn by_manager(
        &self,
        permission: &str,
        scope: &ScopeFilter,
        ctx: &ResolutionContext<'_>,
    ) -> Result<BTreeSet<UserId>> {
        let mut candidates = BTreeSet::new();
        if let Some(manager) = self.eligible_manager(ctx.creator_id).await? {
            if scope.admits(&manager) && self.holds_permission(manager.id, permission).await? {
                candidates.insert(manager.id);
            }
        }
        Ok(candidates)
    }

    async fn by_role(
        &self,
        permission: &str,
        scope: &ScopeFilter,
        required_roles: &BTreeSet<RoleId>,
    ) -> Result<BTreeSet<UserId>> {
        let role_holders = self.store.user_ids_with_any_role(required_roles).await?;

        Ok(self
            .store
            .list_users_with_permission(permission)
            .await?
            .iter()
            .filter(|u| role_holders.contains(&u.id) && scope.admits(u))
            .map(|u| u.id)
            .collect())
    }

    async fn eligible_manager(&self, creator_id: UserId) -> Result<Option<User>> {
        let creator = self.store.get_user(creator_id).await?;
        let Some(manager_id) = creator.manager_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_user(manager_id)
            .await?
            .filter(User::is_eligible))
    }

    async fn holds_permission(&self, user_id: UserId, permission: &str) -> Result<bool> {
        Ok(!self
            .store
            .permission_grant_scopes(user_id, permission)
            .await?
            .is_empty())
    }
}
