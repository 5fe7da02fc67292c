//! Workflow engine
//!
//! The engine handles:
//! - Template creation and selection
//! - Submission of resources
//! - Approve, decline and route-back transitions on the current step
//! - Resubmission of drafts by their creator
//! - Administrative auto-run
//! - Event broadcasting
//!
//! Authorization is decided before a transition's transaction opens; the
//! write itself is guarded on the instance's status, step and version, so a
//! concurrent actor that got there first turns the loser's write into a
//! `Conflict` instead of a double transition.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::instance::{
    AutoRunReport, InstanceStatus, StepStatus, StepView, SubmitRequest, WorkflowAction,
    WorkflowEvent, WorkflowInstance, WorkflowView,
};
use super::template::{
    validate_steps, NewWorkflowTemplate, TemplateStatus, WorkflowStep, WorkflowTemplate,
};
use crate::approvers::{ApproverResolver, ResolutionContext};
use crate::authority::DelegationAuthority;
use crate::error::{AppError, Result};
use crate::hierarchy::LocationHierarchy;
use crate::models::{LocationId, UserId};
use crate::store::{StepAction, Store, TransitionGuard};

/// Permission an operator needs to auto-run an instance
pub const AUTO_RUN_PERMISSION: &str = "workflow.auto_run";

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Store,
    hierarchy: LocationHierarchy,
    resolver: ApproverResolver,
    authority: DelegationAuthority,
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl WorkflowEngine {
    pub fn new(store: Store, hierarchy: LocationHierarchy, authority: DelegationAuthority) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            resolver: ApproverResolver::new(store.clone(), hierarchy.clone()),
            store,
            hierarchy,
            authority,
            event_tx,
        }
    }

    /// Subscribe to workflow events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    // Templates

    pub async fn create_template(&self, new: NewWorkflowTemplate) -> Result<WorkflowTemplate> {
        if new.name.trim().is_empty() {
            return Err(AppError::Validation("template name is required".to_string()));
        }
        if new.resource_type.trim().is_empty() {
            return Err(AppError::Validation("resource type is required".to_string()));
        }
        validate_steps(&new.steps)?;
        if let Some(location_id) = new.location_id {
            self.store.get_location(location_id).await?;
        }

        let version = self
            .store
            .latest_template_version(&new.resource_type, new.location_id)
            .await?
            + 1;

        let template = WorkflowTemplate {
            id: Uuid::new_v4(),
            name: new.name,
            resource_type: new.resource_type,
            location_id: new.location_id,
            status: TemplateStatus::Active,
            version,
            steps: new.steps,
            created_at: Utc::now(),
        };
        self.store.insert_template(&template).await?;

        tracing::info!(
            template_id = %template.id,
            resource_type = %template.resource_type,
            steps = template.steps.len(),
            version,
            "Template created"
        );
        Ok(template)
    }

    pub async fn get_template(&self, id: Uuid) -> Result<WorkflowTemplate> {
        self.store.get_template(id).await
    }

    pub async fn deprecate_template(&self, id: Uuid) -> Result<()> {
        self.store.deprecate_template(id).await?;
        tracing::info!(template_id = %id, "Template deprecated");
        Ok(())
    }

    /// The active template for `resource_type` bound to the deepest location
    /// covering `location_id`, falling back to a global one
    pub async fn select_template(
        &self,
        resource_type: &str,
        location_id: LocationId,
    ) -> Result<WorkflowTemplate> {
        let mut best: Option<(i64, WorkflowTemplate)> = None;

        for template in self.store.list_active_templates(resource_type).await? {
            let depth = match template.location_id {
                None => -1,
                Some(bound) => {
                    if !self.hierarchy.is_descendant_uncached(location_id, bound).await? {
                        continue;
                    }
                    self.store.get_location(bound).await?.level
                }
            };
            // Candidates arrive newest version first; keep the first at each depth
            if best.as_ref().map_or(true, |(d, _)| depth > *d) {
                best = Some((depth, template));
            }
        }

        best.map(|(_, t)| t).ok_or_else(|| {
            AppError::Configuration(format!(
                "no active template for resource type '{}' at location {}",
                resource_type, location_id
            ))
        })
    }

    // Instances

    /// Start a workflow for a resource, under review at step 1
    pub async fn submit(&self, request: SubmitRequest) -> Result<WorkflowInstance> {
        if request.resource_id.trim().is_empty() {
            return Err(AppError::Validation("resource id is required".to_string()));
        }

        let creator = self.store.get_user(request.creator_id).await?;
        let location_id = request
            .location_id
            .or(creator.primary_location_id)
            .ok_or_else(|| {
                AppError::Configuration(format!(
                    "user {} has no primary location; pass a location",
                    creator.id
                ))
            })?;
        self.store.get_location(location_id).await?;

        let template = match request.template_id {
            Some(id) => {
                let template = self.store.get_template(id).await?;
                if template.status != TemplateStatus::Active {
                    return Err(AppError::Validation(format!("template {} is deprecated", id)));
                }
                if template.resource_type != request.resource_type {
                    return Err(AppError::Validation(format!(
                        "template {} is for '{}', not '{}'",
                        id, template.resource_type, request.resource_type
                    )));
                }
                template
            }
            None => self.select_template(&request.resource_type, location_id).await?,
        };
        if template.steps.is_empty() {
            return Err(AppError::Configuration(format!(
                "template {} has no steps",
                template.id
            )));
        }

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            template_id: template.id,
            resource_id: request.resource_id,
            resource_type: request.resource_type,
            creator_id: creator.id,
            location_id,
            fields: request.fields,
            current_step_order: 1,
            status: InstanceStatus::UnderReview,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_instance(&instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            template_id = %template.id,
            creator_id = instance.creator_id,
            location_id,
            "Workflow submitted"
        );
        Ok(instance)
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
        self.store.get_instance(id).await
    }

    /// Approve the current step, finishing the workflow on the last one
    pub async fn approve_step(
        &self,
        instance_id: Uuid,
        step_order: i64,
        actor_id: UserId,
        comment: Option<String>,
    ) -> Result<WorkflowInstance> {
        let (instance, template) = self.load(instance_id).await?;
        instance.ensure_actionable(step_order)?;
        let step = configured_step(&template, step_order)?;

        let now = Utc::now();
        self.authorize(&instance, step, actor_id, now).await?;
        self.apply_approval(&instance, &template, actor_id, comment, None, now)
            .await?;

        self.store.get_instance(instance_id).await
    }

    /// Decline the current step, terminating the workflow
    pub async fn decline_step(
        &self,
        instance_id: Uuid,
        step_order: i64,
        actor_id: UserId,
        comment: String,
    ) -> Result<WorkflowInstance> {
        let (instance, template) = self.load(instance_id).await?;
        instance.ensure_actionable(step_order)?;
        let comment = required_comment(comment, "declining")?;
        let step = configured_step(&template, step_order)?;
        if !step.allow_decline {
            return Err(AppError::Validation(format!(
                "step {} cannot be declined",
                step_order
            )));
        }

        let now = Utc::now();
        self.authorize(&instance, step, actor_id, now).await?;

        let action = StepAction {
            actor_id,
            comment: Some(&comment),
            automated_by: None,
            acted_at: now,
        };
        self.store
            .record_decline(TransitionGuard::of(&instance), &action)
            .await?;

        tracing::info!(instance_id = %instance.id, step_order, actor_id, "Workflow declined");
        self.emit(&instance, WorkflowAction::Declined, actor_id, Some(comment), None, now);

        self.store.get_instance(instance_id).await
    }

    /// Send the workflow back to an earlier step, or to its creator with 0
    pub async fn route_back(
        &self,
        instance_id: Uuid,
        target_step: i64,
        actor_id: UserId,
        comment: String,
    ) -> Result<WorkflowInstance> {
        let (instance, template) = self.load(instance_id).await?;
        instance.ensure_actionable(instance.current_step_order)?;
        let comment = required_comment(comment, "routing back")?;
        if target_step < 0 || target_step > instance.current_step_order {
            return Err(AppError::Validation(format!(
                "cannot route back to step {} from step {}",
                target_step, instance.current_step_order
            )));
        }
        let step = configured_step(&template, instance.current_step_order)?;

        let now = Utc::now();
        self.authorize(&instance, step, actor_id, now).await?;
        self.store
            .record_route_back(TransitionGuard::of(&instance), target_step, now)
            .await?;

        tracing::info!(
            instance_id = %instance.id,
            from_step = instance.current_step_order,
            target_step,
            actor_id,
            "Workflow routed back"
        );
        self.emit(&instance, WorkflowAction::RoutedBack, actor_id, Some(comment), None, now);

        self.store.get_instance(instance_id).await
    }

    /// Put a draft back under review from step 1; only its creator may
    pub async fn resubmit(&self, instance_id: Uuid, actor_id: UserId) -> Result<WorkflowInstance> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.creator_id != actor_id {
            return Err(AppError::Authorization(format!(
                "only the creator can resubmit instance {}",
                instance_id
            )));
        }
        if instance.status != InstanceStatus::Draft {
            return Err(AppError::Conflict(format!(
                "instance {} is {}, not a draft",
                instance_id,
                instance.status.as_str()
            )));
        }

        self.store
            .record_resubmission(TransitionGuard::of(&instance), Utc::now())
            .await?;

        tracing::info!(instance_id = %instance_id, actor_id, "Workflow resubmitted");
        self.store.get_instance(instance_id).await
    }

    /// Drive an instance forward by approving each step with the first
    /// resolved approver who has authority, recording `operator_id` as the
    /// one who automated it. Stops when the workflow leaves review.
    pub async fn auto_run(
        &self,
        instance_id: Uuid,
        max_steps: u32,
        operator_id: UserId,
    ) -> Result<AutoRunReport> {
        let (mut instance, template) = self.load(instance_id).await?;

        let now = Utc::now();
        let grant = self
            .authority
            .check_authority(operator_id, AUTO_RUN_PERMISSION, instance.location_id, now)
            .await?;
        if !grant.authorized {
            tracing::warn!(instance_id = %instance_id, operator_id, "Auto-run refused");
            return Err(AppError::Authorization(format!(
                "user {} may not auto-run workflows at location {}",
                operator_id, instance.location_id
            )));
        }
        instance.ensure_actionable(instance.current_step_order)?;

        let mut performed = 0u32;
        while instance.status == InstanceStatus::UnderReview {
            if performed >= max_steps {
                tracing::warn!(
                    instance_id = %instance_id,
                    max_steps,
                    step_order = instance.current_step_order,
                    "Auto-run hit its step limit"
                );
                return Err(AppError::StepLimitExceeded {
                    max_steps,
                    step_order: instance.current_step_order,
                });
            }

            if let Err(e) = self
                .auto_approve_current(&instance, &template, operator_id)
                .await
            {
                tracing::warn!(
                    instance_id = %instance_id,
                    step_order = instance.current_step_order,
                    performed,
                    error = %e,
                    "Auto-run stopped"
                );
                return Err(e);
            }

            performed += 1;
            instance = self.store.get_instance(instance_id).await?;
        }

        tracing::info!(
            instance_id = %instance_id,
            operator_id,
            performed,
            status = instance.status.as_str(),
            "Auto-run finished"
        );
        Ok(AutoRunReport {
            instance_id,
            steps_performed: performed,
            status: instance.status,
            current_step_order: instance.current_step_order,
        })
    }

    async fn auto_approve_current(
        &self,
        instance: &WorkflowInstance,
        template: &WorkflowTemplate,
        operator_id: UserId,
    ) -> Result<()> {
        let step = configured_step(template, instance.current_step_order)?;
        let ctx = ResolutionContext::for_instance(instance);
        let now = Utc::now();

        let mut chosen = None;
        for candidate in self.resolver.resolve(step, &ctx).await? {
            let decision = self
                .authority
                .check_authority(candidate, &step.required_permission, instance.location_id, now)
                .await?;
            if decision.authorized {
                chosen = Some(candidate);
                break;
            }
        }
        let actor_id = chosen.ok_or_else(|| {
            AppError::Configuration(format!(
                "step {} ({}) has no approver with authority for '{}'",
                step.step_order, step.name, step.required_permission
            ))
        })?;

        let comment = format!(
            "Automatically approved as user {} by operator {}",
            actor_id, operator_id
        );
        self.apply_approval(instance, template, actor_id, Some(comment), Some(operator_id), now)
            .await
    }

    /// Read model of an instance with every configured step
    pub async fn view(&self, instance_id: Uuid) -> Result<WorkflowView> {
        let (instance, template) = self.load(instance_id).await?;
        let mut recorded: HashMap<i64, _> = self
            .store
            .get_step_instances(instance_id)
            .await?
            .into_iter()
            .map(|s| (s.step_order, s))
            .collect();

        let ctx = ResolutionContext::for_instance(&instance);
        let mut steps = Vec::with_capacity(template.steps.len());
        for step in &template.steps {
            let record = recorded.remove(&step.step_order);
            steps.push(StepView {
                step_order: step.step_order,
                name: step.name.clone(),
                status: record.as_ref().map_or(StepStatus::Pending, |r| r.status),
                resolved_approvers: self.resolver.resolve(step, &ctx).await?,
                acted_by: record.as_ref().and_then(|r| r.acted_by),
                acted_at: record.as_ref().and_then(|r| r.acted_at),
                comment: record.and_then(|r| r.comment),
                allow_decline: step.allow_decline,
                allow_adjust: step.allow_adjust,
            });
        }

        Ok(WorkflowView {
            instance_id,
            status: instance.status,
            current_step_order: instance.current_step_order,
            steps,
        })
    }

    async fn load(&self, instance_id: Uuid) -> Result<(WorkflowInstance, WorkflowTemplate)> {
        let instance = self.store.get_instance(instance_id).await?;
        let template = self.store.get_template(instance.template_id).await?;
        Ok((instance, template))
    }

    /// A resolved approver, or anyone holding the permission here directly
    /// or by delegation
    async fn authorize(
        &self,
        instance: &WorkflowInstance,
        step: &WorkflowStep,
        actor_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ctx = ResolutionContext::for_instance(instance);
        if self.resolver.resolve(step, &ctx).await?.contains(&actor_id) {
            return Ok(());
        }

        let decision = self
            .authority
            .check_authority(actor_id, &step.required_permission, instance.location_id, now)
            .await?;
        if decision.authorized {
            return Ok(());
        }

        tracing::warn!(
            instance_id = %instance.id,
            step_order = step.step_order,
            actor_id,
            permission = %step.required_permission,
            "Actor is not an approver for this step"
        );
        Err(AppError::Authorization(format!(
            "user {} cannot act on step {} of instance {}",
            actor_id, step.step_order, instance.id
        )))
    }

    async fn apply_approval(
        &self,
        instance: &WorkflowInstance,
        template: &WorkflowTemplate,
        actor_id: UserId,
        comment: Option<String>,
        automated_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let step_order = instance.current_step_order;
        let next_step = (!template.is_final_step(step_order)).then_some(step_order + 1);

        let action = StepAction {
            actor_id,
            comment: comment.as_deref(),
            automated_by,
            acted_at: now,
        };
        self.store
            .record_approval(TransitionGuard::of(instance), &action, next_step)
            .await?;

        match next_step {
            Some(next) => tracing::info!(
                instance_id = %instance.id,
                step_order,
                next_step = next,
                actor_id,
                automated_by = ?automated_by,
                "Step approved"
            ),
            None => tracing::info!(
                instance_id = %instance.id,
                step_order,
                actor_id,
                automated_by = ?automated_by,
                "Workflow approved"
            ),
        }
        self.emit(instance, WorkflowAction::Approved, actor_id, comment, automated_by, now);
        Ok(())
    }

    fn emit(
        &self,
        instance: &WorkflowInstance,
        action: WorkflowAction,
        actor_id: UserId,
        comment: Option<String>,
        automated_by: Option<UserId>,
        timestamp: DateTime<Utc>,
    ) {
        let _ = self.event_tx.send(WorkflowEvent {
            instance_id: instance.id,
            step_order: instance.current_step_order,
            action,
            actor_id,
            comment,
            timestamp,
            automated_by,
        });
    }
}

fn configured_step(template: &WorkflowTemplate, step_order: i64) -> Result<&WorkflowStep> {
    template.step(step_order).ok_or_else(|| {
        AppError::Configuration(format!(
            "template {} has no step {}",
            template.id, step_order
        ))
    })
}

fn required_comment(comment: String, doing: &str) -> Result<String> {
    let trimmed = comment.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!(
            "a comment is required when {}",
            doing
        )));
    }
    Ok(trimmed.to_string())
}
