//! Approval workflows
//!
//! Templates describe the ordered steps a resource must pass; instances
//! track one resource's progress through them; the engine drives the
//! transitions.

pub mod engine;
pub mod instance;
pub mod template;

pub use engine::{WorkflowEngine, AUTO_RUN_PERMISSION};
pub use instance::{
    AutoRunReport, InstanceStatus, StepStatus, StepView, SubmitRequest, WorkflowAction,
    WorkflowEvent, WorkflowInstance, WorkflowStepInstance, WorkflowView,
};
pub use template::{
    validate_steps, ApproverStrategy, Condition, ConditionalRule, LocationScope,
    NewWorkflowTemplate, TemplateStatus, WorkflowStep, WorkflowTemplate,
};
