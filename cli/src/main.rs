//! Ladder CLI client - drive approval workflows from the terminal

mod client;
mod messages;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::client::LadderClient;
use crate::messages::{ClientMessage, Delegation, WorkflowInstance, WorkflowView};

#[derive(Parser)]
#[command(name = "ladder")]
#[command(about = "CLI client for the Ladder approval workflow server")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(short, long, env = "LADDER_SERVER", default_value = "ws://localhost:3000/ws")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show an instance with its steps and approvers
    Show {
        instance: Uuid,
    },

    /// Submit a resource for approval
    Submit {
        #[arg(long)]
        resource_id: String,

        #[arg(long)]
        resource_type: String,

        /// Submitting user
        #[arg(long)]
        creator: i64,

        /// Workflow location (defaults to the creator's primary location)
        #[arg(long)]
        location: Option<i64>,

        /// Use this template instead of selecting one
        #[arg(long)]
        template: Option<Uuid>,

        /// Resource fields as KEY=VALUE; numeric values are sent as numbers
        #[arg(short, long = "field")]
        fields: Vec<String>,
    },

    /// Approve the current step
    Approve {
        instance: Uuid,

        #[arg(long)]
        step: i64,

        #[arg(long)]
        actor: i64,

        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Decline the current step
    Decline {
        instance: Uuid,

        #[arg(long)]
        step: i64,

        #[arg(long)]
        actor: i64,

        #[arg(short, long)]
        comment: String,
    },

    /// Route back to an earlier step (0 returns it to the creator)
    RouteBack {
        instance: Uuid,

        #[arg(long)]
        to: i64,

        #[arg(long)]
        actor: i64,

        #[arg(short, long)]
        comment: String,
    },

    /// Resubmit a draft
    Resubmit {
        instance: Uuid,

        #[arg(long)]
        actor: i64,
    },

    /// Approve steps automatically on behalf of resolved approvers
    AutoRun {
        instance: Uuid,

        #[arg(long)]
        operator: i64,

        #[arg(long, default_value_t = 10)]
        max_steps: u32,
    },

    /// Delegate a permission to another user
    Delegate {
        #[arg(long)]
        from: i64,

        #[arg(long)]
        to: i64,

        #[arg(long)]
        permission: String,

        /// Limit to a location (global when omitted)
        #[arg(long)]
        location: Option<i64>,

        /// Also cover locations below `location`
        #[arg(long)]
        include_descendants: bool,

        /// Start of the window, RFC 3339 (defaults to now)
        #[arg(long)]
        valid_from: Option<DateTime<Utc>>,

        /// End of the window, RFC 3339
        #[arg(long)]
        valid_until: DateTime<Utc>,

        #[arg(long)]
        reason: Option<String>,

        /// Acting user (defaults to the delegator)
        #[arg(long)]
        created_by: Option<i64>,
    },

    /// Revoke a delegation
    Revoke {
        delegation: Uuid,

        #[arg(long)]
        actor: i64,
    },

    /// List delegations received by a user
    Delegations {
        user: i64,

        /// List delegations granted by the user instead
        #[arg(long)]
        granted: bool,
    },

    /// Stream workflow events
    Watch {
        /// Only events for this instance
        instance: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ladder_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let mut client = LadderClient::connect(&cli.server).await?;

    match cli.command {
        Commands::Show { instance } => {
            let view = client.view(instance).await?;
            print_view(&view);
        }
        Commands::Submit {
            resource_id,
            resource_type,
            creator,
            location,
            template,
            fields,
        } => {
            let instance = client
                .submit(ClientMessage::Submit {
                    resource_id,
                    resource_type,
                    creator_id: creator,
                    location_id: location,
                    template_id: template,
                    fields: parse_fields(&fields)?,
                })
                .await?;
            println!("Submitted {}", instance.id);
            print_instance(&instance);
        }
        Commands::Approve {
            instance,
            step,
            actor,
            comment,
        } => {
            let instance = client.approve(instance, step, actor, comment).await?;
            print_instance(&instance);
        }
        Commands::Decline {
            instance,
            step,
            actor,
            comment,
        } => {
            let instance = client.decline(instance, step, actor, comment).await?;
            print_instance(&instance);
        }
        Commands::RouteBack {
            instance,
            to,
            actor,
            comment,
        } => {
            let instance = client.route_back(instance, to, actor, comment).await?;
            print_instance(&instance);
        }
        Commands::Resubmit { instance, actor } => {
            let instance = client.resubmit(instance, actor).await?;
            print_instance(&instance);
        }
        Commands::AutoRun {
            instance,
            operator,
            max_steps,
        } => {
            let report = client.auto_run(instance, max_steps, operator).await?;
            println!(
                "Performed {} step(s); instance is {} at step {}",
                report.steps_performed,
                report.status.label(),
                report.current_step_order
            );
        }
        Commands::Delegate {
            from,
            to,
            permission,
            location,
            include_descendants,
            valid_from,
            valid_until,
            reason,
            created_by,
        } => {
            let delegation = client
                .delegate(ClientMessage::CreateDelegation {
                    delegator_id: from,
                    delegate_id: to,
                    permission,
                    location_id: location,
                    include_descendants,
                    valid_from: valid_from.unwrap_or_else(Utc::now),
                    valid_until,
                    reason,
                    created_by: created_by.unwrap_or(from),
                })
                .await?;
            println!("Created delegation {}", delegation.id);
            print_delegation(&delegation);
        }
        Commands::Revoke { delegation, actor } => {
            let delegation = client.revoke(delegation, actor).await?;
            print_delegation(&delegation);
        }
        Commands::Delegations { user, granted } => {
            let delegations = client.delegations(user, granted).await?;
            if delegations.is_empty() {
                println!("No delegations found.");
            }
            for delegation in &delegations {
                print_delegation(delegation);
            }
        }
        Commands::Watch { instance } => {
            client.subscribe(instance).await?;
            println!("Watching for workflow events...");
            client
                .listen(|event| {
                    let automated = event
                        .automated_by
                        .map(|op| format!(" (automated by {})", op))
                        .unwrap_or_default();
                    println!(
                        "{} {} step {} {:?} by {}{}{}",
                        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        event.instance_id,
                        event.step_order,
                        event.action,
                        event.actor_id,
                        automated,
                        event
                            .comment
                            .as_deref()
                            .map(|c| format!(": {}", c))
                            .unwrap_or_default()
                    );
                    true
                })
                .await?;
        }
    }

    Ok(())
}

/// Parse `KEY=VALUE` pairs; values that parse as JSON numbers or booleans
/// keep that type, everything else is a string
fn parse_fields(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("field '{}' is not KEY=VALUE", pair))?;
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
            _ => Value::String(raw.to_string()),
        };
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

fn print_instance(instance: &WorkflowInstance) {
    println!(
        "  {} [{}] {} at location {} - {} at step {}",
        instance.id,
        instance.resource_type,
        instance.resource_id,
        instance.location_id,
        instance.status.label(),
        instance.current_step_order
    );
}

fn print_view(view: &WorkflowView) {
    println!(
        "Instance {} - {} at step {}",
        view.instance_id,
        view.status.label(),
        view.current_step_order
    );
    println!("{:─<60}", "");
    for step in &view.steps {
        let marker = if step.step_order == view.current_step_order {
            ">"
        } else {
            " "
        };
        let approvers: Vec<String> = step
            .resolved_approvers
            .iter()
            .map(|id| id.to_string())
            .collect();
        println!(
            "{} {}. {} ({:?}) approvers: [{}]",
            marker,
            step.step_order,
            step.name,
            step.status,
            approvers.join(", ")
        );
        if let (Some(by), Some(at)) = (step.acted_by, step.acted_at) {
            println!(
                "      by {} at {}{}",
                by,
                at.format("%Y-%m-%d %H:%M"),
                step.comment
                    .as_deref()
                    .map(|c| format!(": {}", c))
                    .unwrap_or_default()
            );
        }
    }
}

fn print_delegation(delegation: &Delegation) {
    let scope = match delegation.location_id {
        None => "everywhere".to_string(),
        Some(id) if delegation.include_descendants => format!("location {} and below", id),
        Some(id) => format!("location {}", id),
    };
    println!(
        "  {} {} -> {} '{}' {} ({} to {}) {:?}",
        delegation.id,
        delegation.delegator_id,
        delegation.delegate_id,
        delegation.permission,
        scope,
        delegation.valid_from.format("%Y-%m-%d %H:%M"),
        delegation.valid_until.format("%Y-%m-%d %H:%M"),
        delegation.status
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let fields = parse_fields(&[
            "days=5".to_string(),
            "kind=sick".to_string(),
            "paid=true".to_string(),
        ])
        .unwrap();
        assert_eq!(fields["days"], Value::from(5));
        assert_eq!(fields["kind"], Value::from("sick"));
        assert_eq!(fields["paid"], Value::Bool(true));
        assert!(parse_fields(&["nokey".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_route_back() {
        let cli = Cli::parse_from([
            "ladder",
            "route-back",
            "00000000-0000-0000-0000-000000000000",
            "--to",
            "0",
            "--actor",
            "3",
            "-c",
            "wrong dates",
        ]);
        assert!(matches!(
            cli.command,
            Commands::RouteBack { to: 0, actor: 3, .. }
        ));
    }
}
