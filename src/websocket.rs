//! WebSocket server handler
//!
//! Each text frame carries one `ClientMessage`; each gets exactly one reply.
//! After `subscribe`, workflow events are pushed as `event` messages on the
//! same socket, interleaved with replies.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::{AppError, ErrorKind, Result};
use crate::models::{CreateDelegationRequest, Delegation, UserId};
use crate::workflow::{
    AutoRunReport, NewWorkflowTemplate, SubmitRequest, WorkflowEvent, WorkflowInstance,
    WorkflowTemplate, WorkflowView,
};
use crate::AppState;

/// WebSocket handler
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Replies and pushed events share one writer
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::debug!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let mut connection = Connection {
        state,
        out_tx: out_tx.clone(),
        forwarder: None,
    };

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
        };

        let reply = match serde_json::from_str::<ClientMessage>(&msg) {
            Ok(client_msg) => match connection.handle(client_msg).await {
                Ok(reply) => reply,
                Err(e) => ServerMessage::from_error(&e),
            },
            Err(e) => ServerMessage::Error {
                kind: ErrorKind::Validation,
                message: format!("Invalid message: {}", e),
            },
        };

        if out_tx.send(reply).is_err() {
            break;
        }
    }

    connection.stop_forwarding();
    drop(connection);
    drop(out_tx);
    let _ = writer.await;
}

struct Connection {
    state: Arc<AppState>,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl Connection {
    async fn handle(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        let engine = &self.state.engine;
        let authority = &self.state.authority;

        Ok(match msg {
            ClientMessage::CreateTemplate(new) => ServerMessage::TemplateCreated {
                template: engine.create_template(new).await?,
            },
            ClientMessage::Submit(request) => ServerMessage::Instance {
                instance: engine.submit(request).await?,
            },
            ClientMessage::GetView { instance_id } => ServerMessage::View {
                view: engine.view(instance_id).await?,
            },
            ClientMessage::Approve {
                instance_id,
                step_order,
                actor_id,
                comment,
            } => ServerMessage::Instance {
                instance: engine
                    .approve_step(instance_id, step_order, actor_id, comment)
                    .await?,
            },
            ClientMessage::Decline {
                instance_id,
                step_order,
                actor_id,
                comment,
            } => ServerMessage::Instance {
                instance: engine
                    .decline_step(instance_id, step_order, actor_id, comment)
                    .await?,
            },
            ClientMessage::RouteBack {
                instance_id,
                target_step,
                actor_id,
                comment,
            } => ServerMessage::Instance {
                instance: engine
                    .route_back(instance_id, target_step, actor_id, comment)
                    .await?,
            },
            ClientMessage::Resubmit {
                instance_id,
                actor_id,
            } => ServerMessage::Instance {
                instance: engine.resubmit(instance_id, actor_id).await?,
            },
            ClientMessage::AutoRun {
                instance_id,
                max_steps,
                operator_id,
            } => ServerMessage::AutoRunReport {
                report: engine.auto_run(instance_id, max_steps, operator_id).await?,
            },
            ClientMessage::CreateDelegation(request) => ServerMessage::Delegation {
                delegation: authority.create_delegation(request, Utc::now()).await?,
            },
            ClientMessage::RevokeDelegation {
                delegation_id,
                actor_id,
            } => ServerMessage::Delegation {
                delegation: authority
                    .revoke_delegation(delegation_id, actor_id, Utc::now())
                    .await?,
            },
            ClientMessage::ListDelegations {
                user_id,
                as_delegator,
            } => {
                let delegations = if as_delegator {
                    authority.list_by_delegator(user_id).await?
                } else {
                    authority.list_for_user(user_id).await?
                };
                ServerMessage::Delegations { delegations }
            }
            ClientMessage::Subscribe { instance_id } => {
                self.start_forwarding(instance_id);
                ServerMessage::Subscribed { instance_id }
            }
        })
    }

    /// Push engine events to this client, optionally for one instance only
    fn start_forwarding(&mut self, filter: Option<Uuid>) {
        self.stop_forwarding();

        let mut events = BroadcastStream::new(self.state.engine.subscribe());
        let out_tx = self.out_tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => {
                        if filter.is_some_and(|id| id != event.instance_id) {
                            continue;
                        }
                        if out_tx.send(ServerMessage::Event { event }).is_err() {
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged");
                    }
                }
            }
        }));
    }

    fn stop_forwarding(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Messages from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a workflow template
    CreateTemplate(NewWorkflowTemplate),
    /// Start a workflow for a resource
    Submit(SubmitRequest),
    /// Get the read model of an instance
    GetView { instance_id: Uuid },
    Approve {
        instance_id: Uuid,
        step_order: i64,
        actor_id: UserId,
        #[serde(default)]
        comment: Option<String>,
    },
    Decline {
        instance_id: Uuid,
        step_order: i64,
        actor_id: UserId,
        comment: String,
    },
    RouteBack {
        instance_id: Uuid,
        target_step: i64,
        actor_id: UserId,
        comment: String,
    },
    Resubmit {
        instance_id: Uuid,
        actor_id: UserId,
    },
    AutoRun {
        instance_id: Uuid,
        max_steps: u32,
        operator_id: UserId,
    },
    CreateDelegation(CreateDelegationRequest),
    RevokeDelegation {
        delegation_id: Uuid,
        actor_id: UserId,
    },
    /// Delegations received by `user_id`, or granted by them with `as_delegator`
    ListDelegations {
        user_id: UserId,
        #[serde(default)]
        as_delegator: bool,
    },
    /// Start receiving workflow events
    Subscribe {
        #[serde(default)]
        instance_id: Option<Uuid>,
    },
}

/// Messages from server to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TemplateCreated { template: WorkflowTemplate },
    /// Instance state after a submission or transition
    Instance { instance: WorkflowInstance },
    View { view: WorkflowView },
    AutoRunReport { report: AutoRunReport },
    Delegation { delegation: Delegation },
    Delegations { delegations: Vec<Delegation> },
    Subscribed { instance_id: Option<Uuid> },
    /// Pushed workflow event
    Event { event: WorkflowEvent },
    /// Error occurred
    Error { kind: ErrorKind, message: String },
}

impl ServerMessage {
    fn from_error(error: &AppError) -> Self {
        let message = match error {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Database error".to_string()
            }
            AppError::Migrate(e) => {
                tracing::error!("Migration error: {}", e);
                "Database error".to_string()
            }
            other => other.to_string(),
        };
        ServerMessage::Error {
            kind: error.kind(),
            message,
        }
    }
}
