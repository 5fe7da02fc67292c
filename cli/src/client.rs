//! WebSocket client for the Ladder server

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::messages::{
    AutoRunReport, ClientMessage, Delegation, ServerMessage, WorkflowEvent, WorkflowInstance,
    WorkflowView,
};

/// WebSocket client for Ladder
pub struct LadderClient {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<ServerMessage>,
    #[allow(dead_code)]
    handle: tokio::task::JoinHandle<()>,
}

impl LadderClient {
    /// Connect to a Ladder server
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Connecting to {}", url);

        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Channel for outgoing messages
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);

        // Channel for incoming parsed messages
        let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(32);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = out_rx.recv() => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(result) = read.next() => {
                        match result {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(msg) => {
                                        if in_tx.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Failed to parse message: {} - {}", e, text);
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Err(e) => {
                                tracing::error!("WebSocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
        });

        tracing::info!("Connected successfully");

        Ok(Self {
            tx: out_tx,
            rx: in_rx,
            handle,
        })
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        let json = serde_json::to_string(&msg)?;
        self.tx
            .send(Message::Text(json))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Send a request and wait for its reply, skipping pushed events
    async fn request(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        self.send(msg).await?;

        while let Some(msg) = self.rx.recv().await {
            match msg {
                ServerMessage::Event { .. } => continue,
                ServerMessage::Error { kind, message } => {
                    return Err(anyhow!("Server error ({}): {}", kind, message));
                }
                reply => return Ok(reply),
            }
        }

        Err(anyhow!("Connection closed"))
    }

    async fn request_instance(&mut self, msg: ClientMessage) -> Result<WorkflowInstance> {
        match self.request(msg).await? {
            ServerMessage::Instance { instance } => Ok(instance),
            other => Err(unexpected(other)),
        }
    }

    pub async fn submit(&mut self, msg: ClientMessage) -> Result<WorkflowInstance> {
        self.request_instance(msg).await
    }

    pub async fn view(&mut self, instance_id: Uuid) -> Result<WorkflowView> {
        match self.request(ClientMessage::GetView { instance_id }).await? {
            ServerMessage::View { view } => Ok(view),
            other => Err(unexpected(other)),
        }
    }

    pub async fn approve(
        &mut self,
        instance_id: Uuid,
        step_order: i64,
        actor_id: i64,
        comment: Option<String>,
    ) -> Result<WorkflowInstance> {
        self.request_instance(ClientMessage::Approve {
            instance_id,
            step_order,
            actor_id,
            comment,
        })
        .await
    }

    pub async fn decline(
        &mut self,
        instance_id: Uuid,
        step_order: i64,
        actor_id: i64,
        comment: String,
    ) -> Result<WorkflowInstance> {
        self.request_instance(ClientMessage::Decline {
            instance_id,
            step_order,
            actor_id,
            comment,
        })
        .await
    }

    pub async fn route_back(
        &mut self,
        instance_id: Uuid,
        target_step: i64,
        actor_id: i64,
        comment: String,
    ) -> Result<WorkflowInstance> {
        self.request_instance(ClientMessage::RouteBack {
            instance_id,
            target_step,
            actor_id,
            comment,
        })
        .await
    }

    pub async fn resubmit(&mut self, instance_id: Uuid, actor_id: i64) -> Result<WorkflowInstance> {
        self.request_instance(ClientMessage::Resubmit {
            instance_id,
            actor_id,
        })
        .await
    }

    pub async fn auto_run(
        &mut self,
        instance_id: Uuid,
        max_steps: u32,
        operator_id: i64,
    ) -> Result<AutoRunReport> {
        match self
            .request(ClientMessage::AutoRun {
                instance_id,
                max_steps,
                operator_id,
            })
            .await?
        {
            ServerMessage::AutoRunReport { report } => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delegate(&mut self, msg: ClientMessage) -> Result<Delegation> {
        match self.request(msg).await? {
            ServerMessage::Delegation { delegation } => Ok(delegation),
            other => Err(unexpected(other)),
        }
    }

    pub async fn revoke(&mut self, delegation_id: Uuid, actor_id: i64) -> Result<Delegation> {
        match self
            .request(ClientMessage::RevokeDelegation {
                delegation_id,
                actor_id,
            })
            .await?
        {
            ServerMessage::Delegation { delegation } => Ok(delegation),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delegations(&mut self, user_id: i64, as_delegator: bool) -> Result<Vec<Delegation>> {
        match self
            .request(ClientMessage::ListDelegations {
                user_id,
                as_delegator,
            })
            .await?
        {
            ServerMessage::Delegations { delegations } => Ok(delegations),
            other => Err(unexpected(other)),
        }
    }

    /// Subscribe to workflow events, optionally for one instance
    pub async fn subscribe(&mut self, instance_id: Option<Uuid>) -> Result<()> {
        match self.request(ClientMessage::Subscribe { instance_id }).await? {
            ServerMessage::Subscribed { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Listen for events until callback returns false
    pub async fn listen<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(WorkflowEvent) -> bool,
    {
        while let Some(msg) = self.rx.recv().await {
            if let ServerMessage::Event { event } = msg {
                if !callback(event) {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn unexpected(msg: ServerMessage) -> anyhow::Error {
    anyhow!("Unexpected reply: {:?}", msg)
}
