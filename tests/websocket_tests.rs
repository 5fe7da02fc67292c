//! WebSocket integration tests

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use ladder::hierarchy::NoCache;
use ladder::models::User;
use ladder::store::run_migrations;
use ladder::AppState;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Server with a branch under HQ, user 1 approving org-wide and user 2
/// reporting to user 1
async fn setup_server() -> (SocketAddr, Arc<AppState>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    run_migrations(&pool).await.expect("Failed to run migrations");

    let state = AppState::new(pool, Arc::new(NoCache));
    let hq = state.hierarchy.create_location("HQ", None).await.unwrap();
    let branch = state
        .hierarchy
        .create_location("Branch", Some(hq.id))
        .await
        .unwrap();

    let perm = state
        .store
        .create_permission("leave.approve", "leave")
        .await
        .unwrap();
    let role = state.store.create_role("approver").await.unwrap();
    state.store.grant_permission(role.id, perm.id).await.unwrap();
    for (id, manager) in [(1, None), (2, Some(1))] {
        state
            .store
            .upsert_user(&User {
                id,
                name: format!("user-{}", id),
                manager_id: manager,
                primary_location_id: Some(branch.id),
                active: true,
                deleted: false,
            })
            .await
            .unwrap();
    }
    state.store.assign_role(1, role.id, None).await.unwrap();

    let app = ladder::router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    (addr, state)
}

async fn connect(addr: SocketAddr) -> Ws {
    let url = format!("ws://{}/ws", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws_stream
}

async fn send(ws: &mut Ws, msg: Value) {
    ws.send(Message::Text(msg.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    let next = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
        .await
        .expect("Timed out waiting for a message");
    match next {
        Some(Ok(Message::Text(response))) => serde_json::from_str(&response).unwrap(),
        other => panic!("Expected text message, got {:?}", other),
    }
}

async fn request(ws: &mut Ws, msg: Value) -> Value {
    send(ws, msg).await;
    recv(ws).await
}

/// Creates the two-step template, submits for user 2 and returns the instance id
async fn submit_leave(ws: &mut Ws) -> String {
    let created = request(
        ws,
        json!({
            "type": "create_template",
            "name": "Leave",
            "resource_type": "leave",
            "steps": [
                {
                    "step_order": 1,
                    "name": "Manager",
                    "required_permission": "leave.approve",
                    "strategy": { "kind": "manager" }
                },
                {
                    "step_order": 2,
                    "name": "Any approver",
                    "required_permission": "leave.approve",
                    "strategy": { "kind": "permission" },
                    "location_scope": "all"
                }
            ]
        }),
    )
    .await;
    assert_eq!(created["type"], "template_created", "{}", created);
    assert_eq!(created["template"]["version"], 1);

    let submitted = request(
        ws,
        json!({
            "type": "submit",
            "resource_id": "leave-7",
            "resource_type": "leave",
            "creator_id": 2,
            "fields": { "days": 2 }
        }),
    )
    .await;
    assert_eq!(submitted["type"], "instance", "{}", submitted);
    assert_eq!(submitted["instance"]["status"], "under_review");
    assert_eq!(submitted["instance"]["current_step_order"], 1);
    submitted["instance"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_websocket_invalid_message() {
    let (addr, _state) = setup_server().await;
    let mut ws = connect(addr).await;

    let response = request(&mut ws, json!({ "type": "launch_rockets" })).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["kind"], "validation");
    assert!(response["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid message"));

    // The connection stays usable
    let response = request(&mut ws, json!({ "type": "list_delegations", "user_id": 2 })).await;
    assert_eq!(response["type"], "delegations");
    assert!(response["delegations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_websocket_submit_and_view() {
    let (addr, _state) = setup_server().await;
    let mut ws = connect(addr).await;
    let instance_id = submit_leave(&mut ws).await;

    let view = request(&mut ws, json!({ "type": "get_view", "instance_id": instance_id })).await;
    assert_eq!(view["type"], "view");
    let steps = view["view"]["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["status"], "pending");
    assert_eq!(steps[0]["resolved_approvers"], json!([1]));
    assert_eq!(steps[1]["name"], "Any approver");
}

#[tokio::test]
async fn test_websocket_approval_flow() {
    let (addr, _state) = setup_server().await;
    let mut ws = connect(addr).await;
    let instance_id = submit_leave(&mut ws).await;

    let first = request(
        &mut ws,
        json!({
            "type": "approve",
            "instance_id": instance_id,
            "step_order": 1,
            "actor_id": 1,
            "comment": "enjoy"
        }),
    )
    .await;
    assert_eq!(first["type"], "instance");
    assert_eq!(first["instance"]["current_step_order"], 2);

    let done = request(
        &mut ws,
        json!({
            "type": "approve",
            "instance_id": instance_id,
            "step_order": 2,
            "actor_id": 1
        }),
    )
    .await;
    assert_eq!(done["instance"]["status"], "approved");

    let again = request(
        &mut ws,
        json!({
            "type": "approve",
            "instance_id": instance_id,
            "step_order": 2,
            "actor_id": 1
        }),
    )
    .await;
    assert_eq!(again["type"], "error");
    assert_eq!(again["kind"], "conflict");
}

#[tokio::test]
async fn test_websocket_errors_carry_kind() {
    let (addr, _state) = setup_server().await;
    let mut ws = connect(addr).await;
    let instance_id = submit_leave(&mut ws).await;

    // User 2 is the creator, not an approver
    let refused = request(
        &mut ws,
        json!({
            "type": "approve",
            "instance_id": instance_id,
            "step_order": 1,
            "actor_id": 2
        }),
    )
    .await;
    assert_eq!(refused["kind"], "authorization");

    let missing = request(
        &mut ws,
        json!({ "type": "get_view", "instance_id": "00000000-0000-0000-0000-000000000000" }),
    )
    .await;
    assert_eq!(missing["kind"], "not_found");

    let no_comment = request(
        &mut ws,
        json!({
            "type": "decline",
            "instance_id": instance_id,
            "step_order": 1,
            "actor_id": 1,
            "comment": ""
        }),
    )
    .await;
    assert_eq!(no_comment["kind"], "validation");

    let no_template = request(
        &mut ws,
        json!({
            "type": "submit",
            "resource_id": "po-1",
            "resource_type": "purchase_order",
            "creator_id": 2
        }),
    )
    .await;
    assert_eq!(no_template["kind"], "configuration");
}

#[tokio::test]
async fn test_websocket_subscribe_receives_events() {
    let (addr, _state) = setup_server().await;
    let mut actor = connect(addr).await;
    let mut watcher = connect(addr).await;
    let instance_id = submit_leave(&mut actor).await;

    let subscribed = request(
        &mut watcher,
        json!({ "type": "subscribe", "instance_id": instance_id }),
    )
    .await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["instance_id"], instance_id.as_str());

    let reply = request(
        &mut actor,
        json!({
            "type": "route_back",
            "instance_id": instance_id,
            "target_step": 0,
            "actor_id": 1,
            "comment": "add dates"
        }),
    )
    .await;
    assert_eq!(reply["instance"]["status"], "draft");

    let pushed = recv(&mut watcher).await;
    assert_eq!(pushed["type"], "event");
    assert_eq!(pushed["event"]["instance_id"], instance_id.as_str());
    assert_eq!(pushed["event"]["action"], "routed_back");
    assert_eq!(pushed["event"]["actor_id"], 1);
    assert_eq!(pushed["event"]["comment"], "add dates");

    let resubmitted = request(
        &mut actor,
        json!({ "type": "resubmit", "instance_id": instance_id, "actor_id": 2 }),
    )
    .await;
    assert_eq!(resubmitted["instance"]["status"], "under_review");
    assert_eq!(resubmitted["instance"]["current_step_order"], 1);
}

#[tokio::test]
async fn test_websocket_delegation_roundtrip() {
    let (addr, state) = setup_server().await;
    let mut ws = connect(addr).await;
    let now = chrono::Utc::now();

    let created = request(
        &mut ws,
        json!({
            "type": "create_delegation",
            "delegator_id": 1,
            "delegate_id": 2,
            "permission": "leave.approve",
            "valid_from": now,
            "valid_until": now + chrono::Duration::days(3),
            "reason": "conference",
            "created_by": 1
        }),
    )
    .await;
    assert_eq!(created["type"], "delegation", "{}", created);
    assert_eq!(created["delegation"]["status"], "active");
    let delegation_id = created["delegation"]["id"].as_str().unwrap().to_string();

    let duplicate = request(
        &mut ws,
        json!({
            "type": "create_delegation",
            "delegator_id": 1,
            "delegate_id": 2,
            "permission": "leave.approve",
            "valid_from": now,
            "valid_until": now + chrono::Duration::days(1),
            "created_by": 1
        }),
    )
    .await;
    assert_eq!(duplicate["kind"], "conflict");

    let granted = request(
        &mut ws,
        json!({ "type": "list_delegations", "user_id": 1, "as_delegator": true }),
    )
    .await;
    assert_eq!(granted["delegations"].as_array().unwrap().len(), 1);

    let revoked = request(
        &mut ws,
        json!({ "type": "revoke_delegation", "delegation_id": delegation_id, "actor_id": 1 }),
    )
    .await;
    assert_eq!(revoked["delegation"]["status"], "revoked");

    let stored = state
        .authority
        .get_delegation(delegation_id.parse().unwrap())
        .await
        .unwrap();
    assert!(stored.revoked_at.is_some());
}

#[tokio::test]
async fn test_websocket_auto_run_refused_without_grant() {
    let (addr, _state) = setup_server().await;
    let mut ws = connect(addr).await;
    let instance_id = submit_leave(&mut ws).await;

    let response = request(
        &mut ws,
        json!({
            "type": "auto_run",
            "instance_id": instance_id,
            "max_steps": 5,
            "operator_id": 1
        }),
    )
    .await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["kind"], "authorization");
}
