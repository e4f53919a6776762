//! Operator HTTP surface tests.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use shipway_control_plane::{
    api,
    events::EventBus,
    hub::Hub,
    restart::RestartPolicyEngine,
    router::MessageRouter,
    state::AppState,
    store::{memory::MemoryStore, Server, ServerStatus, Store},
    tokens,
};
use shipway_id::{OrgId, ServerId};
use tokio::net::TcpListener;

struct TestApp {
    addr: std::net::SocketAddr,
    store: Arc<MemoryStore>,
}

async fn spawn_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let hub = Hub::new();
    let events = EventBus::new();
    let restart = RestartPolicyEngine::new(
        hub.clone(),
        store.clone() as Arc<dyn Store>,
        events.clone(),
    );
    let router = MessageRouter::new(
        store.clone() as Arc<dyn Store>,
        hub.clone(),
        events.clone(),
        restart,
    );
    let state = AppState::new(store.clone() as Arc<dyn Store>, hub, events, router);

    let app = api::create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp { addr, store }
}

fn seed_server(store: &MemoryStore) -> ServerId {
    let id = ServerId::new();
    store.insert_server(Server {
        id,
        org_id: OrgId::new(),
        name: format!("server-{id}"),
        token_hash: tokens::hash_token(&tokens::generate_agent_token()),
        status: ServerStatus::Offline,
        last_heartbeat_at: None,
        agent_id: None,
        agent_version: None,
        runtime_version: None,
        hostname: None,
        os: None,
        arch: None,
        public_ip: None,
        resources: None,
        resource_usage: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    });
    id
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = spawn_app().await;
    let response = reqwest::get(format!("http://{}/healthz", app.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "control-plane");
}

#[tokio::test]
async fn readyz_reports_store_and_connection_count() {
    let app = spawn_app().await;
    let response = reqwest::get(format!("http://{}/readyz", app.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["connected_agents"], 0);
}

#[tokio::test]
async fn agent_info_404_when_not_connected() {
    let app = spawn_app().await;
    let server_id = seed_server(&app.store);

    let response = reqwest::get(format!("http://{}/v1/servers/{server_id}/agent", app.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "agent_not_connected");
}

#[tokio::test]
async fn agent_info_400_on_bad_server_id() {
    let app = spawn_app().await;
    let response = reqwest::get(format!("http://{}/v1/servers/not-an-id/agent", app.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn command_409_when_agent_not_connected() {
    let app = spawn_app().await;
    let server_id = seed_server(&app.store);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/v1/servers/{server_id}/commands", app.addr))
        .json(&json!({"type": "restart", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "agent_not_connected");
}

#[tokio::test]
async fn command_400_on_unknown_type() {
    let app = spawn_app().await;
    let server_id = seed_server(&app.store);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/v1/servers/{server_id}/commands", app.addr))
        .json(&json!({"type": "self_destruct", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unknown_command");
}
