//! Server-facing operator endpoints.
//!
//! The HTTP face of the hub's public API, used by automation and manual
//! operator actions:
//! - GET /v1/servers/{server_id}/agent (live connection info)
//! - POST /v1/servers/{server_id}/commands (correlated command dispatch)

use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipway_id::ServerId;
use shipway_protocol::CommandType;

use crate::api::error::ApiError;
use crate::hub::CommandError;
use crate::state::AppState;

/// Server routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{server_id}/agent", get(get_agent_info))
        .route("/{server_id}/commands", post(send_command))
}

/// Live connection info for a server's agent.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct AgentInfoResponse {
    pub server_id: String,
    pub agent_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Request body for a correlated command.
#[derive(Debug, Deserialize)]
pub struct SendCommandRequest {
    /// Command type from the catalog (`deploy`, `stop`, `scale`, ...).
    #[serde(rename = "type")]
    pub kind: String,

    /// Command payload, passed through to the agent.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Optional timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Response carrying the agent's reply data.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct SendCommandResponse {
    pub success: bool,
    pub data: serde_json::Value,
}

async fn get_agent_info(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let server_id = parse_server_id(&server_id)?;

    let Some(info) = state.hub().agent_info(server_id) else {
        return Err(ApiError::not_found(
            "agent_not_connected",
            "No agent is connected for this server",
        ));
    };

    Ok(Json(AgentInfoResponse {
        server_id: server_id.to_string(),
        agent_id: info.agent_id,
        last_heartbeat: info.last_heartbeat,
        connected_since: state.hub().connected_since(server_id),
    }))
}

async fn send_command(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(request): Json<SendCommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let server_id = parse_server_id(&server_id)?;

    let Some(kind) = CommandType::parse(&request.kind) else {
        return Err(ApiError::bad_request(
            "unknown_command",
            format!("'{}' is not a known command type", request.kind),
        ));
    };

    let timeout = request.timeout_ms.map(Duration::from_millis);
    let data = state
        .hub()
        .send_command(server_id, kind, request.payload, timeout)
        .await
        .map_err(|e| match e {
            CommandError::NotConnected(_) => ApiError::conflict(
                "agent_not_connected",
                "No agent is connected for this server",
            ),
            CommandError::Timeout(timeout) => ApiError::gateway_timeout(
                "command_timeout",
                format!("Agent did not respond within {}ms", timeout.as_millis()),
            ),
            CommandError::Rejected(message) => {
                ApiError::bad_gateway("command_rejected", message)
            }
            CommandError::ConnectionClosed => ApiError::bad_gateway(
                "agent_disconnected",
                "Agent disconnected before responding",
            ),
        })?;

    Ok(Json(SendCommandResponse {
        success: true,
        data,
    }))
}

fn parse_server_id(raw: &str) -> Result<ServerId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid_server_id", "Invalid server ID format"))
}
