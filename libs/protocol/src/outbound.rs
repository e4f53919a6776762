//! Outbound server→agent messages.
//!
//! Replies are rendered in the dialect the agent registered with; command
//! frames use the legacy envelope, which both agent generations accept.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shipway_id::{DeploymentId, ServiceId, Ulid};

use crate::command::CommandType;
use crate::event::Dialect;

/// A deployment the agent should pick up work for, delivered in the
/// `hello_ack` config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDeployment {
    pub deployment_id: DeploymentId,
    pub service_id: ServiceId,
}

/// Agent runtime configuration pushed at handshake time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub heartbeat_interval_secs: u64,
    pub telemetry_batch_interval_secs: u64,
    pub telemetry_buffer_limit: u32,
    pub log_level: String,

    #[serde(default)]
    pub pending_deployments: Vec<PendingDeployment>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            telemetry_batch_interval_secs: 60,
            telemetry_buffer_limit: 1000,
            log_level: "info".to_string(),
            pending_deployments: Vec::new(),
        }
    }
}

/// A command frame pushed to an agent.
///
/// The request ID is embedded in the payload so agents can echo it back in
/// their `command_response`, and doubles as the envelope `id`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandFrame {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: CommandType,

    pub timestamp: chrono::DateTime<Utc>,

    pub payload: serde_json::Value,
}

impl CommandFrame {
    pub fn new(kind: CommandType, request_id: &str, payload: serde_json::Value) -> Self {
        let mut payload = match payload {
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            serde_json::Value::Null => json!({}),
            other => json!({ "value": other }),
        };
        payload["request_id"] = json!(request_id);

        Self {
            id: request_id.to_string(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Everything the hub can write to an agent socket.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Handshake acknowledgement for legacy agents.
    HelloAck(AgentConfig),

    /// Handshake acknowledgement for compact agents.
    Welcome { session_id: String },

    /// Heartbeat acknowledgement; dialect picks the spelling.
    HeartbeatAck,

    /// A command frame.
    Command(CommandFrame),
}

impl ServerMessage {
    /// Renders the message as wire text for the given dialect.
    pub fn to_text(&self, dialect: Dialect) -> String {
        match self {
            ServerMessage::HelloAck(config) => envelope("hello_ack", json!(config)),
            ServerMessage::Welcome { session_id } => {
                json!({ "type": "Welcome", "session_id": session_id }).to_string()
            }
            ServerMessage::HeartbeatAck => match dialect {
                Dialect::Legacy => envelope("heartbeat_ack", json!({})),
                Dialect::Compact => json!({ "type": "Pong" }).to_string(),
            },
            ServerMessage::Command(frame) => {
                serde_json::to_string(frame).unwrap_or_else(|_| envelope("ping", json!({})))
            }
        }
    }
}

fn envelope(kind: &str, payload: serde_json::Value) -> String {
    json!({
        "id": Ulid::new().to_string(),
        "type": kind,
        "timestamp": Utc::now(),
        "payload": payload,
    })
    .to_string()
}
