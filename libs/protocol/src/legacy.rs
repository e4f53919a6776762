//! Payload shapes for the legacy JSON dialect.
//!
//! Legacy frames wrap every message in the `{ id, type, timestamp, payload }`
//! envelope; these are the per-`type` payload structs.

use serde::{Deserialize, Serialize};
use shipway_id::{DeploymentId, ServiceId};

use crate::event::{ContainerState, ResourceSnapshot};

/// `agent_hello` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub agent_id: String,

    #[serde(default)]
    pub agent_version: Option<String>,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub os: Option<String>,

    #[serde(default)]
    pub arch: Option<String>,

    /// Container runtime version on the host.
    #[serde(default)]
    pub runtime_version: Option<String>,

    #[serde(default)]
    pub public_ip: Option<String>,

    #[serde(default)]
    pub resources: Option<ResourceSnapshot>,
}

/// `heartbeat` payload with the full per-container breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub cpu_usage: Option<f64>,

    #[serde(default)]
    pub memory_usage: Option<f64>,

    #[serde(default)]
    pub disk_usage: Option<f64>,

    #[serde(default)]
    pub containers: Vec<ContainerState>,

    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

/// `deploy_status` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployStatusPayload {
    pub deployment_id: DeploymentId,

    /// Agent-side status vocabulary; mapped to canonical status downstream.
    pub status: String,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub container_id: Option<String>,
}

/// `container_status` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatusPayload {
    pub container_id: String,

    #[serde(default)]
    pub service_id: Option<ServiceId>,

    /// Lifecycle event name: `running`, `crashed`, `oom`, `start`, `stop`,
    /// `kill`, `exited`...
    pub event: String,

    #[serde(default)]
    pub exit_code: Option<i64>,

    #[serde(default)]
    pub message: Option<String>,
}

/// `task_result` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: String,

    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,

    pub success: bool,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

/// `telemetry_batch` payload. Entries are opaque to the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryBatchPayload {
    #[serde(default)]
    pub entries: Vec<serde_json::Value>,
}

/// `alert` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAlertPayload {
    pub alert_type: String,

    #[serde(default = "default_severity")]
    pub severity: String,

    pub title: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub dedupe_key: Option<String>,

    #[serde(default)]
    pub service_id: Option<ServiceId>,
}

fn default_severity() -> String {
    "warning".to_string()
}

/// `command_response` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponsePayload {
    pub request_id: String,

    pub success: bool,

    #[serde(default)]
    pub data: Option<serde_json::Value>,

    #[serde(default)]
    pub error: Option<String>,
}
