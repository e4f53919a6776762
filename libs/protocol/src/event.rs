//! Canonical inbound events.
//!
//! Whatever dialect a frame arrived in, handler logic only ever sees these
//! types. Normalization happens once, in [`crate::frame`].

use serde::{Deserialize, Serialize};
use shipway_id::{DeploymentId, ServiceId};

/// Which wire dialect a peer speaks.
///
/// Recorded at hello time so outbound replies (acks, pongs) can be rendered
/// in the dialect the agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Legacy,
    Compact,
}

/// Host resource totals reported by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_bytes: Option<i64>,
}

/// A single container as reported inside a legacy heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub container_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub state: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
}

/// The agent's self-description from its hello frame.
#[derive(Debug, Clone)]
pub struct Hello {
    pub dialect: Dialect,
    pub agent_id: String,
    pub agent_version: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub runtime_version: Option<String>,
    pub public_ip: Option<String>,
    pub resources: Option<ResourceSnapshot>,
}

/// A normalized heartbeat.
///
/// Legacy heartbeats carry per-container breakdowns and disk usage; compact
/// heartbeats carry only aggregate gauges. Absent fields stay `None`/empty.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatReport {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub container_count: u32,
    pub containers: Vec<ContainerState>,
    pub uptime_secs: Option<u64>,
}

/// A deployment lifecycle report in the agent's own vocabulary.
///
/// The status string is left raw here; the router owns the mapping to
/// canonical deployment status.
#[derive(Debug, Clone)]
pub struct DeployStatusReport {
    pub deployment_id: DeploymentId,
    pub status: String,
    pub message: Option<String>,
    pub container_id: Option<String>,
}

/// Container lifecycle signals relevant to the restart policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Running,
    Crashed,
    Oom,
    Start,
    Stop,
    Kill,
    Exited,
    Other(String),
}

impl ContainerEvent {
    /// Parses the event vocabulary used by both agent generations.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ContainerEvent::Running,
            "crash" | "crashed" | "die" => ContainerEvent::Crashed,
            "oom" | "oom_killed" => ContainerEvent::Oom,
            "start" | "started" => ContainerEvent::Start,
            "stop" | "stopped" => ContainerEvent::Stop,
            "kill" | "killed" => ContainerEvent::Kill,
            "exit" | "exited" => ContainerEvent::Exited,
            other => ContainerEvent::Other(other.to_string()),
        }
    }
}

/// A container status report.
#[derive(Debug, Clone)]
pub struct ContainerStatusReport {
    pub container_id: String,
    pub service_id: Option<ServiceId>,
    pub event: ContainerEvent,
    pub exit_code: Option<i64>,
    pub message: Option<String>,
}

/// The result of a one-off task the agent executed.
#[derive(Debug, Clone)]
pub struct TaskResultReport {
    pub task_id: String,
    pub deployment_id: Option<DeploymentId>,
    pub success: bool,
    pub message: Option<String>,
    pub output: Option<serde_json::Value>,
}

/// A batch of telemetry entries, passed through opaquely.
#[derive(Debug, Clone, Default)]
pub struct TelemetryBatch {
    pub entries: Vec<serde_json::Value>,
}

/// An alert raised by the agent itself (disk pressure, runtime trouble...).
#[derive(Debug, Clone)]
pub struct AgentAlert {
    pub alert_type: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub dedupe_key: Option<String>,
    pub service_id: Option<ServiceId>,
}

/// A response to a previously issued command.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub request_id: String,
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// The canonical inbound event, dialect-independent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Hello(Hello),
    Heartbeat(HeartbeatReport),
    DeployStatus(DeployStatusReport),
    ContainerStatus(ContainerStatusReport),
    TaskResult(TaskResultReport),
    TelemetryBatch(TelemetryBatch),
    Alert(AgentAlert),
    CommandResponse(CommandResponse),
}

impl AgentEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Hello(_) => "hello",
            AgentEvent::Heartbeat(_) => "heartbeat",
            AgentEvent::DeployStatus(_) => "deploy_status",
            AgentEvent::ContainerStatus(_) => "container_status",
            AgentEvent::TaskResult(_) => "task_result",
            AgentEvent::TelemetryBatch(_) => "telemetry_batch",
            AgentEvent::Alert(_) => "alert",
            AgentEvent::CommandResponse(_) => "command_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_event_vocabulary() {
        assert_eq!(ContainerEvent::parse("crashed"), ContainerEvent::Crashed);
        assert_eq!(ContainerEvent::parse("die"), ContainerEvent::Crashed);
        assert_eq!(ContainerEvent::parse("oom"), ContainerEvent::Oom);
        assert_eq!(ContainerEvent::parse("kill"), ContainerEvent::Kill);
        assert_eq!(
            ContainerEvent::parse("paused"),
            ContainerEvent::Other("paused".to_string())
        );
    }
}
