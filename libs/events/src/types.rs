//! Event type definitions.

use serde::{Deserialize, Serialize};
use shipway_id::{AlertId, DeploymentId, OrgId, ServerId, ServiceId};

/// Event type string constants, for consumers that filter by name.
pub mod event_types {
    pub const DEPLOYMENT_COMPLETED: &str = "deployment.completed";
    pub const DEPLOYMENT_FAILED: &str = "deployment.failed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const ALERT_FIRED: &str = "alert.fired";
    pub const SERVER_OFFLINE: &str = "server.offline";
    pub const SERVER_RECOVERED: &str = "server.recovered";
    pub const TELEMETRY_BATCH: &str = "telemetry.batch";
}

/// Payload for deployment terminal-state events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEventPayload {
    pub org_id: OrgId,
    pub server_id: ServerId,
    pub service_id: ServiceId,
    pub deployment_id: DeploymentId,

    /// Canonical terminal status: `running` or `failed`.
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Payload for one-off task terminal events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEventPayload {
    pub org_id: OrgId,
    pub server_id: ServerId,
    pub task_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,

    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload for alert-fired events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEventPayload {
    pub org_id: OrgId,
    pub alert_id: AlertId,
    pub alert_type: String,
    pub severity: String,
    pub title: String,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,
}

/// Payload for server online/offline transitions observed by the health
/// reconciliation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealthPayload {
    pub org_id: OrgId,
    pub server_id: ServerId,
    pub server_name: String,
    pub previous_status: String,
    pub status: String,
}

/// Payload for telemetry passthrough. Entries are opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEventPayload {
    pub org_id: OrgId,
    pub server_id: ServerId,
    pub entries: Vec<serde_json::Value>,
}

/// Every event the core publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum PlatformEvent {
    #[serde(rename = "deployment.completed")]
    DeploymentCompleted(DeploymentEventPayload),

    #[serde(rename = "deployment.failed")]
    DeploymentFailed(DeploymentEventPayload),

    #[serde(rename = "task.completed")]
    TaskCompleted(TaskEventPayload),

    #[serde(rename = "task.failed")]
    TaskFailed(TaskEventPayload),

    #[serde(rename = "alert.fired")]
    AlertFired(AlertEventPayload),

    #[serde(rename = "server.offline")]
    ServerOffline(ServerHealthPayload),

    #[serde(rename = "server.recovered")]
    ServerRecovered(ServerHealthPayload),

    #[serde(rename = "telemetry.batch")]
    TelemetryBatch(TelemetryEventPayload),
}

impl PlatformEvent {
    /// The event's type string, matching [`event_types`].
    pub fn event_type(&self) -> &'static str {
        match self {
            PlatformEvent::DeploymentCompleted(_) => event_types::DEPLOYMENT_COMPLETED,
            PlatformEvent::DeploymentFailed(_) => event_types::DEPLOYMENT_FAILED,
            PlatformEvent::TaskCompleted(_) => event_types::TASK_COMPLETED,
            PlatformEvent::TaskFailed(_) => event_types::TASK_FAILED,
            PlatformEvent::AlertFired(_) => event_types::ALERT_FIRED,
            PlatformEvent::ServerOffline(_) => event_types::SERVER_OFFLINE,
            PlatformEvent::ServerRecovered(_) => event_types::SERVER_RECOVERED,
            PlatformEvent::TelemetryBatch(_) => event_types::TELEMETRY_BATCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = PlatformEvent::DeploymentCompleted(DeploymentEventPayload {
            org_id: OrgId::new(),
            server_id: ServerId::new(),
            service_id: ServiceId::new(),
            deployment_id: DeploymentId::new(),
            status: "running".to_string(),
            error_message: None,
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "deployment.completed");
        assert_eq!(value["payload"]["status"], "running");
    }

    #[test]
    fn test_event_type_matches_constant() {
        let event = PlatformEvent::ServerOffline(ServerHealthPayload {
            org_id: OrgId::new(),
            server_id: ServerId::new(),
            server_name: "edge-1".to_string(),
            previous_status: "online".to_string(),
            status: "offline".to_string(),
        });

        assert_eq!(event.event_type(), event_types::SERVER_OFFLINE);
    }

    #[test]
    fn test_event_roundtrip() {
        let event = PlatformEvent::AlertFired(AlertEventPayload {
            org_id: OrgId::new(),
            alert_id: AlertId::new(),
            alert_type: "container_oom".to_string(),
            severity: "critical".to_string(),
            title: "Container OOM-killed".to_string(),
            message: "container c1 exceeded its memory limit".to_string(),
            server_id: Some(ServerId::new()),
            service_id: None,
            deployment_id: None,
        });

        let json = serde_json::to_string(&event).unwrap();
        let parsed: PlatformEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), event_types::ALERT_FIRED);
    }
}
