//! Persisted-store boundary.
//!
//! The core treats persistence as a narrow query/update interface: look up
//! servers by ID or token hash, advance deployment status, insert alerts,
//! read restart-policy overrides. [`postgres::PgStore`] is the production
//! backend; [`memory::MemoryStore`] backs tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipway_id::{AlertId, DeploymentId, OrgId, ServerId, ServiceId};
use shipway_protocol::ResourceSnapshot;
use thiserror::Error;

/// Errors surfaced by the store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Persisted server status.
///
/// Written by three independent writers (handshake, disconnect handler,
/// health loop); every write is idempotent and the health loop converges
/// any missed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Offline,
    Maintenance,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Maintenance => "maintenance",
            ServerStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(ServerStatus::Online),
            "offline" => Some(ServerStatus::Offline),
            "maintenance" => Some(ServerStatus::Maintenance),
            "error" => Some(ServerStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical deployment status.
///
/// Deployments are append-only history: status only advances, and a
/// rollback creates a new row instead of rewriting an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Running,
    Stopped,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeploymentStatus::Pending),
            "building" => Some(DeploymentStatus::Building),
            "deploying" => Some(DeploymentStatus::Deploying),
            "running" => Some(DeploymentStatus::Running),
            "stopped" => Some(DeploymentStatus::Stopped),
            "failed" => Some(DeploymentStatus::Failed),
            "cancelled" => Some(DeploymentStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states: no further automatic transition is expected, and a
    /// transition into one fires exactly one downstream notification.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Running | DeploymentStatus::Failed)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What caused a deployment to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentTrigger {
    Push,
    Manual,
    Rollback,
    Api,
}

impl DeploymentTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentTrigger::Push => "push",
            DeploymentTrigger::Manual => "manual",
            DeploymentTrigger::Rollback => "rollback",
            DeploymentTrigger::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push" => Some(DeploymentTrigger::Push),
            "manual" => Some(DeploymentTrigger::Manual),
            "rollback" => Some(DeploymentTrigger::Rollback),
            "api" => Some(DeploymentTrigger::Api),
            _ => None,
        }
    }
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(AlertSeverity::Info),
            "warning" => Some(AlertSeverity::Warning),
            "critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregate resource gauges from heartbeats (percentages).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_pct: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_pct: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_pct: Option<f64>,
}

/// A fleet server row.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: ServerId,
    pub org_id: OrgId,
    pub name: String,
    pub token_hash: String,
    pub status: ServerStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub agent_id: Option<String>,
    pub agent_version: Option<String>,
    pub runtime_version: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub public_ip: Option<String>,
    pub resources: Option<ResourceSnapshot>,
    pub resource_usage: Option<ResourceUsage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields reported by the agent at handshake time, persisted onto the
/// server row.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_version: Option<String>,
    pub runtime_version: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub public_ip: Option<String>,
    pub resources: Option<ResourceSnapshot>,
}

/// A deployment row.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: DeploymentId,
    pub service_id: ServiceId,
    pub server_id: ServerId,
    pub org_id: OrgId,
    pub status: DeploymentStatus,
    pub container_id: Option<String>,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub trigger: DeploymentTrigger,
    pub rollback_from_id: Option<DeploymentId>,
    pub error_message: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An alert row.
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: AlertId,
    pub org_id: OrgId,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub dedupe_key: Option<String>,
    pub server_id: Option<ServerId>,
    pub service_id: Option<ServiceId>,
    pub deployment_id: Option<DeploymentId>,
    pub created_at: DateTime<Utc>,
}

/// A new alert, before insertion.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub org_id: OrgId,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub dedupe_key: Option<String>,
    pub server_id: Option<ServerId>,
    pub service_id: Option<ServiceId>,
    pub deployment_id: Option<DeploymentId>,
}

/// Restart policy parameters, global defaults with optional per-service
/// overrides stored as JSON on the service row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub reset_window_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 3,
            restart_delay_ms: 5_000,
            reset_window_ms: 300_000,
        }
    }
}

/// The store contract consumed by the core.
#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    // Servers
    async fn server_by_id(&self, id: ServerId) -> Result<Option<Server>, StoreError>;
    async fn server_by_token_hash(&self, token_hash: &str)
        -> Result<Option<Server>, StoreError>;
    async fn list_servers(&self) -> Result<Vec<Server>, StoreError>;
    async fn update_server_status(
        &self,
        id: ServerId,
        status: ServerStatus,
    ) -> Result<(), StoreError>;
    async fn record_server_heartbeat(
        &self,
        id: ServerId,
        at: DateTime<Utc>,
        usage: Option<ResourceUsage>,
    ) -> Result<(), StoreError>;
    async fn update_server_agent_info(
        &self,
        id: ServerId,
        registration: &AgentRegistration,
    ) -> Result<(), StoreError>;

    // Deployments
    async fn deployment_by_id(&self, id: DeploymentId)
        -> Result<Option<Deployment>, StoreError>;
    async fn update_deployment_status(
        &self,
        id: DeploymentId,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn set_deployment_container(
        &self,
        id: DeploymentId,
        container_id: &str,
    ) -> Result<(), StoreError>;
    /// The most recent deployment in `deploying` state for a server, if any.
    async fn latest_deploying_deployment(
        &self,
        server_id: ServerId,
    ) -> Result<Option<Deployment>, StoreError>;
    /// Deployments the agent still has work for, delivered at handshake.
    async fn pending_deployments(
        &self,
        server_id: ServerId,
    ) -> Result<Vec<Deployment>, StoreError>;

    // Alerts
    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert, StoreError>;

    // Services
    async fn service_restart_policy(
        &self,
        service_id: ServiceId,
    ) -> Result<Option<RestartPolicy>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_status_roundtrip() {
        for status in [
            ServerStatus::Online,
            ServerStatus::Offline,
            ServerStatus::Maintenance,
            ServerStatus::Error,
        ] {
            assert_eq!(ServerStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_deployment_states() {
        assert!(DeploymentStatus::Running.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(!DeploymentStatus::Stopped.is_terminal());
        assert!(!DeploymentStatus::Deploying.is_terminal());
        assert!(!DeploymentStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_restart_policy_defaults() {
        let policy = RestartPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.max_restarts, 3);
        assert_eq!(policy.restart_delay_ms, 5_000);
        assert_eq!(policy.reset_window_ms, 300_000);
    }

    #[test]
    fn test_restart_policy_override_json() {
        let policy: RestartPolicy = serde_json::from_str(
            r#"{"enabled": false, "max_restarts": 5, "restart_delay_ms": 1000, "reset_window_ms": 60000}"#,
        )
        .unwrap();
        assert!(!policy.enabled);
        assert_eq!(policy.max_restarts, 5);
    }
}
