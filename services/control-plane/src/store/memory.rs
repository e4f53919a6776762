//! In-memory store backend.
//!
//! Backs unit and integration tests; implements the same [`Store`] contract
//! as the Postgres backend over plain locked maps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipway_id::{AlertId, DeploymentId, ServerId, ServiceId};

use super::{
    AgentRegistration, Alert, Deployment, DeploymentStatus, NewAlert, ResourceUsage,
    RestartPolicy, Server, ServerStatus, Store, StoreError,
};

/// A [`Store`] over in-memory maps.
#[derive(Default)]
pub struct MemoryStore {
    servers: Mutex<HashMap<ServerId, Server>>,
    deployments: Mutex<HashMap<DeploymentId, Deployment>>,
    alerts: Mutex<Vec<Alert>>,
    restart_policies: Mutex<HashMap<ServiceId, RestartPolicy>>,
    status_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a server row.
    pub fn insert_server(&self, server: Server) {
        self.servers.lock().unwrap().insert(server.id, server);
    }

    /// Seed a deployment row.
    pub fn insert_deployment(&self, deployment: Deployment) {
        self.deployments
            .lock()
            .unwrap()
            .insert(deployment.id, deployment);
    }

    /// Seed a per-service restart policy override.
    pub fn set_restart_policy(&self, service_id: ServiceId, policy: RestartPolicy) {
        self.restart_policies
            .lock()
            .unwrap()
            .insert(service_id, policy);
    }

    /// All alerts inserted so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    /// How many times a server status has been written. Lets tests assert
    /// the persist-only-on-change discipline.
    pub fn status_write_count(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn server_by_id(&self, id: ServerId) -> Result<Option<Server>, StoreError> {
        Ok(self.servers.lock().unwrap().get(&id).cloned())
    }

    async fn server_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Server>, StoreError> {
        Ok(self
            .servers
            .lock()
            .unwrap()
            .values()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let mut servers: Vec<_> = self.servers.lock().unwrap().values().cloned().collect();
        servers.sort_by_key(|s| s.id);
        Ok(servers)
    }

    async fn update_server_status(
        &self,
        id: ServerId,
        status: ServerStatus,
    ) -> Result<(), StoreError> {
        if let Some(server) = self.servers.lock().unwrap().get_mut(&id) {
            server.status = status;
            server.updated_at = Utc::now();
            self.status_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn record_server_heartbeat(
        &self,
        id: ServerId,
        at: DateTime<Utc>,
        usage: Option<ResourceUsage>,
    ) -> Result<(), StoreError> {
        if let Some(server) = self.servers.lock().unwrap().get_mut(&id) {
            server.status = ServerStatus::Online;
            server.last_heartbeat_at = Some(at);
            if usage.is_some() {
                server.resource_usage = usage;
            }
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_server_agent_info(
        &self,
        id: ServerId,
        registration: &AgentRegistration,
    ) -> Result<(), StoreError> {
        if let Some(server) = self.servers.lock().unwrap().get_mut(&id) {
            server.agent_id = Some(registration.agent_id.clone());
            server.agent_version = registration.agent_version.clone();
            server.runtime_version = registration.runtime_version.clone();
            server.hostname = registration.hostname.clone();
            server.os = registration.os.clone();
            server.arch = registration.arch.clone();
            server.public_ip = registration.public_ip.clone();
            if registration.resources.is_some() {
                server.resources = registration.resources.clone();
            }
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn deployment_by_id(
        &self,
        id: DeploymentId,
    ) -> Result<Option<Deployment>, StoreError> {
        Ok(self.deployments.lock().unwrap().get(&id).cloned())
    }

    async fn update_deployment_status(
        &self,
        id: DeploymentId,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(deployment) = self.deployments.lock().unwrap().get_mut(&id) {
            deployment.status = status;
            if let Some(message) = error_message {
                deployment.error_message = Some(message.to_string());
            }
            if matches!(
                status,
                DeploymentStatus::Running
                    | DeploymentStatus::Failed
                    | DeploymentStatus::Stopped
                    | DeploymentStatus::Cancelled
            ) {
                deployment.finished_at = Some(Utc::now());
            }
            deployment.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_deployment_container(
        &self,
        id: DeploymentId,
        container_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(deployment) = self.deployments.lock().unwrap().get_mut(&id) {
            deployment.container_id = Some(container_id.to_string());
            deployment.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn latest_deploying_deployment(
        &self,
        server_id: ServerId,
    ) -> Result<Option<Deployment>, StoreError> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.server_id == server_id && d.status == DeploymentStatus::Deploying)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn pending_deployments(
        &self,
        server_id: ServerId,
    ) -> Result<Vec<Deployment>, StoreError> {
        let mut deployments: Vec<_> = self
            .deployments
            .lock()
            .unwrap()
            .values()
            .filter(|d| {
                d.server_id == server_id
                    && matches!(
                        d.status,
                        DeploymentStatus::Pending
                            | DeploymentStatus::Building
                            | DeploymentStatus::Deploying
                    )
            })
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.created_at);
        Ok(deployments)
    }

    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        let alert = Alert {
            id: AlertId::new(),
            org_id: alert.org_id,
            alert_type: alert.alert_type,
            severity: alert.severity,
            title: alert.title,
            message: alert.message,
            dedupe_key: alert.dedupe_key,
            server_id: alert.server_id,
            service_id: alert.service_id,
            deployment_id: alert.deployment_id,
            created_at: Utc::now(),
        };
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(alert)
    }

    async fn service_restart_policy(
        &self,
        service_id: ServiceId,
    ) -> Result<Option<RestartPolicy>, StoreError> {
        Ok(self
            .restart_policies
            .lock()
            .unwrap()
            .get(&service_id)
            .copied())
    }
}
