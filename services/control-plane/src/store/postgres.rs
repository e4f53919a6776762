//! Postgres store backend.
//!
//! Uses SQLx runtime queries with manual row mapping; the macros feature is
//! disabled workspace-wide to avoid a compile-time database requirement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipway_id::{AlertId, DeploymentId, OrgId, ServerId, ServiceId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

use super::{
    AgentRegistration, Alert, AlertSeverity, Deployment, DeploymentStatus, DeploymentTrigger,
    NewAlert, ResourceUsage, RestartPolicy, Server, ServerStatus, Store, StoreError,
};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/shipway".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/shipway".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Postgres-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store with a fresh connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    ///
    /// Note: In production, migrations should be run via a separate
    /// migration tool or as part of deployment. This method uses runtime
    /// migration loading.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/control-plane/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<String> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(|e| StoreError::Migration(e.to_string()))?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(StoreError::Migration(format!(
            "no migrations directory found, last error: {}",
            last_error.unwrap_or_else(|| "unknown".to_string())
        )))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn server_by_id(&self, id: ServerId) -> Result<Option<Server>, StoreError> {
        let row = sqlx::query_as::<_, ServerRow>(&format!(
            "{SELECT_SERVER} WHERE server_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Server::try_from).transpose()
    }

    async fn server_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Server>, StoreError> {
        let row = sqlx::query_as::<_, ServerRow>(&format!(
            "{SELECT_SERVER} WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Server::try_from).transpose()
    }

    async fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let rows = sqlx::query_as::<_, ServerRow>(&format!(
            "{SELECT_SERVER} ORDER BY server_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Server::try_from).collect()
    }

    async fn update_server_status(
        &self,
        id: ServerId,
        status: ServerStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE servers
            SET status = $1, updated_at = now()
            WHERE server_id = $2
            "#,
        )
        .bind(status.as_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_server_heartbeat(
        &self,
        id: ServerId,
        at: DateTime<Utc>,
        usage: Option<ResourceUsage>,
    ) -> Result<(), StoreError> {
        let usage_json = usage.map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            UPDATE servers
            SET status = 'online',
                last_heartbeat_at = $1,
                resource_usage = COALESCE($2, resource_usage),
                updated_at = now()
            WHERE server_id = $3
            "#,
        )
        .bind(at)
        .bind(usage_json)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_server_agent_info(
        &self,
        id: ServerId,
        registration: &AgentRegistration,
    ) -> Result<(), StoreError> {
        let resources_json = registration
            .resources
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE servers
            SET agent_id = $1,
                agent_version = $2,
                runtime_version = $3,
                hostname = $4,
                os = $5,
                arch = $6,
                public_ip = $7,
                resources = COALESCE($8, resources),
                updated_at = now()
            WHERE server_id = $9
            "#,
        )
        .bind(&registration.agent_id)
        .bind(&registration.agent_version)
        .bind(&registration.runtime_version)
        .bind(&registration.hostname)
        .bind(&registration.os)
        .bind(&registration.arch)
        .bind(&registration.public_ip)
        .bind(resources_json)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deployment_by_id(
        &self,
        id: DeploymentId,
    ) -> Result<Option<Deployment>, StoreError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "{SELECT_DEPLOYMENT} WHERE deployment_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Deployment::try_from).transpose()
    }

    async fn update_deployment_status(
        &self,
        id: DeploymentId,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1,
                error_message = COALESCE($2, error_message),
                finished_at = CASE WHEN $1 IN ('running', 'failed', 'stopped', 'cancelled')
                                   THEN now() ELSE finished_at END,
                updated_at = now()
            WHERE deployment_id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_deployment_container(
        &self,
        id: DeploymentId,
        container_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE deployments
            SET container_id = $1, updated_at = now()
            WHERE deployment_id = $2
            "#,
        )
        .bind(container_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_deploying_deployment(
        &self,
        server_id: ServerId,
    ) -> Result<Option<Deployment>, StoreError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"{SELECT_DEPLOYMENT}
            WHERE server_id = $1 AND status = 'deploying'
            ORDER BY created_at DESC
            LIMIT 1"#
        ))
        .bind(server_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Deployment::try_from).transpose()
    }

    async fn pending_deployments(
        &self,
        server_id: ServerId,
    ) -> Result<Vec<Deployment>, StoreError> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"{SELECT_DEPLOYMENT}
            WHERE server_id = $1 AND status IN ('pending', 'building', 'deploying')
            ORDER BY created_at"#
        ))
        .bind(server_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Deployment::try_from).collect()
    }

    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        let alert_id = AlertId::new();
        let created_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO alerts (
                alert_id, org_id, alert_type, severity, title, message,
                dedupe_key, server_id, service_id, deployment_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(alert_id.to_string())
        .bind(alert.org_id.to_string())
        .bind(&alert.alert_type)
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.dedupe_key)
        .bind(alert.server_id.map(|id| id.to_string()))
        .bind(alert.service_id.map(|id| id.to_string()))
        .bind(alert.deployment_id.map(|id| id.to_string()))
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Alert {
            id: alert_id,
            org_id: alert.org_id,
            alert_type: alert.alert_type,
            severity: alert.severity,
            title: alert.title,
            message: alert.message,
            dedupe_key: alert.dedupe_key,
            server_id: alert.server_id,
            service_id: alert.service_id,
            deployment_id: alert.deployment_id,
            created_at,
        })
    }

    async fn service_restart_policy(
        &self,
        service_id: ServiceId,
    ) -> Result<Option<RestartPolicy>, StoreError> {
        let row: Option<Option<serde_json::Value>> = sqlx::query_scalar(
            "SELECT restart_policy FROM services WHERE service_id = $1",
        )
        .bind(service_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row.flatten() {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

const SELECT_SERVER: &str = r#"
    SELECT server_id, org_id, name, token_hash, status, last_heartbeat_at,
           agent_id, agent_version, runtime_version, hostname, os, arch,
           public_ip, resources, resource_usage, created_at, updated_at
    FROM servers"#;

const SELECT_DEPLOYMENT: &str = r#"
    SELECT deployment_id, service_id, server_id, org_id, status, container_id,
           commit_sha, commit_message, trigger_type, rollback_from_id,
           error_message, finished_at, created_at, updated_at
    FROM deployments"#;

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug)]
struct ServerRow {
    server_id: String,
    org_id: String,
    name: String,
    token_hash: String,
    status: String,
    last_heartbeat_at: Option<DateTime<Utc>>,
    agent_id: Option<String>,
    agent_version: Option<String>,
    runtime_version: Option<String>,
    hostname: Option<String>,
    os: Option<String>,
    arch: Option<String>,
    public_ip: Option<String>,
    resources: Option<serde_json::Value>,
    resource_usage: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ServerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            server_id: row.try_get("server_id")?,
            org_id: row.try_get("org_id")?,
            name: row.try_get("name")?,
            token_hash: row.try_get("token_hash")?,
            status: row.try_get("status")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            agent_id: row.try_get("agent_id")?,
            agent_version: row.try_get("agent_version")?,
            runtime_version: row.try_get("runtime_version")?,
            hostname: row.try_get("hostname")?,
            os: row.try_get("os")?,
            arch: row.try_get("arch")?,
            public_ip: row.try_get("public_ip")?,
            resources: row.try_get("resources")?,
            resource_usage: row.try_get("resource_usage")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ServerRow> for Server {
    type Error = StoreError;

    fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
        Ok(Server {
            id: parse_id::<ServerId>(&row.server_id)?,
            org_id: parse_id::<OrgId>(&row.org_id)?,
            name: row.name,
            token_hash: row.token_hash,
            status: ServerStatus::parse(&row.status).unwrap_or(ServerStatus::Offline),
            last_heartbeat_at: row.last_heartbeat_at,
            agent_id: row.agent_id,
            agent_version: row.agent_version,
            runtime_version: row.runtime_version,
            hostname: row.hostname,
            os: row.os,
            arch: row.arch,
            public_ip: row.public_ip,
            resources: row.resources.map(serde_json::from_value).transpose()?,
            resource_usage: row.resource_usage.map(serde_json::from_value).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct DeploymentRow {
    deployment_id: String,
    service_id: String,
    server_id: String,
    org_id: String,
    status: String,
    container_id: Option<String>,
    commit_sha: Option<String>,
    commit_message: Option<String>,
    trigger_type: String,
    rollback_from_id: Option<String>,
    error_message: Option<String>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeploymentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            deployment_id: row.try_get("deployment_id")?,
            service_id: row.try_get("service_id")?,
            server_id: row.try_get("server_id")?,
            org_id: row.try_get("org_id")?,
            status: row.try_get("status")?,
            container_id: row.try_get("container_id")?,
            commit_sha: row.try_get("commit_sha")?,
            commit_message: row.try_get("commit_message")?,
            trigger_type: row.try_get("trigger_type")?,
            rollback_from_id: row.try_get("rollback_from_id")?,
            error_message: row.try_get("error_message")?,
            finished_at: row.try_get("finished_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = StoreError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        Ok(Deployment {
            id: parse_id::<DeploymentId>(&row.deployment_id)?,
            service_id: parse_id::<ServiceId>(&row.service_id)?,
            server_id: parse_id::<ServerId>(&row.server_id)?,
            org_id: parse_id::<OrgId>(&row.org_id)?,
            status: DeploymentStatus::parse(&row.status).unwrap_or(DeploymentStatus::Pending),
            container_id: row.container_id,
            commit_sha: row.commit_sha,
            commit_message: row.commit_message,
            trigger: DeploymentTrigger::parse(&row.trigger_type)
                .unwrap_or(DeploymentTrigger::Manual),
            rollback_from_id: row
                .rollback_from_id
                .as_deref()
                .map(parse_id::<DeploymentId>)
                .transpose()?,
            error_message: row.error_message,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_id<T: std::str::FromStr<Err = shipway_id::IdError>>(s: &str) -> Result<T, StoreError> {
    s.parse::<T>()
        .map_err(|e| StoreError::Corrupt(format!("bad ID '{s}': {e}")))
}
