//! Inbound message routing.
//!
//! Dispatches canonical [`AgentEvent`]s to one handler each. Handlers are
//! idempotent per transition: the previous persisted status gates terminal
//! notifications, so an agent re-sending the same terminal report never
//! fires a duplicate event. Store write failures are logged and swallowed;
//! the next heartbeat or health pass converges the state.

use std::sync::Arc;

use shipway_events::{
    DeploymentEventPayload, PlatformEvent, TaskEventPayload, TelemetryEventPayload,
};
use shipway_id::{OrgId, ServerId};
use shipway_protocol::{
    AgentAlert, AgentEvent, CommandResponse, ContainerEvent, ContainerStatusReport,
    DeployStatusReport, Dialect, HeartbeatReport, ServerMessage, TaskResultReport, TelemetryBatch,
};
use tracing::{debug, info, warn};

use crate::alerts;
use crate::events::EventBus;
use crate::hub::Hub;
use crate::restart::RestartPolicyEngine;
use crate::store::{
    AlertSeverity, Deployment, DeploymentStatus, NewAlert, ResourceUsage, Store,
};

/// Per-connection context threaded through every handler.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub server_id: ServerId,
    pub org_id: OrgId,
    pub server_name: String,
    pub dialect: Dialect,
}

struct RouterInner {
    store: Arc<dyn Store>,
    hub: Hub,
    events: EventBus,
    restart: RestartPolicyEngine,
}

/// Routes inbound events to their handlers.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Hub,
        events: EventBus,
        restart: RestartPolicyEngine,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                store,
                hub,
                events,
                restart,
            }),
        }
    }

    /// Dispatches one event. Never fails: handler-level errors are logged
    /// and absorbed so the socket layer stays up.
    pub async fn handle_event(&self, ctx: &AgentContext, event: AgentEvent) {
        match event {
            AgentEvent::Heartbeat(report) => self.handle_heartbeat(ctx, report).await,
            AgentEvent::DeployStatus(report) => self.handle_deploy_status(ctx, report).await,
            AgentEvent::ContainerStatus(report) => {
                self.handle_container_status(ctx, report).await
            }
            AgentEvent::TaskResult(report) => self.handle_task_result(ctx, report).await,
            AgentEvent::TelemetryBatch(batch) => self.handle_telemetry(ctx, batch),
            AgentEvent::Alert(alert) => self.handle_alert(ctx, alert).await,
            AgentEvent::CommandResponse(response) => self.handle_command_response(ctx, response),
            AgentEvent::Hello(_) => {
                debug!(server_id = %ctx.server_id, "Hello outside handshake ignored");
            }
        }
    }

    async fn handle_heartbeat(&self, ctx: &AgentContext, report: HeartbeatReport) {
        self.inner.hub.touch_heartbeat(ctx.server_id);

        let usage = ResourceUsage {
            cpu_pct: report.cpu_usage,
            memory_pct: report.memory_usage,
            disk_pct: report.disk_usage,
        };
        if let Err(e) = self
            .inner
            .store
            .record_server_heartbeat(ctx.server_id, chrono::Utc::now(), Some(usage))
            .await
        {
            warn!(server_id = %ctx.server_id, error = %e, "Failed to persist heartbeat");
        }

        self.inner
            .hub
            .send_to_agent(ctx.server_id, &ServerMessage::HeartbeatAck);
    }

    async fn handle_deploy_status(&self, ctx: &AgentContext, report: DeployStatusReport) {
        let (status, recognized) = map_agent_status(&report.status);
        if !recognized {
            // Fail open: forward compatibility with newer agent vocabularies
            // wins over strict validation.
            warn!(
                server_id = %ctx.server_id,
                deployment_id = %report.deployment_id,
                raw_status = %report.status,
                "Unrecognized deployment status; defaulting to running"
            );
        }

        let deployment = match self.inner.store.deployment_by_id(report.deployment_id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                warn!(
                    server_id = %ctx.server_id,
                    deployment_id = %report.deployment_id,
                    "Status report for unknown deployment"
                );
                return;
            }
            Err(e) => {
                warn!(deployment_id = %report.deployment_id, error = %e,
                    "Failed to load deployment");
                return;
            }
        };

        if let Some(container_id) = &report.container_id {
            if let Err(e) = self
                .inner
                .store
                .set_deployment_container(deployment.id, container_id)
                .await
            {
                warn!(deployment_id = %deployment.id, error = %e,
                    "Failed to attach container to deployment");
            }
        }

        let previous = deployment.status;
        if previous == status {
            debug!(
                deployment_id = %deployment.id,
                status = %status,
                "Repeated deployment status ignored"
            );
            return;
        }

        let error_message = if status == DeploymentStatus::Failed {
            report.message.as_deref()
        } else {
            None
        };
        if let Err(e) = self
            .inner
            .store
            .update_deployment_status(deployment.id, status, error_message)
            .await
        {
            warn!(deployment_id = %deployment.id, error = %e,
                "Failed to persist deployment status");
            return;
        }

        info!(
            server_id = %ctx.server_id,
            deployment_id = %deployment.id,
            from = %previous,
            to = %status,
            "Deployment status updated"
        );

        // Exactly one notification per transition into a terminal state.
        if status.is_terminal() {
            self.publish_deployment_terminal(&deployment, status, error_message);
        }
    }

    fn publish_deployment_terminal(
        &self,
        deployment: &Deployment,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) {
        let payload = DeploymentEventPayload {
            org_id: deployment.org_id,
            server_id: deployment.server_id,
            service_id: deployment.service_id,
            deployment_id: deployment.id,
            status: status.to_string(),
            error_message: error_message.map(|s| s.to_string()),
        };
        let event = match status {
            DeploymentStatus::Failed => PlatformEvent::DeploymentFailed(payload),
            _ => PlatformEvent::DeploymentCompleted(payload),
        };
        self.inner.events.publish(event);
    }

    async fn handle_container_status(&self, ctx: &AgentContext, report: ContainerStatusReport) {
        match &report.event {
            ContainerEvent::Running | ContainerEvent::Start => {
                self.attach_container(ctx, &report.container_id).await;
                if report.event == ContainerEvent::Start {
                    self.inner.restart.clear(&report.container_id);
                }
            }
            ContainerEvent::Crashed => {
                self.inner
                    .restart
                    .handle_crash(ctx, &report.container_id, report.service_id, report.exit_code)
                    .await;
            }
            ContainerEvent::Oom => {
                self.inner
                    .restart
                    .handle_oom(ctx, &report.container_id, report.service_id)
                    .await;
            }
            ContainerEvent::Exited => match report.exit_code {
                Some(0) => self.inner.restart.clear(&report.container_id),
                _ => {
                    self.inner
                        .restart
                        .handle_crash(
                            ctx,
                            &report.container_id,
                            report.service_id,
                            report.exit_code,
                        )
                        .await;
                }
            },
            ContainerEvent::Stop | ContainerEvent::Kill => {
                self.inner.restart.clear(&report.container_id);
            }
            ContainerEvent::Other(event) => {
                debug!(
                    server_id = %ctx.server_id,
                    container_id = %report.container_id,
                    event = %event,
                    "Unhandled container event"
                );
            }
        }
    }

    /// Attaches a reported container to the most recent `deploying`
    /// deployment for this server.
    async fn attach_container(&self, ctx: &AgentContext, container_id: &str) {
        match self
            .inner
            .store
            .latest_deploying_deployment(ctx.server_id)
            .await
        {
            Ok(Some(deployment)) => {
                if let Err(e) = self
                    .inner
                    .store
                    .set_deployment_container(deployment.id, container_id)
                    .await
                {
                    warn!(deployment_id = %deployment.id, error = %e,
                        "Failed to attach container to deployment");
                }
            }
            Ok(None) => {
                debug!(
                    server_id = %ctx.server_id,
                    container_id,
                    "Container report with no deploying deployment"
                );
            }
            Err(e) => {
                warn!(server_id = %ctx.server_id, error = %e,
                    "Failed to look up deploying deployment");
            }
        }
    }

    async fn handle_task_result(&self, ctx: &AgentContext, report: TaskResultReport) {
        let payload = TaskEventPayload {
            org_id: ctx.org_id,
            server_id: ctx.server_id,
            task_id: report.task_id.clone(),
            deployment_id: report.deployment_id,
            success: report.success,
            message: report.message.clone(),
        };
        self.inner.events.publish(if report.success {
            PlatformEvent::TaskCompleted(payload)
        } else {
            PlatformEvent::TaskFailed(payload)
        });

        // Task results tied to a deployment drive it into a terminal state
        // under the same per-transition notification contract.
        let Some(deployment_id) = report.deployment_id else {
            return;
        };
        let deployment = match self.inner.store.deployment_by_id(deployment_id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                warn!(deployment_id = %deployment_id, "Task result for unknown deployment");
                return;
            }
            Err(e) => {
                warn!(deployment_id = %deployment_id, error = %e, "Failed to load deployment");
                return;
            }
        };

        let target = if report.success {
            DeploymentStatus::Running
        } else {
            DeploymentStatus::Failed
        };
        if deployment.status == target {
            return;
        }

        let error_message = if report.success {
            None
        } else {
            report.message.as_deref()
        };
        if let Err(e) = self
            .inner
            .store
            .update_deployment_status(deployment.id, target, error_message)
            .await
        {
            warn!(deployment_id = %deployment.id, error = %e,
                "Failed to persist deployment status");
            return;
        }

        self.publish_deployment_terminal(&deployment, target, error_message);
    }

    fn handle_telemetry(&self, ctx: &AgentContext, batch: TelemetryBatch) {
        debug!(
            server_id = %ctx.server_id,
            entries = batch.entries.len(),
            "Telemetry batch forwarded"
        );
        self.inner
            .events
            .publish(PlatformEvent::TelemetryBatch(TelemetryEventPayload {
                org_id: ctx.org_id,
                server_id: ctx.server_id,
                entries: batch.entries,
            }));
    }

    async fn handle_alert(&self, ctx: &AgentContext, alert: AgentAlert) {
        let severity = AlertSeverity::parse(&alert.severity).unwrap_or(AlertSeverity::Warning);

        alerts::raise(
            &self.inner.store,
            &self.inner.events,
            NewAlert {
                org_id: ctx.org_id,
                alert_type: alert.alert_type,
                severity,
                title: alert.title,
                message: alert.message,
                dedupe_key: alert.dedupe_key,
                server_id: Some(ctx.server_id),
                service_id: alert.service_id,
                deployment_id: None,
            },
        )
        .await;
    }

    fn handle_command_response(&self, ctx: &AgentContext, response: CommandResponse) {
        if !self.inner.hub.resolve_command(response) {
            // Already timed out, or a response for a different correlator
            // instance. Dropped silently by design.
            debug!(server_id = %ctx.server_id, "Late or unmatched command response dropped");
        }
    }
}

/// The fixed agent-vocabulary → canonical status table.
///
/// Returns the canonical status and whether the input was recognized;
/// unknown values fail open to `running`.
pub fn map_agent_status(raw: &str) -> (DeploymentStatus, bool) {
    match raw {
        "pulling" | "creating" => (DeploymentStatus::Building, true),
        "starting" | "created" | "deploying" => (DeploymentStatus::Deploying, true),
        "running" => (DeploymentStatus::Running, true),
        "stopped" | "exited" => (DeploymentStatus::Stopped, true),
        "failed" => (DeploymentStatus::Failed, true),
        _ => (DeploymentStatus::Running, false),
    }
}
