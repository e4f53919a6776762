//! Container restart policy engine.
//!
//! Per-container crash bookkeeping with a bounded restart budget: up to
//! `max_restarts` automatic restarts, each delayed by `restart_delay_ms`,
//! with the counter forgiven after `reset_window_ms` of stability. Budget
//! exhaustion is not an error: it is a terminal business state surfaced as
//! a critical alert for a human or automation to act on.
//!
//! Trackers are in-memory only. A control-plane restart forgets crash
//! history and every container gets a fresh budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use shipway_id::{RequestId, ServerId, ServiceId};
use shipway_protocol::{CommandFrame, CommandType, ServerMessage};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts;
use crate::events::EventBus;
use crate::hub::Hub;
use crate::router::AgentContext;
use crate::store::{AlertSeverity, NewAlert, RestartPolicy, Store};

/// Synthetic exit code attached to OOM kills.
pub const OOM_EXIT_CODE: i64 = 137;

/// Per-container crash bookkeeping.
#[derive(Debug, Default)]
struct RestartTracker {
    restart_count: u32,
    last_restart: Option<Instant>,
    last_crash: Option<Instant>,
}

struct EngineInner {
    hub: Hub,
    store: Arc<dyn Store>,
    events: EventBus,
    trackers: Mutex<HashMap<String, RestartTracker>>,
}

/// The restart policy engine.
#[derive(Clone)]
pub struct RestartPolicyEngine {
    inner: Arc<EngineInner>,
}

enum Decision {
    Disabled,
    Exhausted(u32),
    Restart(Duration),
}

impl RestartPolicyEngine {
    pub fn new(hub: Hub, store: Arc<dyn Store>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                hub,
                store,
                events,
                trackers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Handles a container crash.
    pub async fn handle_crash(
        &self,
        ctx: &AgentContext,
        container_id: &str,
        service_id: Option<ServiceId>,
        exit_code: Option<i64>,
    ) {
        let policy = self.policy_for(service_id).await;
        let now = Instant::now();

        let decision = {
            let mut trackers = self.inner.trackers.lock().unwrap();
            let tracker = trackers.entry(container_id.to_string()).or_default();
            tracker.last_crash = Some(now);

            // Stable long enough since the last restart: forgive past failures.
            if let Some(last_restart) = tracker.last_restart {
                if now.duration_since(last_restart)
                    > Duration::from_millis(policy.reset_window_ms)
                {
                    tracker.restart_count = 0;
                }
            }

            if !policy.enabled {
                Decision::Disabled
            } else if tracker.restart_count >= policy.max_restarts {
                Decision::Exhausted(tracker.restart_count)
            } else {
                Decision::Restart(Duration::from_millis(policy.restart_delay_ms))
            }
        };

        match decision {
            Decision::Disabled => {
                debug!(
                    server_id = %ctx.server_id,
                    container_id,
                    "Restart policy disabled; crash ignored"
                );
            }
            Decision::Exhausted(count) => {
                warn!(
                    server_id = %ctx.server_id,
                    container_id,
                    restart_count = count,
                    "Restart budget exhausted"
                );
                alerts::raise(
                    &self.inner.store,
                    &self.inner.events,
                    NewAlert {
                        org_id: ctx.org_id,
                        alert_type: "restart_budget_exhausted".to_string(),
                        severity: AlertSeverity::Critical,
                        title: "Container restart budget exhausted".to_string(),
                        message: format!(
                            "container {container_id} on {} crashed again (exit code {}) after {} automatic restarts; manual intervention required",
                            ctx.server_name,
                            exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                            count
                        ),
                        dedupe_key: Some(format!("restart_budget:{container_id}")),
                        server_id: Some(ctx.server_id),
                        service_id,
                        deployment_id: None,
                    },
                )
                .await;
            }
            Decision::Restart(delay) => {
                debug!(
                    server_id = %ctx.server_id,
                    container_id,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling container restart"
                );
                self.schedule_restart(ctx.server_id, container_id.to_string(), delay);
            }
        }
    }

    /// Handles an OOM kill: a dedicated critical alert first, then the
    /// shared crash path with the synthetic exit code.
    pub async fn handle_oom(
        &self,
        ctx: &AgentContext,
        container_id: &str,
        service_id: Option<ServiceId>,
    ) {
        alerts::raise(
            &self.inner.store,
            &self.inner.events,
            NewAlert {
                org_id: ctx.org_id,
                alert_type: "container_oom".to_string(),
                severity: AlertSeverity::Critical,
                title: "Container OOM-killed".to_string(),
                message: format!(
                    "container {container_id} on {} exceeded its memory limit and was killed",
                    ctx.server_name
                ),
                dedupe_key: Some(format!("oom:{container_id}")),
                server_id: Some(ctx.server_id),
                service_id,
                deployment_id: None,
            },
        )
        .await;

        self.handle_crash(ctx, container_id, service_id, Some(OOM_EXIT_CODE))
            .await;
    }

    /// Clears a container's crash history. Deliberate lifecycle transitions
    /// (start/stop/kill) reset the budget unconditionally.
    pub fn clear(&self, container_id: &str) {
        if self
            .inner
            .trackers
            .lock()
            .unwrap()
            .remove(container_id)
            .is_some()
        {
            debug!(container_id, "Restart tracker cleared");
        }
    }

    /// Whether a container currently has crash history.
    pub fn is_tracked(&self, container_id: &str) -> bool {
        self.inner.trackers.lock().unwrap().contains_key(container_id)
    }

    /// Waits out the restart delay off the frame loop, then issues the
    /// restart command. The counter only advances on successful
    /// transmission.
    fn schedule_restart(&self, server_id: ServerId, container_id: String, delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let request_id = RequestId::new().to_string();
            let frame = CommandFrame::new(
                CommandType::ContainerRestart,
                &request_id,
                json!({ "container_id": container_id }),
            );

            if engine
                .inner
                .hub
                .send_to_agent(server_id, &ServerMessage::Command(frame))
            {
                let mut trackers = engine.inner.trackers.lock().unwrap();
                let tracker = trackers.entry(container_id.clone()).or_default();
                tracker.restart_count += 1;
                tracker.last_restart = Some(Instant::now());
                info!(
                    server_id = %server_id,
                    container_id = %container_id,
                    restart_count = tracker.restart_count,
                    "Container restart command sent"
                );
            } else {
                warn!(
                    server_id = %server_id,
                    container_id = %container_id,
                    "Agent disconnected before restart command could be sent"
                );
            }
        });
    }

    async fn policy_for(&self, service_id: Option<ServiceId>) -> RestartPolicy {
        let Some(service_id) = service_id else {
            return RestartPolicy::default();
        };

        match self.inner.store.service_restart_policy(service_id).await {
            Ok(Some(policy)) => policy,
            Ok(None) => RestartPolicy::default(),
            Err(e) => {
                warn!(service_id = %service_id, error = %e,
                    "Failed to load restart policy; using defaults");
                RestartPolicy::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Outbound;
    use crate::router::AgentContext;
    use crate::store::memory::MemoryStore;
    use shipway_id::OrgId;
    use shipway_protocol::Dialect;
    use tokio::sync::mpsc;

    struct Rig {
        engine: RestartPolicyEngine,
        ctx: AgentContext,
        store: Arc<MemoryStore>,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn rig() -> Rig {
        let hub = Hub::new();
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let server_id = ServerId::new();

        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(
            server_id,
            OrgId::new(),
            "agent".to_string(),
            "edge-1".to_string(),
            Dialect::Legacy,
            tx,
        );

        let engine = RestartPolicyEngine::new(hub, store.clone() as Arc<dyn Store>, events);
        let ctx = AgentContext {
            server_id,
            org_id: OrgId::new(),
            server_name: "edge-1".to_string(),
            dialect: Dialect::Legacy,
        };

        Rig {
            engine,
            ctx,
            store,
            rx,
        }
    }

    async fn drain_restart_commands(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> usize {
        let mut count = 0;
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Text(text) = out {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                if frame["type"] == "container_restart" {
                    count += 1;
                }
            }
        }
        count
    }

    /// Let the paused clock run past the restart delay so scheduled
    /// restarts fire.
    async fn settle() {
        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_three_crashes_restart_fourth_alerts() {
        let mut rig = rig();

        for _ in 0..3 {
            rig.engine.handle_crash(&rig.ctx, "c1", None, Some(1)).await;
            settle().await;
        }
        assert_eq!(drain_restart_commands(&mut rig.rx).await, 3);
        assert!(rig.store.alerts().is_empty());

        // Budget exhausted: no restart, exactly one critical alert.
        rig.engine.handle_crash(&rig.ctx, "c1", None, Some(1)).await;
        settle().await;
        assert_eq!(drain_restart_commands(&mut rig.rx).await, 0);

        let alerts = rig.store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "restart_budget_exhausted");
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_window_forgives_old_crashes() {
        let mut rig = rig();

        for _ in 0..3 {
            rig.engine.handle_crash(&rig.ctx, "c1", None, Some(1)).await;
            settle().await;
        }
        assert_eq!(drain_restart_commands(&mut rig.rx).await, 3);

        // A container crashing once every 10 minutes with a 5-minute reset
        // window never exhausts its budget.
        tokio::time::sleep(Duration::from_secs(600)).await;
        rig.engine.handle_crash(&rig.ctx, "c1", None, Some(1)).await;
        settle().await;

        assert_eq!(drain_restart_commands(&mut rig.rx).await, 1);
        assert!(rig.store.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_policy_does_nothing() {
        let mut rig = rig();
        let service_id = ServiceId::new();
        rig.store.set_restart_policy(
            service_id,
            RestartPolicy {
                enabled: false,
                ..RestartPolicy::default()
            },
        );

        rig.engine
            .handle_crash(&rig.ctx, "c1", Some(service_id), Some(1))
            .await;
        settle().await;

        assert_eq!(drain_restart_commands(&mut rig.rx).await, 0);
        assert!(rig.store.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_override_lowers_budget() {
        let mut rig = rig();
        let service_id = ServiceId::new();
        rig.store.set_restart_policy(
            service_id,
            RestartPolicy {
                max_restarts: 1,
                ..RestartPolicy::default()
            },
        );

        rig.engine
            .handle_crash(&rig.ctx, "c1", Some(service_id), Some(1))
            .await;
        settle().await;
        rig.engine
            .handle_crash(&rig.ctx, "c1", Some(service_id), Some(1))
            .await;
        settle().await;

        assert_eq!(drain_restart_commands(&mut rig.rx).await, 1);
        assert_eq!(rig.store.alerts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_clear_resets_budget() {
        let mut rig = rig();

        for _ in 0..3 {
            rig.engine.handle_crash(&rig.ctx, "c1", None, Some(1)).await;
            settle().await;
        }
        assert_eq!(drain_restart_commands(&mut rig.rx).await, 3);
        assert!(rig.engine.is_tracked("c1"));

        rig.engine.clear("c1");
        assert!(!rig.engine.is_tracked("c1"));

        rig.engine.handle_crash(&rig.ctx, "c1", None, Some(1)).await;
        settle().await;
        assert_eq!(drain_restart_commands(&mut rig.rx).await, 1);
        assert!(rig.store.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oom_raises_dedicated_alert_then_restarts() {
        let mut rig = rig();

        rig.engine.handle_oom(&rig.ctx, "c1", None).await;
        settle().await;

        // OOM alert fired and the shared crash path still restarted.
        let alerts = rig.store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "container_oom");
        assert_eq!(drain_restart_commands(&mut rig.rx).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_on_disconnected_agent_does_not_advance_budget() {
        let rig = rig();
        let ctx = AgentContext {
            server_id: ServerId::new(), // nobody connected for this server
            org_id: OrgId::new(),
            server_name: "unplugged-1".to_string(),
            dialect: Dialect::Legacy,
        };

        rig.engine.handle_crash(&ctx, "c9", None, Some(1)).await;
        settle().await;

        // Transmission failed, so the counter must not have advanced.
        let trackers = rig.engine.inner.trackers.lock().unwrap();
        assert_eq!(trackers.get("c9").unwrap().restart_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trackers_are_per_container() {
        let mut rig = rig();

        for _ in 0..3 {
            rig.engine.handle_crash(&rig.ctx, "c1", None, Some(1)).await;
            settle().await;
        }
        // c1 exhausted; c2 still has a full budget.
        rig.engine.handle_crash(&rig.ctx, "c1", None, Some(1)).await;
        rig.engine.handle_crash(&rig.ctx, "c2", None, Some(1)).await;
        settle().await;

        let restarts = drain_restart_commands(&mut rig.rx).await;
        assert_eq!(restarts, 4); // 3 for c1 + 1 for c2
        assert_eq!(rig.store.alerts().len(), 1);
    }
}
