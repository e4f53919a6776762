//! Health reconciliation pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use shipway_events::{PlatformEvent, ServerHealthPayload};
use shipway_id::ServerId;
use tracing::{info, warn};

use crate::alerts;
use crate::events::EventBus;
use crate::hub::Hub;
use crate::store::{AlertSeverity, NewAlert, Server, ServerStatus, Store, StoreError};

/// Heartbeat freshness threshold. Distinct from the connection-level 90s
/// reaper ceiling and the 30s command timeout; these are different layers
/// of the same liveness concern.
pub const HEARTBEAT_FRESHNESS_SECS: i64 = 60;

/// Max offline alerts per server per rolling hour.
pub const OFFLINE_ALERT_LIMIT: u32 = 10;

const ALERT_WINDOW_SECS: i64 = 3600;

/// Tri-state health derived from connectivity and heartbeat recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHealth {
    Healthy,
    Unhealthy,
    Offline,
}

impl ServerHealth {
    /// The status persisted for this health state.
    pub fn persisted_status(&self) -> ServerStatus {
        match self {
            ServerHealth::Healthy => ServerStatus::Online,
            ServerHealth::Unhealthy => ServerStatus::Error,
            ServerHealth::Offline => ServerStatus::Offline,
        }
    }
}

/// Statistics from one reconciliation pass.
#[derive(Debug, Default, Clone)]
pub struct HealthStats {
    pub checked: u32,
    pub transitions: u32,
    pub alerts_raised: u32,
}

struct AlertWindow {
    window_start: DateTime<Utc>,
    count: u32,
}

/// The health reconciler.
pub struct HealthReconciler {
    store: Arc<dyn Store>,
    hub: Hub,
    events: EventBus,
    offline_windows: Mutex<HashMap<ServerId, AlertWindow>>,
}

impl HealthReconciler {
    pub fn new(store: Arc<dyn Store>, hub: Hub, events: EventBus) -> Self {
        Self {
            store,
            hub,
            events,
            offline_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Derives tri-state health from connectivity and heartbeat recency.
    pub fn classify(
        is_connected: bool,
        last_heartbeat_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ServerHealth {
        if !is_connected {
            return ServerHealth::Offline;
        }

        let fresh = last_heartbeat_at
            .map(|at| now - at <= Duration::seconds(HEARTBEAT_FRESHNESS_SECS))
            .unwrap_or(false);

        if fresh {
            ServerHealth::Healthy
        } else {
            ServerHealth::Unhealthy
        }
    }

    /// Run a single reconciliation pass over every non-maintenance server.
    pub async fn run_pass(&self) -> Result<HealthStats, StoreError> {
        let mut stats = HealthStats::default();
        let servers = self.store.list_servers().await?;
        let now = Utc::now();

        for server in servers {
            if server.status == ServerStatus::Maintenance {
                continue;
            }
            stats.checked += 1;

            let is_connected = self.hub.is_agent_connected(server.id);
            let health = Self::classify(is_connected, server.last_heartbeat_at, now);
            let new_status = health.persisted_status();

            // Persist only on change.
            if new_status == server.status {
                continue;
            }

            if let Err(e) = self.store.update_server_status(server.id, new_status).await {
                warn!(server_id = %server.id, error = %e,
                    "Failed to persist server status");
                continue;
            }
            stats.transitions += 1;

            info!(
                server_id = %server.id,
                from = %server.status,
                to = %new_status,
                is_connected,
                "Server status transitioned"
            );

            match (server.status, new_status) {
                (ServerStatus::Online, ServerStatus::Offline) => {
                    self.events
                        .publish(PlatformEvent::ServerOffline(health_payload(
                            &server, new_status,
                        )));
                    if self.allow_offline_alert(server.id, now) {
                        let raised = alerts::raise(
                            &self.store,
                            &self.events,
                            NewAlert {
                                org_id: server.org_id,
                                alert_type: "server_offline".to_string(),
                                severity: AlertSeverity::Critical,
                                title: format!("Server {} is offline", server.name),
                                message: format!(
                                    "server {} lost its agent connection and has not heartbeated within {}s",
                                    server.name, HEARTBEAT_FRESHNESS_SECS
                                ),
                                dedupe_key: Some(format!("server_offline:{}", server.id)),
                                server_id: Some(server.id),
                                service_id: None,
                                deployment_id: None,
                            },
                        )
                        .await;
                        if raised.is_some() {
                            stats.alerts_raised += 1;
                        }
                    }
                }
                (ServerStatus::Offline | ServerStatus::Error, ServerStatus::Online) => {
                    self.events
                        .publish(PlatformEvent::ServerRecovered(health_payload(
                            &server, new_status,
                        )));
                    self.offline_windows.lock().unwrap().remove(&server.id);
                    let raised = alerts::raise(
                        &self.store,
                        &self.events,
                        NewAlert {
                            org_id: server.org_id,
                            alert_type: "server_recovered".to_string(),
                            severity: AlertSeverity::Info,
                            title: format!("Server {} recovered", server.name),
                            message: format!(
                                "server {} is connected and heartbeating again",
                                server.name
                            ),
                            dedupe_key: Some(format!("server_recovered:{}", server.id)),
                            server_id: Some(server.id),
                            service_id: None,
                            deployment_id: None,
                        },
                    )
                    .await;
                    if raised.is_some() {
                        stats.alerts_raised += 1;
                    }
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    /// Rolling-hour rate limit on offline alerts, to keep flapping
    /// connections from causing alert storms.
    fn allow_offline_alert(&self, server_id: ServerId, now: DateTime<Utc>) -> bool {
        let mut windows = self.offline_windows.lock().unwrap();
        let window = windows.entry(server_id).or_insert(AlertWindow {
            window_start: now,
            count: 0,
        });

        if now - window.window_start > Duration::seconds(ALERT_WINDOW_SECS) {
            window.window_start = now;
            window.count = 0;
        }

        if window.count >= OFFLINE_ALERT_LIMIT {
            return false;
        }
        window.count += 1;
        true
    }
}

fn health_payload(server: &Server, new_status: ServerStatus) -> ServerHealthPayload {
    ServerHealthPayload {
        org_id: server.org_id,
        server_id: server.id,
        server_name: server.name.clone(),
        previous_status: server.status.to_string(),
        status: new_status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Outbound;
    use crate::store::memory::MemoryStore;
    use shipway_id::OrgId;
    use shipway_protocol::Dialect;
    use tokio::sync::mpsc;

    fn seed_server(
        store: &MemoryStore,
        status: ServerStatus,
        heartbeat_age_secs: Option<i64>,
    ) -> ServerId {
        let id = ServerId::new();
        store.insert_server(Server {
            id,
            org_id: OrgId::new(),
            name: format!("server-{id}"),
            token_hash: crate::tokens::hash_token("shw_ag_test"),
            status,
            last_heartbeat_at: heartbeat_age_secs
                .map(|secs| Utc::now() - Duration::seconds(secs)),
            agent_id: None,
            agent_version: None,
            runtime_version: None,
            hostname: None,
            os: None,
            arch: None,
            public_ip: None,
            resources: None,
            resource_usage: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        id
    }

    fn connect(hub: &Hub, server_id: ServerId) -> (uuid::Uuid, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = hub.register(
            server_id,
            OrgId::new(),
            "agent".to_string(),
            "server".to_string(),
            Dialect::Legacy,
            tx,
        );
        (session, rx)
    }

    fn reconciler(store: Arc<MemoryStore>, hub: Hub) -> HealthReconciler {
        HealthReconciler::new(store as Arc<dyn Store>, hub, EventBus::new())
    }

    #[test]
    fn test_classify_matrix() {
        let now = Utc::now();
        let fresh = Some(now - Duration::seconds(10));
        let stale = Some(now - Duration::seconds(120));

        assert_eq!(
            HealthReconciler::classify(true, fresh, now),
            ServerHealth::Healthy
        );
        assert_eq!(
            HealthReconciler::classify(true, stale, now),
            ServerHealth::Unhealthy
        );
        assert_eq!(
            HealthReconciler::classify(true, None, now),
            ServerHealth::Unhealthy
        );
        assert_eq!(
            HealthReconciler::classify(false, fresh, now),
            ServerHealth::Offline
        );
    }

    #[tokio::test]
    async fn test_disconnected_stale_server_goes_offline_with_alert() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new();
        let server_id = seed_server(&store, ServerStatus::Online, Some(120));

        let stats = reconciler(store.clone(), hub).run_pass().await.unwrap();
        assert_eq!(stats.transitions, 1);
        assert_eq!(stats.alerts_raised, 1);

        let server = store.server_by_id(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Offline);

        let alerts = store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "server_offline");
    }

    #[tokio::test]
    async fn test_connected_fresh_server_stays_online_without_write() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new();
        let server_id = seed_server(&store, ServerStatus::Online, Some(5));
        let (_session, _rx) = connect(&hub, server_id);

        let stats = reconciler(store.clone(), hub).run_pass().await.unwrap();
        assert_eq!(stats.transitions, 0);
        // Persist only on change.
        assert_eq!(store.status_write_count(), 0);
    }

    #[tokio::test]
    async fn test_connected_but_silent_server_goes_error() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new();
        let server_id = seed_server(&store, ServerStatus::Online, Some(120));
        let (_session, _rx) = connect(&hub, server_id);

        reconciler(store.clone(), hub).run_pass().await.unwrap();

        let server = store.server_by_id(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Error);
        // Unhealthy is not offline: no offline alert.
        assert!(store.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_servers_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new();
        let server_id = seed_server(&store, ServerStatus::Maintenance, None);

        let stats = reconciler(store.clone(), hub).run_pass().await.unwrap();
        assert_eq!(stats.checked, 0);

        let server = store.server_by_id(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Maintenance);
    }

    #[tokio::test]
    async fn test_recovery_raises_info_alert_and_event() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new();
        let server_id = seed_server(&store, ServerStatus::Offline, Some(5));
        let (_session, _rx) = connect(&hub, server_id);

        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let reconciler = HealthReconciler::new(store.clone() as Arc<dyn Store>, hub, bus);
        reconciler.run_pass().await.unwrap();

        let server = store.server_by_id(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Online);

        let alerts = store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "server_recovered");
        assert_eq!(alerts[0].severity, AlertSeverity::Info);

        let mut saw_recovered = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type() == shipway_events::event_types::SERVER_RECOVERED {
                saw_recovered = true;
            }
        }
        assert!(saw_recovered);
    }

    #[tokio::test]
    async fn test_offline_alerts_rate_limited_to_ten_per_hour() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new();
        let server_id = seed_server(&store, ServerStatus::Online, Some(120));
        let reconciler = reconciler(store.clone(), hub);

        // Flap 12 times within the same rolling hour. The recovery side is
        // forced directly through the store so the recovery alert path (and
        // its window clearing) stays out of the picture.
        for _ in 0..12 {
            reconciler.run_pass().await.unwrap();
            store
                .update_server_status(server_id, ServerStatus::Online)
                .await
                .unwrap();
        }

        let offline_alerts = store
            .alerts()
            .into_iter()
            .filter(|a| a.alert_type == "server_offline")
            .count();
        assert_eq!(offline_alerts, OFFLINE_ALERT_LIMIT as usize);
    }

    #[tokio::test]
    async fn test_recovery_clears_the_rate_limit_window() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new();
        let server_id = seed_server(&store, ServerStatus::Online, Some(120));
        let reconciler = HealthReconciler::new(
            store.clone() as Arc<dyn Store>,
            hub.clone(),
            EventBus::new(),
        );

        // Exhaust the offline-alert budget.
        for _ in 0..11 {
            reconciler.run_pass().await.unwrap();
            store
                .update_server_status(server_id, ServerStatus::Online)
                .await
                .unwrap();
        }
        let exhausted = store
            .alerts()
            .into_iter()
            .filter(|a| a.alert_type == "server_offline")
            .count();
        assert_eq!(exhausted, OFFLINE_ALERT_LIMIT as usize);

        // A genuine recovery (connected + fresh heartbeat) clears the window.
        store
            .update_server_status(server_id, ServerStatus::Offline)
            .await
            .unwrap();
        store
            .record_server_heartbeat(server_id, Utc::now(), None)
            .await
            .unwrap();
        store
            .update_server_status(server_id, ServerStatus::Offline)
            .await
            .unwrap();
        let (session, _rx) = connect(&hub, server_id);
        reconciler.run_pass().await.unwrap();

        let server = store.server_by_id(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Online);

        // Next offline transition alerts again.
        assert!(hub.deregister(server_id, session));
        store
            .update_server_status(server_id, ServerStatus::Online)
            .await
            .unwrap();
        reconciler.run_pass().await.unwrap();

        let offline_alerts = store
            .alerts()
            .into_iter()
            .filter(|a| a.alert_type == "server_offline")
            .count();
        assert_eq!(offline_alerts, OFFLINE_ALERT_LIMIT as usize + 1);
    }
}
