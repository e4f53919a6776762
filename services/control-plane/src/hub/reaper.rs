//! Stale-connection reaper.
//!
//! The liveness backstop independent of any heartbeat-interval negotiation:
//! connections that have not heartbeated inside the ceiling are force-closed
//! with code 4004 and their servers marked offline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shipway_protocol::close::CLOSE_HEARTBEAT_TIMEOUT;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::{ServerStatus, Store};

use super::Hub;

/// How often the reaper sweeps.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum silence before a connection is considered dead.
pub const HEARTBEAT_CEILING: Duration = Duration::from_secs(90);

/// Periodic worker that evicts silent connections.
pub struct ConnectionReaper {
    hub: Hub,
    store: Arc<dyn Store>,
    interval: Duration,
    max_heartbeat_age: Duration,
}

impl ConnectionReaper {
    pub fn new(hub: Hub, store: Arc<dyn Store>) -> Self {
        Self {
            hub,
            store,
            interval: REAP_INTERVAL,
            max_heartbeat_age: HEARTBEAT_CEILING,
        }
    }

    /// Run the reaper until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            ceiling_secs = self.max_heartbeat_age.as_secs(),
            "Starting stale-connection reaper"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let reaped = self.reap_once().await;
                    if reaped > 0 {
                        info!(reaped, "Evicted stale agent connections");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Stale-connection reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// A single sweep. Returns how many connections were evicted.
    pub async fn reap_once(&self) -> usize {
        let stale = self.hub.stale_agents(self.max_heartbeat_age, Utc::now());
        let mut reaped = 0;

        for (server_id, session) in stale {
            if !self
                .hub
                .evict(server_id, session, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout")
            {
                continue;
            }
            reaped += 1;

            if let Err(e) = self
                .store
                .update_server_status(server_id, ServerStatus::Offline)
                .await
            {
                warn!(server_id = %server_id, error = %e,
                    "Failed to mark reaped server offline");
            }
        }

        reaped
    }
}
