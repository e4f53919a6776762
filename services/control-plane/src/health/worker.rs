//! Health reconciliation background worker.
//!
//! Runs the reconciliation pass on a fixed interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::events::EventBus;
use crate::hub::Hub;
use crate::store::Store;

use super::reconciler::HealthReconciler;

/// How often the fleet is reconciled.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Health worker that runs the reconciliation loop.
pub struct HealthWorker {
    reconciler: HealthReconciler,
    interval: Duration,
}

impl HealthWorker {
    /// Create a new health worker.
    pub fn new(store: Arc<dyn Store>, hub: Hub, events: EventBus) -> Self {
        Self {
            reconciler: HealthReconciler::new(store, hub, events),
            interval: HEALTH_INTERVAL,
        }
    }

    /// Run the health worker until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting health reconciliation worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconciler.run_pass().await {
                        Ok(stats) => {
                            if stats.transitions > 0 {
                                info!(
                                    checked = stats.checked,
                                    transitions = stats.transitions,
                                    alerts_raised = stats.alerts_raised,
                                    "Health reconciliation pass complete"
                                );
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Health reconciliation pass failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health reconciliation worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
