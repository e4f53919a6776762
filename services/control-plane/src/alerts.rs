//! Alert creation shared by the router, restart engine, and health loop.
//!
//! An alert is an inserted row plus an `alert.fired` event for the
//! notification/webhook consumers. The core never mutates alerts after
//! creation; acknowledgement is a dashboard concern.

use std::sync::Arc;

use shipway_events::{AlertEventPayload, PlatformEvent};
use tracing::warn;

use crate::events::EventBus;
use crate::store::{Alert, NewAlert, Store};

/// Inserts the alert and fans out the `alert.fired` event.
///
/// A store failure is logged and swallowed: a lost alert must not take the
/// calling handler down with it.
pub async fn raise(store: &Arc<dyn Store>, events: &EventBus, alert: NewAlert) -> Option<Alert> {
    match store.insert_alert(alert).await {
        Ok(alert) => {
            events.publish(PlatformEvent::AlertFired(AlertEventPayload {
                org_id: alert.org_id,
                alert_id: alert.id,
                alert_type: alert.alert_type.clone(),
                severity: alert.severity.to_string(),
                title: alert.title.clone(),
                message: alert.message.clone(),
                server_id: alert.server_id,
                service_id: alert.service_id,
                deployment_id: alert.deployment_id,
            }));
            Some(alert)
        }
        Err(e) => {
            warn!(error = %e, "Failed to insert alert");
            None
        }
    }
}
