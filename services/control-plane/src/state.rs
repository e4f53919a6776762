//! Application state shared across request handlers and sessions.

use std::sync::Arc;

use crate::events::EventBus;
use crate::hub::Hub;
use crate::router::MessageRouter;
use crate::store::Store;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor, and
/// into every agent session.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn Store>,
    hub: Hub,
    events: EventBus,
    router: MessageRouter,
}

impl AppState {
    /// Create a new application state.
    pub fn new(store: Arc<dyn Store>, hub: Hub, events: EventBus, router: MessageRouter) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                hub,
                events,
                router,
            }),
        }
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Get a reference to the connection hub.
    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// Get a reference to the outbound event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Get a reference to the message router.
    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }
}
