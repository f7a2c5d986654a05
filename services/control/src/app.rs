//! Application state shared across request handlers.

use std::sync::Arc;

use crate::broker::RoutingBroker;
use crate::state::StateStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    broker: Arc<RoutingBroker>,
    store: Arc<StateStore>,
}

impl AppState {
    pub fn new(broker: Arc<RoutingBroker>, store: Arc<StateStore>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { broker, store }),
        }
    }

    pub fn broker(&self) -> &Arc<RoutingBroker> {
        &self.inner.broker
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }
}
