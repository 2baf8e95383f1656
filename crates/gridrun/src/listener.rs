//! # Listener Service
//!
//! Routes server-pushed event frames to the handler registered under the
//! correlation id of the request that subscribed to them.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

pub type EventHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub struct ListenerService {
    handlers: DashMap<u64, EventHandler>,
}

impl ListenerService {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, registration_id: u64, handler: EventHandler) {
        self.handlers.insert(registration_id, handler);
    }

    /// Returns whether a handler was registered under `registration_id`.
    pub fn deregister(&self, registration_id: u64) -> bool {
        self.handlers.remove(&registration_id).is_some()
    }

    pub fn registration_count(&self) -> usize {
        self.handlers.len()
    }

    /// Runs the handler for `registration_id`; events nobody listens to are dropped.
    pub fn dispatch(&self, registration_id: u64, body: &[u8]) {
        // Clone out so the handler never runs under the shard lock.
        let handler = self
            .handlers
            .get(&registration_id)
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => handler(body),
            None => debug!(registration_id, "dropping event with no registered listener"),
        }
    }
}

impl Default for ListenerService {
    fn default() -> Self {
        Self::new()
    }
}
