//! Global session registry.
//!
//! Distinct tasks (stream channel, control channel, status endpoint, session
//! manager) must resolve a `SessionId` to the same streamer. The registry is
//! an explicit service passed where needed; there is no ambient process
//! state.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;
use visor_core::{SessionId, StreamingConfig};

use crate::streamer::EventStreamer;

/// Registry of live event streamers keyed by session id.
pub struct StreamerRegistry {
    config: StreamingConfig,
    streamers: DashMap<String, Arc<EventStreamer>>,
}

impl StreamerRegistry {
    /// Create a registry whose streamers share `config`.
    #[must_use]
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            streamers: DashMap::new(),
        }
    }

    /// The config new streamers are created with.
    #[must_use]
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Register (or return the existing) streamer for a session.
    #[must_use]
    pub fn register(&self, session_id: &SessionId) -> Arc<EventStreamer> {
        if let Some(existing) = self.lookup(session_id) {
            return existing;
        }
        let streamer = EventStreamer::new(session_id.clone(), self.config.clone());
        let _ = self
            .streamers
            .insert(session_id.as_str().to_string(), Arc::clone(&streamer));
        metrics::gauge!("visual_sessions_active").increment(1.0);
        info!(session_id = %session_id, sessions = self.streamers.len(), "streamer registered");
        streamer
    }

    /// Resolve a session id to its streamer.
    #[must_use]
    pub fn lookup(&self, session_id: &SessionId) -> Option<Arc<EventStreamer>> {
        self.streamers
            .get(session_id.as_str())
            .map(|s| Arc::clone(s.value()))
    }

    /// Remove a session's streamer, shutting it down.
    pub fn remove(&self, session_id: &SessionId) -> bool {
        if let Some((_, streamer)) = self.streamers.remove(session_id.as_str()) {
            streamer.shutdown();
            metrics::gauge!("visual_sessions_active").decrement(1.0);
            info!(session_id = %session_id, sessions = self.streamers.len(), "streamer removed");
            true
        } else {
            false
        }
    }

    /// All live streamers.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<EventStreamer>> {
        self.streamers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streamers.len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streamers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StreamerRegistry {
        StreamerRegistry::new(StreamingConfig::default())
    }

    #[test]
    fn register_and_lookup() {
        let registry = registry();
        let id = SessionId::new();
        let streamer = registry.register(&id);
        let found = registry.lookup(&id).unwrap();
        assert!(Arc::ptr_eq(&streamer, &found));
    }

    #[test]
    fn register_is_idempotent() {
        let registry = registry();
        let id = SessionId::new();
        let first = registry.register(&id);
        let second = registry.register(&id);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_unknown_is_none() {
        let registry = registry();
        assert!(registry.lookup(&SessionId::new()).is_none());
    }

    #[test]
    fn remove_drops_session() {
        let registry = registry();
        let id = SessionId::new();
        let _ = registry.register(&id);
        assert!(registry.remove(&id));
        assert!(registry.lookup(&id).is_none());
        assert!(!registry.remove(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn all_lists_every_session() {
        let registry = registry();
        let _ = registry.register(&SessionId::new());
        let _ = registry.register(&SessionId::new());
        assert_eq!(registry.all().len(), 2);
    }
}
