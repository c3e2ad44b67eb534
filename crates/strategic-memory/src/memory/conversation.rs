//! Conversation layer: an append-only turn log per session.
//!
//! Appends are idempotent on `(session_id, turn_index)`; reads observe every
//! append committed before them within the same session. A bounded cache
//! keeps hot histories cheap and is invalidated on append.

use crate::coordinator::UnifiedCoordinator;
use crate::error::Result;
use crate::record_store::ConversationTurn;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct ConversationLayer {
    coordinator: Arc<UnifiedCoordinator>,
    history_cache: Cache<String, Vec<ConversationTurn>>,
}

impl ConversationLayer {
    pub fn new(coordinator: Arc<UnifiedCoordinator>) -> Self {
        let capacity = coordinator.config().conversation_cache_capacity;
        Self {
            coordinator,
            history_cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(Duration::from_secs(3600))
                .build(),
        }
    }

    /// Append one turn at an explicit index. Replaying the same turn is a
    /// no-op; returns whether the turn was newly recorded.
    pub fn append(
        &self,
        session_id: &str,
        turn_index: i32,
        role: &str,
        content: &str,
    ) -> Result<bool> {
        let inserted = self
            .coordinator
            .append_turn(session_id, turn_index, role, content)?;
        if inserted {
            self.history_cache.invalidate(session_id);
        }
        Ok(inserted)
    }

    /// Append at the next free index. Convenience for the common
    /// single-writer-per-session flow.
    pub fn append_next(&self, session_id: &str, role: &str, content: &str) -> Result<i32> {
        let next_index = self.coordinator.turn_count(session_id)? as i32;
        self.append(session_id, next_index, role, content)?;
        Ok(next_index)
    }

    /// The ordered turn sequence for a session.
    pub fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        if let Some(turns) = self.history_cache.get(session_id) {
            self.coordinator.counters().inc_cache_hit();
            return Ok(turns);
        }
        self.coordinator.counters().inc_cache_miss();

        let turns = self.coordinator.get_turns(session_id, None)?;
        if !turns.is_empty() {
            self.history_cache
                .insert(session_id.to_string(), turns.clone());
        }
        debug!("Loaded {} turn(s) for session {}", turns.len(), session_id);
        Ok(turns)
    }

    pub fn turn_count(&self, session_id: &str) -> Result<usize> {
        self.coordinator.turn_count(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn open_layer() -> (tempfile::TempDir, ConversationLayer) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_workspace(dir.path());
        let coordinator = UnifiedCoordinator::open(config).unwrap();
        let layer = ConversationLayer::new(coordinator);
        (dir, layer)
    }

    #[test]
    fn test_appends_read_back_in_write_order() {
        let (_dir, layer) = open_layer();
        layer.append("sess-1", 0, "user", "first").unwrap();
        layer.append("sess-1", 1, "assistant", "second").unwrap();
        layer.append("sess-1", 2, "user", "third").unwrap();

        let history = layer.history("sess-1").unwrap();
        let contents: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_replayed_append_is_idempotent() {
        let (_dir, layer) = open_layer();
        assert!(layer.append("sess-1", 0, "user", "hello").unwrap());
        assert!(!layer.append("sess-1", 0, "user", "hello").unwrap());
        assert_eq!(layer.history("sess-1").unwrap().len(), 1);
    }

    #[test]
    fn test_append_next_assigns_sequential_indexes() {
        let (_dir, layer) = open_layer();
        assert_eq!(layer.append_next("sess-1", "user", "one").unwrap(), 0);
        assert_eq!(layer.append_next("sess-1", "assistant", "two").unwrap(), 1);
        assert_eq!(layer.turn_count("sess-1").unwrap(), 2);
    }

    #[test]
    fn test_cached_read_is_invalidated_by_append() {
        let (_dir, layer) = open_layer();
        layer.append("sess-1", 0, "user", "first").unwrap();
        assert_eq!(layer.history("sess-1").unwrap().len(), 1);
        // Second read comes from cache.
        assert_eq!(layer.history("sess-1").unwrap().len(), 1);

        layer.append("sess-1", 1, "assistant", "second").unwrap();
        assert_eq!(layer.history("sess-1").unwrap().len(), 2);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let (_dir, layer) = open_layer();
        layer.append("sess-1", 0, "user", "one").unwrap();
        layer.append("sess-2", 0, "user", "other").unwrap();

        assert_eq!(layer.history("sess-1").unwrap().len(), 1);
        assert_eq!(layer.history("sess-2").unwrap()[0].content, "other");
    }
}
