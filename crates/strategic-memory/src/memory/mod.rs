//! Context memory manager - layered domain logic over the coordinator.
//!
//! The single implementation of the memory concern: conversation history,
//! stakeholder/entity intelligence, session continuity, and the derived
//! feature sweep, each as an internal layer module. This manager exclusively
//! owns entity merges and the session snapshot lifecycle.
pub mod conversation;
pub mod entity;
pub mod session;
pub mod features;
pub use conversation::ConversationLayer;
pub use entity::{normalize_name, EntityCandidate, EntityDetector, EntityLayer};
pub use features::{compute_feature_vector, FeatureSweep};
pub use session::{compute_quality, recovery_gaps, SessionContinuity, SessionState};

use crate::analytical_store::{AggregateRow, AggregateSpec};
use crate::config::Config;
use crate::coordinator::UnifiedCoordinator;
use crate::error::Result;
use crate::record_store::{ConversationTurn, EntityProfile, Record, RecordKind, SessionSnapshot};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct ContextMemoryManager {
    coordinator: Arc<UnifiedCoordinator>,
    pub conversations: ConversationLayer,
    pub entities: EntityLayer,
    pub sessions: SessionContinuity,
    pub features: Arc<FeatureSweep>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ContextMemoryManager {
    /// Open the workspace and build every layer over one shared coordinator.
    pub fn open(config: Config) -> Result<Self> {
        let coordinator = UnifiedCoordinator::open(config)?;
        Ok(Self::with_coordinator(coordinator))
    }

    /// Build the layers over an existing coordinator. The coordinator is
    /// injected, never a process-wide singleton.
    pub fn with_coordinator(coordinator: Arc<UnifiedCoordinator>) -> Self {
        let conversations = ConversationLayer::new(Arc::clone(&coordinator));
        let entities = EntityLayer::new(Arc::clone(&coordinator));
        let sessions = SessionContinuity::new(Arc::clone(&coordinator));
        let features = Arc::new(FeatureSweep::new(Arc::clone(&coordinator)));
        Self {
            coordinator,
            conversations,
            entities,
            sessions,
            features,
            sweep_task: std::sync::Mutex::new(None),
        }
    }

    /// Start coordinator health/propagation loops and the feature sweep.
    pub fn start_background_tasks(&self) {
        self.coordinator.start_background_tasks();
        let handle = self.features.spawn_background();
        *self.sweep_task.lock().unwrap() = Some(handle);
        info!("Context memory manager background tasks started");
    }

    /// Snapshot open sessions' state is already durable; stop background
    /// work and close the coordinator.
    pub async fn close(&self) {
        self.features.cancel();
        if let Some(handle) = self.sweep_task.lock().unwrap().take() {
            handle.abort();
        }
        self.coordinator.close().await;
    }

    pub fn coordinator(&self) -> &Arc<UnifiedCoordinator> {
        &self.coordinator
    }

    // ===== Exposed operation surface =====

    pub async fn record_write(
        &self,
        kind: RecordKind,
        id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<i64> {
        self.coordinator.record_write(kind, id, payload).await
    }

    pub async fn record_read(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        self.coordinator.record_read(kind, id).await
    }

    pub async fn aggregate_query(&self, spec: AggregateSpec) -> Result<Vec<AggregateRow>> {
        self.coordinator.aggregate_query(spec).await
    }

    pub async fn similarity_search(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        self.coordinator.similarity_search(vector, k).await
    }

    /// Entity detection plus merge for one conversational turn. The only
    /// entity write path exposed to presentation logic.
    pub async fn detect_and_merge(&self, text: &str) -> Result<Vec<EntityProfile>> {
        self.entities.detect_and_merge(text).await
    }

    pub async fn entity_merge(&self, candidate: EntityCandidate) -> Result<EntityProfile> {
        self.entities.merge(candidate).await
    }

    /// Record a turn and keep the session lifecycle in `Active`.
    pub fn append_turn(
        &self,
        session_id: &str,
        turn_index: i32,
        role: &str,
        content: &str,
    ) -> Result<bool> {
        let inserted = self.conversations.append(session_id, turn_index, role, content)?;
        self.sessions.note_activity(session_id);
        Ok(inserted)
    }

    pub fn conversation_history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        self.conversations.history(session_id)
    }

    pub fn session_snapshot(&self, session_id: &str) -> Result<String> {
        Ok(self.sessions.snapshot(session_id)?.id)
    }

    pub fn session_restore(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        self.sessions.restore(session_id)
    }

    pub fn detect_restart(&self) -> Result<bool> {
        self.sessions.detect_restart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytical_store::AggregateMetric;

    fn open_manager() -> (tempfile::TempDir, ContextMemoryManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_workspace(dir.path());
        let manager = ContextMemoryManager::open(config).unwrap();
        (dir, manager)
    }

    // ===== Scenario: cold start =====

    #[tokio::test]
    async fn test_cold_start_workspace() {
        let (_dir, manager) = open_manager();
        assert!(!manager.detect_restart().unwrap());

        manager.append_turn("sess-1", 0, "user", "hello").unwrap();
        let snapshot_id = manager.session_snapshot("sess-1").unwrap();

        let restored = manager.session_restore("sess-1").unwrap().unwrap();
        assert_eq!(restored.id, snapshot_id);
    }

    // ===== Scenario: contention =====

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_entity_merge_converges() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_workspace(dir.path());
        let manager = Arc::new(ContextMemoryManager::open(config).unwrap());

        let a = Arc::clone(&manager);
        let b = Arc::clone(&manager);
        let task_a = tokio::spawn(async move {
            a.entity_merge(EntityCandidate::from_name("Jordan Lee")).await
        });
        let task_b = tokio::spawn(async move {
            b.entity_merge(EntityCandidate::from_name("Jordan Lee")).await
        });
        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();

        let record = manager
            .record_read(RecordKind::Entity, "entity:jordan lee")
            .await
            .unwrap()
            .unwrap();
        let profile = EntityProfile::from_record(&record).unwrap();
        assert_eq!(profile.mention_count, 2);
        assert_eq!(profile.name, "jordan lee");
        // Exactly one profile: the normalized id is the only entity record.
        assert_eq!(record.version, 2);
    }

    // ===== Scenario: conversation feeds entity intelligence =====

    #[tokio::test]
    async fn test_turn_processing_pipeline() {
        let (_dir, manager) = open_manager();
        let text = "Jordan Lee approved the rollout budget. What about the platform migration?";
        manager.append_turn("sess-1", 0, "user", text).unwrap();
        let profiles = manager.detect_and_merge(text).await.unwrap();
        assert_eq!(profiles.len(), 1);

        // The snapshot sees both the turn and the active entity.
        let snapshot_id = manager.session_snapshot("sess-1").unwrap();
        let snapshot = manager.session_restore("sess-1").unwrap().unwrap();
        assert_eq!(snapshot.id, snapshot_id);
        assert_eq!(
            snapshot.captured_fields["active_entities"],
            serde_json::json!(["jordan lee"])
        );
    }

    // ===== Scenario: analytics over merged entities =====

    #[tokio::test]
    async fn test_entity_aggregate_after_propagation() {
        let (_dir, manager) = open_manager();
        manager
            .detect_and_merge("Jordan Lee met Maria Santos about the launch")
            .await
            .unwrap();
        manager.coordinator().drain_propagation(32);

        let rows = manager
            .aggregate_query(AggregateSpec {
                kind: Some(RecordKind::Entity),
                metric: AggregateMetric::Count,
                field: None,
                group_by_kind: false,
            })
            .await
            .unwrap();
        assert_eq!(rows[0].count, 2);
    }

    // ===== Scenario: features reach similarity search =====

    #[tokio::test]
    async fn test_sweep_feeds_similarity_search() {
        let (_dir, manager) = open_manager();
        manager
            .detect_and_merge("Jordan Lee is the director for the rollout")
            .await
            .unwrap();
        manager.features.run_to_completion().unwrap();
        manager.coordinator().drain_propagation(32);

        let record = manager
            .record_read(RecordKind::Entity, "entity:jordan lee")
            .await
            .unwrap()
            .unwrap();
        let probe = compute_feature_vector(&record);

        let matches = manager.similarity_search(&probe.values, 1).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, "fv:entity:jordan lee");
        assert!(matches[0].1 > 0.99);
    }

    // ===== Lifecycle =====

    #[tokio::test]
    async fn test_close_is_clean() {
        let (_dir, manager) = open_manager();
        manager.append_turn("sess-1", 0, "user", "hello").unwrap();
        manager.session_snapshot("sess-1").unwrap();
        manager.close().await;
        assert!(manager.features.is_cancelled());
    }
}
