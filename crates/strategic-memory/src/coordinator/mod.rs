//! Unified storage coordinator.
//!
//! The single API surface over the three backends. Routes each operation by
//! its declared shape, owns connection lifecycles and health probing, and
//! keeps the record store as the source of truth: a write is durable once
//! the record store commits, and reaches the analytical store and similarity
//! index through the bounded propagation queue.
pub mod routing;
pub mod propagation;
pub mod health;
pub use routing::{Operation, OperationOutput, RoutingTag};
pub use propagation::{PropagationJob, PropagationQueue};
pub use health::BackendHealth;

use crate::analytical_store::{aggregate_records, AggregateRow, AggregateSpec, AnalyticalStore};
use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::metrics::{CounterSnapshot, StorageCounters};
use crate::record_store::{
    validate_payload, ConversationTurn, FeatureVector, Record, RecordKind, RecordStore,
    SessionSnapshot, SessionView, FEATURE_DIMENSION,
};
use crate::similarity_index::SimilarityIndex;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cadence of the background propagation drain. Short enough that a write
/// reaches the derived stores well inside the propagation SLA.
const PROPAGATION_TICK_MS: u64 = 500;

/// Jobs applied per drain cycle before yielding back to the scheduler.
const DRAIN_BATCH: usize = 64;

/// Combined backend statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub records: crate::record_store::StoreStats,
    pub analytics: crate::analytical_store::AnalyticsStats,
    pub similarity: crate::similarity_index::SimilarityStats,
    pub queue_depth: usize,
    pub counters: CounterSnapshot,
}

/// Explicitly constructed and dependency-injected; one instance per open
/// workspace, shared by every layer. Safe for concurrent use.
pub struct UnifiedCoordinator {
    config: Arc<Config>,
    records: Arc<RecordStore>,
    analytics: Arc<AnalyticalStore>,
    similarity: Arc<SimilarityIndex>,
    counters: Arc<StorageCounters>,
    propagation: Arc<PropagationQueue>,
    health: Arc<BackendHealth>,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UnifiedCoordinator {
    /// Open all three backends under the workspace directory.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.workspace_dir)?;

        let records = Arc::new(RecordStore::open(
            &config.records_db_path(),
            config.record_pool_size,
        )?);
        let analytics = Arc::new(AnalyticalStore::open(
            &config.analytics_db_path(),
            config.analytics_pool_size,
        )?);
        let similarity = Arc::new(SimilarityIndex::open(&config.vector_index_path())?);

        let counters = Arc::new(StorageCounters::new());
        let propagation = Arc::new(PropagationQueue::new(
            config.retry_queue_bound,
            Arc::clone(&counters),
        ));

        info!("Unified coordinator opened for workspace {}", config.workspace_dir.display());
        Ok(Arc::new(Self {
            config,
            records,
            analytics,
            similarity,
            counters,
            propagation,
            health: Arc::new(BackendHealth::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the health probe and propagation drain loops.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let probe = Arc::clone(self);
        let probe_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(probe.config.health_interval_seconds));
            loop {
                interval.tick().await;
                if probe.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                probe.probe_backends();
            }
        });

        let drainer = Arc::clone(self);
        let drain_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(PROPAGATION_TICK_MS));
            loop {
                interval.tick().await;
                if drainer.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                drainer.drain_propagation(DRAIN_BATCH);
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(probe_task);
        tasks.push(drain_task);
    }

    /// Graceful shutdown: stop background work, drain what the derived
    /// backends will still accept, persist the vector sidecar.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap();
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        while !self.propagation.is_empty() {
            if self.drain_propagation(DRAIN_BATCH) == 0 {
                warn!(
                    "Abandoning {} undrained propagation jobs at close",
                    self.propagation.depth()
                );
                break;
            }
        }

        if let Err(e) = self.similarity.persist() {
            warn!("Failed to persist similarity index at close: {}", e);
        }
        info!("Unified coordinator closed");
    }

    // ===== Routed execution =====

    /// Execute one routed operation under the configured deadline.
    pub async fn execute(&self, operation: Operation) -> Result<OperationOutput> {
        self.execute_with_deadline(operation, self.default_deadline()).await
    }

    /// Execute one routed operation under an explicit deadline. On expiry the
    /// operation fails with `Timeout`; any pooled connection it held is
    /// released with the dropped future.
    pub async fn execute_with_deadline(
        &self,
        operation: Operation,
        deadline: Duration,
    ) -> Result<OperationOutput> {
        let tag = operation.tag();
        debug!("Executing {:?} operation", tag);
        self.with_deadline(deadline, async {
            match operation {
                Operation::RecordWrite { kind, id, payload } => {
                    self.write_record(kind, &id, payload).map(OperationOutput::Version)
                }
                Operation::RecordRead { kind, id } => {
                    self.read_record(kind, &id).map(OperationOutput::Record)
                }
                Operation::Aggregate { spec } => {
                    self.run_aggregate(&spec).map(OperationOutput::Rows)
                }
                Operation::SimilaritySearch { vector, k } => {
                    self.run_similarity(&vector, k).map(OperationOutput::Matches)
                }
            }
        })
        .await
    }

    pub(crate) async fn with_deadline<T, F>(&self, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(deadline)),
        }
    }

    fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.config.operation_timeout_ms)
    }

    // ===== Transactional path =====

    /// Commit a record to the source of truth. Reads the current version and
    /// attempts exactly one compare-and-swap; a lost race surfaces as
    /// `Contention` for the caller to re-issue.
    pub async fn record_write(
        &self,
        kind: RecordKind,
        id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<i64> {
        let deadline = self.default_deadline();
        self.with_deadline(deadline, async { self.write_record(kind, id, payload) })
            .await
    }

    fn write_record(
        &self,
        kind: RecordKind,
        id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<i64> {
        let expected = self.records.get(kind, id)?.map(|r| r.version);
        self.commit_record(kind, id, payload, expected)
    }

    /// Compare-and-swap with a caller-supplied expected version. The entity
    /// merge loop drives its bounded retries through this.
    pub fn record_cas(
        &self,
        kind: RecordKind,
        id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        self.commit_record(kind, id, payload, expected_version)
    }

    fn commit_record(
        &self,
        kind: RecordKind,
        id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        validate_payload(kind, &payload)?;
        let version = self.records.compare_and_swap(kind, id, &payload, expected_version)?;
        self.counters.inc_record_writes();

        // Durable now; derived stores converge through the queue.
        if let Some(committed) = self.records.get(kind, id)? {
            self.propagation.push(PropagationJob::RecordUpsert(committed));
        }
        Ok(version)
    }

    pub async fn record_read(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        let deadline = self.default_deadline();
        self.with_deadline(deadline, async { self.read_record(kind, id) }).await
    }

    fn read_record(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        self.counters.inc_record_reads();
        self.records.get(kind, id)
    }

    // ===== Analytical path =====

    pub async fn aggregate_query(&self, spec: AggregateSpec) -> Result<Vec<AggregateRow>> {
        let deadline = self.default_deadline();
        self.with_deadline(deadline, async { self.run_aggregate(&spec) }).await
    }

    fn run_aggregate(&self, spec: &AggregateSpec) -> Result<Vec<AggregateRow>> {
        if self.health.analytics_is_healthy() {
            match self.analytics.aggregate(spec) {
                Ok(rows) => return Ok(rows),
                Err(StorageError::Validation(msg)) => {
                    return Err(StorageError::Validation(msg));
                }
                Err(e) => {
                    warn!("Analytical store query failed, degrading: {}", e);
                    self.health.set_analytics_healthy(false);
                }
            }
        }

        // Degraded but correct: the same rows, computed synchronously from
        // the source of truth.
        self.counters.inc_degraded_fallbacks();
        let records = match spec.kind {
            Some(kind) => self.records.scan_kind(kind)?,
            None => {
                let mut all = Vec::new();
                for kind in [RecordKind::Session, RecordKind::Entity, RecordKind::Config, RecordKind::Event] {
                    all.extend(self.records.scan_kind(kind)?);
                }
                all
            }
        };
        aggregate_records(&records, spec)
    }

    // ===== Similarity path =====

    pub async fn similarity_search(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let deadline = self.default_deadline();
        self.with_deadline(deadline, async { self.run_similarity(vector, k) }).await
    }

    fn run_similarity(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        if vector.len() != FEATURE_DIMENSION {
            return Err(StorageError::Validation(format!(
                "similarity query has dimension {}, expected {}",
                vector.len(),
                FEATURE_DIMENSION
            )));
        }
        if !self.health.similarity_is_healthy() {
            self.counters.inc_degraded_fallbacks();
            return Ok(Vec::new());
        }
        Ok(self.similarity.search(vector, k))
    }

    /// Queue a derived feature vector for the analytical store and the
    /// similarity index. Never applied inline with a caller's write.
    pub fn write_feature(&self, feature: FeatureVector) -> Result<()> {
        if feature.values.len() != FEATURE_DIMENSION {
            return Err(StorageError::Validation(format!(
                "feature vector {} has dimension {}, expected {}",
                feature.id,
                feature.values.len(),
                FEATURE_DIMENSION
            )));
        }
        self.propagation.push(PropagationJob::FeatureUpsert(feature));
        Ok(())
    }

    // ===== Propagation =====

    /// Apply queued propagation jobs to the derived backends. Returns the
    /// number applied; stops early when a backend rejects a job.
    pub fn drain_propagation(&self, max_batch: usize) -> usize {
        if !self.health.analytics_is_healthy() && !self.health.similarity_is_healthy() {
            return 0;
        }

        let mut features_applied = false;
        let applied = self.propagation.drain(max_batch, |job| {
            match job {
                PropagationJob::RecordUpsert(record) => {
                    if self.health.analytics_is_healthy() {
                        self.analytics.upsert_fact(record)?;
                    }
                }
                PropagationJob::FeatureUpsert(feature) => {
                    if self.health.analytics_is_healthy() {
                        self.analytics.upsert_feature(feature)?;
                    }
                    if self.health.similarity_is_healthy() {
                        self.similarity.upsert(feature)?;
                        features_applied = true;
                    }
                }
            }
            Ok(())
        });

        if features_applied {
            if let Err(e) = self.similarity.build() {
                warn!("Similarity index rebuild failed: {}", e);
                self.health.set_similarity_healthy(false);
            } else if let Err(e) = self.similarity.persist() {
                warn!("Similarity sidecar persist failed: {}", e);
            }
        }

        if applied > 0 {
            debug!("Drained {} propagation jobs, {} queued", applied, self.propagation.depth());
        }
        applied
    }

    /// Probe each backend once and update the degraded flags.
    pub fn probe_backends(&self) {
        self.health.set_record_healthy(self.records.ping().is_ok());
        self.health.set_analytics_healthy(self.analytics.ping().is_ok());
        // The in-process similarity index has no connection to lose; it only
        // degrades when an upsert/build fails or an operator disables it.
    }

    // ===== Domain storage surface (transactional) =====

    pub fn append_turn(
        &self,
        session_id: &str,
        turn_index: i32,
        role: &str,
        content: &str,
    ) -> Result<bool> {
        self.records.append_turn(session_id, turn_index, role, content)
    }

    pub fn get_turns(&self, session_id: &str, limit: Option<i64>) -> Result<Vec<ConversationTurn>> {
        self.records.get_turns(session_id, limit)
    }

    pub fn turn_count(&self, session_id: &str) -> Result<usize> {
        self.records.turn_count(session_id)
    }

    pub fn capture_session_view(&self, session_id: &str, recent_turns: usize) -> Result<SessionView> {
        self.records.capture_session_view(session_id, recent_turns)
    }

    pub fn insert_snapshot(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.records.insert_snapshot(snapshot)
    }

    pub fn latest_snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        self.records.latest_snapshot(session_id)
    }

    pub fn latest_snapshot_any(&self) -> Result<Option<SessionSnapshot>> {
        self.records.latest_snapshot_any()
    }

    pub fn list_snapshots(&self, session_id: &str, limit: usize) -> Result<Vec<SessionSnapshot>> {
        self.records.list_snapshots(session_id, limit)
    }

    pub fn prune_snapshots(&self, keep_max: usize) -> Result<usize> {
        self.records.prune_snapshots(keep_max)
    }

    pub fn any_session_exists(&self) -> Result<bool> {
        self.records.any_session_exists()
    }

    pub fn records_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.records.changed_since(since, limit)
    }

    pub fn cleanup_old_data(&self, older_than_days: i32) -> Result<usize> {
        self.records.cleanup_old_data(older_than_days)
    }

    pub fn run_maintenance(&self) -> Result<()> {
        self.records.run_maintenance()
    }

    // ===== Observability =====

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counters(&self) -> &StorageCounters {
        &self.counters
    }

    pub fn health(&self) -> &BackendHealth {
        &self.health
    }

    pub fn queue_depth(&self) -> usize {
        self.propagation.depth()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            records: self.records.stats()?,
            analytics: self.analytics.stats()?,
            similarity: self.similarity.stats(),
            queue_depth: self.propagation.depth(),
            counters: self.counters.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytical_store::AggregateMetric;

    fn open_test_coordinator() -> (tempfile::TempDir, Arc<UnifiedCoordinator>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_workspace(dir.path());
        let coordinator = UnifiedCoordinator::open(config).unwrap();
        (dir, coordinator)
    }

    fn entity_payload(name: &str, mentions: i64) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("name".into(), serde_json::json!(name));
        map.insert("mention_count".into(), serde_json::json!(mentions));
        map
    }

    fn entity_count_spec() -> AggregateSpec {
        AggregateSpec {
            kind: Some(RecordKind::Entity),
            metric: AggregateMetric::Count,
            field: None,
            group_by_kind: false,
        }
    }

    // ===== Write/Read Path Tests =====

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (_dir, coordinator) = open_test_coordinator();
        let version = coordinator
            .record_write(RecordKind::Entity, "entity:ada", entity_payload("ada", 1))
            .await
            .unwrap();
        assert_eq!(version, 1);

        let record = coordinator
            .record_read(RecordKind::Entity, "entity:ada")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.payload["name"], "ada");
    }

    #[tokio::test]
    async fn test_validation_rejected_before_backend() {
        let (_dir, coordinator) = open_test_coordinator();
        let err = coordinator
            .record_write(RecordKind::Entity, "entity:bad", serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        // Nothing was committed or queued.
        assert!(coordinator
            .record_read(RecordKind::Entity, "entity:bad")
            .await
            .unwrap()
            .is_none());
        assert_eq!(coordinator.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_execute_routes_by_shape() {
        let (_dir, coordinator) = open_test_coordinator();
        let output = coordinator
            .execute(Operation::RecordWrite {
                kind: RecordKind::Entity,
                id: "entity:ada".into(),
                payload: entity_payload("ada", 1),
            })
            .await
            .unwrap();
        assert!(matches!(output, OperationOutput::Version(1)));

        let output = coordinator
            .execute(Operation::RecordRead {
                kind: RecordKind::Entity,
                id: "entity:ada".into(),
            })
            .await
            .unwrap();
        match output {
            OperationOutput::Record(Some(record)) => assert_eq!(record.id, "entity:ada"),
            other => panic!("unexpected output: {:?}", other),
        }

        let output = coordinator
            .execute(Operation::SimilaritySearch {
                vector: vec![0.0; FEATURE_DIMENSION],
                k: 3,
            })
            .await
            .unwrap();
        assert!(matches!(output, OperationOutput::Matches(ref m) if m.is_empty()));
    }

    #[tokio::test]
    async fn test_stale_cas_surfaces_contention() {
        let (_dir, coordinator) = open_test_coordinator();
        coordinator
            .record_write(RecordKind::Entity, "entity:ada", entity_payload("ada", 1))
            .await
            .unwrap();
        coordinator
            .record_cas(RecordKind::Entity, "entity:ada", entity_payload("ada", 2), Some(1))
            .unwrap();

        let err = coordinator
            .record_cas(RecordKind::Entity, "entity:ada", entity_payload("ada", 9), Some(1))
            .unwrap_err();
        assert!(matches!(err, StorageError::Contention { .. }));
    }

    // ===== Propagation Tests =====

    #[tokio::test]
    async fn test_propagation_lag_then_convergence() {
        let (_dir, coordinator) = open_test_coordinator();
        coordinator
            .record_write(RecordKind::Entity, "entity:ada", entity_payload("ada", 1))
            .await
            .unwrap();

        // Before the queue drains the analytical store is stale.
        let rows = coordinator.aggregate_query(entity_count_spec()).await.unwrap();
        assert_eq!(rows[0].count, 0);
        assert_eq!(coordinator.queue_depth(), 1);

        coordinator.drain_propagation(16);

        let rows = coordinator.aggregate_query(entity_count_spec()).await.unwrap();
        assert_eq!(rows[0].count, 1);
        assert_eq!(coordinator.queue_depth(), 0);
        assert_eq!(coordinator.counters().snapshot().propagated, 1);
    }

    #[tokio::test]
    async fn test_feature_write_reaches_both_derived_stores() {
        let (_dir, coordinator) = open_test_coordinator();
        let feature = FeatureVector {
            id: "fv:entity:ada".into(),
            values: {
                let mut v = vec![0.0; FEATURE_DIMENSION];
                v[0] = 1.0;
                v
            },
            source_record_ids: vec!["entity:ada".into()],
            source_version: 1,
            generated_at: Utc::now(),
        };
        coordinator.write_feature(feature).unwrap();
        coordinator.drain_propagation(16);

        let mut query = vec![0.0_f32; FEATURE_DIMENSION];
        query[0] = 1.0;
        let matches = coordinator.similarity_search(&query, 1).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, "fv:entity:ada");

        let stats = coordinator.stats().unwrap();
        assert_eq!(stats.analytics.total_features, 1);
        assert_eq!(stats.similarity.total_vectors, 1);
    }

    // ===== Degraded Backend Tests =====

    #[tokio::test]
    async fn test_degraded_analytics_falls_back_to_record_store() {
        let (_dir, coordinator) = open_test_coordinator();
        coordinator
            .record_write(RecordKind::Entity, "entity:ada", entity_payload("ada", 1))
            .await
            .unwrap();
        coordinator
            .record_write(RecordKind::Entity, "entity:grace", entity_payload("grace", 2))
            .await
            .unwrap();

        coordinator.health().set_analytics_healthy(false);

        // Correct counts even though nothing was propagated.
        let rows = coordinator.aggregate_query(entity_count_spec()).await.unwrap();
        assert_eq!(rows[0].count, 2);
        assert!(coordinator.counters().snapshot().degraded_fallbacks >= 1);
    }

    #[tokio::test]
    async fn test_disabled_similarity_returns_empty_while_records_work() {
        let (_dir, coordinator) = open_test_coordinator();
        coordinator.health().set_similarity_healthy(false);

        let matches = coordinator
            .similarity_search(&vec![0.0; FEATURE_DIMENSION], 5)
            .await
            .unwrap();
        assert!(matches.is_empty());

        let version = coordinator
            .record_write(RecordKind::Entity, "entity:ada", entity_payload("ada", 1))
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert!(coordinator
            .record_read(RecordKind::Entity, "entity:ada")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_recovery_drains_queued_propagations() {
        let (_dir, coordinator) = open_test_coordinator();
        coordinator.health().set_analytics_healthy(false);
        coordinator.health().set_similarity_healthy(false);

        coordinator
            .record_write(RecordKind::Entity, "entity:ada", entity_payload("ada", 1))
            .await
            .unwrap();
        assert_eq!(coordinator.drain_propagation(16), 0);
        assert_eq!(coordinator.queue_depth(), 1);

        coordinator.probe_backends();
        assert!(coordinator.health().analytics_is_healthy());
        coordinator.drain_propagation(16);

        let rows = coordinator.aggregate_query(entity_count_spec()).await.unwrap();
        assert_eq!(rows[0].count, 1);
    }

    #[tokio::test]
    async fn test_wrong_dimension_similarity_query_rejected() {
        let (_dir, coordinator) = open_test_coordinator();
        let err = coordinator.similarity_search(&[1.0, 2.0], 5).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    // ===== Deadline Tests =====

    #[tokio::test]
    async fn test_deadline_expiry_returns_timeout() {
        let (_dir, coordinator) = open_test_coordinator();
        let err = coordinator
            .with_deadline(Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_fast_operation_beats_deadline() {
        let (_dir, coordinator) = open_test_coordinator();
        let version = coordinator
            .execute_with_deadline(
                Operation::RecordWrite {
                    kind: RecordKind::Entity,
                    id: "entity:ada".into(),
                    payload: entity_payload("ada", 1),
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(matches!(version, OperationOutput::Version(1)));
    }

    // ===== Lifecycle Tests =====

    #[tokio::test]
    async fn test_close_drains_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_workspace(dir.path());
        {
            let coordinator = UnifiedCoordinator::open(config.clone()).unwrap();
            coordinator
                .record_write(RecordKind::Entity, "entity:ada", entity_payload("ada", 1))
                .await
                .unwrap();
            coordinator
                .write_feature(FeatureVector {
                    id: "fv:entity:ada".into(),
                    values: vec![0.5; FEATURE_DIMENSION],
                    source_record_ids: vec!["entity:ada".into()],
                    source_version: 1,
                    generated_at: Utc::now(),
                })
                .unwrap();
            coordinator.close().await;
            assert_eq!(coordinator.queue_depth(), 0);
        }

        // Reopened workspace sees the persisted vector sidecar.
        let coordinator = UnifiedCoordinator::open(config).unwrap();
        let stats = coordinator.stats().unwrap();
        assert_eq!(stats.similarity.total_vectors, 1);
        assert_eq!(stats.records.total_records, 1);
    }
}
