//! Analytical store - read-mostly aggregation backend.
//!
//! A second database file laid out for aggregate queries over historical
//! records, synced asynchronously from the record store by the coordinator's
//! propagation queue. Losing it never loses data; it is rebuilt from the
//! source of truth.

use crate::error::{Result, StorageError};
use crate::record_store::{FeatureVector, Record, RecordKind};
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Metric computed by an aggregate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMetric {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

/// Numeric fact column an aggregate metric applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateField {
    MentionCount,
    Influence,
    Sentiment,
}

impl AggregateField {
    fn column(&self) -> &'static str {
        match self {
            AggregateField::MentionCount => "mention_count",
            AggregateField::Influence => "influence",
            AggregateField::Sentiment => "sentiment",
        }
    }

    fn extract(&self, record: &Record) -> Option<f64> {
        match self {
            AggregateField::MentionCount => {
                record.payload.get("mention_count").and_then(|v| v.as_i64()).map(|v| v as f64)
            }
            AggregateField::Influence => record.payload.get("influence").and_then(|v| v.as_f64()),
            AggregateField::Sentiment => record.payload.get("sentiment").and_then(|v| v.as_f64()),
        }
    }
}

/// Declarative aggregate request. Deliberately not a query language: one
/// metric, an optional field, an optional kind filter, optional grouping.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub kind: Option<RecordKind>,
    pub metric: AggregateMetric,
    pub field: Option<AggregateField>,
    pub group_by_kind: bool,
}

/// One row of an aggregate result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AggregateRow {
    pub group: String,
    pub value: f64,
    pub count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalyticsStats {
    pub total_facts: i64,
    pub total_features: i64,
    pub database_size_bytes: i64,
}

const ANALYTICS_SCHEMA_SQL: &str = "
-- Flattened record facts, one row per record, replaced on propagation
CREATE TABLE IF NOT EXISTS record_facts (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    mention_count INTEGER,
    influence REAL,
    sentiment REAL,
    payload_fields INTEGER NOT NULL
);
-- Derived feature vectors with provenance
CREATE TABLE IF NOT EXISTS feature_vectors (
    id TEXT PRIMARY KEY,
    vector BLOB NOT NULL,
    source_record_ids TEXT NOT NULL,
    source_version INTEGER NOT NULL,
    generated_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_facts_kind ON record_facts (kind);
CREATE INDEX IF NOT EXISTS idx_facts_updated ON record_facts (updated_at);
";

pub struct AnalyticalStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl AnalyticalStore {
    pub fn open(db_path: &Path, pool_size: u32) -> Result<Self> {
        info!("Opening analytical store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| StorageError::Fatal(format!("Failed to create connection pool: {}", e)))?;
        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(ANALYTICS_SCHEMA_SQL)?;
        }
        info!("Analytical store initialized successfully");
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Fatal(format!("Failed to create connection pool: {}", e)))?;
        {
            let conn = pool.get()?;
            conn.execute_batch(ANALYTICS_SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| StorageError::Fatal(format!("Failed to get connection from pool: {}", e)))
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Replace the fact row for a record. Idempotent: re-propagating the
    /// same version is harmless.
    pub fn upsert_fact(&self, record: &Record) -> Result<()> {
        let mention_count = record.payload.get("mention_count").and_then(|v| v.as_i64());
        let influence = record.payload.get("influence").and_then(|v| v.as_f64());
        let sentiment = record.payload.get("sentiment").and_then(|v| v.as_f64());

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO record_facts
             (id, kind, version, updated_at, mention_count, influence, sentiment, payload_fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.kind.as_str(),
                record.version,
                record.updated_at.to_rfc3339(),
                mention_count,
                influence,
                sentiment,
                record.payload.len() as i64,
            ],
        )?;
        debug!("Propagated record {} v{} to analytical store", record.id, record.version);
        Ok(())
    }

    pub fn upsert_feature(&self, feature: &FeatureVector) -> Result<()> {
        let vector_bytes = bincode::serialize(&feature.values)?;
        let sources_json = serde_json::to_string(&feature.source_record_ids)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO feature_vectors
             (id, vector, source_record_ids, source_version, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                feature.id,
                vector_bytes,
                sources_json,
                feature.source_version,
                feature.generated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_feature(&self, id: &str) -> Result<Option<FeatureVector>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, vector, source_record_ids, source_version, generated_at
             FROM feature_vectors WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            let vector_bytes: Vec<u8> = row.get(1)?;
            let sources_json: String = row.get(2)?;
            let generated_at_str: String = row.get(4)?;
            let generated_at = chrono::DateTime::parse_from_rfc3339(&generated_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            Ok(Some(FeatureVector {
                id: row.get(0)?,
                values: bincode::deserialize(&vector_bytes)?,
                source_record_ids: serde_json::from_str(&sources_json)
                    .map_err(|e| StorageError::Fatal(format!("corrupt provenance JSON: {}", e)))?,
                source_version: row.get(3)?,
                generated_at,
            }))
        } else {
            Ok(None)
        }
    }

    /// Run an aggregate query against the fact table.
    pub fn aggregate(&self, spec: &AggregateSpec) -> Result<Vec<AggregateRow>> {
        let group_expr = if spec.group_by_kind { "kind" } else { "'all'" };

        let (metric_expr, count_expr, not_null_filter) = match (spec.metric, spec.field) {
            (AggregateMetric::Count, _) => ("COUNT(*)".to_string(), "COUNT(*)".to_string(), None),
            (metric, Some(field)) => {
                let func = match metric {
                    AggregateMetric::Sum => "SUM",
                    AggregateMetric::Average => "AVG",
                    AggregateMetric::Min => "MIN",
                    AggregateMetric::Max => "MAX",
                    AggregateMetric::Count => unreachable!(),
                };
                (
                    format!("{}({})", func, field.column()),
                    format!("COUNT({})", field.column()),
                    Some(format!("{} IS NOT NULL", field.column())),
                )
            }
            (_, None) => {
                return Err(StorageError::Validation(
                    "aggregate metric requires a field unless it is a count".into(),
                ))
            }
        };

        let mut query = format!(
            "SELECT {} AS grp, {} AS val, {} AS cnt FROM record_facts",
            group_expr, metric_expr, count_expr
        );
        let mut clauses: Vec<String> = Vec::new();
        if let Some(kind) = spec.kind {
            clauses.push(format!("kind = '{}'", kind.as_str()));
        }
        if let Some(filter) = not_null_filter {
            clauses.push(filter);
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        if spec.group_by_kind {
            query.push_str(" GROUP BY kind");
        }
        query.push_str(" ORDER BY grp");

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query([])?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let count: i64 = row.get(2)?;
            if count == 0 && spec.metric != AggregateMetric::Count {
                continue;
            }
            result.push(AggregateRow {
                group: row.get(0)?,
                value: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                count,
            });
        }
        Ok(result)
    }

    pub fn stats(&self) -> Result<AnalyticsStats> {
        let conn = self.get_conn()?;
        let total_facts: i64 =
            conn.query_row("SELECT COUNT(*) FROM record_facts", [], |row| row.get(0))?;
        let total_features: i64 =
            conn.query_row("SELECT COUNT(*) FROM feature_vectors", [], |row| row.get(0))?;
        let database_size_bytes: i64 = conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        Ok(AnalyticsStats {
            total_facts,
            total_features,
            database_size_bytes,
        })
    }
}

impl Drop for AnalyticalStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

/// Compute the same aggregate directly from record payloads. The degraded
/// fallback path when the analytical store is unavailable: slower and read
/// from the source of truth, but the row shapes match exactly.
pub fn aggregate_records(records: &[Record], spec: &AggregateSpec) -> Result<Vec<AggregateRow>> {
    use std::collections::BTreeMap;

    let filtered: Vec<&Record> = records
        .iter()
        .filter(|r| spec.kind.map_or(true, |k| r.kind == k))
        .collect();

    let group_key = |r: &Record| -> String {
        if spec.group_by_kind {
            r.kind.as_str().to_string()
        } else {
            "all".to_string()
        }
    };

    if spec.metric == AggregateMetric::Count {
        if spec.group_by_kind {
            let mut groups: BTreeMap<String, i64> = BTreeMap::new();
            for record in &filtered {
                *groups.entry(group_key(record)).or_insert(0) += 1;
            }
            return Ok(groups
                .into_iter()
                .map(|(group, count)| AggregateRow {
                    group,
                    value: count as f64,
                    count,
                })
                .collect());
        }
        let count = filtered.len() as i64;
        return Ok(vec![AggregateRow {
            group: "all".to_string(),
            value: count as f64,
            count,
        }]);
    }

    let field = spec.field.ok_or_else(|| {
        StorageError::Validation("aggregate metric requires a field unless it is a count".into())
    })?;

    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for record in &filtered {
        if let Some(value) = field.extract(record) {
            groups.entry(group_key(record)).or_default().push(value);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(group, values)| {
            let count = values.len() as i64;
            let value = match spec.metric {
                AggregateMetric::Sum => values.iter().sum(),
                AggregateMetric::Average => values.iter().sum::<f64>() / values.len() as f64,
                AggregateMetric::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
                AggregateMetric::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                AggregateMetric::Count => unreachable!(),
            };
            AggregateRow { group, value, count }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity_record(id: &str, mentions: i64, influence: f64) -> Record {
        let mut payload = serde_json::Map::new();
        payload.insert("name".into(), serde_json::json!(id));
        payload.insert("mention_count".into(), serde_json::json!(mentions));
        payload.insert("influence".into(), serde_json::json!(influence));
        Record {
            id: format!("entity:{}", id),
            kind: RecordKind::Entity,
            payload,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    fn event_record(id: &str) -> Record {
        let mut payload = serde_json::Map::new();
        payload.insert("event_type".into(), serde_json::json!("meeting"));
        Record {
            id: format!("event:{}", id),
            kind: RecordKind::Event,
            payload,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    fn count_spec(kind: Option<RecordKind>) -> AggregateSpec {
        AggregateSpec {
            kind,
            metric: AggregateMetric::Count,
            field: None,
            group_by_kind: false,
        }
    }

    // ===== Fact Upsert + Aggregate Tests =====

    #[test]
    fn test_count_aggregate_after_upsert() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        store.upsert_fact(&entity_record("ada", 2, 0.5)).unwrap();
        store.upsert_fact(&entity_record("grace", 1, 0.8)).unwrap();
        store.upsert_fact(&event_record("kickoff")).unwrap();

        let rows = store.aggregate(&count_spec(Some(RecordKind::Entity))).unwrap();
        assert_eq!(rows, vec![AggregateRow { group: "all".into(), value: 2.0, count: 2 }]);
    }

    #[test]
    fn test_upsert_same_id_replaces_fact() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        let mut record = entity_record("ada", 1, 0.5);
        store.upsert_fact(&record).unwrap();
        record.version = 2;
        record.payload.insert("mention_count".into(), serde_json::json!(7));
        store.upsert_fact(&record).unwrap();

        let rows = store
            .aggregate(&AggregateSpec {
                kind: Some(RecordKind::Entity),
                metric: AggregateMetric::Max,
                field: Some(AggregateField::MentionCount),
                group_by_kind: false,
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 7.0);
        assert_eq!(rows[0].count, 1);
    }

    #[test]
    fn test_average_grouped_by_kind() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        store.upsert_fact(&entity_record("ada", 2, 0.4)).unwrap();
        store.upsert_fact(&entity_record("grace", 4, 0.6)).unwrap();
        store.upsert_fact(&event_record("kickoff")).unwrap();

        let rows = store
            .aggregate(&AggregateSpec {
                kind: None,
                metric: AggregateMetric::Average,
                field: Some(AggregateField::Influence),
                group_by_kind: true,
            })
            .unwrap();
        // Events carry no influence, so only the entity group appears.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group, "entity");
        assert!((rows[0].value - 0.5).abs() < 1e-9);
        assert_eq!(rows[0].count, 2);
    }

    #[test]
    fn test_metric_without_field_rejected() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        let err = store
            .aggregate(&AggregateSpec {
                kind: None,
                metric: AggregateMetric::Average,
                field: None,
                group_by_kind: false,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn test_count_on_empty_store_is_zero_row() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        let rows = store.aggregate(&count_spec(None)).unwrap();
        assert_eq!(rows, vec![AggregateRow { group: "all".into(), value: 0.0, count: 0 }]);
    }

    // ===== Fallback Equivalence Tests =====

    #[test]
    fn test_fallback_matches_store_aggregate() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        let records = vec![
            entity_record("ada", 2, 0.4),
            entity_record("grace", 4, 0.6),
            event_record("kickoff"),
        ];
        for record in &records {
            store.upsert_fact(record).unwrap();
        }

        let specs = [
            count_spec(None),
            count_spec(Some(RecordKind::Entity)),
            AggregateSpec {
                kind: Some(RecordKind::Entity),
                metric: AggregateMetric::Average,
                field: Some(AggregateField::MentionCount),
                group_by_kind: false,
            },
            AggregateSpec {
                kind: None,
                metric: AggregateMetric::Min,
                field: Some(AggregateField::Influence),
                group_by_kind: true,
            },
        ];

        for spec in &specs {
            let from_store = store.aggregate(spec).unwrap();
            let from_records = aggregate_records(&records, spec).unwrap();
            assert_eq!(from_store, from_records, "spec {:?} diverged", spec);
        }
    }

    // ===== Feature Vector Tests =====

    #[test]
    fn test_feature_vector_round_trip() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        let feature = FeatureVector {
            id: "fv:entity:ada".into(),
            values: vec![0.25; 16],
            source_record_ids: vec!["entity:ada".into()],
            source_version: 3,
            generated_at: Utc::now(),
        };
        store.upsert_feature(&feature).unwrap();

        let restored = store.get_feature("fv:entity:ada").unwrap().unwrap();
        assert_eq!(restored.values, feature.values);
        assert_eq!(restored.source_record_ids, feature.source_record_ids);
        assert_eq!(restored.source_version, 3);
    }

    #[test]
    fn test_stats_reflect_rows() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        store.upsert_fact(&entity_record("ada", 1, 0.5)).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_facts, 1);
        assert_eq!(stats.total_features, 0);
    }
}
