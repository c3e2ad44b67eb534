//! Schema definitions for the record store: versioned records, the
//! conversation turn log, and session snapshots.

use crate::error::{Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Dimension of every derived feature vector.
pub const FEATURE_DIMENSION: usize = 16;

/// Context segments a complete session snapshot captures. Quality is the
/// fraction of these that are populated.
pub const REQUIRED_SNAPSHOT_FIELDS: [&str; 5] = [
    "active_entities",
    "open_threads",
    "recent_turns",
    "pending_actions",
    "focus_topics",
];

/// Category of a persisted record. Payload schemas are validated per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Session,
    Entity,
    Config,
    Event,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Session => "session",
            RecordKind::Entity => "entity",
            RecordKind::Config => "config",
            RecordKind::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "session" => Ok(RecordKind::Session),
            "entity" => Ok(RecordKind::Entity),
            "config" => Ok(RecordKind::Config),
            "event" => Ok(RecordKind::Event),
            other => Err(StorageError::Validation(format!("unknown record kind: {}", other))),
        }
    }
}

/// The atomic persisted unit. `version` is strictly increasing per `id`;
/// writers commit through compare-and-swap only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub kind: RecordKind,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// A tracked person/stakeholder, stored as a `kind = entity` record and
/// mutated only through the merge operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityProfile {
    /// Normalized lowercase dedup key; exactly one profile per name.
    pub name: String,
    /// Name as it first appeared in text.
    pub display_name: String,
    pub aliases: BTreeSet<String>,
    pub role: Option<String>,
    pub influence: f32,
    pub sentiment: f32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub mention_count: i64,
}

impl EntityProfile {
    /// Record id for a normalized entity name.
    pub fn record_id(normalized_name: &str) -> String {
        format!("entity:{}", normalized_name)
    }

    pub fn to_payload(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(StorageError::Validation("entity profile did not serialize to an object".into())),
        }
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        if record.kind != RecordKind::Entity {
            return Err(StorageError::Validation(format!(
                "record {} is {}, not an entity",
                record.id,
                record.kind.as_str()
            )));
        }
        let value = serde_json::Value::Object(record.payload.clone());
        Ok(serde_json::from_value(value)?)
    }
}

/// One entry in a session's append-only conversation log. Idempotent on
/// `(session_id, turn_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: i64,
    pub session_id: String,
    pub turn_index: i32,
    pub role: String,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

/// Point-in-time capture of a session's strategic context. Superseded, not
/// overwritten, by the next snapshot of the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub session_id: String,
    pub captured_fields: BTreeMap<String, serde_json::Value>,
    pub quality_score: f32,
    pub state_hash: String,
    pub captured_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Content hash over the canonical JSON encoding of the captured fields.
    /// Recomputed on restore to verify the byte-for-byte round trip.
    pub fn compute_hash(fields: &BTreeMap<String, serde_json::Value>) -> Result<String> {
        let bytes = serde_json::to_vec(fields)?;
        Ok(blake3::hash(&bytes).to_string())
    }
}

/// Derived, read-only projection of one or more records. Lives only in the
/// analytical store and the similarity index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub id: String,
    pub values: Vec<f32>,
    pub source_record_ids: Vec<String>,
    pub source_version: i64,
    pub generated_at: DateTime<Utc>,
}

/// Record store statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub total_records: i64,
    pub total_turns: i64,
    pub total_snapshots: i64,
    pub database_size_bytes: i64,
}

/// Validate a payload against the schema for its kind. Runs before any
/// backend call; failures never reach a connection.
pub fn validate_payload(
    kind: RecordKind,
    payload: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    if let Some(declared) = payload.get("kind").and_then(|v| v.as_str()) {
        if declared != kind.as_str() {
            return Err(StorageError::Validation(format!(
                "payload declares kind '{}' but record is '{}'",
                declared,
                kind.as_str()
            )));
        }
    }

    match kind {
        RecordKind::Session => {
            require_string(payload, "session_id")?;
        }
        RecordKind::Entity => {
            require_string(payload, "name")?;
            let mentions = payload
                .get("mention_count")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| StorageError::Validation("entity payload missing integer 'mention_count'".into()))?;
            if mentions < 0 {
                return Err(StorageError::Validation("entity 'mention_count' must be non-negative".into()));
            }
            if let Some(influence) = payload.get("influence").and_then(|v| v.as_f64()) {
                if !(0.0..=1.0).contains(&influence) {
                    return Err(StorageError::Validation(format!(
                        "entity 'influence' out of range: {}",
                        influence
                    )));
                }
            }
            if let Some(sentiment) = payload.get("sentiment").and_then(|v| v.as_f64()) {
                if !(-1.0..=1.0).contains(&sentiment) {
                    return Err(StorageError::Validation(format!(
                        "entity 'sentiment' out of range: {}",
                        sentiment
                    )));
                }
            }
        }
        RecordKind::Event => {
            require_string(payload, "event_type")?;
        }
        RecordKind::Config => {
            if payload.is_empty() {
                return Err(StorageError::Validation("config payload must not be empty".into()));
            }
        }
    }
    Ok(())
}

fn require_string(payload: &serde_json::Map<String, serde_json::Value>, key: &str) -> Result<()> {
    match payload.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err(StorageError::Validation(format!("payload missing string field '{}'", key))),
    }
}

pub const SCHEMA_SQL: &str = "
-- Versioned records table
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
-- Conversation turn log
CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    turn_index INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    recorded_at TIMESTAMP NOT NULL,
    UNIQUE(session_id, turn_index)
);
-- Session snapshots
CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    captured_fields TEXT NOT NULL,
    quality_score REAL NOT NULL,
    state_hash TEXT NOT NULL,
    captured_at TIMESTAMP NOT NULL,
    last_accessed TIMESTAMP NOT NULL
);
-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_records_kind ON records (kind);
CREATE INDEX IF NOT EXISTS idx_records_updated ON records (updated_at);
CREATE INDEX IF NOT EXISTS idx_turns_session ON turns (session_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_session ON snapshots (session_id, captured_at);
";

#[cfg(test)]
mod tests {
    use super::*;

    fn entity_payload(name: &str, mentions: i64) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("name".into(), serde_json::json!(name));
        map.insert("mention_count".into(), serde_json::json!(mentions));
        map
    }

    // ===== Kind Tests =====

    #[test]
    fn test_kind_round_trip() {
        for kind in [RecordKind::Session, RecordKind::Entity, RecordKind::Config, RecordKind::Event] {
            assert_eq!(RecordKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_validation_error() {
        let err = RecordKind::parse("persona").unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    // ===== Payload Validation Tests =====

    #[test]
    fn test_entity_payload_valid() {
        let payload = entity_payload("jordan lee", 2);
        assert!(validate_payload(RecordKind::Entity, &payload).is_ok());
    }

    #[test]
    fn test_entity_payload_missing_name_rejected() {
        let mut payload = serde_json::Map::new();
        payload.insert("mention_count".into(), serde_json::json!(1));
        assert!(matches!(
            validate_payload(RecordKind::Entity, &payload),
            Err(StorageError::Validation(_))
        ));
    }

    #[test]
    fn test_entity_influence_out_of_range_rejected() {
        let mut payload = entity_payload("jordan lee", 1);
        payload.insert("influence".into(), serde_json::json!(1.7));
        assert!(validate_payload(RecordKind::Entity, &payload).is_err());
    }

    #[test]
    fn test_entity_sentiment_out_of_range_rejected() {
        let mut payload = entity_payload("jordan lee", 1);
        payload.insert("sentiment".into(), serde_json::json!(-2.0));
        assert!(validate_payload(RecordKind::Entity, &payload).is_err());
    }

    #[test]
    fn test_kind_mismatch_in_payload_rejected() {
        let mut payload = entity_payload("jordan lee", 1);
        payload.insert("kind".into(), serde_json::json!("session"));
        assert!(validate_payload(RecordKind::Entity, &payload).is_err());
    }

    #[test]
    fn test_session_payload_requires_session_id() {
        let mut payload = serde_json::Map::new();
        assert!(validate_payload(RecordKind::Session, &payload).is_err());
        payload.insert("session_id".into(), serde_json::json!("sess-1"));
        assert!(validate_payload(RecordKind::Session, &payload).is_ok());
    }

    #[test]
    fn test_empty_config_payload_rejected() {
        let payload = serde_json::Map::new();
        assert!(validate_payload(RecordKind::Config, &payload).is_err());
    }

    // ===== Entity Profile Tests =====

    #[test]
    fn test_entity_profile_payload_round_trip() {
        let now = Utc::now();
        let profile = EntityProfile {
            name: "jordan lee".into(),
            display_name: "Jordan Lee".into(),
            aliases: BTreeSet::from(["J. Lee".to_string()]),
            role: Some("director".into()),
            influence: 0.6,
            sentiment: 0.2,
            first_seen: now,
            last_seen: now,
            mention_count: 3,
        };

        let record = Record {
            id: EntityProfile::record_id(&profile.name),
            kind: RecordKind::Entity,
            payload: profile.to_payload().unwrap(),
            version: 1,
            updated_at: now,
        };

        let restored = EntityProfile::from_record(&record).unwrap();
        assert_eq!(restored.name, profile.name);
        assert_eq!(restored.mention_count, 3);
        assert_eq!(restored.aliases, profile.aliases);
    }

    #[test]
    fn test_entity_profile_from_wrong_kind_rejected() {
        let mut payload = serde_json::Map::new();
        payload.insert("session_id".into(), serde_json::json!("sess-1"));
        let record = Record {
            id: "sess-1".into(),
            kind: RecordKind::Session,
            payload,
            version: 1,
            updated_at: Utc::now(),
        };
        assert!(EntityProfile::from_record(&record).is_err());
    }

    // ===== Snapshot Hash Tests =====

    #[test]
    fn test_snapshot_hash_is_deterministic() {
        let mut fields = BTreeMap::new();
        fields.insert("recent_turns".to_string(), serde_json::json!(["hello"]));
        fields.insert("focus_topics".to_string(), serde_json::json!(["roadmap"]));

        let h1 = SessionSnapshot::compute_hash(&fields).unwrap();
        let h2 = SessionSnapshot::compute_hash(&fields).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_snapshot_hash_detects_change() {
        let mut fields = BTreeMap::new();
        fields.insert("recent_turns".to_string(), serde_json::json!(["hello"]));
        let h1 = SessionSnapshot::compute_hash(&fields).unwrap();

        fields.insert("recent_turns".to_string(), serde_json::json!(["goodbye"]));
        let h2 = SessionSnapshot::compute_hash(&fields).unwrap();
        assert_ne!(h1, h2);
    }
}
