//! Record store - the transactional source of truth for all persisted state.
//!
//! Single-writer-per-key is enforced with optimistic compare-and-swap on the
//! record version; writes to unrelated keys proceed fully in parallel.
pub mod schema;
pub mod migration;
pub use schema::*;
pub use migration::MigrationManager;

use crate::error::{Result, StorageError};
use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RecordStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

/// Scoped transaction over one pooled connection. Rolls back on drop unless
/// committed.
pub struct Transaction<'a> {
    conn: r2d2::PooledConnection<SqliteConnectionManager>,
    finished: bool,
    _marker: std::marker::PhantomData<&'a RecordStore>,
}

impl<'a> Transaction<'a> {
    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT;")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK;")?;
        self.finished = true;
        Ok(())
    }

    pub fn connection(&mut self) -> &mut rusqlite::Connection {
        &mut self.conn
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK;");
        }
    }
}

/// Turns and entity records for one session, read under a single transaction.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub turns: Vec<ConversationTurn>,
    pub entities: Vec<Record>,
}

impl RecordStore {
    pub fn open(db_path: &Path, pool_size: u32) -> Result<Self> {
        info!("Opening record store at: {}", db_path.display());
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
            let mut conn = pool.get()?;
            let mut migrator = migration::MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
        }
        info!("Record store initialized successfully");
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
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| StorageError::Fatal(format!("Failed to get connection from pool: {}", e)))
    }

    /// Liveness probe used by the coordinator's health check.
    pub fn ping(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn begin_transaction(&self) -> Result<Transaction<'_>> {
        let conn = self.get_conn()?;
        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION;")?;
        Ok(Transaction {
            conn,
            finished: false,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut tx = self.begin_transaction()?;
        match f(&mut tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    // ===== Versioned records =====

    /// Commit a record version through compare-and-swap.
    ///
    /// `expected_version` of `None` asserts the record does not exist yet and
    /// commits version 1. `Some(v)` asserts the current committed version is
    /// exactly `v` and commits `v + 1`. A failed assertion is `Contention`;
    /// no two writers can commit the same `(id, version)` pair.
    pub fn compare_and_swap(
        &self,
        kind: RecordKind,
        id: &str,
        payload: &serde_json::Map<String, serde_json::Value>,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        let payload_json = serde_json::to_string(payload)?;
        let now = Utc::now();
        let conn = self.get_conn()?;

        match expected_version {
            None => {
                let inserted = conn.execute(
                    "INSERT INTO records (id, kind, payload, version, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4)
                     ON CONFLICT(id) DO NOTHING",
                    params![id, kind.as_str(), payload_json, now.to_rfc3339()],
                )?;
                if inserted == 0 {
                    debug!("Insert for record {} lost race, already present", id);
                    return Err(StorageError::Contention {
                        key: id.to_string(),
                        attempts: 1,
                    });
                }
                Ok(1)
            }
            Some(expected) => {
                let updated = conn.execute(
                    "UPDATE records SET payload = ?1, version = version + 1, updated_at = ?2
                     WHERE id = ?3 AND kind = ?4 AND version = ?5",
                    params![payload_json, now.to_rfc3339(), id, kind.as_str(), expected],
                )?;
                if updated == 0 {
                    let existing: Option<(String, i64)> = conn
                        .query_row(
                            "SELECT kind, version FROM records WHERE id = ?1",
                            [id],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?;
                    return match existing {
                        Some((stored_kind, _)) if stored_kind != kind.as_str() => {
                            Err(StorageError::Validation(format!(
                                "record {} is kind '{}', not '{}'",
                                id,
                                stored_kind,
                                kind.as_str()
                            )))
                        }
                        Some((_, current)) => {
                            debug!(
                                "CAS for record {} expected version {} but found {}",
                                id, expected, current
                            );
                            Err(StorageError::Contention {
                                key: id.to_string(),
                                attempts: 1,
                            })
                        }
                        None => Err(StorageError::NotFound(format!("record {}", id))),
                    };
                }
                Ok(expected + 1)
            }
        }
    }

    pub fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, payload, version, updated_at FROM records WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;

        if let Some(row) = rows.next()? {
            let record = Self::row_to_record(row)?;
            if record.kind != kind {
                return Err(StorageError::Validation(format!(
                    "record {} is kind '{}', not '{}'",
                    id,
                    record.kind.as_str(),
                    kind.as_str()
                )));
            }
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// All records of one kind, ordered by id. Used for degraded-mode
    /// aggregate fallbacks and the session view.
    pub fn scan_kind(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, payload, version, updated_at FROM records
             WHERE kind = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query([kind.as_str()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::row_to_record(row)?);
        }
        Ok(records)
    }

    /// Records whose last mutation is strictly after `since`, oldest first.
    /// Drives the feature sweep's high-water mark.
    pub fn changed_since(&self, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Record>> {
        let conn = self.get_conn()?;
        let floor = since
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "1970-01-01T00:00:00+00:00".to_string());
        let mut stmt = conn.prepare(
            "SELECT id, kind, payload, version, updated_at FROM records
             WHERE updated_at > ?1 ORDER BY updated_at, id LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![floor, limit as i64])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::row_to_record(row)?);
        }
        Ok(records)
    }

    // ===== Conversation turn log =====

    /// Append one turn. Idempotent on `(session_id, turn_index)`: replaying
    /// the same turn is a no-op and reports `false`.
    pub fn append_turn(
        &self,
        session_id: &str,
        turn_index: i32,
        role: &str,
        content: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let conn = self.get_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO turns (session_id, turn_index, role, content, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, turn_index, role, content, now.to_rfc3339()],
        )?;
        if inserted == 0 {
            debug!(
                "Turn ({}, {}) already recorded, append is a no-op",
                session_id, turn_index
            );
        }
        Ok(inserted > 0)
    }

    /// Ordered turn sequence for a session. Observes every append committed
    /// before this read (session-local read-after-write).
    pub fn get_turns(&self, session_id: &str, limit: Option<i64>) -> Result<Vec<ConversationTurn>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, turn_index, role, content, recorded_at
             FROM turns WHERE session_id = ?1 ORDER BY turn_index LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![session_id, limit.unwrap_or(10_000)])?;
        let mut turns = Vec::new();
        while let Some(row) = rows.next()? {
            turns.push(Self::row_to_turn(row)?);
        }
        Ok(turns)
    }

    pub fn turn_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM turns WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// True when any session left a trace in the workspace: a turn, a
    /// snapshot, or a session record.
    pub fn any_session_exists(&self) -> Result<bool> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM turns)
                  + (SELECT COUNT(*) FROM snapshots)
                  + (SELECT COUNT(*) FROM records WHERE kind = 'session')",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Turns and entity records for one session under a single read
    /// transaction, so a snapshot captures a consistent view without
    /// suspending concurrent writers.
    pub fn capture_session_view(&self, session_id: &str, recent_turns: usize) -> Result<SessionView> {
        let conn = self.get_conn()?;
        conn.execute_batch("BEGIN;")?;
        let result = (|| -> Result<SessionView> {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, turn_index, role, content, recorded_at
                 FROM turns WHERE session_id = ?1
                 ORDER BY turn_index DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(params![session_id, recent_turns as i64])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                turns.push(Self::row_to_turn(row)?);
            }
            turns.reverse();

            let mut stmt = conn.prepare(
                "SELECT id, kind, payload, version, updated_at FROM records
                 WHERE kind = 'entity' ORDER BY id",
            )?;
            let mut rows = stmt.query([])?;
            let mut entities = Vec::new();
            while let Some(row) = rows.next()? {
                entities.push(Self::row_to_record(row)?);
            }

            Ok(SessionView { turns, entities })
        })();
        conn.execute_batch("COMMIT;")?;
        result
    }

    // ===== Session snapshots =====

    pub fn insert_snapshot(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let fields_json = serde_json::to_string(&snapshot.captured_fields)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO snapshots
             (id, session_id, captured_fields, quality_score, state_hash, captured_at, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.id,
                snapshot.session_id,
                fields_json,
                snapshot.quality_score,
                snapshot.state_hash,
                snapshot.captured_at.to_rfc3339(),
                snapshot.captured_at.to_rfc3339(),
            ],
        )?;
        debug!(
            "Stored snapshot {} for session {} (quality {:.2})",
            snapshot.id, snapshot.session_id, snapshot.quality_score
        );
        Ok(())
    }

    /// Newest snapshot for a session, marking it accessed for retention.
    pub fn latest_snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, captured_fields, quality_score, state_hash, captured_at
             FROM snapshots WHERE session_id = ?1
             ORDER BY captured_at DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([session_id])?;
        if let Some(row) = rows.next()? {
            let snapshot = Self::row_to_snapshot(row)?;
            conn.execute(
                "UPDATE snapshots SET last_accessed = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), snapshot.id],
            )?;
            Ok(Some(snapshot))
        } else {
            Ok(None)
        }
    }

    /// Newest snapshot in the workspace, across all sessions. Drives restart
    /// detection.
    pub fn latest_snapshot_any(&self) -> Result<Option<SessionSnapshot>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, captured_fields, quality_score, state_hash, captured_at
             FROM snapshots ORDER BY captured_at DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_snapshot(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_snapshots(&self, session_id: &str, limit: usize) -> Result<Vec<SessionSnapshot>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, captured_fields, quality_score, state_hash, captured_at
             FROM snapshots WHERE session_id = ?1
             ORDER BY captured_at DESC, id DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![session_id, limit as i64])?;
        let mut snapshots = Vec::new();
        while let Some(row) = rows.next()? {
            snapshots.push(Self::row_to_snapshot(row)?);
        }
        Ok(snapshots)
    }

    /// Keep only the newest `keep_max` snapshots per session.
    pub fn prune_snapshots(&self, keep_max: usize) -> Result<usize> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT s.id
             FROM snapshots s
             WHERE (
                 SELECT COUNT(*)
                 FROM snapshots s2
                 WHERE s2.session_id = s.session_id
                 AND (s2.captured_at > s.captured_at
                      OR (s2.captured_at = s.captured_at AND s2.id >= s.id))
             ) > ?1",
        )?;

        let ids_to_delete: Vec<String> = stmt
            .query_map([keep_max as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if ids_to_delete.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids_to_delete.len()].join(",");
        let query = format!("DELETE FROM snapshots WHERE id IN ({})", placeholders);

        let mut stmt = conn.prepare(&query)?;
        let deleted = stmt.execute(rusqlite::params_from_iter(&ids_to_delete))?;

        Ok(deleted)
    }

    // ===== Maintenance =====

    pub fn cleanup_old_data(&self, older_than_days: i32) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let mut migrator = migration::MigrationManager::new(&mut conn);
        Ok(migrator.cleanup_old_data(older_than_days)?)
    }

    pub fn run_maintenance(&self) -> Result<()> {
        let mut conn = self.get_conn()?;
        Ok(migration::run_maintenance(&mut conn)?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.get_conn()?;
        Ok(migration::get_store_stats(&conn)?)
    }

    // ===== Row mapping =====

    fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
        None
    }

    fn row_to_record(row: &Row) -> Result<Record> {
        let kind_str: String = row.get(1)?;
        let payload_json: String = row.get(2)?;
        let payload: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&payload_json)
                .map_err(|e| StorageError::Fatal(format!("corrupt payload JSON: {}", e)))?;
        let updated_at = Self::parse_datetime_safe(&row.get::<_, String>(4)?)
            .unwrap_or_else(|| {
                warn!("Failed parse record updated_at");
                Utc::now()
            });

        Ok(Record {
            id: row.get(0)?,
            kind: RecordKind::parse(&kind_str)?,
            payload,
            version: row.get(3)?,
            updated_at,
        })
    }

    fn row_to_turn(row: &Row) -> Result<ConversationTurn> {
        let recorded_at = Self::parse_datetime_safe(&row.get::<_, String>(5)?)
            .unwrap_or_else(|| {
                warn!("Failed parse turn timestamp");
                Utc::now()
            });
        Ok(ConversationTurn {
            id: row.get(0)?,
            session_id: row.get(1)?,
            turn_index: row.get(2)?,
            role: row.get(3)?,
            content: row.get(4)?,
            recorded_at,
        })
    }

    fn row_to_snapshot(row: &Row) -> Result<SessionSnapshot> {
        let fields_json: String = row.get(2)?;
        let captured_fields = serde_json::from_str(&fields_json)
            .map_err(|e| StorageError::Fatal(format!("corrupt snapshot JSON: {}", e)))?;
        let captured_at = Self::parse_datetime_safe(&row.get::<_, String>(5)?)
            .unwrap_or_else(|| {
                warn!("Failed parse snapshot captured_at");
                Utc::now()
            });
        Ok(SessionSnapshot {
            id: row.get(0)?,
            session_id: row.get(1)?,
            captured_fields,
            quality_score: row.get(3)?,
            state_hash: row.get(4)?,
            captured_at,
        })
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
