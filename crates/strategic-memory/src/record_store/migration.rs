//! Schema migration system for the record store database.

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use crate::record_store::schema::StoreStats;

const MIGRATION_001_INITIAL: &str = "
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_kind ON records (kind);
CREATE INDEX IF NOT EXISTS idx_records_updated ON records (updated_at);
";

const MIGRATION_002_TURNS: &str = "
CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    turn_index INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    recorded_at TIMESTAMP NOT NULL,
    UNIQUE(session_id, turn_index)
);
CREATE INDEX IF NOT EXISTS idx_turns_session ON turns (session_id);
";

const MIGRATION_003_SNAPSHOTS: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    captured_fields TEXT NOT NULL,
    quality_score REAL NOT NULL,
    state_hash TEXT NOT NULL,
    captured_at TIMESTAMP NOT NULL,
    last_accessed TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_session ON snapshots (session_id, captured_at);
";

/// Manages record store schema migrations.
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Initialize database with current schema.
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing record store schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        info!("Current record store schema version: {}", current_version);

        self.apply_migrations(current_version)?;

        Ok(())
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        let migrations = get_migrations();

        for (version, migration_sql) in migrations.iter() {
            if *version > current_version {
                info!("Applying migration {}...", version);

                let tx = self.conn.transaction()?;

                if let Err(e) = tx.execute_batch(migration_sql) {
                    error!("Failed to apply migration {}: {}", version, e);
                    return Err(e);
                }

                tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;

                tx.commit()?;

                info!("Migration {} applied successfully", version);
            }
        }

        Ok(())
    }

    /// Drop snapshots and event records past the retention window. Cascades
    /// nothing implicitly; the record store keys are independent.
    pub fn cleanup_old_data(&mut self, older_than_days: i32) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days as i64);
        let cutoff_str = cutoff.to_rfc3339();

        let mut deleted = self.conn.execute(
            "DELETE FROM snapshots WHERE last_accessed < ?1",
            [&cutoff_str],
        )?;

        deleted += self.conn.execute(
            "DELETE FROM records WHERE kind = 'event' AND updated_at < ?1",
            [&cutoff_str],
        )?;

        info!("Cleaned up {} expired rows", deleted);

        if deleted > 0 {
            self.conn.execute_batch("VACUUM")?;
            info!("Database vacuum completed");
        }

        Ok(deleted)
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or_else(|_| Ok(0))
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, MIGRATION_001_INITIAL),
        (2, MIGRATION_002_TURNS),
        (3, MIGRATION_003_SNAPSHOTS),
    ]
}

/// Read-only statistics over the record store tables.
pub fn get_store_stats(conn: &Connection) -> Result<StoreStats> {
    fn get_table_count(conn: &Connection, table_name: &str) -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| row.get(0))
            .or_else(|e| {
                warn!("Failed to get count from table {}: {}", table_name, e);
                Ok(0)
            })
    }

    let total_records = get_table_count(conn, "records")?;
    let total_turns = get_table_count(conn, "turns")?;
    let total_snapshots = get_table_count(conn, "snapshots")?;

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(StoreStats {
        total_records,
        total_turns,
        total_snapshots,
        database_size_bytes,
    })
}

/// Run database maintenance tasks.
pub fn run_maintenance(conn: &mut Connection) -> Result<()> {
    info!("Running record store maintenance...");

    conn.execute_batch("ANALYZE")?;
    conn.execute_batch("PRAGMA incremental_vacuum(100)")?;
    conn.execute_batch("PRAGMA integrity_check")?;

    info!("Record store maintenance completed");
    Ok(())
}
