// strategic-memory/crates/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Engine configuration, loaded from the environment with sane defaults.
///
/// All three backend files live under `workspace_dir`; nothing is shared
/// across workspaces.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_dir: PathBuf,
    pub retention_days: i32,
    pub quality_threshold: f32,
    pub record_pool_size: u32,
    pub analytics_pool_size: u32,
    pub retry_queue_bound: usize,
    pub health_interval_seconds: u64,
    pub snapshot_keep_max: usize,
    pub operation_timeout_ms: u64,
    pub activity_window_seconds: i64,
    pub merge_retry_limit: u32,
    pub sweep_batch_size: usize,
    pub sweep_interval_seconds: u64,
    pub conversation_cache_capacity: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let workspace_dir = env::var("WORKSPACE_DIR")
            .map(PathBuf::from)
            .context("WORKSPACE_DIR environment variable not set. Please set it in your .env file")?;

        let mut config = Self::for_workspace(&workspace_dir);

        config.retention_days = env::var("RETENTION_DAYS")
            .unwrap_or_else(|_| "30".into())
            .parse()?;
        config.quality_threshold = env::var("QUALITY_THRESHOLD")
            .unwrap_or_else(|_| "0.7".into())
            .parse()?;
        config.record_pool_size = env::var("RECORD_POOL_SIZE")
            .unwrap_or_else(|_| "10".into())
            .parse()?;
        config.analytics_pool_size = env::var("ANALYTICS_POOL_SIZE")
            .unwrap_or_else(|_| "4".into())
            .parse()?;
        config.retry_queue_bound = env::var("RETRY_QUEUE_BOUND")
            .unwrap_or_else(|_| "1024".into())
            .parse()?;
        config.health_interval_seconds = env::var("HEALTH_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "5".into())
            .parse()?;
        config.snapshot_keep_max = env::var("SNAPSHOT_KEEP_MAX")
            .unwrap_or_else(|_| "5".into())
            .parse()?;
        config.operation_timeout_ms = env::var("OPERATION_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".into())
            .parse()?;
        config.activity_window_seconds = env::var("ACTIVITY_WINDOW_SECONDS")
            .unwrap_or_else(|_| "1800".into())
            .parse()?;
        config.merge_retry_limit = env::var("MERGE_RETRY_LIMIT")
            .unwrap_or_else(|_| "3".into())
            .parse()?;
        config.sweep_batch_size = env::var("SWEEP_BATCH_SIZE")
            .unwrap_or_else(|_| "128".into())
            .parse()?;
        config.sweep_interval_seconds = env::var("SWEEP_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "30".into())
            .parse()?;
        config.conversation_cache_capacity = env::var("CONVERSATION_CACHE_CAPACITY")
            .unwrap_or_else(|_| "1000".into())
            .parse()?;

        config.validate()?;
        Ok(config)
    }

    /// Default configuration rooted at the given workspace directory.
    pub fn for_workspace(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
            retention_days: 30,
            quality_threshold: 0.7,
            record_pool_size: 10,
            analytics_pool_size: 4,
            retry_queue_bound: 1024,
            health_interval_seconds: 5,
            snapshot_keep_max: 5,
            operation_timeout_ms: 5000,
            activity_window_seconds: 1800,
            merge_retry_limit: 3,
            sweep_batch_size: 128,
            sweep_interval_seconds: 30,
            conversation_cache_capacity: 1000,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(anyhow::anyhow!(
                "QUALITY_THRESHOLD must be within 0.0..=1.0, got {}",
                self.quality_threshold
            ));
        }
        if self.record_pool_size == 0 || self.analytics_pool_size == 0 {
            return Err(anyhow::anyhow!("pool sizes must be positive"));
        }
        if self.retry_queue_bound == 0 {
            return Err(anyhow::anyhow!("RETRY_QUEUE_BOUND must be positive"));
        }
        if self.merge_retry_limit == 0 {
            return Err(anyhow::anyhow!("MERGE_RETRY_LIMIT must be positive"));
        }
        Ok(())
    }

    pub fn records_db_path(&self) -> PathBuf {
        self.workspace_dir.join("records.db")
    }

    pub fn analytics_db_path(&self) -> PathBuf {
        self.workspace_dir.join("analytics.db")
    }

    pub fn vector_index_path(&self) -> PathBuf {
        self.workspace_dir.join("vectors.idx")
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Workspace: {}", self.workspace_dir.display());
        info!("- Retention: {} days", self.retention_days);
        info!("- Quality Threshold: {}", self.quality_threshold);
        info!("- Record Pool: {}", self.record_pool_size);
        info!("- Analytics Pool: {}", self.analytics_pool_size);
        info!("- Retry Queue Bound: {}", self.retry_queue_bound);
        info!("- Health Interval: {}s", self.health_interval_seconds);
        info!("- Snapshots Kept: {}", self.snapshot_keep_max);
        info!("- Operation Timeout: {}ms", self.operation_timeout_ms);
        info!("- Activity Window: {}s", self.activity_window_seconds);
        info!("- Merge Retry Limit: {}", self.merge_retry_limit);
    }
}
