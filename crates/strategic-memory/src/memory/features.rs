//! Pattern/feature layer: a background sweep that projects changed records
//! into fixed-dimension feature vectors.
//!
//! Vectors are derived, versioned, and never hand-edited: whenever a source
//! record's version changes the sweep regenerates its projection and routes
//! it through the coordinator's analytical/similarity paths. The sweep runs
//! between batches only and is cooperatively cancellable, never mid-record.

use crate::coordinator::UnifiedCoordinator;
use crate::error::Result;
use crate::record_store::{FeatureVector, Record, FEATURE_DIMENSION};
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Token-bucket dimensions; the remaining dimensions carry normalized
/// payload scores.
const TOKEN_BUCKETS: usize = 12;

pub struct FeatureSweep {
    coordinator: Arc<UnifiedCoordinator>,
    high_water: Mutex<Option<DateTime<Utc>>>,
    cancelled: AtomicBool,
}

impl FeatureSweep {
    pub fn new(coordinator: Arc<UnifiedCoordinator>) -> Self {
        Self {
            coordinator,
            high_water: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Process one batch of records changed since the last sweep. Returns
    /// the number of feature vectors written.
    pub fn run_once(&self) -> Result<usize> {
        let since = *self.high_water.lock().unwrap();
        let batch_size = self.coordinator.config().sweep_batch_size;
        let changed = self.coordinator.records_changed_since(since, batch_size)?;
        if changed.is_empty() {
            return Ok(0);
        }

        let mut newest = since;
        let mut written = 0;
        for record in &changed {
            let feature = compute_feature_vector(record);
            self.coordinator.write_feature(feature)?;
            written += 1;
            if newest.map_or(true, |mark| record.updated_at > mark) {
                newest = Some(record.updated_at);
            }
        }

        *self.high_water.lock().unwrap() = newest;
        debug!("Feature sweep projected {} record(s)", written);
        Ok(written)
    }

    /// Sweep until the change feed is empty, checking for cancellation
    /// between batches.
    pub fn run_to_completion(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                info!("Feature sweep cancelled after {} record(s)", total);
                break;
            }
            let written = self.run_once()?;
            if written == 0 {
                break;
            }
            total += written;
        }
        Ok(total)
    }

    /// Request cooperative cancellation; honored at the next batch boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn_background(self: &Arc<Self>) -> JoinHandle<()> {
        let sweep = Arc::clone(self);
        let interval_seconds = sweep.coordinator.config().sweep_interval_seconds;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
            loop {
                interval.tick().await;
                if sweep.cancelled.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = sweep.run_to_completion() {
                    tracing::warn!("Feature sweep failed: {}", e);
                }
            }
        })
    }
}

/// Deterministic projection of one record into feature space: hashed token
/// buckets over the payload's string values plus normalized score fields.
/// The same record version always produces the same vector.
pub fn compute_feature_vector(record: &Record) -> FeatureVector {
    let mut values = vec![0.0_f32; FEATURE_DIMENSION];

    let mut token_count = 0usize;
    for value in record.payload.values() {
        if let Some(text) = value.as_str() {
            for token in text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
            {
                let mut hasher = DefaultHasher::new();
                token.to_lowercase().hash(&mut hasher);
                let bucket = (hasher.finish() % TOKEN_BUCKETS as u64) as usize;
                values[bucket] += 1.0;
                token_count += 1;
            }
        }
    }
    if token_count > 0 {
        for bucket in values.iter_mut().take(TOKEN_BUCKETS) {
            *bucket /= token_count as f32;
        }
    }

    let influence = record
        .payload
        .get("influence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0) as f32;
    let sentiment = record
        .payload
        .get("sentiment")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0) as f32;
    let mention_count = record
        .payload
        .get("mention_count")
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as f32;

    values[TOKEN_BUCKETS] = influence.clamp(0.0, 1.0);
    values[TOKEN_BUCKETS + 1] = ((sentiment + 1.0) / 2.0).clamp(0.0, 1.0);
    values[TOKEN_BUCKETS + 2] = mention_count / (mention_count + 10.0);
    values[TOKEN_BUCKETS + 3] = (record.payload.len() as f32 / 16.0).min(1.0);

    FeatureVector {
        id: format!("fv:{}", record.id),
        values,
        source_record_ids: vec![record.id.clone()],
        source_version: record.version,
        generated_at: Utc::now(),
    }
}
