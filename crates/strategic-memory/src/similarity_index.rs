//! Similarity index - approximate nearest-neighbor backend with ANN indexing
//! support and a linear scan fallback.
//!
//! Vectors and their provenance persist to a sidecar file; the HNSW index is
//! rebuilt from them rather than persisted. A cold index yields empty search
//! results, never an error.

use crate::error::{Result, StorageError};
use crate::record_store::{FeatureVector, FEATURE_DIMENSION};
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    id: String,
    values: Vec<f32>,
    source_record_ids: Vec<String>,
    source_version: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SimilarityStats {
    pub total_vectors: usize,
    pub dimension: usize,
    pub index_type: String,
}

pub struct SimilarityIndex {
    path: PathBuf,
    ann_index: RwLock<Option<HNSWIndex<f32, i64>>>,
    vectors: RwLock<HashMap<String, StoredVector>>,
    seq_to_id: RwLock<HashMap<i64, String>>,
    next_seq: AtomicI64,
    stale: AtomicBool,
}

impl SimilarityIndex {
    /// Open the index, loading persisted vectors when the sidecar file
    /// exists. The ANN structure itself stays cold until `build`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let index = Self {
            path: path.to_path_buf(),
            ann_index: RwLock::new(None),
            vectors: RwLock::new(HashMap::new()),
            seq_to_id: RwLock::new(HashMap::new()),
            next_seq: AtomicI64::new(0),
            stale: AtomicBool::new(false),
        };

        if path.exists() {
            let bytes = std::fs::read(path)?;
            let stored: Vec<StoredVector> = bincode::deserialize(&bytes)?;
            info!("Loaded {} vectors from {}", stored.len(), path.display());
            let mut vectors = index.vectors.write().unwrap();
            for vector in stored {
                vectors.insert(vector.id.clone(), vector);
            }
            index.stale.store(true, Ordering::Relaxed);
        }

        Ok(index)
    }

    /// Insert or replace the vector for a feature id. The ANN index goes
    /// stale and is rebuilt on the next `build`.
    pub fn upsert(&self, feature: &FeatureVector) -> Result<()> {
        if feature.values.len() != FEATURE_DIMENSION {
            return Err(StorageError::Validation(format!(
                "feature vector {} has dimension {}, expected {}",
                feature.id,
                feature.values.len(),
                FEATURE_DIMENSION
            )));
        }
        let mut vectors = self.vectors.write().unwrap();
        vectors.insert(
            feature.id.clone(),
            StoredVector {
                id: feature.id.clone(),
                values: feature.values.clone(),
                source_record_ids: feature.source_record_ids.clone(),
                source_version: feature.source_version,
            },
        );
        self.stale.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Rebuild the HNSW index over the current vector set.
    pub fn build(&self) -> Result<()> {
        let vectors = self.vectors.read().unwrap();
        if vectors.is_empty() {
            *self.ann_index.write().unwrap() = None;
            self.stale.store(false, Ordering::Relaxed);
            return Ok(());
        }

        let params = HNSWParams {
            n_neighbor: 16,
            ef_build: 100,
            ef_search: 50,
            ..Default::default()
        };
        let mut index = HNSWIndex::<f32, i64>::new(FEATURE_DIMENSION, &params);
        let mut seq_to_id = HashMap::new();

        for vector in vectors.values() {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let _ = index.add(&vector.values, seq);
            seq_to_id.insert(seq, vector.id.clone());
        }

        index
            .build(Metric::CosineSimilarity)
            .map_err(|e| StorageError::Fatal(format!("Failed to build index: {}", e)))?;

        *self.seq_to_id.write().unwrap() = seq_to_id;
        *self.ann_index.write().unwrap() = Some(index);
        self.stale.store(false, Ordering::Relaxed);
        info!("ANN index built with {} vectors", vectors.len());
        Ok(())
    }

    /// Nearest neighbors of `query` by cosine similarity, best first.
    ///
    /// A cold or unbuilt index degrades: stale entries fall back to a linear
    /// scan, and an empty index returns no matches rather than an error.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        if query.len() != FEATURE_DIMENSION {
            warn!(
                "Similarity query has dimension {}, expected {}; returning no matches",
                query.len(),
                FEATURE_DIMENSION
            );
            return Vec::new();
        }
        if k == 0 {
            return Vec::new();
        }

        if !self.stale.load(Ordering::Relaxed) {
            let index_guard = self.ann_index.read().unwrap();
            if let Some(index) = &*index_guard {
                let ids = index.search(query, k);
                let seq_to_id = self.seq_to_id.read().unwrap();
                let vectors = self.vectors.read().unwrap();

                let mut scored = Vec::new();
                for seq in &ids {
                    if let Some(id) = seq_to_id.get(seq) {
                        if let Some(stored) = vectors.get(id) {
                            scored.push((id.clone(), cosine_similarity(query, &stored.values)));
                        }
                    }
                }
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                return scored;
            }
        }

        let vectors = self.vectors.read().unwrap();
        if vectors.is_empty() {
            debug!("Similarity index is cold, returning no matches");
            return Vec::new();
        }

        warn!("ANN index not available, falling back to linear scan");
        let mut scored: Vec<(String, f32)> = vectors
            .values()
            .map(|stored| (stored.id.clone(), cosine_similarity(query, &stored.values)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Provenance for a stored vector.
    pub fn source_records(&self, id: &str) -> Option<Vec<String>> {
        self.vectors
            .read()
            .unwrap()
            .get(id)
            .map(|v| v.source_record_ids.clone())
    }

    pub fn len(&self) -> usize {
        self.vectors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.read().unwrap().is_empty()
    }

    /// Write vectors and provenance to the sidecar file.
    pub fn persist(&self) -> Result<()> {
        let vectors = self.vectors.read().unwrap();
        let stored: Vec<&StoredVector> = vectors.values().collect();
        let bytes = bincode::serialize(&stored)?;
        let tmp_path = self.path.with_extension("idx.tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!("Persisted {} vectors to {}", stored.len(), self.path.display());
        Ok(())
    }

    pub fn stats(&self) -> SimilarityStats {
        let index_type = if self.ann_index.read().unwrap().is_some() && !self.stale.load(Ordering::Relaxed) {
            "HNSW".to_string()
        } else {
            "Linear".to_string()
        };
        SimilarityStats {
            total_vectors: self.len(),
            dimension: FEATURE_DIMENSION,
            index_type,
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
