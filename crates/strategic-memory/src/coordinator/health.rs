//! Backend liveness tracking.
//!
//! A failed probe marks the backend degraded; operations route to fallbacks
//! until the next successful probe flips it back.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub struct BackendHealth {
    record_healthy: AtomicBool,
    analytics_healthy: AtomicBool,
    similarity_healthy: AtomicBool,
}

impl BackendHealth {
    pub fn new() -> Self {
        Self {
            record_healthy: AtomicBool::new(true),
            analytics_healthy: AtomicBool::new(true),
            similarity_healthy: AtomicBool::new(true),
        }
    }

    pub fn record_is_healthy(&self) -> bool {
        self.record_healthy.load(Ordering::Relaxed)
    }

    pub fn analytics_is_healthy(&self) -> bool {
        self.analytics_healthy.load(Ordering::Relaxed)
    }

    pub fn similarity_is_healthy(&self) -> bool {
        self.similarity_healthy.load(Ordering::Relaxed)
    }

    pub fn set_record_healthy(&self, healthy: bool) {
        let was = self.record_healthy.swap(healthy, Ordering::Relaxed);
        if was != healthy {
            if healthy {
                info!("Record store recovered");
            } else {
                warn!("Record store marked unhealthy");
            }
        }
    }

    pub fn set_analytics_healthy(&self, healthy: bool) {
        let was = self.analytics_healthy.swap(healthy, Ordering::Relaxed);
        if was != healthy {
            if healthy {
                info!("Analytical store recovered, queued propagations will drain");
            } else {
                warn!("Analytical store marked degraded, falling back to record store aggregates");
            }
        }
    }

    pub fn set_similarity_healthy(&self, healthy: bool) {
        let was = self.similarity_healthy.swap(healthy, Ordering::Relaxed);
        if was != healthy {
            if healthy {
                info!("Similarity index recovered");
            } else {
                warn!("Similarity index marked degraded, searches return no matches");
            }
        }
    }
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_start_healthy() {
        let health = BackendHealth::new();
        assert!(health.record_is_healthy());
        assert!(health.analytics_is_healthy());
        assert!(health.similarity_is_healthy());
    }

    #[test]
    fn test_degrade_and_recover() {
        let health = BackendHealth::new();
        health.set_analytics_healthy(false);
        assert!(!health.analytics_is_healthy());
        assert!(health.record_is_healthy());

        health.set_analytics_healthy(true);
        assert!(health.analytics_is_healthy());
    }
}
