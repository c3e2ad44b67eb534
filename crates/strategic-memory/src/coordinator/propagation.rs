//! Bounded retry queue for asynchronous propagation to the analytical store
//! and similarity index.
//!
//! Overflow drops the oldest queued job and counts the drop; the queue never
//! grows without bound and never blocks a writer.

use crate::metrics::StorageCounters;
use crate::record_store::{FeatureVector, Record};
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use tracing::{debug, warn};

/// A unit of deferred propagation work.
#[derive(Debug, Clone)]
pub enum PropagationJob {
    RecordUpsert(Record),
    FeatureUpsert(FeatureVector),
}

impl PropagationJob {
    pub fn key(&self) -> &str {
        match self {
            PropagationJob::RecordUpsert(record) => &record.id,
            PropagationJob::FeatureUpsert(feature) => &feature.id,
        }
    }
}

pub struct PropagationQueue {
    queue: ArrayQueue<PropagationJob>,
    counters: Arc<StorageCounters>,
}

impl PropagationQueue {
    pub fn new(bound: usize, counters: Arc<StorageCounters>) -> Self {
        Self {
            queue: ArrayQueue::new(bound),
            counters,
        }
    }

    /// Enqueue a job, evicting the oldest entry when full.
    pub fn push(&self, job: PropagationJob) {
        let mut job = job;
        loop {
            match self.queue.push(job) {
                Ok(()) => return,
                Err(rejected) => {
                    if let Some(dropped) = self.queue.pop() {
                        self.counters.inc_propagation_dropped();
                        warn!(
                            "Propagation queue full, dropped oldest job for {}",
                            dropped.key()
                        );
                    }
                    job = rejected;
                }
            }
        }
    }

    pub fn pop(&self) -> Option<PropagationJob> {
        self.queue.pop()
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Apply up to `max_batch` queued jobs. A failing job is re-queued and
    /// the drain stops, leaving the rest for the next cycle.
    pub fn drain<F>(&self, max_batch: usize, mut apply: F) -> usize
    where
        F: FnMut(&PropagationJob) -> crate::error::Result<()>,
    {
        let mut applied = 0;
        while applied < max_batch {
            let Some(job) = self.queue.pop() else { break };
            match apply(&job) {
                Ok(()) => {
                    applied += 1;
                    self.counters.inc_propagated();
                }
                Err(e) => {
                    debug!("Propagation of {} failed, re-queueing: {}", job.key(), e);
                    self.push(job);
                    break;
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::RecordKind;
    use chrono::Utc;

    fn record_job(id: &str) -> PropagationJob {
        let mut payload = serde_json::Map::new();
        payload.insert("event_type".into(), serde_json::json!("meeting"));
        PropagationJob::RecordUpsert(Record {
            id: id.to_string(),
            kind: RecordKind::Event,
            payload,
            version: 1,
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn test_push_pop_fifo_order() {
        let counters = Arc::new(StorageCounters::new());
        let queue = PropagationQueue::new(4, counters);
        queue.push(record_job("event:a"));
        queue.push(record_job("event:b"));
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.pop().unwrap().key(), "event:a");
        assert_eq!(queue.pop().unwrap().key(), "event:b");
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let counters = Arc::new(StorageCounters::new());
        let queue = PropagationQueue::new(2, Arc::clone(&counters));
        queue.push(record_job("event:a"));
        queue.push(record_job("event:b"));
        queue.push(record_job("event:c"));

        assert_eq!(queue.depth(), 2);
        assert_eq!(counters.snapshot().propagation_dropped, 1);
        assert_eq!(queue.pop().unwrap().key(), "event:b");
        assert_eq!(queue.pop().unwrap().key(), "event:c");
    }

    #[test]
    fn test_drain_applies_in_order() {
        let counters = Arc::new(StorageCounters::new());
        let queue = PropagationQueue::new(8, Arc::clone(&counters));
        queue.push(record_job("event:a"));
        queue.push(record_job("event:b"));
        queue.push(record_job("event:c"));

        let mut seen = Vec::new();
        let applied = queue.drain(8, |job| {
            seen.push(job.key().to_string());
            Ok(())
        });

        assert_eq!(applied, 3);
        assert_eq!(seen, vec!["event:a", "event:b", "event:c"]);
        assert_eq!(counters.snapshot().propagated, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_requeues_failed_job() {
        let counters = Arc::new(StorageCounters::new());
        let queue = PropagationQueue::new(8, Arc::clone(&counters));
        queue.push(record_job("event:a"));
        queue.push(record_job("event:b"));

        let applied = queue.drain(8, |job| {
            if job.key() == "event:a" {
                Err(crate::error::StorageError::Fatal("backend down".into()))
            } else {
                Ok(())
            }
        });

        assert_eq!(applied, 0);
        assert_eq!(queue.depth(), 2);
        // The failed job went to the back; the next drain sees event:b first.
        assert_eq!(queue.pop().unwrap().key(), "event:b");
        assert_eq!(queue.pop().unwrap().key(), "event:a");
    }

    #[test]
    fn test_drain_respects_batch_bound() {
        let counters = Arc::new(StorageCounters::new());
        let queue = PropagationQueue::new(8, counters);
        for i in 0..5 {
            queue.push(record_job(&format!("event:{}", i)));
        }
        let applied = queue.drain(2, |_| Ok(()));
        assert_eq!(applied, 2);
        assert_eq!(queue.depth(), 3);
    }
}
