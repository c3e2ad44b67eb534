// strategic-memory/crates/src/lib.rs

pub mod analytical_store;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod record_store;
pub mod similarity_index;
pub mod telemetry;

// Public API exports
pub use config::Config;
pub use coordinator::{Operation, OperationOutput, RoutingTag, UnifiedCoordinator};
pub use error::{Result, StorageError};
pub use memory::{ContextMemoryManager, EntityCandidate, SessionState};
pub use record_store::{
    ConversationTurn, EntityProfile, FeatureVector, Record, RecordKind, SessionSnapshot,
};
pub use telemetry::init_tracing;

// Analytical surface exports
pub use analytical_store::{AggregateField, AggregateMetric, AggregateRow, AggregateSpec};
pub use metrics::{CounterSnapshot, StorageCounters};
