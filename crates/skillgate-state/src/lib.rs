//! skillgate-state: persistence for the skill lifecycle pipeline
//!
//! ## Layer 0 - Data/Persistence
//!
//! Two-layer metrics storage plus the authoritative skill registry:
//!
//! - `ExecutionLog`: append-only execution records, one stream per skill version
//! - `AggregateStore`: summaries folded from the log by the aggregator
//! - `RegistryStore`: lifecycle state and content with conditional commits
//! - `ApprovalLog` / `LifecycleLog`: audit trails
//!
//! Backends: `fakes` (in-memory), `fs` (JSONL and atomic files) and
//! `SurrealAggregateStore` (SurrealDB, `mem://` or `surrealkv://`).

mod commit;
mod error;
pub mod fakes;
pub mod fs;
mod handle;
mod schema;
pub mod storage_traits;
pub mod surreal_aggregate;

pub use error::{StateError, StorageError};
pub use handle::SurrealHandle;
pub use schema::{
    AggregateBucket, AggregateSummary, ApprovalRecord, ArchivedVersion, ContentLocation,
    ExecutionRecord, LifecycleEvent, LifecycleEventKind, LifecycleState, MetricSnapshot,
    ParentRef, RecentSample, RegistryChange, RegistryRecord, StepAttempt, StepStat, StreamKey,
    TimeWindow, UnknownState,
};
pub use storage_traits::{
    validate_key, AggregateStore, ApprovalLog, ContentDigest, ExecutionLog, LifecycleLog,
    RegistryStore, StorageResult,
};
pub use surreal_aggregate::SurrealAggregateStore;

/// Result type for skillgate-state connection operations
pub type Result<T> = std::result::Result<T, StateError>;
