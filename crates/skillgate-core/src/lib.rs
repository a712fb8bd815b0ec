//! skillgate Core Library
//!
//! Execution, metrics, promotion, rollback and variation for versioned agent
//! skills. Persistence lives in `skillgate-state`; this crate holds the
//! pipeline that runs on top of it.

pub mod aggregate;
pub mod approval;
pub mod config;
pub mod domain;
pub mod engine;
pub mod gate;
pub mod lifecycle;
pub mod metrics;
pub mod monitor;
pub mod obs;
pub mod ops;
pub mod pipeline;
pub mod pool;
pub mod query;
pub mod registry;
pub mod retry;
mod schedule;
pub mod scorer;
pub mod telemetry;
pub mod variation;

pub use domain::{
    Result, Skill, SkillBody, SkillDefinition, SkillError, Step, StepDefinition,
    ValidationPattern,
};

pub use aggregate::{Aggregator, AggregatorConfig, BatchReport};
pub use approval::ApprovalPolicy;
pub use config::PipelineConfig;
pub use engine::{ExecutionEngine, Executor, ExecutorError, ExecutorSet, TaskContext};
pub use gate::{evaluate_promotion, Decision, GateEvaluation, PromotionGate};
pub use lifecycle::{classify, TransitionKind};
pub use metrics::METRICS;
pub use monitor::{check_breach, Breach, MonitorConfig, MonitorReport, RollbackMonitor};
pub use ops::{LifecycleOps, StatusReport};
pub use pipeline::Pipeline;
pub use pool::WorkerPool;
pub use query::MetricsQuery;
pub use registry::{Expected, SkillRegistry};
pub use retry::RetryPolicy;
pub use scorer::FidelityScorer;
pub use telemetry::init_tracing;
pub use variation::{
    EmphasisStrategy, TrialOutcome, VariationConfig, VariationManager, VariationReport,
    VariationStrategy, Winner,
};

pub use skillgate_state::{
    ApprovalRecord, ExecutionRecord, LifecycleEvent, LifecycleEventKind, LifecycleState,
    MetricSnapshot, RegistryRecord,
};
