//! Domain-level error taxonomy for skillgate.
//!
//! Per-execution failures (validation failures, executor exceptions,
//! timeouts) are never represented here; they are data inside an
//! `ExecutionRecord`. These variants are the structural failures that
//! surface to the caller of a lifecycle operation.

use skillgate_state::{LifecycleState, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("invalid transition for {skill_id}: {from} -> {to}")]
    InvalidTransition {
        skill_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("approval missing for {skill_id} ({from} -> {to}): {reason}")]
    ApprovalMissing {
        skill_id: String,
        from: LifecycleState,
        to: LifecycleState,
        reason: String,
    },

    #[error("{skill_id} not ready: {count} executions recorded, {required} required")]
    NotReady {
        skill_id: String,
        count: u64,
        required: u64,
    },

    #[error("{skill_id} fidelity {avg:.3} is below threshold {threshold:.3}")]
    LowFidelity {
        skill_id: String,
        avg: f64,
        threshold: f64,
    },

    #[error("registry unavailable after {attempts} attempts: {last_error}")]
    RegistryUnavailable { attempts: u32, last_error: String },

    #[error(
        "{skill_id} changed since it was read: expected {expected_state} v{expected_version}, \
         found {state} v{version}"
    )]
    StaleRecord {
        skill_id: String,
        expected_state: LifecycleState,
        expected_version: u64,
        state: LifecycleState,
        version: u64,
    },

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("skill {0} is retired")]
    SkillRetired(String),

    #[error("invalid skill definition: {0}")]
    InvalidSkill(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for SkillError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SkillNotFound { skill_id } => SkillError::SkillNotFound(skill_id),
            other => SkillError::Storage(other),
        }
    }
}

impl SkillError {
    /// Process exit code for the operational commands.
    pub fn code(&self) -> u8 {
        match self {
            SkillError::InvalidTransition { .. } => 3,
            SkillError::ApprovalMissing { .. } => 4,
            SkillError::NotReady { .. } => 5,
            SkillError::RegistryUnavailable { .. } => 6,
            SkillError::LowFidelity { .. } => 7,
            SkillError::SkillNotFound(_) => 8,
            _ => 1,
        }
    }
}

/// Result type for skillgate domain operations.
pub type Result<T> = std::result::Result<T, SkillError>;
