//! Domain models for skillgate.
//!
//! - `Skill` / `Step`: a versioned behavior module and its ordered stages
//! - `SkillDefinition`: the authored JSON/TOML form
//! - `ValidationPattern`: what a step's output must satisfy
//! - `SkillError`: structural failures surfaced to callers

pub mod error;
pub mod skill;
pub mod validation;

pub use error::{Result, SkillError};
pub use skill::{
    Skill, SkillBody, SkillDefinition, Step, StepDefinition, DEFAULT_FIDELITY_THRESHOLD,
    DEFAULT_MIN_EXECUTIONS,
};
pub use validation::ValidationPattern;
