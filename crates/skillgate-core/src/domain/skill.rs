//! Skill domain types and the external definition format.

use std::path::Path;

use serde::{Deserialize, Serialize};
use skillgate_state::{validate_key, LifecycleState, ParentRef, RegistryRecord};

use super::error::{Result, SkillError};
use super::validation::ValidationPattern;

pub const DEFAULT_FIDELITY_THRESHOLD: f64 = 0.90;
pub const DEFAULT_MIN_EXECUTIONS: u64 = 100;

fn default_threshold() -> f64 {
    DEFAULT_FIDELITY_THRESHOLD
}

fn default_min_executions() -> u64 {
    DEFAULT_MIN_EXECUTIONS
}

/// One stage of a skill's reasoning chain. `instructions` are opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub instructions: String,
    pub validation_pattern: ValidationPattern,
}

/// A named, versioned behavior module as seen by the pipeline.
///
/// `id`, `version`, `lifecycle_state` and `parent` come from the registry
/// record; everything else from the stored content (`SkillBody`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub version: u64,
    pub lifecycle_state: LifecycleState,
    pub primary_executor_class: String,
    pub fidelity_threshold: f64,
    pub min_executions_for_promotion: u64,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub parent: Option<ParentRef>,
}

/// The part of a skill stored at its content location. Lifecycle state is
/// deliberately absent so moving content never makes it stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillBody {
    pub primary_executor_class: String,
    pub fidelity_threshold: f64,
    pub min_executions_for_promotion: u64,
    pub steps: Vec<Step>,
}

impl Skill {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SkillError::InvalidSkill(format!("{}: {}", self.id, msg)));

        if validate_key(&self.id).is_err() {
            return Err(SkillError::InvalidSkill(format!(
                "id {:?} must be 1-128 chars of [A-Za-z0-9._-] and not start with '.'",
                self.id
            )));
        }
        if self.version == 0 {
            return invalid("version must be >= 1".into());
        }
        if self.primary_executor_class.trim().is_empty() {
            return invalid("primary_executor_class is required".into());
        }
        if !(self.fidelity_threshold > 0.0 && self.fidelity_threshold <= 1.0) {
            return invalid(format!(
                "fidelity_threshold {} must be in (0, 1]",
                self.fidelity_threshold
            ));
        }
        if self.min_executions_for_promotion == 0 {
            return invalid("min_executions_for_promotion must be >= 1".into());
        }
        if self.steps.is_empty() {
            return invalid("at least one step is required".into());
        }
        for (position, step) in self.steps.iter().enumerate() {
            if step.index != position {
                return invalid(format!(
                    "step at position {position} has index {}",
                    step.index
                ));
            }
            step.validation_pattern
                .check()
                .or_else(|e| invalid(format!("step {position}: {e}")))?;
        }
        Ok(())
    }

    pub fn body(&self) -> SkillBody {
        SkillBody {
            primary_executor_class: self.primary_executor_class.clone(),
            fidelity_threshold: self.fidelity_threshold,
            min_executions_for_promotion: self.min_executions_for_promotion,
            steps: self.steps.clone(),
        }
    }

    /// Serialized `SkillBody`, the bytes the registry stores.
    pub fn content_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.body())?)
    }

    /// Rebuild a skill from its registry record and stored content.
    pub fn from_record(record: &RegistryRecord, content: &[u8]) -> Result<Self> {
        let body: SkillBody = serde_json::from_slice(content)?;
        Ok(Self {
            id: record.skill_id.clone(),
            version: record.version,
            lifecycle_state: record.state,
            primary_executor_class: body.primary_executor_class,
            fidelity_threshold: body.fidelity_threshold,
            min_executions_for_promotion: body.min_executions_for_promotion,
            steps: body.steps,
            parent: record.parent.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Definition format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Optional; must equal the step's position when present.
    #[serde(default)]
    pub index: Option<usize>,
    pub instructions: String,
    pub validation_pattern: ValidationPattern,
}

/// A skill as authored: metadata followed by ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u64,
    /// Accepted for compatibility; new skills always start in `prototype`.
    #[serde(default)]
    pub lifecycle_state: Option<LifecycleState>,
    pub primary_executor_class: String,
    #[serde(default = "default_threshold")]
    pub fidelity_threshold: f64,
    #[serde(default = "default_min_executions")]
    pub min_executions_for_promotion: u64,
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> u64 {
    1
}

impl SkillDefinition {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SkillError::InvalidSkill(e.to_string()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SkillError::InvalidSkill(e.to_string()))
    }

    /// Load from disk; `.toml` files are TOML, everything else JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    /// Validate and convert. The result is always in `prototype`.
    pub fn into_skill(self) -> Result<Skill> {
        if let Some(state) = self.lifecycle_state {
            if state != LifecycleState::Prototype {
                tracing::warn!(
                    skill_id = %self.name,
                    declared = %state,
                    "ignoring declared lifecycle_state; new skills start in prototype"
                );
            }
        }
        let mut steps = Vec::with_capacity(self.steps.len());
        for (position, def) in self.steps.into_iter().enumerate() {
            if let Some(index) = def.index {
                if index != position {
                    return Err(SkillError::InvalidSkill(format!(
                        "{}: step at position {position} declares index {index}",
                        self.name
                    )));
                }
            }
            steps.push(Step {
                index: position,
                instructions: def.instructions,
                validation_pattern: def.validation_pattern,
            });
        }
        let skill = Skill {
            id: self.name,
            version: self.version,
            lifecycle_state: LifecycleState::Prototype,
            primary_executor_class: self.primary_executor_class,
            fidelity_threshold: self.fidelity_threshold,
            min_executions_for_promotion: self.min_executions_for_promotion,
            steps,
            parent: None,
        };
        skill.validate()?;
        Ok(skill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skillgate_state::{ContentDigest, ContentLocation};

    const TOML_DEF: &str = r#"
name = "greeting"
version = 1
lifecycle_state = "production"
primary_executor_class = "chat"

[[steps]]
instructions = "Greet the user by name"
validation_pattern = { kind = "required_fields", fields = ["greeting"] }

[[steps]]
instructions = "Sign off"
validation_pattern = { kind = "contains", text = "bye" }
"#;

    #[test]
    fn toml_definition_applies_defaults_and_forces_prototype() {
        let skill = SkillDefinition::from_toml(TOML_DEF)
            .unwrap()
            .into_skill()
            .unwrap();
        assert_eq!(skill.lifecycle_state, LifecycleState::Prototype);
        assert_eq!(skill.fidelity_threshold, DEFAULT_FIDELITY_THRESHOLD);
        assert_eq!(skill.min_executions_for_promotion, DEFAULT_MIN_EXECUTIONS);
        assert_eq!(skill.steps.len(), 2);
        assert_eq!(skill.steps[1].index, 1);
    }

    #[test]
    fn json_definition_parses() {
        let def = SkillDefinition::from_json(
            r#"{"name":"echo","primary_executor_class":"shell","fidelity_threshold":0.95,
                "steps":[{"instructions":"echo","validation_pattern":{"kind":"non_empty"}}]}"#,
        )
        .unwrap();
        let skill = def.into_skill().unwrap();
        assert_eq!(skill.version, 1);
        assert_eq!(skill.fidelity_threshold, 0.95);
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let mut def = SkillDefinition::from_toml(TOML_DEF).unwrap();
        def.steps.clear();
        assert!(matches!(def.into_skill(), Err(SkillError::InvalidSkill(_))));

        let mut def = SkillDefinition::from_toml(TOML_DEF).unwrap();
        def.fidelity_threshold = 1.5;
        assert!(def.into_skill().is_err());

        let mut def = SkillDefinition::from_toml(TOML_DEF).unwrap();
        def.name = "../etc".into();
        assert!(def.into_skill().is_err());

        let mut def = SkillDefinition::from_toml(TOML_DEF).unwrap();
        def.steps[1].index = Some(5);
        assert!(def.into_skill().is_err());
    }

    #[test]
    fn content_round_trips_through_record() {
        let skill = SkillDefinition::from_toml(TOML_DEF)
            .unwrap()
            .into_skill()
            .unwrap();
        let bytes = skill.content_bytes().unwrap();
        let now = Utc::now();
        let record = RegistryRecord {
            skill_id: skill.id.clone(),
            version: 3,
            state: LifecycleState::Staged,
            location: ContentLocation::for_state(LifecycleState::Staged, &skill.id, 3),
            content_digest: ContentDigest::from_bytes(&bytes),
            revision: 2,
            state_since: now,
            parent: None,
            archived_versions: vec![],
            updated_at: now,
        };
        let loaded = Skill::from_record(&record, &bytes).unwrap();
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.lifecycle_state, LifecycleState::Staged);
        assert_eq!(loaded.steps, skill.steps);
    }
}
