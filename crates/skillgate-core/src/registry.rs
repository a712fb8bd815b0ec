//! Skill registry: the single source of truth for lifecycle state and
//! content location.
//!
//! Mutations for one skill id are serialized through a per-key async mutex;
//! the backend's revision check catches writers outside this process. Every
//! backend call goes through the retry policy, so a hung or flapping store
//! surfaces as `RegistryUnavailable` instead of leaving a skill in limbo.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use skillgate_state::{
    ApprovalRecord, ContentDigest, LifecycleState, ParentRef, RegistryChange, RegistryRecord,
    RegistryStore, StorageError,
};
use tracing::{debug, instrument};

use crate::approval::ApprovalPolicy;
use crate::domain::{Result, Skill, SkillError, Step};
use crate::lifecycle::{check_transition, TransitionKind};
use crate::obs;
use crate::retry::RetryPolicy;

/// How many times a read follows a record that moved while its content was
/// being fetched.
const CONTENT_RELOADS: u32 = 4;

/// The state and version a caller based a transition on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub state: LifecycleState,
    pub version: u64,
}

impl Expected {
    pub fn of(record: &RegistryRecord) -> Self {
        Self {
            state: record.state,
            version: record.version,
        }
    }
}

/// Who is asking for a transition.
enum Authorization<'a> {
    /// A human-driven or monitor-driven request; promotions and retirements
    /// need the approval.
    Request(Option<&'a ApprovalRecord>),
    /// Pipeline bookkeeping (archiving a losing candidate).
    System,
}

pub struct SkillRegistry {
    store: Arc<dyn RegistryStore>,
    policy: ApprovalPolicy,
    retry: RetryPolicy,
    rollback_floor: f64,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SkillRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            policy: ApprovalPolicy::default(),
            retry: RetryPolicy::default(),
            rollback_floor: 0.85,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Skills must declare a promotion threshold strictly above this floor.
    pub fn with_rollback_floor(mut self, floor: f64) -> Self {
        self.rollback_floor = floor;
        self
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn lock_for(&self, skill_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(skill_id.to_string()).or_default().clone()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The registry record, or `SkillNotFound`.
    pub async fn record(&self, skill_id: &str) -> Result<RegistryRecord> {
        self.retry
            .run("get", || self.store.get(skill_id))
            .await?
            .ok_or_else(|| SkillError::SkillNotFound(skill_id.to_string()))
    }

    /// The skill as currently stored, with its content digest verified.
    pub async fn get(&self, skill_id: &str) -> Result<Skill> {
        let record = self.record(skill_id).await?;
        self.load_skill(&record).await
    }

    /// Load the content `record` points to. A commit can relocate the
    /// content between reading the record and reading the content; the
    /// missing location is then retried against the newer record.
    async fn load_skill(&self, record: &RegistryRecord) -> Result<Skill> {
        let mut current = record.clone();
        let mut reloads = 0;
        loop {
            let outcome = self.read_skill(&current).await;
            match outcome {
                Err(e @ SkillError::Storage(StorageError::ContentNotFound { .. })) => {
                    let latest = self.record(&current.skill_id).await?;
                    if latest.revision == current.revision || reloads == CONTENT_RELOADS {
                        return Err(e);
                    }
                    reloads += 1;
                    debug!(
                        skill_id = %current.skill_id,
                        revision = latest.revision,
                        "content moved during read; following the record"
                    );
                    current = latest;
                }
                other => return other,
            }
        }
    }

    async fn read_skill(&self, record: &RegistryRecord) -> Result<Skill> {
        let content = self
            .retry
            .run("read_content", || self.store.read_content(&record.location))
            .await?;
        record.content_digest.verify(&record.location, &content)?;
        Skill::from_record(record, &content)
    }

    pub async fn list_records(
        &self,
        state: Option<LifecycleState>,
    ) -> Result<Vec<RegistryRecord>> {
        self.retry.run("list", || self.store.list(state)).await
    }

    pub async fn list_by_state(&self, state: LifecycleState) -> Result<Vec<Skill>> {
        let records = self.list_records(Some(state)).await?;
        let mut skills = Vec::with_capacity(records.len());
        for record in &records {
            skills.push(self.load_skill(record).await?);
        }
        Ok(skills)
    }

    /// Live (non-retired) variation candidates derived from `parent_id`.
    pub async fn candidates_of(&self, parent_id: &str) -> Result<Vec<RegistryRecord>> {
        Ok(self
            .retry
            .run("children", || self.store.children(parent_id))
            .await?
            .into_iter()
            .filter(|r| r.state != LifecycleState::Retired)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a new skill. It always enters at `prototype`.
    #[instrument(skip(self, skill), fields(skill_id = %skill.id))]
    pub async fn register(&self, skill: &Skill) -> Result<RegistryRecord> {
        self.create(skill, None).await
    }

    /// Register a variation candidate of `parent`.
    pub async fn register_candidate(
        &self,
        skill: &Skill,
        parent: ParentRef,
    ) -> Result<RegistryRecord> {
        self.create(skill, Some(parent)).await
    }

    async fn create(&self, skill: &Skill, parent: Option<ParentRef>) -> Result<RegistryRecord> {
        skill.validate()?;
        if skill.fidelity_threshold <= self.rollback_floor {
            return Err(SkillError::InvalidSkill(format!(
                "{}: fidelity_threshold {} must be above the rollback floor {}",
                skill.id, skill.fidelity_threshold, self.rollback_floor
            )));
        }

        let lock = self.lock_for(&skill.id);
        let _guard = lock.lock().await;

        if self.retry.run("get", || self.store.get(&skill.id)).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                skill_id: skill.id.clone(),
            }
            .into());
        }

        let content = skill.content_bytes()?;
        let change = RegistryChange::create(
            skill.id.clone(),
            skill.version,
            LifecycleState::Prototype,
            content.clone(),
            parent,
        );
        match self.retry.run("create", || self.store.commit(change.clone())).await {
            Ok(record) => Ok(record),
            Err(SkillError::Storage(StorageError::AlreadyExists { skill_id })) => {
                // An attempt that timed out may still have landed.
                let existing = self.record(&skill_id).await?;
                if existing.revision == 1
                    && existing.version == skill.version
                    && existing.content_digest == ContentDigest::from_bytes(&content)
                {
                    debug!(skill_id = %skill_id, "create applied by an earlier attempt");
                    Ok(existing)
                } else {
                    Err(StorageError::AlreadyExists { skill_id }.into())
                }
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Move `skill_id` to `to`, relocating its content in the same commit.
    ///
    /// Fails with `StaleRecord` unless the skill is still at `expected`.
    /// Promotions and retirements need an approval that passes the policy;
    /// rollbacks and demotions ignore `approval`.
    #[instrument(skip(self, approval), fields(skill_id = %skill_id, to = %to))]
    pub async fn set_state(
        &self,
        skill_id: &str,
        expected: Expected,
        to: LifecycleState,
        approval: Option<&ApprovalRecord>,
    ) -> Result<RegistryRecord> {
        self.transition(skill_id, expected, to, Authorization::Request(approval))
            .await
    }

    /// Retire a losing variation candidate. No approval is consulted.
    pub async fn archive_candidate(&self, skill_id: &str) -> Result<RegistryRecord> {
        let record = self.record(skill_id).await?;
        if record.parent.is_none() {
            return Err(SkillError::InvalidSkill(format!(
                "{skill_id} is not a variation candidate"
            )));
        }
        self.transition(
            skill_id,
            Expected::of(&record),
            LifecycleState::Retired,
            Authorization::System,
        )
        .await
    }

    async fn transition(
        &self,
        skill_id: &str,
        expected: Expected,
        to: LifecycleState,
        auth: Authorization<'_>,
    ) -> Result<RegistryRecord> {
        let lock = self.lock_for(skill_id);
        let _guard = lock.lock().await;

        let record = self.record(skill_id).await?;
        if Expected::of(&record) != expected {
            return Err(SkillError::StaleRecord {
                skill_id: skill_id.to_string(),
                expected_state: expected.state,
                expected_version: expected.version,
                state: record.state,
                version: record.version,
            });
        }
        let kind = check_transition(skill_id, record.state, to)?;

        if let Authorization::Request(approval) = auth {
            if kind.requires_approval() {
                let approval = approval.ok_or_else(|| SkillError::ApprovalMissing {
                    skill_id: skill_id.to_string(),
                    from: record.state,
                    to,
                    reason: "no approval supplied".into(),
                })?;
                self.policy
                    .verify(approval, &record, to)
                    .map_err(|reason| SkillError::ApprovalMissing {
                        skill_id: skill_id.to_string(),
                        from: record.state,
                        to,
                        reason,
                    })?;
            }
        } else if kind != TransitionKind::Retire {
            return Err(SkillError::InvalidTransition {
                skill_id: skill_id.to_string(),
                from: record.state,
                to,
            });
        }

        let change = RegistryChange::transition(&record, to, None);
        let updated = self.commit(&record, change, "set_state").await?;
        obs::emit_state_changed(skill_id, updated.version, record.state, updated.state);
        Ok(updated)
    }

    /// Make `steps` the next version of `skill_id`, keeping its state.
    ///
    /// Fails if the skill is no longer at `expected_version`.
    pub async fn replace_baseline(
        &self,
        skill_id: &str,
        expected_version: u64,
        steps: Vec<Step>,
    ) -> Result<RegistryRecord> {
        let lock = self.lock_for(skill_id);
        let _guard = lock.lock().await;

        let record = self.record(skill_id).await?;
        if record.state.is_terminal() {
            return Err(SkillError::SkillRetired(skill_id.to_string()));
        }
        if record.version != expected_version {
            return Err(SkillError::InvalidSkill(format!(
                "{skill_id} is at version {}, expected {expected_version}",
                record.version
            )));
        }

        let mut next = self.load_skill(&record).await?;
        next.version = record.version + 1;
        next.steps = steps;
        next.validate()?;

        let change = RegistryChange::new_version(&record, next.version, next.content_bytes()?);
        self.commit(&record, change, "replace_baseline").await
    }

    /// Commit with retries. A revision conflict right after a timed-out
    /// attempt is resolved by checking whether that attempt applied.
    async fn commit(
        &self,
        before: &RegistryRecord,
        change: RegistryChange,
        operation: &str,
    ) -> Result<RegistryRecord> {
        let (state, version) = (change.state, change.version);
        match self.retry.run(operation, || self.store.commit(change.clone())).await {
            Ok(record) => Ok(record),
            Err(SkillError::Storage(conflict @ StorageError::RevisionConflict { .. })) => {
                let current = self.record(&before.skill_id).await?;
                if current.revision == before.revision + 1
                    && current.state == state
                    && current.version == version
                {
                    debug!(
                        skill_id = %before.skill_id,
                        "{operation} applied by an earlier attempt"
                    );
                    Ok(current)
                } else {
                    Err(conflict.into())
                }
            }
            Err(e) => Err(e),
        }
    }
}
