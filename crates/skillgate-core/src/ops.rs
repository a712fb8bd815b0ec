//! Operational commands.
//!
//! [`LifecycleOps`] is the surface the CLI drives: every manual lifecycle
//! action goes through here so it is checked and audited the same way.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use skillgate_state::{
    ApprovalLog, ApprovalRecord, ExecutionLog, LifecycleEvent, LifecycleEventKind, LifecycleLog,
    LifecycleState, MetricSnapshot, RegistryRecord, StreamKey,
};
use tracing::{info, warn};

use crate::domain::{Result, Skill, SkillError};
use crate::gate::{GateEvaluation, PromotionGate};
use crate::lifecycle::{check_transition, classify, fallback_target, record_event, TransitionKind};
use crate::metrics::METRICS;
use crate::obs;
use crate::query::MetricsQuery;
use crate::registry::{Expected, SkillRegistry};

/// What `status` reports for one skill.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub skill_id: String,
    pub version: u64,
    pub state: LifecycleState,
    pub state_since: DateTime<Utc>,
    pub metrics: MetricSnapshot,
    /// When the aggregate layer last folded this version.
    pub metrics_as_of: Option<DateTime<Utc>>,
    /// Appended executions not yet folded into `metrics`.
    pub pending_executions: u64,
    /// `metrics` are older than one batch interval and there is unfolded data.
    pub lagging: bool,
    /// Live variation candidates.
    pub candidates: Vec<String>,
}

pub struct LifecycleOps {
    registry: Arc<SkillRegistry>,
    gate: PromotionGate,
    metrics: MetricsQuery,
    executions: Arc<dyn ExecutionLog>,
    approvals: Arc<dyn ApprovalLog>,
    history: Arc<dyn LifecycleLog>,
    batch_interval: Duration,
}

impl LifecycleOps {
    pub fn new(
        registry: Arc<SkillRegistry>,
        metrics: MetricsQuery,
        executions: Arc<dyn ExecutionLog>,
        approvals: Arc<dyn ApprovalLog>,
        history: Arc<dyn LifecycleLog>,
    ) -> Self {
        let gate = PromotionGate::new(
            registry.clone(),
            metrics.clone(),
            approvals.clone(),
            history.clone(),
        );
        Self {
            registry,
            gate,
            metrics,
            executions,
            approvals,
            history,
            batch_interval: Duration::from_secs(3_600),
        }
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    async fn audit(&self, event: LifecycleEvent) {
        record_event(self.history.as_ref(), self.registry.retry_policy(), &event).await;
    }

    pub async fn register(&self, skill: &Skill, actor: &str) -> Result<RegistryRecord> {
        let record = self.registry.register(skill).await?;
        self.audit(LifecycleEvent::new(
            LifecycleEventKind::Registered,
            &record.skill_id,
            record.version,
            None,
            record.state,
            actor,
        ))
        .await;
        info!(skill_id = %record.skill_id, version = record.version, "skill registered");
        Ok(record)
    }

    /// Record an approval for moving `skill_id` from its current state to
    /// `to`. The checklist is stored as given; a `false` entry is kept on
    /// record and will block the transition.
    pub async fn approve(
        &self,
        skill_id: &str,
        to: LifecycleState,
        approver: &str,
        checklist: BTreeMap<String, bool>,
    ) -> Result<ApprovalRecord> {
        let record = self.registry.record(skill_id).await?;
        let kind = check_transition(skill_id, record.state, to)?;
        if !kind.requires_approval() {
            return Err(SkillError::InvalidTransition {
                skill_id: skill_id.to_string(),
                from: record.state,
                to,
            });
        }

        let approval = ApprovalRecord::new(
            skill_id,
            record.version,
            record.state,
            to,
            approver,
            checklist,
            Utc::now(),
        );
        let failed = approval.failed_checks();
        if !failed.is_empty() {
            warn!(
                skill_id = %skill_id,
                failed = %failed.join(","),
                "approval recorded with failing checklist items"
            );
        }
        self.registry
            .retry_policy()
            .without_timeout()
            .run("approval_append", || self.approvals.append(&approval))
            .await?;
        Ok(approval)
    }

    pub async fn evaluate(&self, skill_id: &str) -> Result<GateEvaluation> {
        self.gate.evaluate(skill_id).await
    }

    pub async fn promote(&self, skill_id: &str, actor: &str) -> Result<RegistryRecord> {
        self.gate.promote(skill_id, actor).await
    }

    /// Step `skill_id` back one state. Never needs an approval.
    pub async fn rollback(
        &self,
        skill_id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<RegistryRecord> {
        let record = self.registry.record(skill_id).await?;
        if record.state.is_terminal() {
            return Err(SkillError::SkillRetired(skill_id.to_string()));
        }
        let to = fallback_target(record.state).ok_or(SkillError::InvalidTransition {
            skill_id: skill_id.to_string(),
            from: record.state,
            to: record.state,
        })?;

        let snapshot = self
            .metrics
            .snapshot(skill_id, record.version, Some(record.state_since))
            .await?;
        let updated = self
            .registry
            .set_state(skill_id, Expected::of(&record), to, None)
            .await?;
        METRICS.inc_rollbacks();
        obs::emit_rollback_triggered(skill_id, to, reason, &snapshot);

        let kind = classify(record.state, to)
            .unwrap_or(TransitionKind::Rollback)
            .event_kind();
        self.audit(
            LifecycleEvent::new(kind, skill_id, updated.version, Some(record.state), to, actor)
                .with_snapshot(snapshot)
                .with_reason(reason),
        )
        .await;
        Ok(updated)
    }

    /// Retire `skill_id` using the newest valid retirement approval on file.
    pub async fn retire(&self, skill_id: &str, actor: &str) -> Result<RegistryRecord> {
        let record = self.registry.record(skill_id).await?;
        if record.state.is_terminal() {
            return Err(SkillError::SkillRetired(skill_id.to_string()));
        }
        let approvals = self.approvals.for_skill(skill_id).await?;
        let policy = self.registry.policy();
        let approval = policy
            .find_valid(&approvals, &record, LifecycleState::Retired)
            .cloned()
            .ok_or_else(|| SkillError::ApprovalMissing {
                skill_id: skill_id.to_string(),
                from: record.state,
                to: LifecycleState::Retired,
                reason: policy.explain_missing(&approvals, &record, LifecycleState::Retired),
            })?;

        let updated = self
            .registry
            .set_state(
                skill_id,
                Expected::of(&record),
                LifecycleState::Retired,
                Some(&approval),
            )
            .await?;
        self.audit(
            LifecycleEvent::new(
                LifecycleEventKind::Retirement,
                skill_id,
                updated.version,
                Some(record.state),
                LifecycleState::Retired,
                actor,
            )
            .with_approval(approval.approval_id),
        )
        .await;
        Ok(updated)
    }

    pub async fn list(&self, state: Option<LifecycleState>) -> Result<Vec<RegistryRecord>> {
        self.registry.list_records(state).await
    }

    pub async fn history(&self, skill_id: &str) -> Result<Vec<LifecycleEvent>> {
        let events = self.history.history(skill_id).await?;
        if events.is_empty() {
            // Distinguish "no events" from "no such skill".
            self.registry.record(skill_id).await?;
        }
        Ok(events)
    }

    /// Last known metrics for the current version, labelled with their age.
    pub async fn status(&self, skill_id: &str) -> Result<StatusReport> {
        let record = self.registry.record(skill_id).await?;
        let metrics = self.metrics.snapshot(skill_id, record.version, None).await?;
        let folded = self
            .metrics
            .summary(skill_id, record.version)
            .await?
            .map(|s| s.events_folded)
            .unwrap_or(0);
        let appended = self
            .executions
            .len(&StreamKey::new(skill_id, record.version))
            .await?;
        let pending_executions = appended.saturating_sub(folded);

        let lagging = pending_executions > 0
            && match metrics.as_of {
                None => true,
                Some(at) => chrono::Duration::from_std(self.batch_interval)
                    .map(|interval| Utc::now() - at > interval)
                    .unwrap_or(false),
            };

        let candidates = self
            .registry
            .candidates_of(skill_id)
            .await?
            .into_iter()
            .map(|c| c.skill_id)
            .collect();

        Ok(StatusReport {
            skill_id: skill_id.to_string(),
            version: record.version,
            state: record.state,
            state_since: record.state_since,
            metrics_as_of: metrics.as_of,
            metrics,
            pending_executions,
            lagging,
            candidates,
        })
    }
}
