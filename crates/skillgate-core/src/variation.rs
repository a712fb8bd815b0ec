//! Variation manager: A/B trials for skills stuck between the rollback floor
//! and their promotion threshold.
//!
//! `scan` spawns candidates for marginal skills, each a copy of the parent
//! with the weakest step's instructions rewritten by a [`VariationStrategy`].
//! Candidates live in the registry at `prototype` with a parent link, so an
//! in-flight trial is rebuilt from the registry and the aggregates after a
//! restart. `evaluate_trials` concludes a trial once the baseline (counted
//! from the trial start) and every candidate have a full evaluation window.
//! A strictly better leading candidate becomes the parent's next version;
//! every candidate of the trial is archived either way.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use skillgate_state::{
    LifecycleEvent, LifecycleEventKind, LifecycleLog, LifecycleState, MetricSnapshot, ParentRef,
    RegistryRecord,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::{Result, Skill, Step};
use crate::lifecycle::record_event;
use crate::metrics::METRICS;
use crate::obs;
use crate::query::MetricsQuery;
use crate::registry::SkillRegistry;
use crate::schedule::run_every;

pub const VARIATION_ACTOR: &str = "variation-manager";

#[derive(Debug, Clone, PartialEq)]
pub struct VariationConfig {
    /// Lower edge of the marginal band.
    pub rollback_floor: f64,
    /// Executions each side needs before a trial is decided.
    pub evaluation_window: u64,
    pub candidates_per_round: usize,
    pub min_baseline_executions: u64,
    pub scan_interval: Duration,
}

impl Default for VariationConfig {
    fn default() -> Self {
        Self {
            rollback_floor: 0.85,
            evaluation_window: 100,
            candidates_per_round: 1,
            min_baseline_executions: 100,
            scan_interval: Duration::from_secs(3_600),
        }
    }
}

/// Produces alternative step lists for a skill.
pub trait VariationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Steps for the `attempt`-th candidate (1-based) targeting `target_step`.
    fn vary(&self, skill: &Skill, target_step: usize, attempt: usize) -> Vec<Step>;
}

/// Appends an explicit reminder of the step's validation rule to the weakest
/// step. Successive attempts use increasingly direct wording.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmphasisStrategy;

const EMPHASIS: [&str; 3] = [
    "Before answering, make sure the output satisfies: {rule}.",
    "Your output is checked mechanically. It must satisfy: {rule}. Re-check it before you finish.",
    "Output that does not satisfy {rule} is rejected. Produce nothing else.",
];

impl VariationStrategy for EmphasisStrategy {
    fn name(&self) -> &str {
        "emphasis"
    }

    fn vary(&self, skill: &Skill, target_step: usize, attempt: usize) -> Vec<Step> {
        let template = EMPHASIS[attempt.saturating_sub(1) % EMPHASIS.len()];
        skill
            .steps
            .iter()
            .map(|step| {
                if step.index != target_step {
                    return step.clone();
                }
                let rule = step.validation_pattern.describe();
                Step {
                    index: step.index,
                    instructions: format!(
                        "{}\n\n{}",
                        step.instructions.trim_end(),
                        template.replace("{rule}", &rule)
                    ),
                    validation_pattern: step.validation_pattern.clone(),
                }
            })
            .collect()
    }
}

/// Lowest pass rate wins; ties go to the earlier step. Falls back to step 0.
pub fn weakest_step(pass_rates: &[f64]) -> usize {
    pass_rates
        .iter()
        .enumerate()
        .fold(None::<(usize, f64)>, |best, (i, &rate)| match best {
            Some((_, b)) if b <= rate => best,
            _ => Some((i, rate)),
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

pub fn candidate_id(parent_id: &str, parent_version: u64, ordinal: usize) -> String {
    format!("{parent_id}.v{parent_version}.c{ordinal}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Baseline,
    Candidate,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialOutcome {
    pub parent_id: String,
    pub parent_version: u64,
    pub leading_candidate: String,
    pub baseline_avg: f64,
    pub candidate_avg: f64,
    pub winner: Winner,
    /// Parent version after the trial when the candidate won.
    pub new_version: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VariationReport {
    pub spawned: Vec<String>,
    pub concluded: Vec<TrialOutcome>,
    /// Candidates archived because their parent moved on without them.
    pub archived_stale: Vec<String>,
    pub failures: Vec<(String, String)>,
}

pub struct VariationManager {
    registry: Arc<SkillRegistry>,
    metrics: MetricsQuery,
    history: Arc<dyn LifecycleLog>,
    strategy: Arc<dyn VariationStrategy>,
    config: VariationConfig,
}

impl VariationManager {
    pub fn new(
        registry: Arc<SkillRegistry>,
        metrics: MetricsQuery,
        history: Arc<dyn LifecycleLog>,
        config: VariationConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            history,
            strategy: Arc::new(EmphasisStrategy),
            config,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn VariationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Conclude finished trials, then look for new marginal skills.
    pub async fn tick(&self) -> Result<VariationReport> {
        let mut report = VariationReport::default();
        self.evaluate_trials(&mut report).await?;
        self.scan(&mut report).await?;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Spawning
    // -----------------------------------------------------------------------

    /// Spawn candidates for skills whose fidelity sits in
    /// `[rollback_floor, fidelity_threshold)` and have no trial running.
    pub async fn scan(&self, report: &mut VariationReport) -> Result<()> {
        let all = self.registry.list_records(None).await?;

        for record in all.iter().filter(|r| is_baseline(r)) {
            let busy = all.iter().any(|c| {
                c.state != LifecycleState::Retired
                    && c.parent.as_ref().map(|p| p.skill_id == record.skill_id).unwrap_or(false)
            });
            if busy {
                continue;
            }
            if let Err(e) = self.maybe_spawn(record, &all, report).await {
                warn!(skill_id = %record.skill_id, error = %e, "variation spawn failed");
                report.failures.push((record.skill_id.clone(), e.to_string()));
            }
        }
        Ok(())
    }

    async fn maybe_spawn(
        &self,
        record: &RegistryRecord,
        all: &[RegistryRecord],
        report: &mut VariationReport,
    ) -> Result<()> {
        let skill = self.registry.get(&record.skill_id).await?;
        let snapshot = self.metrics.snapshot(&record.skill_id, record.version, None).await?;
        if snapshot.execution_count < self.config.min_baseline_executions {
            return Ok(());
        }
        let avg = snapshot.avg_fidelity;
        if avg < self.config.rollback_floor || avg >= skill.fidelity_threshold {
            return Ok(());
        }

        let rates = self.metrics.step_pass_rates(&record.skill_id, record.version).await?;
        let target = weakest_step(&rates).min(skill.steps.len().saturating_sub(1));

        // Ordinals continue after earlier rounds against the same version.
        let earlier = all
            .iter()
            .filter(|c| {
                c.parent
                    .as_ref()
                    .map(|p| p.skill_id == record.skill_id && p.version == record.version)
                    .unwrap_or(false)
            })
            .count();

        let parent = ParentRef {
            skill_id: record.skill_id.clone(),
            version: record.version,
        };
        for attempt in 1..=self.config.candidates_per_round {
            let id = candidate_id(&record.skill_id, record.version, earlier + attempt);
            let candidate = Skill {
                id: id.clone(),
                version: 1,
                lifecycle_state: LifecycleState::Prototype,
                steps: self.strategy.vary(&skill, target, attempt),
                parent: Some(parent.clone()),
                ..skill.clone()
            };
            let registered = self
                .registry
                .register_candidate(&candidate, parent.clone())
                .await?;

            let event = LifecycleEvent::new(
                LifecycleEventKind::VariationSpawned,
                &id,
                registered.version,
                None,
                LifecycleState::Prototype,
                VARIATION_ACTOR,
            )
            .with_snapshot(snapshot.clone())
            .with_reason(format!(
                "{} variant of {}@v{} targeting step {target}",
                self.strategy.name(),
                record.skill_id,
                record.version
            ));
            record_event(self.history.as_ref(), self.registry.retry_policy(), &event).await;

            METRICS.inc_variations();
            obs::emit_variation_spawned(&record.skill_id, &id, target);
            report.spawned.push(id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Trials
    // -----------------------------------------------------------------------

    /// When the trial for `candidate` started: its spawn event, else the
    /// moment it entered its current state.
    async fn trial_start(&self, candidate: &RegistryRecord) -> Result<DateTime<Utc>> {
        let history = self.history.history(&candidate.skill_id).await?;
        Ok(history
            .iter()
            .find(|e| e.kind == LifecycleEventKind::VariationSpawned)
            .map(|e| e.at)
            .unwrap_or(candidate.state_since))
    }

    pub async fn evaluate_trials(&self, report: &mut VariationReport) -> Result<()> {
        let all = self.registry.list_records(None).await?;
        let by_id: BTreeMap<&str, &RegistryRecord> =
            all.iter().map(|r| (r.skill_id.as_str(), r)).collect();

        let mut trials: BTreeMap<&str, Vec<&RegistryRecord>> = BTreeMap::new();
        for candidate in all.iter().filter(|r| r.state != LifecycleState::Retired) {
            let Some(parent) = &candidate.parent else {
                continue;
            };
            let live_parent = by_id
                .get(parent.skill_id.as_str())
                .filter(|p| p.version == parent.version && !p.state.is_terminal());
            match live_parent {
                Some(_) => trials.entry(parent.skill_id.as_str()).or_default().push(candidate),
                None => {
                    let reason = format!(
                        "parent {}@v{} is no longer current",
                        parent.skill_id, parent.version
                    );
                    match self.archive(candidate, &reason, None).await {
                        Ok(()) => report.archived_stale.push(candidate.skill_id.clone()),
                        Err(e) => report.failures.push((candidate.skill_id.clone(), e.to_string())),
                    }
                }
            }
        }

        for (parent_id, candidates) in trials {
            let Some(parent) = by_id.get(parent_id) else {
                continue;
            };
            match self.conclude(parent, &candidates).await {
                Ok(Some(outcome)) => report.concluded.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    warn!(skill_id = %parent_id, error = %e, "variation trial failed");
                    report.failures.push((parent_id.to_string(), e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Decide the trial if every side has a full window.
    async fn conclude(
        &self,
        parent: &RegistryRecord,
        candidates: &[&RegistryRecord],
    ) -> Result<Option<TrialOutcome>> {
        let window = self.config.evaluation_window;
        let window_len = window as usize;

        let mut start = None::<DateTime<Utc>>;
        let mut scored: Vec<(&RegistryRecord, MetricSnapshot)> = Vec::new();
        for candidate in candidates {
            let trial_start = self.trial_start(candidate).await?;
            start = Some(start.map_or(trial_start, |s| s.min(trial_start)));
            let snap = self
                .metrics
                .snapshot_over(&candidate.skill_id, candidate.version, None, window_len)
                .await?;
            if snap.recent_count < window {
                return Ok(None);
            }
            scored.push((candidate, snap));
        }

        let baseline = self
            .metrics
            .snapshot_over(&parent.skill_id, parent.version, start, window_len)
            .await?;
        if baseline.recent_count < window {
            return Ok(None);
        }
        let baseline_avg = baseline.recent_avg_fidelity;

        // Highest windowed average leads; ties go to the lowest id.
        scored.sort_by(|a, b| a.0.skill_id.cmp(&b.0.skill_id));
        let mut leading: Option<&(&RegistryRecord, MetricSnapshot)> = None;
        for entry in &scored {
            if leading.map_or(true, |(_, best)| avg_of(&entry.1) > avg_of(best)) {
                leading = Some(entry);
            }
        }
        let Some((leader, leader_snap)) = leading.cloned() else {
            return Ok(None);
        };
        let candidate_avg = avg_of(&leader_snap);

        let (winner, new_version) = if candidate_avg > baseline_avg {
            let leader_skill = self.registry.get(&leader.skill_id).await?;
            let updated = self
                .registry
                .replace_baseline(&parent.skill_id, parent.version, leader_skill.steps)
                .await?;
            let event = LifecycleEvent::new(
                LifecycleEventKind::BaselineReplaced,
                &parent.skill_id,
                updated.version,
                Some(parent.state),
                updated.state,
                VARIATION_ACTOR,
            )
            .with_snapshot(leader_snap.clone())
            .with_reason(format!(
                "{} scored {candidate_avg:.3} against baseline {baseline_avg:.3}",
                leader.skill_id
            ));
            record_event(self.history.as_ref(), self.registry.retry_policy(), &event).await;
            (Winner::Candidate, Some(updated.version))
        } else {
            (Winner::Baseline, None)
        };

        for (candidate, snap) in &scored {
            let reason = match (winner, candidate.skill_id == leader.skill_id) {
                (Winner::Candidate, true) => format!(
                    "promoted into {}@v{}",
                    parent.skill_id,
                    new_version.unwrap_or(parent.version)
                ),
                _ => format!(
                    "trial concluded, {} kept at {baseline_avg:.3}",
                    if winner == Winner::Baseline { "baseline" } else { "leading candidate" }
                ),
            };
            self.archive(candidate, &reason, Some(snap.clone())).await?;
        }

        obs::emit_variation_concluded(
            &parent.skill_id,
            &leader.skill_id,
            match winner {
                Winner::Baseline => "baseline",
                Winner::Candidate => "candidate",
            },
            baseline_avg,
            candidate_avg,
        );
        info!(
            parent = %parent.skill_id,
            candidate = %leader.skill_id,
            ?winner,
            "variation trial concluded"
        );

        Ok(Some(TrialOutcome {
            parent_id: parent.skill_id.clone(),
            parent_version: parent.version,
            leading_candidate: leader.skill_id.clone(),
            baseline_avg,
            candidate_avg,
            winner,
            new_version,
        }))
    }

    async fn archive(
        &self,
        candidate: &RegistryRecord,
        reason: &str,
        snapshot: Option<MetricSnapshot>,
    ) -> Result<()> {
        let archived = self.registry.archive_candidate(&candidate.skill_id).await?;
        let mut event = LifecycleEvent::new(
            LifecycleEventKind::CandidateArchived,
            &candidate.skill_id,
            archived.version,
            Some(candidate.state),
            archived.state,
            VARIATION_ACTOR,
        )
        .with_reason(reason);
        if let Some(snapshot) = snapshot {
            event = event.with_snapshot(snapshot);
        }
        record_event(self.history.as_ref(), self.registry.retry_policy(), &event).await;
        Ok(())
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        run_every("variation_manager", self.config.scan_interval, shutdown, || async move {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "variation tick failed");
            }
        })
        .await;
    }
}

/// A skill that can be varied: live, serving, and not itself a candidate.
fn is_baseline(record: &RegistryRecord) -> bool {
    record.parent.is_none()
        && matches!(
            record.state,
            LifecycleState::Production | LifecycleState::Staged
        )
}

/// Average over the snapshot's window.
fn avg_of(snapshot: &MetricSnapshot) -> f64 {
    snapshot.recent_avg_fidelity
}
