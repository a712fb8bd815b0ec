//! Rollback monitor.
//!
//! Each tick looks at every `production` and `staged` skill and steps it back
//! one state when its recent aggregate metrics breach the floor or the
//! exception ceiling. Rollbacks never wait on an approval. A skill that was
//! just stepped back is left alone for the cooldown.
//!
//! Evidence is scoped to the current state: only executions timestamped at or
//! after `state_since` count, so a rollback does not cascade into a second
//! demotion on the same samples.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use skillgate_state::{LifecycleEvent, LifecycleLog, LifecycleState, MetricSnapshot};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{Result, SkillError};
use crate::lifecycle::{classify, fallback_target, record_event, TransitionKind};
use crate::metrics::METRICS;
use crate::obs;
use crate::query::MetricsQuery;
use crate::registry::{Expected, SkillRegistry};
use crate::schedule::run_every;

pub const MONITOR_ACTOR: &str = "rollback-monitor";

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Strictly below every skill's promotion threshold.
    pub rollback_floor: f64,
    pub exception_ceiling: f64,
    /// Recent executions a breach must be sustained over.
    pub window: usize,
    pub cooldown: Duration,
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rollback_floor: 0.85,
            exception_ceiling: 0.05,
            window: 10,
            cooldown: Duration::from_secs(3_600),
            poll_interval: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "breach", rename_all = "snake_case")]
pub enum Breach {
    LowFidelity { avg: f64, floor: f64, samples: u64 },
    ExceptionRate { rate: f64, ceiling: f64, samples: u64 },
}

impl Breach {
    pub fn reason(&self) -> String {
        match self {
            Breach::LowFidelity { avg, floor, samples } => format!(
                "avg fidelity {avg:.3} over the last {samples} executions is below floor {floor:.3}"
            ),
            Breach::ExceptionRate {
                rate,
                ceiling,
                samples,
            } => format!(
                "exception rate {:.1}% over {samples} executions exceeds {:.1}%",
                rate * 100.0,
                ceiling * 100.0
            ),
        }
    }
}

/// A sustained breach in `snapshot`, if any. Fewer than `window` recent
/// samples is never a breach.
pub fn check_breach(snapshot: &MetricSnapshot, config: &MonitorConfig) -> Option<Breach> {
    let window = config.window.max(1) as u64;
    if snapshot.recent_count >= window && snapshot.recent_avg_fidelity < config.rollback_floor {
        return Some(Breach::LowFidelity {
            avg: snapshot.recent_avg_fidelity,
            floor: config.rollback_floor,
            samples: snapshot.recent_count,
        });
    }
    if snapshot.exception_sample_count >= window
        && snapshot.recent_exception_rate > config.exception_ceiling
    {
        return Some(Breach::ExceptionRate {
            rate: snapshot.recent_exception_rate,
            ceiling: config.exception_ceiling,
            samples: snapshot.exception_sample_count,
        });
    }
    None
}

/// One automatic step back.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackAction {
    pub skill_id: String,
    pub version: u64,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub breach: Breach,
    pub snapshot: MetricSnapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorReport {
    pub checked: usize,
    pub actions: Vec<RollbackAction>,
    pub failures: Vec<(String, String)>,
}

pub struct RollbackMonitor {
    registry: Arc<SkillRegistry>,
    metrics: MetricsQuery,
    history: Arc<dyn LifecycleLog>,
    config: MonitorConfig,
    last_triggered: Mutex<HashMap<String, Instant>>,
}

impl RollbackMonitor {
    pub fn new(
        registry: Arc<SkillRegistry>,
        metrics: MetricsQuery,
        history: Arc<dyn LifecycleLog>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            history,
            config,
            last_triggered: Mutex::new(HashMap::new()),
        }
    }

    fn cooling_down(&self, skill_id: &str) -> bool {
        let map = self.last_triggered.lock().unwrap_or_else(|e| e.into_inner());
        map.get(skill_id)
            .map(|at| at.elapsed() < self.config.cooldown)
            .unwrap_or(false)
    }

    fn start_cooldown(&self, skill_id: &str) {
        let mut map = self.last_triggered.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(skill_id.to_string(), Instant::now());
    }

    /// One polling cycle.
    pub async fn tick(&self) -> Result<MonitorReport> {
        let mut report = MonitorReport::default();

        for state in [LifecycleState::Production, LifecycleState::Staged] {
            for record in self.registry.list_records(Some(state)).await? {
                report.checked += 1;
                if self.cooling_down(&record.skill_id) {
                    debug!(skill_id = %record.skill_id, "in rollback cooldown");
                    continue;
                }

                let snapshot = self
                    .metrics
                    .snapshot(&record.skill_id, record.version, Some(record.state_since))
                    .await?;
                let Some(breach) = check_breach(&snapshot, &self.config) else {
                    continue;
                };
                let Some(to) = fallback_target(record.state) else {
                    continue;
                };

                obs::emit_rollback_triggered(&record.skill_id, to, &breach.reason(), &snapshot);
                let expected = Expected::of(&record);
                match self.registry.set_state(&record.skill_id, expected, to, None).await {
                    Ok(updated) => {
                        self.start_cooldown(&record.skill_id);
                        METRICS.inc_rollbacks();

                        let kind = classify(record.state, to)
                            .unwrap_or(TransitionKind::Rollback)
                            .event_kind();
                        let event = LifecycleEvent::new(
                            kind,
                            &record.skill_id,
                            updated.version,
                            Some(record.state),
                            to,
                            MONITOR_ACTOR,
                        )
                        .with_snapshot(snapshot.clone())
                        .with_reason(breach.reason());
                        record_event(self.history.as_ref(), self.registry.retry_policy(), &event)
                            .await;

                        report.actions.push(RollbackAction {
                            skill_id: record.skill_id.clone(),
                            version: updated.version,
                            from: record.state,
                            to,
                            breach,
                            snapshot,
                        });
                    }
                    Err(SkillError::StaleRecord { state, version, .. }) => {
                        debug!(
                            skill_id = %record.skill_id,
                            %state,
                            version,
                            "skill moved since the breach was read; skipping"
                        );
                    }
                    Err(e) => {
                        warn!(skill_id = %record.skill_id, error = %e, "automatic rollback failed");
                        report.failures.push((record.skill_id.clone(), e.to_string()));
                    }
                }
            }
        }
        Ok(report)
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        run_every("rollback_monitor", self.config.poll_interval, shutdown, || async move {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "rollback monitor tick failed");
            }
        })
        .await;
    }
}
