//! Promotion gate.
//!
//! [`evaluate_promotion`] is a pure function of the registry record, the
//! skill, its aggregate snapshot and the recorded approvals. The
//! [`PromotionGate`] gathers those inputs, and `promote` acts on an
//! `Approved` decision.
//!
//! Metric checks apply to `staged -> production` only; `prototype -> staged`
//! is gated on the approval checklist alone.

use std::sync::Arc;

use serde::Serialize;
use skillgate_state::{
    ApprovalLog, ApprovalRecord, LifecycleEvent, LifecycleEventKind, LifecycleLog, LifecycleState,
    MetricSnapshot, RegistryRecord,
};
use uuid::Uuid;

use crate::approval::ApprovalPolicy;
use crate::domain::{Result, Skill, SkillError};
use crate::lifecycle::{promotion_target, record_event};
use crate::metrics::METRICS;
use crate::obs;
use crate::query::MetricsQuery;
use crate::registry::{Expected, SkillRegistry};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approved { approval_id: Uuid },
    NotReady { count: u64, required: u64 },
    BlockedLowFidelity { avg: f64, threshold: f64 },
    BlockedNoApproval { reason: String },
    /// No promotion edge leaves the current state.
    NotPromotable { state: LifecycleState },
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approved { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Approved { .. } => "approved",
            Decision::NotReady { .. } => "not_ready",
            Decision::BlockedLowFidelity { .. } => "blocked_low_fidelity",
            Decision::BlockedNoApproval { .. } => "blocked_no_approval",
            Decision::NotPromotable { .. } => "not_promotable",
        }
    }
}

/// Decide whether `record` may advance one step.
pub fn evaluate_promotion(
    record: &RegistryRecord,
    skill: &Skill,
    snapshot: &MetricSnapshot,
    approvals: &[ApprovalRecord],
    policy: &ApprovalPolicy,
) -> Decision {
    let Some(target) = promotion_target(record.state) else {
        return Decision::NotPromotable {
            state: record.state,
        };
    };

    if target == LifecycleState::Production {
        if snapshot.execution_count < skill.min_executions_for_promotion {
            return Decision::NotReady {
                count: snapshot.execution_count,
                required: skill.min_executions_for_promotion,
            };
        }
        if snapshot.avg_fidelity < skill.fidelity_threshold {
            return Decision::BlockedLowFidelity {
                avg: snapshot.avg_fidelity,
                threshold: skill.fidelity_threshold,
            };
        }
    }

    match policy.find_valid(approvals, record, target) {
        Some(approval) => Decision::Approved {
            approval_id: approval.approval_id,
        },
        None => Decision::BlockedNoApproval {
            reason: policy.explain_missing(approvals, record, target),
        },
    }
}

/// Everything a promotion decision was based on.
#[derive(Debug, Clone, Serialize)]
pub struct GateEvaluation {
    pub skill_id: String,
    pub version: u64,
    pub from: LifecycleState,
    pub target: Option<LifecycleState>,
    pub decision: Decision,
    pub snapshot: MetricSnapshot,
    #[serde(skip)]
    approval: Option<ApprovalRecord>,
}

pub struct PromotionGate {
    registry: Arc<SkillRegistry>,
    metrics: MetricsQuery,
    approvals: Arc<dyn ApprovalLog>,
    history: Arc<dyn LifecycleLog>,
}

impl PromotionGate {
    pub fn new(
        registry: Arc<SkillRegistry>,
        metrics: MetricsQuery,
        approvals: Arc<dyn ApprovalLog>,
        history: Arc<dyn LifecycleLog>,
    ) -> Self {
        Self {
            registry,
            metrics,
            approvals,
            history,
        }
    }

    /// Gather inputs and decide, without changing anything.
    pub async fn evaluate(&self, skill_id: &str) -> Result<GateEvaluation> {
        let record = self.registry.record(skill_id).await?;
        let skill = self.registry.get(skill_id).await?;
        let snapshot = self.metrics.snapshot(skill_id, record.version, None).await?;
        let approvals = self.approvals.for_skill(skill_id).await?;

        let decision = evaluate_promotion(
            &record,
            &skill,
            &snapshot,
            &approvals,
            self.registry.policy(),
        );
        let target = promotion_target(record.state);
        if let Some(to) = target {
            obs::emit_gate_evaluated(skill_id, to, decision.label());
        }

        let approval = match &decision {
            Decision::Approved { approval_id } => approvals
                .into_iter()
                .find(|a| a.approval_id == *approval_id),
            _ => None,
        };
        Ok(GateEvaluation {
            skill_id: skill_id.to_string(),
            version: record.version,
            from: record.state,
            target,
            decision,
            snapshot,
            approval,
        })
    }

    /// Advance `skill_id` one step if the gate approves; otherwise the
    /// decision becomes the matching error and nothing changes.
    pub async fn promote(&self, skill_id: &str, actor: &str) -> Result<RegistryRecord> {
        let eval = self.evaluate(skill_id).await?;
        let from = eval.from;

        let (target, approval) = match (eval.decision, eval.target, eval.approval) {
            (Decision::Approved { .. }, Some(target), Some(approval)) => (target, approval),
            (Decision::NotReady { count, required }, _, _) => {
                return Err(SkillError::NotReady {
                    skill_id: skill_id.to_string(),
                    count,
                    required,
                })
            }
            (Decision::BlockedLowFidelity { avg, threshold }, _, _) => {
                return Err(SkillError::LowFidelity {
                    skill_id: skill_id.to_string(),
                    avg,
                    threshold,
                })
            }
            (Decision::BlockedNoApproval { reason }, Some(to), _) => {
                return Err(SkillError::ApprovalMissing {
                    skill_id: skill_id.to_string(),
                    from,
                    to,
                    reason,
                })
            }
            (Decision::NotPromotable { state }, _, _) if state.is_terminal() => {
                return Err(SkillError::SkillRetired(skill_id.to_string()))
            }
            _ => {
                return Err(SkillError::InvalidTransition {
                    skill_id: skill_id.to_string(),
                    from,
                    to: from,
                })
            }
        };

        let updated = self
            .registry
            .set_state(
                skill_id,
                Expected {
                    state: from,
                    version: eval.version,
                },
                target,
                Some(&approval),
            )
            .await?;
        METRICS.inc_promotions();

        let event = LifecycleEvent::new(
            LifecycleEventKind::Promotion,
            skill_id,
            updated.version,
            Some(from),
            target,
            actor,
        )
        .with_snapshot(eval.snapshot)
        .with_approval(approval.approval_id);
        record_event(self.history.as_ref(), self.registry.retry_policy(), &event).await;
        Ok(updated)
    }
}
