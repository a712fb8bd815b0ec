//! Structured observability hooks for pipeline events.
//!
//! Each function emits one event with a stable `event` field so logs can be
//! filtered by kind. Verbosity is controlled through `SKILLGATE_LOG`.

use skillgate_state::{LifecycleState, MetricSnapshot};
use tracing::{info, warn};

/// Span scoping one execution. Attach with `tracing::Instrument` so it
/// survives awaits on a multi-threaded runtime.
pub fn execution_span(execution_id: &str, skill_id: &str, version: u64) -> tracing::Span {
    tracing::info_span!(
        "skillgate.execution",
        execution_id = %execution_id,
        skill_id = %skill_id,
        version = version,
    )
}

pub fn emit_execution_recorded(
    skill_id: &str,
    version: u64,
    fidelity: f64,
    steps: usize,
    exception: bool,
) {
    info!(
        event = "execution.recorded",
        skill_id = %skill_id,
        version = version,
        fidelity = fidelity,
        steps_attempted = steps,
        exception = exception,
    );
}

pub fn emit_step_failed(skill_id: &str, step_index: usize, reason: &str) {
    info!(
        event = "execution.step_failed",
        skill_id = %skill_id,
        step_index = step_index,
        reason = %reason,
    );
}

pub fn emit_append_failed(skill_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "execution.append_failed", skill_id = %skill_id, error = %error);
}

pub fn emit_batch_folded(streams: usize, records: u64) {
    info!(event = "aggregate.batch_folded", streams = streams, records = records);
}

pub fn emit_gate_evaluated(skill_id: &str, target: LifecycleState, decision: &str) {
    info!(
        event = "gate.evaluated",
        skill_id = %skill_id,
        target = %target,
        decision = %decision,
    );
}

pub fn emit_state_changed(skill_id: &str, version: u64, from: LifecycleState, to: LifecycleState) {
    info!(
        event = "registry.state_changed",
        skill_id = %skill_id,
        version = version,
        from = %from,
        to = %to,
    );
}

pub fn emit_registry_retry(operation: &str, attempt: u32, error: &str) {
    warn!(
        event = "registry.retry",
        operation = %operation,
        attempt = attempt,
        error = %error,
    );
}

pub fn emit_rollback_triggered(
    skill_id: &str,
    to: LifecycleState,
    reason: &str,
    snapshot: &MetricSnapshot,
) {
    warn!(
        event = "monitor.rollback_triggered",
        skill_id = %skill_id,
        to = %to,
        reason = %reason,
        recent_avg_fidelity = snapshot.recent_avg_fidelity,
        recent_exception_rate = snapshot.recent_exception_rate,
        recent_count = snapshot.recent_count,
    );
}

pub fn emit_variation_spawned(parent_id: &str, candidate_id: &str, target_step: usize) {
    info!(
        event = "variation.spawned",
        parent_id = %parent_id,
        candidate_id = %candidate_id,
        target_step = target_step,
    );
}

pub fn emit_variation_concluded(
    parent_id: &str,
    candidate_id: &str,
    winner: &str,
    baseline_avg: f64,
    candidate_avg: f64,
) {
    info!(
        event = "variation.concluded",
        parent_id = %parent_id,
        candidate_id = %candidate_id,
        winner = %winner,
        baseline_avg = baseline_avg,
        candidate_avg = candidate_avg,
    );
}
