//! Record types persisted by the storage layer.
//!
//! - `ExecutionRecord`: one immutable run of a skill (append layer)
//! - `AggregateSummary` / `AggregateBucket`: folded metrics (aggregate layer)
//! - `RegistryRecord`: authoritative lifecycle state and content location
//! - `ApprovalRecord`: a recorded authorization for one transition
//! - `LifecycleEvent`: append-only audit of promotions, rollbacks and archives

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage_traits::ContentDigest;

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

/// Trust level of a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Prototype,
    Staged,
    Production,
    Retired,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 4] = [
        LifecycleState::Prototype,
        LifecycleState::Staged,
        LifecycleState::Production,
        LifecycleState::Retired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Prototype => "prototype",
            LifecycleState::Staged => "staged",
            LifecycleState::Production => "production",
            LifecycleState::Retired => "retired",
        }
    }

    /// Retired skills never leave that state.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Retired)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown lifecycle state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lifecycle state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for LifecycleState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Append layer
// ---------------------------------------------------------------------------

/// Identifies one append-only stream: all executions of one skill version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub skill_id: String,
    pub version: u64,
}

impl StreamKey {
    pub fn new(skill_id: impl Into<String>, version: u64) -> Self {
        Self {
            skill_id: skill_id.into(),
            version,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.skill_id, self.version)
    }
}

/// Outcome of one attempted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    pub step_index: usize,
    pub output_summary: String,
    pub validation_passed: bool,
}

/// One run of a skill against one task. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub skill_id: String,
    pub skill_version: u64,
    pub timestamp: DateTime<Utc>,
    /// Attempted steps only; a halted chain records fewer than the skill declares.
    pub steps: Vec<StepAttempt>,
    /// passed / attempted, always in [0, 1].
    pub overall_fidelity: f64,
    #[serde(default)]
    pub outcome_correct: Option<bool>,
    pub duration_ms: u64,
    #[serde(default)]
    pub exception: Option<String>,
}

impl ExecutionRecord {
    pub fn steps_passed(&self) -> usize {
        self.steps.iter().filter(|s| s.validation_passed).count()
    }

    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.skill_id.clone(), self.skill_version)
    }
}

// ---------------------------------------------------------------------------
// Aggregate layer
// ---------------------------------------------------------------------------

/// Point-in-time view of a skill version's aggregate metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricSnapshot {
    pub execution_count: u64,
    pub avg_fidelity: f64,
    pub exception_rate: f64,
    #[serde(default)]
    pub outcome_accuracy: Option<f64>,
    /// Samples used for `recent_avg_fidelity` (at most the monitor window).
    pub recent_count: u64,
    pub recent_avg_fidelity: f64,
    /// Samples used for `recent_exception_rate`.
    pub exception_sample_count: u64,
    pub recent_exception_rate: f64,
    /// When the aggregate layer last folded this version. `None` if never.
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

/// Per-step attempt and pass counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepStat {
    pub attempts: u64,
    pub passed: u64,
}

impl StepStat {
    pub fn pass_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.passed as f64 / self.attempts as f64
    }
}

/// One execution as remembered by the recent-sample window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentSample {
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub fidelity: f64,
    pub exception: bool,
}

/// Running totals for one `(skill_id, version)`.
///
/// `events_folded` is the cursor into the append-layer stream; the aggregator
/// is the only writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub skill_id: String,
    pub version: u64,
    pub events_folded: u64,
    pub execution_count: u64,
    pub fidelity_sum: f64,
    pub exception_count: u64,
    pub outcome_known: u64,
    pub outcome_correct: u64,
    pub duration_ms_total: u64,
    pub step_stats: Vec<StepStat>,
    /// Ordered by execution timestamp, oldest first.
    pub recent: VecDeque<RecentSample>,
    pub recent_capacity: usize,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
}

impl AggregateSummary {
    pub fn new(skill_id: impl Into<String>, version: u64, recent_capacity: usize) -> Self {
        Self {
            skill_id: skill_id.into(),
            version,
            events_folded: 0,
            execution_count: 0,
            fidelity_sum: 0.0,
            exception_count: 0,
            outcome_known: 0,
            outcome_correct: 0,
            duration_ms_total: 0,
            step_stats: Vec::new(),
            recent: VecDeque::new(),
            recent_capacity: recent_capacity.max(1),
            last_updated: Utc::now(),
            last_event_at: None,
        }
    }

    /// Fold one execution into the totals and advance the cursor.
    pub fn absorb(&mut self, record: &ExecutionRecord) {
        self.events_folded += 1;
        self.execution_count += 1;
        self.fidelity_sum += record.overall_fidelity.clamp(0.0, 1.0);
        self.duration_ms_total = self.duration_ms_total.saturating_add(record.duration_ms);
        if record.exception.is_some() {
            self.exception_count += 1;
        }
        if let Some(correct) = record.outcome_correct {
            self.outcome_known += 1;
            if correct {
                self.outcome_correct += 1;
            }
        }

        for attempt in &record.steps {
            if self.step_stats.len() <= attempt.step_index {
                self.step_stats
                    .resize(attempt.step_index + 1, StepStat::default());
            }
            let stat = &mut self.step_stats[attempt.step_index];
            stat.attempts += 1;
            if attempt.validation_passed {
                stat.passed += 1;
            }
        }

        let sample = RecentSample {
            execution_id: record.execution_id,
            timestamp: record.timestamp,
            fidelity: record.overall_fidelity.clamp(0.0, 1.0),
            exception: record.exception.is_some(),
        };
        // Late arrivals are slotted in by timestamp, not arrival order.
        let pos = self
            .recent
            .iter()
            .rposition(|s| s.timestamp <= sample.timestamp)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.recent.insert(pos, sample);
        while self.recent.len() > self.recent_capacity {
            self.recent.pop_front();
        }

        self.last_event_at = Some(match self.last_event_at {
            Some(prev) if prev > record.timestamp => prev,
            _ => record.timestamp,
        });
    }

    pub fn avg_fidelity(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.fidelity_sum / self.execution_count as f64
    }

    pub fn exception_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.exception_count as f64 / self.execution_count as f64
    }

    pub fn outcome_accuracy(&self) -> Option<f64> {
        if self.outcome_known == 0 {
            return None;
        }
        Some(self.outcome_correct as f64 / self.outcome_known as f64)
    }

    pub fn step_pass_rates(&self) -> Vec<f64> {
        self.step_stats.iter().map(StepStat::pass_rate).collect()
    }

    /// Build a snapshot whose recent figures only use samples at or after
    /// `since` (all samples when `None`). Fidelity is averaged over the newest
    /// `window` of them; the exception rate over all of them.
    pub fn snapshot(&self, window: usize, since: Option<DateTime<Utc>>) -> MetricSnapshot {
        let eligible: Vec<&RecentSample> = self
            .recent
            .iter()
            .filter(|s| since.map(|t| s.timestamp >= t).unwrap_or(true))
            .collect();

        let newest = &eligible[eligible.len().saturating_sub(window)..];
        let recent_avg_fidelity = if newest.is_empty() {
            0.0
        } else {
            newest.iter().map(|s| s.fidelity).sum::<f64>() / newest.len() as f64
        };
        let recent_exception_rate = if eligible.is_empty() {
            0.0
        } else {
            eligible.iter().filter(|s| s.exception).count() as f64 / eligible.len() as f64
        };

        MetricSnapshot {
            execution_count: self.execution_count,
            avg_fidelity: self.avg_fidelity(),
            exception_rate: self.exception_rate(),
            outcome_accuracy: self.outcome_accuracy(),
            recent_count: newest.len() as u64,
            recent_avg_fidelity,
            exception_sample_count: eligible.len() as u64,
            recent_exception_rate,
            as_of: Some(self.last_updated),
        }
    }
}

/// Fixed-width time bucket for range queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub skill_id: String,
    pub version: u64,
    /// Unix seconds, aligned to `bucket_secs`.
    pub bucket_start: i64,
    pub bucket_secs: i64,
    pub execution_count: u64,
    pub fidelity_sum: f64,
    pub exception_count: u64,
    pub duration_ms_total: u64,
    /// One past the highest append-log offset folded in.
    #[serde(default)]
    pub folded_through: u64,
}

impl AggregateBucket {
    pub fn new(
        skill_id: impl Into<String>,
        version: u64,
        bucket_start: i64,
        bucket_secs: i64,
    ) -> Self {
        Self {
            skill_id: skill_id.into(),
            version,
            bucket_start,
            bucket_secs,
            execution_count: 0,
            fidelity_sum: 0.0,
            exception_count: 0,
            duration_ms_total: 0,
            folded_through: 0,
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn start_for(ts: DateTime<Utc>, bucket_secs: i64) -> i64 {
        let width = bucket_secs.max(1);
        ts.timestamp().div_euclid(width) * width
    }

    pub fn absorb(&mut self, record: &ExecutionRecord) {
        self.execution_count += 1;
        self.fidelity_sum += record.overall_fidelity.clamp(0.0, 1.0);
        self.duration_ms_total = self.duration_ms_total.saturating_add(record.duration_ms);
        if record.exception.is_some() {
            self.exception_count += 1;
        }
    }

    /// Absorb the record at append-log `offset` unless it was already
    /// folded. Offsets must be offered in increasing order.
    pub fn absorb_at(&mut self, offset: u64, record: &ExecutionRecord) -> bool {
        if offset < self.folded_through {
            return false;
        }
        self.absorb(record);
        self.folded_through = offset + 1;
        true
    }

    pub fn avg_fidelity(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.fidelity_sum / self.execution_count as f64
    }
}

/// Half-open time range `[from, to)` for aggregate queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The `span` ending at `now`.
    pub fn last(span: Duration, now: DateTime<Utc>) -> Self {
        Self {
            from: now - span,
            to: now,
        }
    }

    /// Everything representable.
    pub fn all() -> Self {
        Self {
            from: DateTime::<Utc>::MIN_UTC,
            to: DateTime::<Utc>::MAX_UTC,
        }
    }

    /// Widen to whole buckets so partially covered buckets are included.
    pub fn aligned(&self, bucket_secs: i64) -> Self {
        let width = bucket_secs.max(1);
        let from = AggregateBucket::start_for(self.from, width);
        let to_ts = self.to.timestamp();
        let to = if to_ts.rem_euclid(width) == 0 {
            to_ts
        } else {
            AggregateBucket::start_for(self.to, width).saturating_add(width)
        };
        Self {
            from: Utc.timestamp_opt(from, 0).single().unwrap_or(self.from),
            to: Utc.timestamp_opt(to, 0).single().unwrap_or(self.to),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Physical location of a skill's authoritative content, relative to the
/// backend's content root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentLocation(String);

impl ContentLocation {
    pub fn for_state(state: LifecycleState, skill_id: &str, version: u64) -> Self {
        ContentLocation(format!("{}/{}/v{}.json", state.as_str(), skill_id, version))
    }

    /// Where a superseded version is kept for audit.
    pub fn archived(skill_id: &str, version: u64) -> Self {
        ContentLocation(format!("archive/{}/v{}.json", skill_id, version))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Back-reference from a variation candidate to the skill it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub skill_id: String,
    pub version: u64,
}

/// A superseded version whose content moved to the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedVersion {
    pub version: u64,
    pub location: ContentLocation,
    pub content_digest: ContentDigest,
    pub archived_at: DateTime<Utc>,
}

/// The registry's view of one skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub skill_id: String,
    pub version: u64,
    pub state: LifecycleState,
    pub location: ContentLocation,
    pub content_digest: ContentDigest,
    /// Bumped on every committed change; used for conditional updates.
    pub revision: u64,
    /// When the skill entered `state`.
    pub state_since: DateTime<Utc>,
    #[serde(default)]
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub archived_versions: Vec<ArchivedVersion>,
    pub updated_at: DateTime<Utc>,
}

/// A conditional change submitted to a `RegistryStore`.
///
/// - `expected_revision == None` registers a new skill; `content` is required.
/// - Otherwise the change applies only if the stored revision matches.
///   `content == None` moves the existing bytes to the new location; a
///   higher `version` archives the previous content.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryChange {
    pub skill_id: String,
    pub expected_revision: Option<u64>,
    pub version: u64,
    pub state: LifecycleState,
    pub content: Option<Vec<u8>>,
    pub parent: Option<ParentRef>,
}

impl RegistryChange {
    pub fn create(
        skill_id: impl Into<String>,
        version: u64,
        state: LifecycleState,
        content: Vec<u8>,
        parent: Option<ParentRef>,
    ) -> Self {
        Self {
            skill_id: skill_id.into(),
            expected_revision: None,
            version,
            state,
            content: Some(content),
            parent,
        }
    }

    /// Move `record` to `state`, optionally rewriting its content in place.
    pub fn transition(
        record: &RegistryRecord,
        state: LifecycleState,
        content: Option<Vec<u8>>,
    ) -> Self {
        Self {
            skill_id: record.skill_id.clone(),
            expected_revision: Some(record.revision),
            version: record.version,
            state,
            content,
            parent: record.parent.clone(),
        }
    }

    /// Replace `record`'s content with a new version in the same state.
    pub fn new_version(record: &RegistryRecord, version: u64, content: Vec<u8>) -> Self {
        Self {
            skill_id: record.skill_id.clone(),
            expected_revision: Some(record.revision),
            version,
            state: record.state,
            content: Some(content),
            parent: record.parent.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// A recorded authorization for one specific transition of one skill version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: Uuid,
    pub skill_id: String,
    pub skill_version: u64,
    pub from_state: LifecycleState,
    pub to_state: LifecycleState,
    pub approver_id: String,
    pub checklist: BTreeMap<String, bool>,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn new(
        skill_id: impl Into<String>,
        skill_version: u64,
        from_state: LifecycleState,
        to_state: LifecycleState,
        approver_id: impl Into<String>,
        checklist: BTreeMap<String, bool>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            approval_id: Uuid::new_v4(),
            skill_id: skill_id.into(),
            skill_version,
            from_state,
            to_state,
            approver_id: approver_id.into(),
            checklist,
            timestamp: now,
        }
    }

    /// Names of checklist items recorded as `false`.
    pub fn failed_checks(&self) -> Vec<&str> {
        self.checklist
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Non-empty checklist with no `false` entry.
    pub fn is_fully_checked(&self) -> bool {
        !self.checklist.is_empty() && self.checklist.values().all(|ok| *ok)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Registered,
    Promotion,
    Demotion,
    Rollback,
    Retirement,
    VariationSpawned,
    BaselineReplaced,
    CandidateArchived,
}

/// Append-only audit entry for a lifecycle change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: Uuid,
    pub kind: LifecycleEventKind,
    pub skill_id: String,
    pub version: u64,
    #[serde(default)]
    pub from: Option<LifecycleState>,
    pub to: LifecycleState,
    #[serde(default)]
    pub approval_id: Option<Uuid>,
    /// Metrics that justified the change, when metrics were involved.
    #[serde(default)]
    pub snapshot: Option<MetricSnapshot>,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        kind: LifecycleEventKind,
        skill_id: impl Into<String>,
        version: u64,
        from: Option<LifecycleState>,
        to: LifecycleState,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            skill_id: skill_id.into(),
            version,
            from,
            to,
            approval_id: None,
            snapshot: None,
            actor: actor.into(),
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: MetricSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_approval(mut self, approval_id: Uuid) -> Self {
        self.approval_id = Some(approval_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_at(ts: DateTime<Utc>, fidelity: f64, exception: bool) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: Uuid::new_v4(),
            skill_id: "greeting".into(),
            skill_version: 1,
            timestamp: ts,
            steps: vec![
                StepAttempt {
                    step_index: 0,
                    output_summary: "ok".into(),
                    validation_passed: true,
                },
                StepAttempt {
                    step_index: 1,
                    output_summary: "bad".into(),
                    validation_passed: fidelity >= 1.0,
                },
            ],
            overall_fidelity: fidelity,
            outcome_correct: None,
            duration_ms: 10,
            exception: exception.then(|| "boom".to_string()),
        }
    }

    #[test]
    fn lifecycle_state_parses_case_insensitively() {
        assert_eq!("Staged".parse::<LifecycleState>(), Ok(LifecycleState::Staged));
        assert_eq!(
            " production ".parse::<LifecycleState>(),
            Ok(LifecycleState::Production)
        );
        assert!("live".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn lifecycle_state_serializes_snake_case() {
        let json = serde_json::to_string(&LifecycleState::Production).unwrap();
        assert_eq!(json, "\"production\"");
    }

    #[test]
    fn summary_absorb_tracks_totals_and_steps() {
        let now = Utc::now();
        let mut summary = AggregateSummary::new("greeting", 1, 10);
        summary.absorb(&record_at(now, 1.0, false));
        summary.absorb(&record_at(now, 0.5, true));

        assert_eq!(summary.events_folded, 2);
        assert_eq!(summary.execution_count, 2);
        assert!((summary.avg_fidelity() - 0.75).abs() < 1e-9);
        assert!((summary.exception_rate() - 0.5).abs() < 1e-9);
        assert_eq!(summary.step_stats.len(), 2);
        assert_eq!(summary.step_stats[0].passed, 2);
        assert_eq!(summary.step_stats[1].passed, 1);
        assert_eq!(summary.step_pass_rates(), vec![1.0, 0.5]);
    }

    #[test]
    fn recent_samples_stay_ordered_under_late_arrival() {
        let now = Utc::now();
        let mut summary = AggregateSummary::new("greeting", 1, 3);
        summary.absorb(&record_at(now, 1.0, false));
        summary.absorb(&record_at(now + Duration::seconds(2), 1.0, false));
        // Arrives late but happened in between.
        summary.absorb(&record_at(now + Duration::seconds(1), 0.0, false));

        let stamps: Vec<_> = summary.recent.iter().map(|s| s.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);

        // A sample older than everything is dropped once capacity is full.
        summary.absorb(&record_at(now - Duration::seconds(10), 0.0, false));
        assert_eq!(summary.recent.len(), 3);
        assert!(summary.recent.iter().all(|s| s.timestamp >= now));
    }

    #[test]
    fn snapshot_respects_window_and_since() {
        let start = Utc::now();
        let mut summary = AggregateSummary::new("greeting", 1, 100);
        for i in 0..5 {
            summary.absorb(&record_at(start + Duration::seconds(i), 1.0, false));
        }
        let cutoff = start + Duration::seconds(10);
        for i in 0..4 {
            summary.absorb(&record_at(cutoff + Duration::seconds(i), 0.5, i == 0));
        }

        let all = summary.snapshot(3, None);
        assert_eq!(all.recent_count, 3);
        assert!((all.recent_avg_fidelity - 0.5).abs() < 1e-9);
        assert_eq!(all.exception_sample_count, 9);

        let scoped = summary.snapshot(10, Some(cutoff));
        assert_eq!(scoped.recent_count, 4);
        assert_eq!(scoped.exception_sample_count, 4);
        assert!((scoped.recent_exception_rate - 0.25).abs() < 1e-9);
        assert_eq!(scoped.execution_count, 9);
    }

    #[test]
    fn bucket_start_aligns_down() {
        let ts = Utc.timestamp_opt(7_250, 0).unwrap();
        assert_eq!(AggregateBucket::start_for(ts, 3_600), 3_600);
    }

    #[test]
    fn bucket_skips_already_folded_offsets() {
        let now = Utc::now();
        let mut bucket = AggregateBucket::new("greeting", 1, 0, 3_600);
        assert!(bucket.absorb_at(0, &record_at(now, 1.0, false)));
        assert!(bucket.absorb_at(1, &record_at(now, 0.5, false)));
        assert!(!bucket.absorb_at(1, &record_at(now, 0.5, false)));
        assert_eq!(bucket.execution_count, 2);
        assert_eq!(bucket.folded_through, 2);
    }

    #[test]
    fn window_alignment_covers_partial_buckets() {
        let from = Utc.timestamp_opt(3_700, 0).unwrap();
        let to = Utc.timestamp_opt(7_300, 0).unwrap();
        let aligned = TimeWindow::new(from, to).aligned(3_600);
        assert_eq!(aligned.from.timestamp(), 3_600);
        assert_eq!(aligned.to.timestamp(), 10_800);
    }

    #[test]
    fn approval_checklist_with_false_is_not_fully_checked() {
        let mut checklist = BTreeMap::new();
        checklist.insert("tests_complete".to_string(), true);
        checklist.insert("security_reviewed".to_string(), false);
        let approval = ApprovalRecord::new(
            "greeting",
            1,
            LifecycleState::Staged,
            LifecycleState::Production,
            "alice",
            checklist,
            Utc::now(),
        );
        assert!(!approval.is_fully_checked());
        assert_eq!(approval.failed_checks(), vec!["security_reviewed"]);
    }

    #[test]
    fn empty_checklist_is_not_fully_checked() {
        let approval = ApprovalRecord::new(
            "greeting",
            1,
            LifecycleState::Prototype,
            LifecycleState::Staged,
            "alice",
            BTreeMap::new(),
            Utc::now(),
        );
        assert!(!approval.is_fully_checked());
    }

    #[test]
    fn content_locations_encode_state_and_version() {
        let loc = ContentLocation::for_state(LifecycleState::Staged, "greeting", 2);
        assert_eq!(loc.as_str(), "staged/greeting/v2.json");
        assert_eq!(
            ContentLocation::archived("greeting", 1).as_str(),
            "archive/greeting/v1.json"
        );
    }
}
