//! In-memory implementations of the storage traits (testing only)
//!
//! `MemoryRegistryStore`, `MemoryExecutionLog` and `MemoryAggregateStore` can
//! inject failures, and the registry also latency, so callers' retry and
//! timeout paths can be exercised.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::commit::plan_commit;
use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

/// Consume one unit of injected failure, if any is pending.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// MemoryExecutionLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryExecutionLog {
    streams: Mutex<BTreeMap<StreamKey, Vec<ExecutionRecord>>>,
    fail_next: AtomicU32,
}

impl MemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with `StorageError::Unavailable`.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total records across all streams.
    pub fn total(&self) -> usize {
        self.streams.lock().unwrap().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ExecutionLog for MemoryExecutionLog {
    async fn append(&self, record: &ExecutionRecord) -> StorageResult<()> {
        if take_failure(&self.fail_next) {
            return Err(StorageError::Unavailable("injected append failure".into()));
        }
        let mut streams = self.streams.lock().unwrap();
        streams
            .entry(record.stream())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_from(
        &self,
        stream: &StreamKey,
        offset: u64,
        limit: usize,
    ) -> StorageResult<Vec<ExecutionRecord>> {
        let streams = self.streams.lock().unwrap();
        Ok(streams
            .get(stream)
            .map(|records| {
                records
                    .iter()
                    .skip(offset as usize)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn len(&self, stream: &StreamKey) -> StorageResult<u64> {
        let streams = self.streams.lock().unwrap();
        Ok(streams.get(stream).map(|r| r.len() as u64).unwrap_or(0))
    }

    async fn streams(&self) -> StorageResult<Vec<StreamKey>> {
        let streams = self.streams.lock().unwrap();
        Ok(streams.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryAggregateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    summaries: Mutex<HashMap<StreamKey, AggregateSummary>>,
    buckets: Mutex<BTreeMap<(StreamKey, i64), AggregateBucket>>,
    fail_next: AtomicU32,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` summary reads fail with `StorageError::Unavailable`.
    pub fn fail_next_summaries(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn summary(&self, stream: &StreamKey) -> StorageResult<Option<AggregateSummary>> {
        if take_failure(&self.fail_next) {
            return Err(StorageError::Unavailable("injected summary failure".into()));
        }
        Ok(self.summaries.lock().unwrap().get(stream).cloned())
    }

    async fn put_summary(&self, summary: &AggregateSummary) -> StorageResult<()> {
        let key = StreamKey::new(summary.skill_id.clone(), summary.version);
        self.summaries.lock().unwrap().insert(key, summary.clone());
        Ok(())
    }

    async fn bucket(
        &self,
        stream: &StreamKey,
        bucket_start: i64,
    ) -> StorageResult<Option<AggregateBucket>> {
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets.get(&(stream.clone(), bucket_start)).cloned())
    }

    async fn put_bucket(&self, bucket: &AggregateBucket) -> StorageResult<()> {
        let key = (
            StreamKey::new(bucket.skill_id.clone(), bucket.version),
            bucket.bucket_start,
        );
        self.buckets.lock().unwrap().insert(key, bucket.clone());
        Ok(())
    }

    async fn buckets(
        &self,
        stream: &StreamKey,
        window: &TimeWindow,
    ) -> StorageResult<Vec<AggregateBucket>> {
        let from = window.from.timestamp();
        let to = window.to.timestamp();
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets
            .iter()
            .filter(|((key, start), _)| key == stream && *start >= from && *start < to)
            .map(|(_, b)| b.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryRegistryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryInner {
    records: BTreeMap<String, RegistryRecord>,
    content: HashMap<String, Vec<u8>>,
    children: HashMap<String, BTreeSet<String>>,
}

/// In-memory registry. Each commit applies under a single lock, so readers
/// never observe a half-applied change.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    inner: Mutex<RegistryInner>,
    fail_next: AtomicU32,
    commit_delay_ms: AtomicU64,
    commits: AtomicU64,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with `StorageError::Unavailable`.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Sleep this long before every commit.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Commits that were applied successfully.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Whether any bytes are stored at `location`.
    pub fn has_content(&self, location: &ContentLocation) -> bool {
        self.inner
            .lock()
            .unwrap()
            .content
            .contains_key(location.as_str())
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn get(&self, skill_id: &str) -> StorageResult<Option<RegistryRecord>> {
        Ok(self.inner.lock().unwrap().records.get(skill_id).cloned())
    }

    async fn list(&self, state: Option<LifecycleState>) -> StorageResult<Vec<RegistryRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .values()
            .filter(|r| state.map(|s| r.state == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn children(&self, parent_id: &str) -> StorageResult<Vec<RegistryRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .children
            .get(parent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect())
    }

    async fn read_content(&self, location: &ContentLocation) -> StorageResult<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .content
            .get(location.as_str())
            .cloned()
            .ok_or_else(|| StorageError::ContentNotFound {
                location: location.to_string(),
            })
    }

    async fn commit(&self, change: RegistryChange) -> StorageResult<RegistryRecord> {
        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take_failure(&self.fail_next) {
            return Err(StorageError::Unavailable("injected commit failure".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        let current = inner.records.get(&change.skill_id).cloned();
        let current_content = current
            .as_ref()
            .and_then(|r| inner.content.get(r.location.as_str()).cloned());
        let plan = plan_commit(current.as_ref(), current_content, change, Utc::now())?;

        if let Some((location, bytes)) = plan.archive {
            inner.content.insert(location.as_str().to_string(), bytes);
        }
        if let Some(old) = &plan.remove {
            inner.content.remove(old.as_str());
        }
        inner
            .content
            .insert(plan.record.location.as_str().to_string(), plan.content);
        if let Some(parent) = &plan.record.parent {
            inner
                .children
                .entry(parent.skill_id.clone())
                .or_default()
                .insert(plan.record.skill_id.clone());
        }
        inner
            .records
            .insert(plan.record.skill_id.clone(), plan.record.clone());
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(plan.record)
    }
}

// ---------------------------------------------------------------------------
// Audit logs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryApprovalLog {
    approvals: Mutex<Vec<ApprovalRecord>>,
}

impl MemoryApprovalLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalLog for MemoryApprovalLog {
    async fn append(&self, approval: &ApprovalRecord) -> StorageResult<()> {
        validate_key(&approval.skill_id)?;
        self.approvals.lock().unwrap().push(approval.clone());
        Ok(())
    }

    async fn for_skill(&self, skill_id: &str) -> StorageResult<Vec<ApprovalRecord>> {
        let approvals = self.approvals.lock().unwrap();
        Ok(approvals
            .iter()
            .filter(|a| a.skill_id == skill_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLifecycleLog {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryLifecycleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LifecycleLog for MemoryLifecycleLog {
    async fn append(&self, event: &LifecycleEvent) -> StorageResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn history(&self, skill_id: &str) -> StorageResult<Vec<LifecycleEvent>> {
        let events = self.events.lock().unwrap();
        Ok(events
            .iter()
            .filter(|e| e.skill_id == skill_id)
            .cloned()
            .collect())
    }
}
