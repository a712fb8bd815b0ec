//! Storage seams for the skill pipeline.
//!
//! - `ExecutionLog`: append-only execution streams (fast layer)
//! - `AggregateStore`: folded summaries and time buckets (slow layer)
//! - `RegistryStore`: skill state, content and conditional updates
//! - `ApprovalLog` / `LifecycleLog`: append-only audit records
//!
//! All traits are async and backend-agnostic. `fakes` holds in-memory
//! versions for tests; `fs` and `surreal_aggregate` hold durable ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::schema::{
    AggregateBucket, AggregateSummary, ApprovalRecord, ContentLocation, ExecutionRecord,
    LifecycleEvent, LifecycleState, RegistryChange, RegistryRecord, StreamKey, TimeWindow,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Content digest
// ---------------------------------------------------------------------------

/// SHA-256 of a skill's serialized content, lowercase hex.
///
/// Constructed only via `from_bytes` or the validating `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }

    /// Check `data` against this digest.
    pub fn verify(&self, location: &ContentLocation, data: &[u8]) -> StorageResult<()> {
        let actual = ContentDigest::from_bytes(data);
        if &actual != self {
            return Err(StorageError::DigestMismatch {
                location: location.to_string(),
                expected: self.0.clone(),
                actual: actual.0,
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ExecutionLog: append layer
// ---------------------------------------------------------------------------

/// Append-only execution streams, one per `(skill_id, version)`.
///
/// Guarantees:
/// - `append` is durable when it returns `Ok`.
/// - Concurrent appends never lose or interleave records.
/// - `read_from(stream, n)` returns records in append order starting at
///   offset `n`; offsets are stable forever.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> StorageResult<()>;

    /// Records at or after `offset`, at most `limit` of them.
    async fn read_from(
        &self,
        stream: &StreamKey,
        offset: u64,
        limit: usize,
    ) -> StorageResult<Vec<ExecutionRecord>>;

    /// Number of complete records in the stream.
    async fn len(&self, stream: &StreamKey) -> StorageResult<u64>;

    /// Every stream that has at least one record.
    async fn streams(&self) -> StorageResult<Vec<StreamKey>>;
}

// ---------------------------------------------------------------------------
// AggregateStore: slow layer
// ---------------------------------------------------------------------------

/// Folded metrics. Written only by the aggregator.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn summary(&self, stream: &StreamKey) -> StorageResult<Option<AggregateSummary>>;

    async fn put_summary(&self, summary: &AggregateSummary) -> StorageResult<()>;

    async fn bucket(
        &self,
        stream: &StreamKey,
        bucket_start: i64,
    ) -> StorageResult<Option<AggregateBucket>>;

    async fn put_bucket(&self, bucket: &AggregateBucket) -> StorageResult<()>;

    /// Buckets whose start lies in `[window.from, window.to)`, oldest first.
    async fn buckets(
        &self,
        stream: &StreamKey,
        window: &TimeWindow,
    ) -> StorageResult<Vec<AggregateBucket>>;
}

// ---------------------------------------------------------------------------
// RegistryStore: authoritative skill state
// ---------------------------------------------------------------------------

/// Skill records plus their content.
///
/// Guarantees:
/// - `commit` is all-or-nothing: after it returns, either the record, the
///   content location and the revision all reflect the change, or none do.
/// - A commit whose `expected_revision` is stale fails with
///   `RevisionConflict` and changes nothing.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get(&self, skill_id: &str) -> StorageResult<Option<RegistryRecord>>;

    /// All records, optionally filtered by state, ordered by skill id.
    async fn list(&self, state: Option<LifecycleState>) -> StorageResult<Vec<RegistryRecord>>;

    /// Records created with `parent_id` as their parent, ordered by skill id.
    /// Parent links never change, so backends may index them at creation.
    async fn children(&self, parent_id: &str) -> StorageResult<Vec<RegistryRecord>>;

    /// Raw bytes at `location`.
    async fn read_content(&self, location: &ContentLocation) -> StorageResult<Vec<u8>>;

    async fn commit(&self, change: RegistryChange) -> StorageResult<RegistryRecord>;
}

// ---------------------------------------------------------------------------
// Audit logs
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ApprovalLog: Send + Sync {
    async fn append(&self, approval: &ApprovalRecord) -> StorageResult<()>;

    /// Approvals for `skill_id`, oldest first.
    async fn for_skill(&self, skill_id: &str) -> StorageResult<Vec<ApprovalRecord>>;
}

#[async_trait]
pub trait LifecycleLog: Send + Sync {
    async fn append(&self, event: &LifecycleEvent) -> StorageResult<()>;

    /// Events for `skill_id`, oldest first.
    async fn history(&self, skill_id: &str) -> StorageResult<Vec<LifecycleEvent>>;
}

/// Reject ids that could escape a storage root or collide with path syntax.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key.starts_with('.');
    if !ok {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}
