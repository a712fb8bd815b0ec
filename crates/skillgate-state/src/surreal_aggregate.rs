//! SurrealDB-backed `AggregateStore`.
//!
//! Rows carry the lookup columns (`skill_id`, `version`, `bucket_start`) as
//! scalars and the full record as a JSON `payload`, converted at the boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::handle::SurrealHandle;
use crate::schema::{AggregateBucket, AggregateSummary, StreamKey, TimeWindow};
use crate::storage_traits::{AggregateStore, StorageResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbSummaryRow {
    skill_id: String,
    version: i64,
    events_folded: i64,
    payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbBucketRow {
    skill_id: String,
    version: i64,
    bucket_start: i64,
    payload: String,
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn version_col(version: u64) -> StorageResult<i64> {
    i64::try_from(version)
        .map_err(|_| StorageError::Backend(format!("version {version} out of range")))
}

/// Aggregate layer stored in SurrealDB.
pub struct SurrealAggregateStore {
    handle: SurrealHandle,
}

impl SurrealAggregateStore {
    pub fn new(handle: SurrealHandle) -> Self {
        Self { handle }
    }

    /// In-memory instance for tests.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(SurrealHandle::setup_db().await?))
    }

    fn summary_key(stream: &StreamKey) -> String {
        format!("{}@v{}", stream.skill_id, stream.version)
    }

    fn bucket_key(stream: &StreamKey, bucket_start: i64) -> String {
        format!("{}@v{}@{}", stream.skill_id, stream.version, bucket_start)
    }
}

#[async_trait]
impl AggregateStore for SurrealAggregateStore {
    async fn summary(&self, stream: &StreamKey) -> StorageResult<Option<AggregateSummary>> {
        let mut res = self
            .handle
            .db()
            .query(
                "SELECT * OMIT id FROM aggregate_summaries \
                 WHERE skill_id = $sid AND version = $ver",
            )
            .bind(("sid", stream.skill_id.clone()))
            .bind(("ver", version_col(stream.version)?))
            .await
            .map_err(backend)?;
        let rows: Vec<DbSummaryRow> = res.take(0).map_err(backend)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_str(&row.payload)?)),
            None => Ok(None),
        }
    }

    async fn put_summary(&self, summary: &AggregateSummary) -> StorageResult<()> {
        let stream = StreamKey::new(summary.skill_id.clone(), summary.version);
        let row = DbSummaryRow {
            skill_id: summary.skill_id.clone(),
            version: version_col(summary.version)?,
            events_folded: summary.events_folded as i64,
            payload: serde_json::to_string(summary)?,
        };
        debug!(stream = %stream, folded = summary.events_folded, "writing aggregate summary");

        self.handle
            .db()
            .query("UPSERT type::thing('aggregate_summaries', $key) CONTENT $row")
            .bind(("key", Self::summary_key(&stream)))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn bucket(
        &self,
        stream: &StreamKey,
        bucket_start: i64,
    ) -> StorageResult<Option<AggregateBucket>> {
        let mut res = self
            .handle
            .db()
            .query(
                "SELECT * OMIT id FROM aggregate_buckets \
                 WHERE skill_id = $sid AND version = $ver AND bucket_start = $start",
            )
            .bind(("sid", stream.skill_id.clone()))
            .bind(("ver", version_col(stream.version)?))
            .bind(("start", bucket_start))
            .await
            .map_err(backend)?;
        let rows: Vec<DbBucketRow> = res.take(0).map_err(backend)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_str(&row.payload)?)),
            None => Ok(None),
        }
    }

    async fn put_bucket(&self, bucket: &AggregateBucket) -> StorageResult<()> {
        let stream = StreamKey::new(bucket.skill_id.clone(), bucket.version);
        let row = DbBucketRow {
            skill_id: bucket.skill_id.clone(),
            version: version_col(bucket.version)?,
            bucket_start: bucket.bucket_start,
            payload: serde_json::to_string(bucket)?,
        };
        self.handle
            .db()
            .query("UPSERT type::thing('aggregate_buckets', $key) CONTENT $row")
            .bind(("key", Self::bucket_key(&stream, bucket.bucket_start)))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn buckets(
        &self,
        stream: &StreamKey,
        window: &TimeWindow,
    ) -> StorageResult<Vec<AggregateBucket>> {
        let mut res = self
            .handle
            .db()
            .query(
                "SELECT * OMIT id FROM aggregate_buckets \
                 WHERE skill_id = $sid AND version = $ver \
                 AND bucket_start >= $from AND bucket_start < $to \
                 ORDER BY bucket_start ASC",
            )
            .bind(("sid", stream.skill_id.clone()))
            .bind(("ver", version_col(stream.version)?))
            .bind(("from", window.from.timestamp()))
            .bind(("to", window.to.timestamp()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbBucketRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .map(|row| serde_json::from_str(&row.payload).map_err(StorageError::from))
            .collect()
    }
}
