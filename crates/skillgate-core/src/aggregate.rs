//! Batch aggregator: folds new append-layer records into the aggregate layer.
//!
//! The aggregator is the only writer of the aggregate store. For each stream
//! it reads forward from the summary's cursor (`events_folded`), folds records
//! in log order, writes the touched time buckets and then the summary. The
//! summary write advances the cursor, so a crash in between re-reads the same
//! records next time; buckets skip offsets they already hold.
//!
//! Gate and monitor decisions therefore see data that is up to one batch
//! interval old.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use skillgate_state::{AggregateBucket, AggregateStore, AggregateSummary, ExecutionLog, StreamKey};
use tokio::sync::watch;
use tracing::{instrument, warn};

use crate::domain::Result;
use crate::metrics::METRICS;
use crate::obs;
use crate::schedule::run_every;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub interval: Duration,
    pub bucket_secs: i64,
    pub recent_capacity: usize,
    pub batch_limit: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3_600),
            bucket_secs: 3_600,
            recent_capacity: 100,
            batch_limit: 1_000,
        }
    }
}

/// What one batch run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub streams_scanned: usize,
    pub streams_advanced: usize,
    pub records_folded: u64,
    /// Streams that failed this round, with the error. They are retried next
    /// round from their unchanged cursor.
    pub failures: Vec<(String, String)>,
}

pub struct Aggregator {
    log: Arc<dyn ExecutionLog>,
    store: Arc<dyn AggregateStore>,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(
        log: Arc<dyn ExecutionLog>,
        store: Arc<dyn AggregateStore>,
        config: AggregatorConfig,
    ) -> Self {
        Self { log, store, config }
    }

    /// Fold everything appended since the previous run.
    #[instrument(skip(self))]
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let streams = self.log.streams().await?;
        let mut report = BatchReport {
            streams_scanned: streams.len(),
            ..BatchReport::default()
        };

        for stream in &streams {
            match self.fold_stream(stream).await {
                Ok(0) => {}
                Ok(n) => {
                    report.streams_advanced += 1;
                    report.records_folded += n;
                }
                Err(e) => {
                    warn!(stream = %stream, error = %e, "failed to fold stream");
                    report.failures.push((stream.to_string(), e.to_string()));
                }
            }
        }

        METRICS.inc_batches();
        obs::emit_batch_folded(report.streams_advanced, report.records_folded);
        Ok(report)
    }

    async fn fold_stream(&self, stream: &StreamKey) -> Result<u64> {
        let existing = self.store.summary(stream).await?;
        let had_summary = existing.is_some();
        let mut summary = existing.unwrap_or_else(|| {
            AggregateSummary::new(
                stream.skill_id.clone(),
                stream.version,
                self.config.recent_capacity,
            )
        });

        let mut folded = 0u64;
        loop {
            let base = summary.events_folded;
            let batch = self
                .log
                .read_from(stream, base, self.config.batch_limit)
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut touched: BTreeMap<i64, AggregateBucket> = BTreeMap::new();
            for (i, record) in batch.iter().enumerate() {
                let start = AggregateBucket::start_for(record.timestamp, self.config.bucket_secs);
                if !touched.contains_key(&start) {
                    let bucket = self.store.bucket(stream, start).await?.unwrap_or_else(|| {
                        AggregateBucket::new(
                            stream.skill_id.clone(),
                            stream.version,
                            start,
                            self.config.bucket_secs,
                        )
                    });
                    touched.insert(start, bucket);
                }
                if let Some(bucket) = touched.get_mut(&start) {
                    bucket.absorb_at(base + i as u64, record);
                }
                summary.absorb(record);
            }

            for bucket in touched.values() {
                self.store.put_bucket(bucket).await?;
            }
            summary.last_updated = Utc::now();
            self.store.put_summary(&summary).await?;

            folded += batch.len() as u64;
            if batch.len() < self.config.batch_limit {
                break;
            }
        }

        // Nothing new: refresh the timestamp so readers know it is current.
        if folded == 0 && had_summary {
            summary.last_updated = Utc::now();
            self.store.put_summary(&summary).await?;
        }
        Ok(folded)
    }

    /// Run a batch every `interval` until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        run_every("aggregator", self.config.interval, shutdown, || async move {
            if let Err(e) = self.run_batch().await {
                warn!(error = %e, "aggregation batch failed");
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration};
    use skillgate_state::fakes::{MemoryAggregateStore, MemoryExecutionLog};
    use skillgate_state::{ExecutionRecord, TimeWindow};
    use uuid::Uuid;

    fn record(ts: DateTime<Utc>, fidelity: f64, exception: bool) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: Uuid::new_v4(),
            skill_id: "greeting".into(),
            skill_version: 1,
            timestamp: ts,
            steps: vec![],
            overall_fidelity: fidelity,
            outcome_correct: None,
            duration_ms: 5,
            exception: exception.then(|| "boom".to_string()),
        }
    }

    fn setup(limit: usize) -> (Arc<MemoryExecutionLog>, Arc<MemoryAggregateStore>, Aggregator) {
        let log = Arc::new(MemoryExecutionLog::new());
        let store = Arc::new(MemoryAggregateStore::new());
        let agg = Aggregator::new(
            log.clone(),
            store.clone(),
            AggregatorConfig {
                batch_limit: limit,
                ..AggregatorConfig::default()
            },
        );
        (log, store, agg)
    }

    #[tokio::test]
    async fn folds_only_new_records() {
        let (log, store, agg) = setup(1_000);
        let now = Utc::now();
        for _ in 0..3 {
            log.append(&record(now, 1.0, false)).await.unwrap();
        }
        assert_eq!(agg.run_batch().await.unwrap().records_folded, 3);

        log.append(&record(now, 0.0, true)).await.unwrap();
        let report = agg.run_batch().await.unwrap();
        assert_eq!(report.records_folded, 1);

        let summary = store
            .summary(&StreamKey::new("greeting", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.events_folded, 4);
        assert_eq!(summary.execution_count, 4);
        assert_eq!(summary.avg_fidelity(), 0.75);
        assert_eq!(summary.exception_rate(), 0.25);
    }

    #[tokio::test]
    async fn small_batch_limit_still_drains_the_stream() {
        let (log, store, agg) = setup(2);
        let now = Utc::now();
        for _ in 0..5 {
            log.append(&record(now, 1.0, false)).await.unwrap();
        }
        let report = agg.run_batch().await.unwrap();
        assert_eq!(report.records_folded, 5);

        let stream = StreamKey::new("greeting", 1);
        let buckets = store.buckets(&stream, &TimeWindow::all()).await.unwrap();
        let total: u64 = buckets.iter().map(|b| b.execution_count).sum();
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn late_arrivals_land_in_their_own_bucket() {
        let (log, store, agg) = setup(1_000);
        let now = Utc::now();
        log.append(&record(now, 1.0, false)).await.unwrap();
        log.append(&record(now - ChronoDuration::hours(5), 0.0, false))
            .await
            .unwrap();
        agg.run_batch().await.unwrap();

        let stream = StreamKey::new("greeting", 1);
        let buckets = store.buckets(&stream, &TimeWindow::all()).await.unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].avg_fidelity(), 0.0);
        assert_eq!(buckets[1].avg_fidelity(), 1.0);

        let summary = store.summary(&stream).await.unwrap().unwrap();
        assert_eq!(summary.recent.front().unwrap().fidelity, 0.0);
    }

    #[tokio::test]
    async fn refold_after_lost_summary_does_not_double_count_buckets() {
        let (log, store, agg) = setup(1_000);
        let now = Utc::now();
        for _ in 0..4 {
            log.append(&record(now, 1.0, false)).await.unwrap();
        }
        agg.run_batch().await.unwrap();

        // Simulate a crash between the bucket writes and the summary write.
        let stream = StreamKey::new("greeting", 1);
        let mut stale = store.summary(&stream).await.unwrap().unwrap();
        stale = AggregateSummary::new(stale.skill_id, stale.version, stale.recent_capacity);
        store.put_summary(&stale).await.unwrap();

        agg.run_batch().await.unwrap();
        let buckets = store.buckets(&stream, &TimeWindow::all()).await.unwrap();
        let total: u64 = buckets.iter().map(|b| b.execution_count).sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn idle_stream_refreshes_last_updated() {
        let (log, store, agg) = setup(1_000);
        log.append(&record(Utc::now(), 1.0, false)).await.unwrap();
        agg.run_batch().await.unwrap();
        let stream = StreamKey::new("greeting", 1);
        let first = store.summary(&stream).await.unwrap().unwrap().last_updated;

        let report = agg.run_batch().await.unwrap();
        assert_eq!(report.records_folded, 0);
        let second = store.summary(&stream).await.unwrap().unwrap().last_updated;
        assert!(second >= first);
    }
}
