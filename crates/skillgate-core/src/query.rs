//! Read side of the aggregate layer. The gate, the monitor and the variation
//! manager only ever look at metrics through this type, never at the log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use skillgate_state::{AggregateStore, AggregateSummary, MetricSnapshot, StreamKey, TimeWindow};

use crate::domain::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Totals {
    count: u64,
    fidelity_sum: f64,
    exceptions: u64,
}

#[derive(Clone)]
pub struct MetricsQuery {
    store: Arc<dyn AggregateStore>,
    bucket_secs: i64,
    /// Recent-sample window used for snapshots.
    window: usize,
}

impl MetricsQuery {
    pub fn new(store: Arc<dyn AggregateStore>, bucket_secs: i64, window: usize) -> Self {
        Self {
            store,
            bucket_secs,
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Bucket totals over `window`, widened to whole buckets.
    async fn totals(&self, stream: &StreamKey, window: &TimeWindow) -> Result<Totals> {
        let aligned = window.aligned(self.bucket_secs);
        let buckets = self.store.buckets(stream, &aligned).await?;
        Ok(buckets.iter().fold(Totals::default(), |acc, b| Totals {
            count: acc.count + b.execution_count,
            fidelity_sum: acc.fidelity_sum + b.fidelity_sum,
            exceptions: acc.exceptions + b.exception_count,
        }))
    }

    pub async fn count(&self, skill_id: &str, version: u64, window: &TimeWindow) -> Result<u64> {
        let stream = StreamKey::new(skill_id, version);
        Ok(self.totals(&stream, window).await?.count)
    }

    /// `None` when no executions fall in the window.
    pub async fn avg_fidelity(
        &self,
        skill_id: &str,
        version: u64,
        window: &TimeWindow,
    ) -> Result<Option<f64>> {
        let t = self.totals(&StreamKey::new(skill_id, version), window).await?;
        Ok((t.count > 0).then(|| t.fidelity_sum / t.count as f64))
    }

    /// `None` when no executions fall in the window.
    pub async fn exception_rate(
        &self,
        skill_id: &str,
        version: u64,
        window: &TimeWindow,
    ) -> Result<Option<f64>> {
        let t = self.totals(&StreamKey::new(skill_id, version), window).await?;
        Ok((t.count > 0).then(|| t.exceptions as f64 / t.count as f64))
    }

    pub async fn summary(&self, skill_id: &str, version: u64) -> Result<Option<AggregateSummary>> {
        Ok(self.store.summary(&StreamKey::new(skill_id, version)).await?)
    }

    /// Current figures for one version. Recent figures only use executions at
    /// or after `since`. A version that was never folded yields an empty
    /// snapshot with `as_of == None`.
    pub async fn snapshot(
        &self,
        skill_id: &str,
        version: u64,
        since: Option<DateTime<Utc>>,
    ) -> Result<MetricSnapshot> {
        self.snapshot_over(skill_id, version, since, self.window).await
    }

    /// [`snapshot`](Self::snapshot) with an explicit recent window. The
    /// window is bounded by the aggregator's recent-sample capacity.
    pub async fn snapshot_over(
        &self,
        skill_id: &str,
        version: u64,
        since: Option<DateTime<Utc>>,
        window: usize,
    ) -> Result<MetricSnapshot> {
        Ok(self
            .summary(skill_id, version)
            .await?
            .map(|s| s.snapshot(window.max(1), since))
            .unwrap_or_default())
    }

    /// Pass rate per step index; empty when never folded.
    pub async fn step_pass_rates(&self, skill_id: &str, version: u64) -> Result<Vec<f64>> {
        Ok(self
            .summary(skill_id, version)
            .await?
            .map(|s| s.step_pass_rates())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use skillgate_state::fakes::MemoryAggregateStore;
    use skillgate_state::AggregateBucket;

    async fn seeded() -> MetricsQuery {
        let store = Arc::new(MemoryAggregateStore::new());
        let now = Utc::now();
        let recent = AggregateBucket::start_for(now - Duration::hours(1), 3_600);
        let old = AggregateBucket::start_for(now - Duration::days(3), 3_600);

        let mut b = AggregateBucket::new("greeting", 1, recent, 3_600);
        b.execution_count = 10;
        b.fidelity_sum = 9.0;
        b.exception_count = 1;
        store.put_bucket(&b).await.unwrap();

        let mut b = AggregateBucket::new("greeting", 1, old, 3_600);
        b.execution_count = 10;
        b.fidelity_sum = 5.0;
        store.put_bucket(&b).await.unwrap();

        MetricsQuery::new(store, 3_600, 10)
    }

    #[tokio::test]
    async fn windowed_queries_use_buckets() {
        let q = seeded().await;
        let day = TimeWindow::last(Duration::days(1), Utc::now());

        assert_eq!(q.count("greeting", 1, &day).await.unwrap(), 10);
        assert_eq!(q.avg_fidelity("greeting", 1, &day).await.unwrap(), Some(0.9));
        assert_eq!(q.exception_rate("greeting", 1, &day).await.unwrap(), Some(0.1));

        assert_eq!(q.count("greeting", 1, &TimeWindow::all()).await.unwrap(), 20);
        assert_eq!(q.avg_fidelity("greeting", 1, &TimeWindow::all()).await.unwrap(), Some(0.7));
    }

    #[tokio::test]
    async fn empty_window_has_no_average() {
        let q = seeded().await;
        let day = TimeWindow::last(Duration::days(1), Utc::now());
        assert_eq!(q.avg_fidelity("greeting", 2, &day).await.unwrap(), None);
        assert_eq!(q.count("other", 1, &day).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn snapshot_of_unfolded_version_is_empty() {
        let q = seeded().await;
        let snap = q.snapshot("greeting", 1, None).await.unwrap();
        assert_eq!(snap.execution_count, 0);
        assert!(snap.as_of.is_none());
        assert!(q.step_pass_rates("greeting", 1).await.unwrap().is_empty());
    }
}
