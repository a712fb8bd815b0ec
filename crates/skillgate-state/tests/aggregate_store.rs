//! AggregateStore behavior against the in-memory fake and SurrealDB (mem://).

use chrono::{Duration, TimeZone, Utc};
use skillgate_state::fakes::MemoryAggregateStore;
use skillgate_state::storage_traits::AggregateStore;
use skillgate_state::{
    AggregateBucket, AggregateSummary, ExecutionRecord, StreamKey, SurrealAggregateStore,
    TimeWindow,
};
use uuid::Uuid;

fn execution(fidelity: f64) -> ExecutionRecord {
    ExecutionRecord {
        execution_id: Uuid::new_v4(),
        skill_id: "greeting".into(),
        skill_version: 1,
        timestamp: Utc::now(),
        steps: vec![],
        overall_fidelity: fidelity,
        outcome_correct: None,
        duration_ms: 3,
        exception: None,
    }
}

async fn summary_round_trips(store: &dyn AggregateStore) {
    let stream = StreamKey::new("greeting", 1);
    assert!(store.summary(&stream).await.unwrap().is_none());

    let mut summary = AggregateSummary::new("greeting", 1, 10);
    summary.absorb(&execution(1.0));
    summary.absorb(&execution(0.5));
    store.put_summary(&summary).await.unwrap();

    let loaded = store.summary(&stream).await.unwrap().unwrap();
    assert_eq!(loaded.events_folded, 2);
    assert_eq!(loaded.recent.len(), 2);
    assert!((loaded.avg_fidelity() - 0.75).abs() < 1e-9);

    // Overwrite, not duplicate.
    summary.absorb(&execution(0.0));
    store.put_summary(&summary).await.unwrap();
    let loaded = store.summary(&stream).await.unwrap().unwrap();
    assert_eq!(loaded.events_folded, 3);

    assert!(store
        .summary(&StreamKey::new("greeting", 2))
        .await
        .unwrap()
        .is_none());
}

async fn buckets_filter_by_window(store: &dyn AggregateStore) {
    let stream = StreamKey::new("greeting", 1);
    for start in [0_i64, 3_600, 7_200, 10_800] {
        let mut bucket = AggregateBucket::new("greeting", 1, start, 3_600);
        bucket.absorb(&execution(1.0));
        store.put_bucket(&bucket).await.unwrap();
    }
    let mut other = AggregateBucket::new("greeting", 2, 3_600, 3_600);
    other.absorb(&execution(0.0));
    store.put_bucket(&other).await.unwrap();

    let window = TimeWindow::new(
        Utc.timestamp_opt(3_600, 0).unwrap(),
        Utc.timestamp_opt(10_800, 0).unwrap(),
    );
    let starts: Vec<i64> = store
        .buckets(&stream, &window)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.bucket_start)
        .collect();
    assert_eq!(starts, vec![3_600, 7_200]);

    let single = store.bucket(&stream, 7_200).await.unwrap().unwrap();
    assert_eq!(single.execution_count, 1);
    assert!(store.bucket(&stream, 99).await.unwrap().is_none());
}

#[tokio::test]
async fn memory_aggregate_contracts() {
    summary_round_trips(&MemoryAggregateStore::new()).await;
    buckets_filter_by_window(&MemoryAggregateStore::new()).await;
}

#[tokio::test]
async fn surreal_aggregate_contracts() {
    summary_round_trips(&SurrealAggregateStore::in_memory().await.unwrap()).await;
    buckets_filter_by_window(&SurrealAggregateStore::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn surreal_window_of_last_day() {
    let store = SurrealAggregateStore::in_memory().await.unwrap();
    let now = Utc::now();
    let stale = now - Duration::days(3);

    for ts in [stale, now - Duration::hours(1)] {
        let start = AggregateBucket::start_for(ts, 3_600);
        let mut bucket = AggregateBucket::new("greeting", 1, start, 3_600);
        bucket.absorb(&execution(1.0));
        store.put_bucket(&bucket).await.unwrap();
    }

    let window = TimeWindow::last(Duration::days(1), now).aligned(3_600);
    let got = store
        .buckets(&StreamKey::new("greeting", 1), &window)
        .await
        .unwrap();
    assert_eq!(got.len(), 1);
}
