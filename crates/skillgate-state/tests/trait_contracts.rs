//! Contract tests for ExecutionLog, RegistryStore and the audit logs.
//!
//! Each contract runs against both the in-memory fakes and the filesystem
//! backends; any conforming implementation must pass them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use skillgate_state::fakes::{
    MemoryApprovalLog, MemoryExecutionLog, MemoryLifecycleLog, MemoryRegistryStore,
};
use skillgate_state::fs::{FsApprovalLog, FsExecutionLog, FsLifecycleLog, FsRegistryStore};
use skillgate_state::storage_traits::*;
use skillgate_state::{
    ApprovalRecord, ExecutionRecord, LifecycleEvent, LifecycleEventKind, LifecycleState,
    ParentRef, RegistryChange, StepAttempt, StorageError, StreamKey,
};
use uuid::Uuid;

fn execution(skill: &str, version: u64, fidelity: f64) -> ExecutionRecord {
    ExecutionRecord {
        execution_id: Uuid::new_v4(),
        skill_id: skill.to_string(),
        skill_version: version,
        timestamp: Utc::now(),
        steps: vec![StepAttempt {
            step_index: 0,
            output_summary: "done".into(),
            validation_passed: fidelity > 0.0,
        }],
        overall_fidelity: fidelity,
        outcome_correct: Some(true),
        duration_ms: 5,
        exception: None,
    }
}

// ===========================================================================
// ExecutionLog contracts
// ===========================================================================

async fn log_preserves_append_order(log: &dyn ExecutionLog) {
    let first = execution("greeting", 1, 1.0);
    let second = execution("greeting", 1, 0.5);
    log.append(&first).await.unwrap();
    log.append(&second).await.unwrap();

    let stream = StreamKey::new("greeting", 1);
    let all = log.read_from(&stream, 0, 100).await.unwrap();
    assert_eq!(all, vec![first, second.clone()]);

    let tail = log.read_from(&stream, 1, 100).await.unwrap();
    assert_eq!(tail, vec![second]);
    assert_eq!(log.len(&stream).await.unwrap(), 2);
}

async fn log_separates_versions(log: &dyn ExecutionLog) {
    log.append(&execution("greeting", 1, 1.0)).await.unwrap();
    log.append(&execution("greeting", 2, 1.0)).await.unwrap();
    log.append(&execution("greeting", 2, 1.0)).await.unwrap();

    assert_eq!(log.len(&StreamKey::new("greeting", 1)).await.unwrap(), 1);
    assert_eq!(log.len(&StreamKey::new("greeting", 2)).await.unwrap(), 2);
    assert_eq!(log.streams().await.unwrap().len(), 2);
}

async fn log_empty_stream_reads_nothing(log: &dyn ExecutionLog) {
    let stream = StreamKey::new("missing", 1);
    assert_eq!(log.len(&stream).await.unwrap(), 0);
    assert!(log.read_from(&stream, 0, 10).await.unwrap().is_empty());
}

async fn log_limit_bounds_batch(log: &dyn ExecutionLog) {
    for _ in 0..5 {
        log.append(&execution("batch", 1, 1.0)).await.unwrap();
    }
    let stream = StreamKey::new("batch", 1);
    assert_eq!(log.read_from(&stream, 1, 3).await.unwrap().len(), 3);
    assert_eq!(log.read_from(&stream, 4, 3).await.unwrap().len(), 1);
}

#[tokio::test]
async fn memory_log_contracts() {
    log_preserves_append_order(&MemoryExecutionLog::new()).await;
    log_separates_versions(&MemoryExecutionLog::new()).await;
    log_empty_stream_reads_nothing(&MemoryExecutionLog::new()).await;
    log_limit_bounds_batch(&MemoryExecutionLog::new()).await;
}

#[tokio::test]
async fn fs_log_contracts() {
    for check in 0..4 {
        let dir = tempfile::tempdir().unwrap();
        let log = FsExecutionLog::new(dir.path()).unwrap();
        match check {
            0 => log_preserves_append_order(&log).await,
            1 => log_separates_versions(&log).await,
            2 => log_empty_stream_reads_nothing(&log).await,
            _ => log_limit_bounds_batch(&log).await,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_lose_nothing() {
    const WRITERS: usize = 8;
    const PER_WRITER: usize = 25;

    let dir = tempfile::tempdir().unwrap();
    let fs_log: Arc<dyn ExecutionLog> = Arc::new(FsExecutionLog::new(dir.path()).unwrap());
    let mem_log: Arc<dyn ExecutionLog> = Arc::new(MemoryExecutionLog::new());

    for log in [fs_log, mem_log] {
        let mut handles = Vec::new();
        for _ in 0..WRITERS {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..PER_WRITER {
                    let record = execution("busy", 1, 1.0);
                    ids.push(record.execution_id);
                    log.append(&record).await.unwrap();
                }
                ids
            }));
        }
        let mut expected: Vec<Uuid> = futures::future::join_all(handles)
            .await
            .into_iter()
            .flat_map(|r| r.unwrap())
            .collect();

        let stream = StreamKey::new("busy", 1);
        let mut stored: Vec<Uuid> = log
            .read_from(&stream, 0, usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.execution_id)
            .collect();

        assert_eq!(stored.len(), WRITERS * PER_WRITER);
        expected.sort();
        stored.sort();
        assert_eq!(stored, expected);
    }
}

// ===========================================================================
// RegistryStore contracts
// ===========================================================================

async fn registry_create_then_get(store: &dyn RegistryStore) {
    let rec = store
        .commit(RegistryChange::create(
            "greeting",
            1,
            LifecycleState::Prototype,
            b"{\"v\":1}".to_vec(),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(rec.revision, 1);
    assert_eq!(rec.state, LifecycleState::Prototype);

    let got = store.get("greeting").await.unwrap().unwrap();
    assert_eq!(got, rec);
    assert_eq!(store.read_content(&got.location).await.unwrap(), b"{\"v\":1}");
    assert!(store.get("nope").await.unwrap().is_none());
}

async fn registry_duplicate_create_fails(store: &dyn RegistryStore) {
    let change =
        RegistryChange::create("dup", 1, LifecycleState::Prototype, b"{}".to_vec(), None);
    store.commit(change.clone()).await.unwrap();
    let err = store.commit(change).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists { .. }));
}

async fn registry_stale_revision_changes_nothing(store: &dyn RegistryStore) {
    let rec = store
        .commit(RegistryChange::create(
            "racy",
            1,
            LifecycleState::Prototype,
            b"{}".to_vec(),
            None,
        ))
        .await
        .unwrap();
    let staged = store
        .commit(RegistryChange::transition(&rec, LifecycleState::Staged, None))
        .await
        .unwrap();

    // Second writer still holds revision 1.
    let err = store
        .commit(RegistryChange::transition(&rec, LifecycleState::Retired, None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::RevisionConflict { expected: 1, actual: 2, .. }
    ));
    assert_eq!(store.get("racy").await.unwrap().unwrap(), staged);
}

async fn registry_version_bump_archives(store: &dyn RegistryStore) {
    let rec = store
        .commit(RegistryChange::create(
            "base",
            1,
            LifecycleState::Staged,
            b"old".to_vec(),
            None,
        ))
        .await
        .unwrap();
    let next = store
        .commit(RegistryChange::new_version(&rec, 2, b"new".to_vec()))
        .await
        .unwrap();

    assert_eq!(next.version, 2);
    assert_eq!(next.state, LifecycleState::Staged);
    assert_eq!(next.archived_versions.len(), 1);
    let archived = &next.archived_versions[0];
    assert_eq!(store.read_content(&archived.location).await.unwrap(), b"old");
    assert_eq!(store.read_content(&next.location).await.unwrap(), b"new");
}

async fn registry_list_filters_by_state(store: &dyn RegistryStore) {
    let parent = ParentRef {
        skill_id: "a".into(),
        version: 1,
    };
    for (id, state, parent) in [
        ("a", LifecycleState::Staged, None),
        ("b", LifecycleState::Prototype, Some(parent)),
        ("c", LifecycleState::Staged, None),
    ] {
        store
            .commit(RegistryChange::create(id, 1, state, b"{}".to_vec(), parent))
            .await
            .unwrap();
    }

    let staged: Vec<String> = store
        .list(Some(LifecycleState::Staged))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.skill_id)
        .collect();
    assert_eq!(staged, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(store.list(None).await.unwrap().len(), 3);
    let b = store.get("b").await.unwrap().unwrap();
    assert_eq!(b.parent.unwrap().skill_id, "a");
}

async fn registry_children_follow_parent(store: &dyn RegistryStore) {
    let parent = |v| ParentRef {
        skill_id: "root".into(),
        version: v,
    };
    store
        .commit(RegistryChange::create(
            "root",
            1,
            LifecycleState::Production,
            b"{}".to_vec(),
            None,
        ))
        .await
        .unwrap();
    for (id, p) in [("v-b", Some(parent(1))), ("v-a", Some(parent(1))), ("other", None)] {
        store
            .commit(RegistryChange::create(id, 1, LifecycleState::Prototype, b"{}".to_vec(), p))
            .await
            .unwrap();
    }
    let staged = store.get("v-b").await.unwrap().unwrap();
    store
        .commit(RegistryChange::transition(&staged, LifecycleState::Staged, None))
        .await
        .unwrap();

    let children = store.children("root").await.unwrap();
    let ids: Vec<&str> = children.iter().map(|r| r.skill_id.as_str()).collect();
    assert_eq!(ids, vec!["v-a", "v-b"]);
    assert_eq!(children[1].state, LifecycleState::Staged);
    assert!(store.children("other").await.unwrap().is_empty());
    assert!(store.children("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_registry_contracts() {
    registry_create_then_get(&MemoryRegistryStore::new()).await;
    registry_duplicate_create_fails(&MemoryRegistryStore::new()).await;
    registry_stale_revision_changes_nothing(&MemoryRegistryStore::new()).await;
    registry_version_bump_archives(&MemoryRegistryStore::new()).await;
    registry_list_filters_by_state(&MemoryRegistryStore::new()).await;
    registry_children_follow_parent(&MemoryRegistryStore::new()).await;
}

#[tokio::test]
async fn fs_registry_contracts() {
    for check in 0..6 {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRegistryStore::new(dir.path()).unwrap();
        match check {
            0 => registry_create_then_get(&store).await,
            1 => registry_duplicate_create_fails(&store).await,
            2 => registry_stale_revision_changes_nothing(&store).await,
            3 => registry_version_bump_archives(&store).await,
            4 => registry_list_filters_by_state(&store).await,
            _ => registry_children_follow_parent(&store).await,
        }
    }
}

#[tokio::test]
async fn fs_registry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let rec = {
        let store = FsRegistryStore::new(dir.path()).unwrap();
        store
            .commit(RegistryChange::create(
                "durable",
                1,
                LifecycleState::Production,
                b"{}".to_vec(),
                None,
            ))
            .await
            .unwrap()
    };
    let reopened = FsRegistryStore::new(dir.path()).unwrap();
    assert_eq!(reopened.get("durable").await.unwrap().unwrap(), rec);
}

#[tokio::test]
async fn injected_commit_failure_changes_nothing() {
    let store = MemoryRegistryStore::new();
    let rec = store
        .commit(RegistryChange::create(
            "flaky",
            1,
            LifecycleState::Prototype,
            b"{}".to_vec(),
            None,
        ))
        .await
        .unwrap();

    store.fail_next_commits(1);
    let err = store
        .commit(RegistryChange::transition(&rec, LifecycleState::Staged, None))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(store.get("flaky").await.unwrap().unwrap(), rec);
    assert!(store.has_content(&rec.location));
    assert_eq!(store.commit_count(), 1);
}

// ===========================================================================
// Audit log contracts
// ===========================================================================

async fn approvals_filter_by_skill(log: &dyn ApprovalLog) {
    let mut checklist = BTreeMap::new();
    checklist.insert("tests_complete".to_string(), true);
    for skill in ["a", "b", "a"] {
        let approval = ApprovalRecord::new(
            skill,
            1,
            LifecycleState::Prototype,
            LifecycleState::Staged,
            "alice",
            checklist.clone(),
            Utc::now(),
        );
        log.append(&approval).await.unwrap();
    }
    assert_eq!(log.for_skill("a").await.unwrap().len(), 2);
    assert_eq!(log.for_skill("b").await.unwrap().len(), 1);
    assert!(log.for_skill("c").await.unwrap().is_empty());
}

async fn history_is_ordered(log: &dyn LifecycleLog) {
    let first = LifecycleEvent::new(
        LifecycleEventKind::Registered,
        "greeting",
        1,
        None,
        LifecycleState::Prototype,
        "alice",
    );
    let second = LifecycleEvent::new(
        LifecycleEventKind::Promotion,
        "greeting",
        1,
        Some(LifecycleState::Prototype),
        LifecycleState::Staged,
        "alice",
    )
    .with_reason("ready");
    log.append(&first).await.unwrap();
    log.append(&second).await.unwrap();

    let history = log.history("greeting").await.unwrap();
    assert_eq!(history, vec![first, second]);
}

#[tokio::test]
async fn memory_audit_contracts() {
    approvals_filter_by_skill(&MemoryApprovalLog::new()).await;
    history_is_ordered(&MemoryLifecycleLog::new()).await;
}

#[tokio::test]
async fn fs_audit_contracts() {
    let dir = tempfile::tempdir().unwrap();
    approvals_filter_by_skill(&FsApprovalLog::new(dir.path()).unwrap()).await;
    history_is_ordered(&FsLifecycleLog::new(dir.path()).unwrap()).await;
}
