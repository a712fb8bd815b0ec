//! Backend-independent validation of a `RegistryChange`.
//!
//! Backends load the current record and bytes, call `plan_commit`, then
//! apply the resulting plan under their own atomicity mechanism.

use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::{ArchivedVersion, ContentLocation, RegistryChange, RegistryRecord};
use crate::storage_traits::{validate_key, ContentDigest, StorageResult};

/// Everything a backend must write to apply one change.
#[derive(Debug)]
pub(crate) struct CommitPlan {
    pub record: RegistryRecord,
    /// Bytes that must exist at `record.location` afterwards.
    pub content: Vec<u8>,
    /// Superseded bytes to keep at the archive location.
    pub archive: Option<(ContentLocation, Vec<u8>)>,
    /// Previous location to remove once the new one is in place.
    pub remove: Option<ContentLocation>,
}

pub(crate) fn plan_commit(
    current: Option<&RegistryRecord>,
    current_content: Option<Vec<u8>>,
    change: RegistryChange,
    now: DateTime<Utc>,
) -> StorageResult<CommitPlan> {
    validate_key(&change.skill_id)?;
    let invalid = |reason: &str| StorageError::InvalidChange {
        skill_id: change.skill_id.clone(),
        reason: reason.to_string(),
    };

    match (current, change.expected_revision) {
        (Some(_), None) => Err(StorageError::AlreadyExists {
            skill_id: change.skill_id.clone(),
        }),
        (None, Some(_)) => Err(StorageError::SkillNotFound {
            skill_id: change.skill_id.clone(),
        }),
        (None, None) => {
            let content = change
                .content
                .clone()
                .ok_or_else(|| invalid("new skill requires content"))?;
            let location =
                ContentLocation::for_state(change.state, &change.skill_id, change.version);
            let record = RegistryRecord {
                skill_id: change.skill_id.clone(),
                version: change.version,
                state: change.state,
                location,
                content_digest: ContentDigest::from_bytes(&content),
                revision: 1,
                state_since: now,
                parent: change.parent.clone(),
                archived_versions: Vec::new(),
                updated_at: now,
            };
            Ok(CommitPlan {
                record,
                content,
                archive: None,
                remove: None,
            })
        }
        (Some(cur), Some(expected)) => {
            if cur.revision != expected {
                return Err(StorageError::RevisionConflict {
                    skill_id: change.skill_id.clone(),
                    expected,
                    actual: cur.revision,
                });
            }
            if cur.state.is_terminal() && change.state != cur.state {
                return Err(invalid("retired skills cannot change state"));
            }
            if change.version < cur.version {
                return Err(invalid("version cannot decrease"));
            }
            let bumped = change.version > cur.version;
            if bumped && change.content.is_none() {
                return Err(invalid("a new version requires content"));
            }

            let old_bytes = current_content.ok_or_else(|| StorageError::ContentNotFound {
                location: cur.location.to_string(),
            })?;
            cur.content_digest.verify(&cur.location, &old_bytes)?;

            let mut archived_versions = cur.archived_versions.clone();
            let archive = if bumped {
                let location = ContentLocation::archived(&cur.skill_id, cur.version);
                archived_versions.push(ArchivedVersion {
                    version: cur.version,
                    location: location.clone(),
                    content_digest: cur.content_digest.clone(),
                    archived_at: now,
                });
                Some((location, old_bytes.clone()))
            } else {
                None
            };

            let content = change.content.clone().unwrap_or(old_bytes);
            let location =
                ContentLocation::for_state(change.state, &change.skill_id, change.version);
            let remove = (location != cur.location).then(|| cur.location.clone());
            let state_since = if change.state != cur.state || bumped {
                now
            } else {
                cur.state_since
            };

            let record = RegistryRecord {
                skill_id: cur.skill_id.clone(),
                version: change.version,
                state: change.state,
                location,
                content_digest: ContentDigest::from_bytes(&content),
                revision: cur.revision + 1,
                state_since,
                parent: change.parent.clone(),
                archived_versions,
                updated_at: now,
            };
            Ok(CommitPlan {
                record,
                content,
                archive,
                remove,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LifecycleState;

    fn created() -> CommitPlan {
        let change =
            RegistryChange::create("greeting", 1, LifecycleState::Prototype, b"v1".to_vec(), None);
        plan_commit(None, None, change, Utc::now()).unwrap()
    }

    #[test]
    fn create_starts_at_revision_one() {
        let plan = created();
        assert_eq!(plan.record.revision, 1);
        assert_eq!(plan.record.location.as_str(), "prototype/greeting/v1.json");
        assert!(plan.remove.is_none());
    }

    #[test]
    fn create_over_existing_is_rejected() {
        let plan = created();
        let change =
            RegistryChange::create("greeting", 1, LifecycleState::Prototype, b"v1".to_vec(), None);
        let err =
            plan_commit(Some(&plan.record), Some(plan.content), change, Utc::now()).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[test]
    fn transition_moves_content_and_resets_state_since() {
        let plan = created();
        let later = plan.record.state_since + chrono::Duration::seconds(5);
        let change = RegistryChange::transition(&plan.record, LifecycleState::Staged, None);
        let next =
            plan_commit(Some(&plan.record), Some(plan.content.clone()), change, later).unwrap();
        assert_eq!(next.record.revision, 2);
        assert_eq!(next.record.state_since, later);
        assert_eq!(next.content, plan.content);
        assert_eq!(next.remove.unwrap(), plan.record.location);
    }

    #[test]
    fn stale_revision_conflicts() {
        let plan = created();
        let mut change = RegistryChange::transition(&plan.record, LifecycleState::Staged, None);
        change.expected_revision = Some(7);
        let err =
            plan_commit(Some(&plan.record), Some(plan.content), change, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            StorageError::RevisionConflict { expected: 7, actual: 1, .. }
        ));
    }

    #[test]
    fn version_bump_archives_previous_content() {
        let plan = created();
        let change = RegistryChange::new_version(&plan.record, 2, b"v2".to_vec());
        let next = plan_commit(Some(&plan.record), Some(plan.content), change, Utc::now()).unwrap();
        let (loc, bytes) = next.archive.unwrap();
        assert_eq!(loc.as_str(), "archive/greeting/v1.json");
        assert_eq!(bytes, b"v1");
        assert_eq!(next.record.archived_versions.len(), 1);
        assert_eq!(next.record.version, 2);
    }

    #[test]
    fn retired_is_terminal() {
        let plan = created();
        let retire = RegistryChange::transition(&plan.record, LifecycleState::Retired, None);
        let retired =
            plan_commit(Some(&plan.record), Some(plan.content), retire, Utc::now()).unwrap();
        let revive = RegistryChange::transition(&retired.record, LifecycleState::Staged, None);
        let err = plan_commit(Some(&retired.record), Some(retired.content), revive, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidChange { .. }));
    }

    #[test]
    fn corrupted_content_is_detected() {
        let plan = created();
        let change = RegistryChange::transition(&plan.record, LifecycleState::Staged, None);
        let tampered = b"tampered".to_vec();
        let err = plan_commit(Some(&plan.record), Some(tampered), change, Utc::now()).unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }
}
