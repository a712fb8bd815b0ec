//! Filesystem-backed stores.
//!
//! Layout under the data directory:
//!
//! ```text
//! executions/<skill_id>/v<version>.jsonl   append layer, one record per line
//! registry/records/<skill_id>.json         registry records
//! registry/content/<state>/<skill_id>/v<version>.json
//! registry/content/archive/<skill_id>/v<version>.json
//! approvals/<skill_id>.jsonl
//! history/<skill_id>.jsonl                 lifecycle events
//! ```
//!
//! Whole-file writes go through a temp file in the target directory followed
//! by a rename. JSONL readers ignore a trailing line without a newline, which
//! is what a crash mid-append leaves behind.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::instrument;

use crate::commit::plan_commit;
use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// One async lock per path, created on first use.
#[derive(Debug, Default)]
struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    fn for_path(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = path.parent().ok_or_else(|| StorageError::InvalidKey {
        key: path.display().to_string(),
    })?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Complete lines only; a torn final line is skipped.
fn read_lines<T: DeserializeOwned>(path: &Path) -> StorageResult<Vec<T>> {
    let Some(bytes) = read_optional(path)? else {
        return Ok(Vec::new());
    };
    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(end) => &bytes[..=end],
        None => return Ok(Vec::new()),
    };
    complete
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).map_err(StorageError::from))
        .collect()
}

fn content_path(root: &Path, location: &ContentLocation) -> StorageResult<PathBuf> {
    let mut path = root.to_path_buf();
    for part in location.as_str().split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(StorageError::InvalidKey {
                key: location.to_string(),
            });
        }
        path.push(part);
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// FsExecutionLog
// ---------------------------------------------------------------------------

/// JSONL file per `(skill_id, version)` stream.
#[derive(Debug)]
pub struct FsExecutionLog {
    dir: PathBuf,
    locks: PathLocks,
}

impl FsExecutionLog {
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("executions");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: PathLocks::default(),
        })
    }

    fn stream_path(&self, stream: &StreamKey) -> StorageResult<PathBuf> {
        validate_key(&stream.skill_id)?;
        Ok(self
            .dir
            .join(&stream.skill_id)
            .join(format!("v{}.jsonl", stream.version)))
    }
}

#[async_trait]
impl ExecutionLog for FsExecutionLog {
    #[instrument(skip_all, fields(skill_id = %record.skill_id, version = record.skill_version))]
    async fn append(&self, record: &ExecutionRecord) -> StorageResult<()> {
        let path = self.stream_path(&record.stream())?;
        let lock = self.locks.for_path(&path);
        let _guard = lock.lock().await;
        append_line(&path, record)
    }

    async fn read_from(
        &self,
        stream: &StreamKey,
        offset: u64,
        limit: usize,
    ) -> StorageResult<Vec<ExecutionRecord>> {
        let path = self.stream_path(stream)?;
        let records: Vec<ExecutionRecord> = read_lines(&path)?;
        Ok(records
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .collect())
    }

    async fn len(&self, stream: &StreamKey) -> StorageResult<u64> {
        let path = self.stream_path(stream)?;
        let Some(bytes) = read_optional(&path)? else {
            return Ok(0);
        };
        Ok(bytes.iter().filter(|b| **b == b'\n').count() as u64)
    }

    async fn streams(&self) -> StorageResult<Vec<StreamKey>> {
        let mut out = Vec::new();
        for skill_dir in fs::read_dir(&self.dir)? {
            let skill_dir = skill_dir?;
            if !skill_dir.file_type()?.is_dir() {
                continue;
            }
            let skill_id = skill_dir.file_name().to_string_lossy().into_owned();
            for file in fs::read_dir(skill_dir.path())? {
                let name = file?.file_name().to_string_lossy().into_owned();
                let version = name
                    .strip_prefix('v')
                    .and_then(|rest| rest.strip_suffix(".jsonl"))
                    .and_then(|v| v.parse::<u64>().ok());
                if let Some(version) = version {
                    out.push(StreamKey::new(skill_id.clone(), version));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// FsRegistryStore
// ---------------------------------------------------------------------------

/// Registry records as JSON files with content stored by location.
///
/// A commit writes the archive copy and the new content first, then renames
/// the record file into place; that rename is the commit point. The old
/// content is removed afterwards. A failure before the rename leaves the
/// previous record and content untouched.
///
/// Candidates are indexed under `children/<parent>/<child>` when created. A
/// marker whose record never landed is skipped on read.
#[derive(Debug)]
pub struct FsRegistryStore {
    records_dir: PathBuf,
    content_dir: PathBuf,
    children_dir: PathBuf,
    locks: PathLocks,
}

impl FsRegistryStore {
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let base = root.as_ref().join("registry");
        let records_dir = base.join("records");
        let content_dir = base.join("content");
        let children_dir = base.join("children");
        fs::create_dir_all(&records_dir)?;
        fs::create_dir_all(&content_dir)?;
        fs::create_dir_all(&children_dir)?;
        Ok(Self {
            records_dir,
            content_dir,
            children_dir,
            locks: PathLocks::default(),
        })
    }

    fn record_path(&self, skill_id: &str) -> StorageResult<PathBuf> {
        validate_key(skill_id)?;
        Ok(self.records_dir.join(format!("{skill_id}.json")))
    }

    fn load(&self, skill_id: &str) -> StorageResult<Option<RegistryRecord>> {
        let path = self.record_path(skill_id)?;
        match read_optional(&path)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RegistryStore for FsRegistryStore {
    async fn get(&self, skill_id: &str) -> StorageResult<Option<RegistryRecord>> {
        self.load(skill_id)
    }

    async fn list(&self, state: Option<LifecycleState>) -> StorageResult<Vec<RegistryRecord>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.records_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: RegistryRecord = serde_json::from_slice(&fs::read(&path)?)?;
            if state.map(|s| record.state == s).unwrap_or(true) {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.skill_id.cmp(&b.skill_id));
        Ok(out)
    }

    async fn children(&self, parent_id: &str) -> StorageResult<Vec<RegistryRecord>> {
        validate_key(parent_id)?;
        let dir = self.children_dir.join(parent_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(child) = name.to_str() else {
                continue;
            };
            if validate_key(child).is_err() {
                continue;
            }
            if let Some(record) = self.load(child)? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.skill_id.cmp(&b.skill_id));
        Ok(out)
    }

    async fn read_content(&self, location: &ContentLocation) -> StorageResult<Vec<u8>> {
        let path = content_path(&self.content_dir, location)?;
        read_optional(&path)?.ok_or_else(|| StorageError::ContentNotFound {
            location: location.to_string(),
        })
    }

    #[instrument(skip_all, fields(skill_id = %change.skill_id, state = %change.state))]
    async fn commit(&self, change: RegistryChange) -> StorageResult<RegistryRecord> {
        let record_path = self.record_path(&change.skill_id)?;
        let lock = self.locks.for_path(&record_path);
        let _guard = lock.lock().await;

        let current = self.load(&change.skill_id)?;
        let current_content = match &current {
            Some(r) => read_optional(&content_path(&self.content_dir, &r.location)?)?,
            None => None,
        };
        let plan = plan_commit(current.as_ref(), current_content, change, Utc::now())?;

        let new_path = content_path(&self.content_dir, &plan.record.location)?;
        let mut written: Vec<PathBuf> = Vec::new();
        let staged = (|| -> StorageResult<()> {
            if let Some((location, bytes)) = &plan.archive {
                let path = content_path(&self.content_dir, location)?;
                write_atomic(&path, bytes)?;
                written.push(path);
            }
            write_atomic(&new_path, &plan.content)?;
            written.push(new_path.clone());
            if let (None, Some(parent)) = (&current, &plan.record.parent) {
                let marker = self.children_dir.join(&parent.skill_id).join(&plan.record.skill_id);
                write_atomic(&marker, b"")?;
            }
            write_atomic(&record_path, &serde_json::to_vec_pretty(&plan.record)?)
        })();

        if let Err(e) = staged {
            let keep = current
                .as_ref()
                .map(|r| content_path(&self.content_dir, &r.location))
                .transpose()?;
            for path in written {
                if Some(&path) != keep.as_ref() {
                    let _ = fs::remove_file(&path);
                }
            }
            return Err(e);
        }

        if let Some(old) = &plan.remove {
            let old_path = content_path(&self.content_dir, old)?;
            if let Err(e) = fs::remove_file(&old_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %old_path.display(),
                        error = %e,
                        "stale skill content left behind"
                    );
                }
            }
        }
        Ok(plan.record)
    }
}

// ---------------------------------------------------------------------------
// Audit logs
// ---------------------------------------------------------------------------

/// Approvals as one JSONL file per skill.
#[derive(Debug)]
pub struct FsApprovalLog {
    dir: PathBuf,
    locks: PathLocks,
}

impl FsApprovalLog {
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("approvals");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: PathLocks::default(),
        })
    }

    fn path(&self, skill_id: &str) -> StorageResult<PathBuf> {
        validate_key(skill_id)?;
        Ok(self.dir.join(format!("{skill_id}.jsonl")))
    }
}

#[async_trait]
impl ApprovalLog for FsApprovalLog {
    async fn append(&self, approval: &ApprovalRecord) -> StorageResult<()> {
        let path = self.path(&approval.skill_id)?;
        let lock = self.locks.for_path(&path);
        let _guard = lock.lock().await;
        append_line(&path, approval)
    }

    async fn for_skill(&self, skill_id: &str) -> StorageResult<Vec<ApprovalRecord>> {
        read_lines(&self.path(skill_id)?)
    }
}

/// Lifecycle events as one JSONL file per skill.
#[derive(Debug)]
pub struct FsLifecycleLog {
    dir: PathBuf,
    locks: PathLocks,
}

impl FsLifecycleLog {
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("history");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: PathLocks::default(),
        })
    }

    fn path(&self, skill_id: &str) -> StorageResult<PathBuf> {
        validate_key(skill_id)?;
        Ok(self.dir.join(format!("{skill_id}.jsonl")))
    }
}

#[async_trait]
impl LifecycleLog for FsLifecycleLog {
    async fn append(&self, event: &LifecycleEvent) -> StorageResult<()> {
        let path = self.path(&event.skill_id)?;
        let lock = self.locks.for_path(&path);
        let _guard = lock.lock().await;
        append_line(&path, event)
    }

    async fn history(&self, skill_id: &str) -> StorageResult<Vec<LifecycleEvent>> {
        read_lines(&self.path(skill_id)?)
    }
}
