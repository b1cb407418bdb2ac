//! Daily-rotated JSON persistence for tasks.
//!
//! The store root holds one `YYYY-MM-DD.json` file per day with submissions,
//! each a JSON object mapping `task_id` to the task record. A task lives in
//! the bucket matching its `created_at` for its entire life, so updates to
//! old tasks rewrite old buckets, never today's.
//!
//! Writes go through a temp file and an atomic rename. On startup the loader
//! prefers the newer valid of `NAME.json` / `NAME.json.tmp` (a crash between
//! write and rename leaves a complete tmp behind) and quarantines buckets
//! that fail to parse instead of refusing to start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use super::locks::LockTable;
use crate::tasks::types::{Task, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Filters for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub etab_name: Option<String>,
    pub app_name: Option<String>,
    pub created_from: Option<NaiveDate>,
    pub created_to: Option<NaiveDate>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(task_type) = &self.task_type {
            if &task.task_type != task_type {
                return false;
            }
        }
        if let Some(etab_name) = &self.etab_name {
            if &task.etab_name != etab_name {
                return false;
            }
        }
        if let Some(app_name) = &self.app_name {
            if &task.app_name != app_name {
                return false;
            }
        }
        let day = task.day_bucket();
        if let Some(from) = self.created_from {
            if day < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if day > to {
                return false;
            }
        }
        true
    }
}

/// Durable task store with an in-memory index.
///
/// Reads are served from the index; every mutation writes the whole day
/// bucket back to disk before the caller's stripe lock is released.
pub struct TaskStore {
    root: PathBuf,
    index: DashMap<String, Task>,
    /// Serialises writers of the same bucket file.
    bucket_locks: DashMap<String, Arc<Mutex<()>>>,
    locks: LockTable,
}

impl TaskStore {
    /// Opens the store, creating the root directory if needed, and loads
    /// every bucket into memory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let store = Self {
            root,
            index: DashMap::new(),
            bucket_locks: DashMap::new(),
            locks: LockTable::default(),
        };
        store.load_all().await?;
        Ok(Arc::new(store))
    }

    /// Acquires the mutation stripe for a task id.
    pub async fn lock(&self, task_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks.lock(task_id).await
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.index.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Task> {
        self.index
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .index
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        tasks
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Write-through upsert: updates the index, then rewrites the task's
    /// day bucket atomically. Callers hold the task's stripe lock.
    pub async fn put(&self, task: &Task) -> Result<(), StoreError> {
        let bucket = task.day_bucket();
        self.index.insert(task.task_id.clone(), task.clone());
        self.write_bucket(bucket).await
    }

    /// Removes a task (retention). Returns whether it existed.
    pub async fn remove(&self, task_id: &str) -> Result<bool, StoreError> {
        let Some((_, task)) = self.index.remove(task_id) else {
            return Ok(false);
        };
        self.write_bucket(task.day_bucket()).await?;
        Ok(true)
    }

    fn bucket_path(&self, bucket: NaiveDate) -> PathBuf {
        self.root.join(format!("{}.json", bucket.format("%Y-%m-%d")))
    }

    fn bucket_write_lock(&self, bucket: NaiveDate) -> Arc<Mutex<()>> {
        self.bucket_locks
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn write_bucket(&self, bucket: NaiveDate) -> Result<(), StoreError> {
        let contents: BTreeMap<String, Task> = self
            .index
            .iter()
            .filter(|entry| entry.value().day_bucket() == bucket)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let path = self.bucket_path(bucket);
        let lock = self.bucket_write_lock(bucket);
        let _guard = lock.lock().await;

        if contents.is_empty() {
            // Last task of the day removed; drop the bucket file.
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        let serialized = serde_json::to_vec_pretty(&contents)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &serialized).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!(
            "Persisted {} task(s) to bucket {}",
            contents.len(),
            path.display()
        );
        Ok(())
    }

    async fn load_all(&self) -> Result<(), StoreError> {
        // A tmp file left behind is a crashed write whose content is
        // complete; recover it before the normal load.
        let mut tmp_files: Vec<PathBuf> = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".json.tmp"))
                .unwrap_or(false)
            {
                tmp_files.push(path);
            }
        }
        for tmp_path in tmp_files {
            self.recover_tmp(&tmp_path).await;
        }

        // Scan again so promoted files are picked up.
        let mut bucket_files: Vec<PathBuf> = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".json"))
                .unwrap_or(false)
            {
                bucket_files.push(path);
            }
        }
        bucket_files.sort();

        let mut loaded = 0usize;
        for path in &bucket_files {
            match self.read_bucket(path).await {
                Ok(tasks) => {
                    loaded += tasks.len();
                    for (task_id, task) in tasks {
                        self.index.insert(task_id, task);
                    }
                }
                Err(e) => {
                    tracing::warn!("Quarantining corrupt bucket {}: {}", path.display(), e);
                    self.quarantine(path).await;
                }
            }
        }

        tracing::info!(
            "Loaded {} task(s) from {} bucket(s) in {}",
            loaded,
            bucket_files.len(),
            self.root.display()
        );
        Ok(())
    }

    async fn read_bucket(&self, path: &Path) -> Result<BTreeMap<String, Task>, StoreError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Promotes a leftover tmp file when it is the newer valid version of
    /// its bucket; otherwise deletes it.
    async fn recover_tmp(&self, tmp_path: &Path) {
        let final_path = tmp_path.with_extension("");
        debug_assert!(final_path.extension().is_some_and(|e| e == "json"));

        let tmp_valid = self.read_bucket(tmp_path).await.is_ok();
        if !tmp_valid {
            tracing::warn!("Discarding unreadable tmp bucket {}", tmp_path.display());
            let _ = tokio::fs::remove_file(tmp_path).await;
            return;
        }

        let final_valid = self.read_bucket(&final_path).await.is_ok();
        let tmp_newer = match (
            tokio::fs::metadata(tmp_path).await,
            tokio::fs::metadata(&final_path).await,
        ) {
            (Ok(tmp_meta), Ok(final_meta)) => {
                match (tmp_meta.modified(), final_meta.modified()) {
                    (Ok(t), Ok(f)) => t >= f,
                    _ => false,
                }
            }
            (Ok(_), Err(_)) => true,
            _ => false,
        };

        if !final_valid || tmp_newer {
            tracing::warn!(
                "Recovering bucket {} from interrupted write",
                final_path.display()
            );
            if let Err(e) = tokio::fs::rename(tmp_path, &final_path).await {
                tracing::warn!("Failed to promote {}: {}", tmp_path.display(), e);
            }
        } else {
            let _ = tokio::fs::remove_file(tmp_path).await;
        }
    }

    async fn quarantine(&self, path: &Path) {
        let quarantined = path.with_extension("json.corrupt");
        if let Err(e) = tokio::fs::rename(path, &quarantined).await {
            tracing::warn!("Failed to quarantine {}: {}", path.display(), e);
        }
    }
}
