//! Job persistence store.
//!
//! The registry is the authority on what jobs exist; the store only has to
//! return the latest committed write. Retention and schema design beyond
//! this seam are the embedder's concern.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use jobwheel_protocols::{JobId, JobRecord};

use crate::error::SchedulerError;

/// Job store trait for persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Save (insert or replace) a job record.
    async fn save(&self, record: &JobRecord) -> Result<(), SchedulerError>;

    /// Load a job record by ID.
    async fn load(&self, id: JobId) -> Result<Option<JobRecord>, SchedulerError>;

    /// Load every persisted job record.
    async fn load_all(&self) -> Result<Vec<JobRecord>, SchedulerError>;

    /// Delete a job record. Deleting a missing record is a no-op.
    async fn delete(&self, id: JobId) -> Result<(), SchedulerError>;
}

/// In-memory job store.
pub struct MemoryJobStore {
    jobs: tokio::sync::RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        Self {
            jobs: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, record: &JobRecord) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(record.definition.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<JobRecord>, SchedulerError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().cloned().collect())
    }

    async fn delete(&self, id: JobId) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&id);
        Ok(())
    }
}

/// File system based job store.
///
/// One JSON document per job:
///
/// ```text
/// {dir}/
/// ├── 1.json
/// ├── 2.json
/// └── ...
/// ```
///
/// Writes go through a temporary file and a rename so a crash never leaves
/// a half-written record behind.
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SchedulerError::Store(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, record: &JobRecord) -> Result<(), SchedulerError> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| SchedulerError::Store(format!("serialize job: {}", e)))?;

        let path = self.path_for(record.definition.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SchedulerError::Store(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SchedulerError::Store(format!("rename {}: {}", path.display(), e)))?;

        debug!("Persisted job {} to {}", record.definition.id, path.display());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<JobRecord>, SchedulerError> {
        let path = self.path_for(id);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SchedulerError::Store(format!("parse {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SchedulerError::Store(format!("read {}: {}", path.display(), e))),
        }
    }

    async fn load_all(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| SchedulerError::Store(format!("read {}: {}", self.dir.display(), e)))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SchedulerError::Store(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .map_err(|e| SchedulerError::Store(format!("read {}: {}", path.display(), e)))?;
            match serde_json::from_slice::<JobRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable job file {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    async fn delete(&self, id: JobId) -> Result<(), SchedulerError> {
        let path = self.path_for(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SchedulerError::Store(format!("remove {}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobwheel_protocols::{JobDefinition, JobSpec, JobState};

    fn record(id: JobId, label: &str) -> JobRecord {
        JobRecord {
            definition: JobDefinition::from_spec(
                id,
                JobSpec::new(label, "0 * * * * *", "noop"),
                Utc::now(),
            ),
            state: JobState::Normal,
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryJobStore::new();
        store.save(&record(1, "a")).await.unwrap();

        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.definition.label, "a");

        store.delete(1).await.unwrap();
        assert!(store.load(1).await.unwrap().is_none());
        // Deleting again is a no-op.
        store.delete(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        store.save(&record(1, "a")).await.unwrap();
        store.save(&record(2, "b")).await.unwrap();
        // Overwrite keeps a single record per ID.
        store.save(&record(1, "a2")).await.unwrap();

        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.definition.label, "a2");

        let mut all = store.load_all().await.unwrap();
        all.sort_by_key(|r| r.definition.id);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].definition.label, "b");

        store.delete(1).await.unwrap();
        assert!(store.load(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        store.save(&record(1, "a")).await.unwrap();
        tokio::fs::write(dir.path().join("3.json"), b"not json")
            .await
            .unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
