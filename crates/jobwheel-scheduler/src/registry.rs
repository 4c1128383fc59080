//! Job registry: the single source of truth for what jobs exist.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use jobwheel_protocols::{JobDefinition, JobId, JobRecord, JobSpec, JobState};

use crate::error::SchedulerError;
use crate::store::JobStore;
use crate::trigger::parse_schedule;

/// Filter for job queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Case-sensitive substring match on the label.
    #[serde(default)]
    pub label_contains: Option<String>,
    /// Restrict to one administrative state.
    #[serde(default)]
    pub state: Option<JobState>,
}

impl JobFilter {
    fn matches(&self, record: &JobRecord) -> bool {
        if let Some(needle) = &self.label_contains {
            if !record.definition.label.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        true
    }
}

/// One page of query results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total matching items across all pages.
    pub total: usize,
    /// 1-based page number.
    pub page: u32,
    /// Effective (possibly clamped) page size.
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Map items while keeping pagination metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

/// Durable mapping from job identity to definition and state.
///
/// Every mutation is persisted to the backing store before it becomes
/// visible, so reads always reflect the latest committed write.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    next_id: AtomicU64,
    max_page_size: u32,
}

impl JobRegistry {
    /// Create a registry over a store.
    pub fn new(store: Arc<dyn JobStore>, max_page_size: u32) -> Self {
        Self {
            store,
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_page_size,
        }
    }

    /// Rebuild the in-memory view and ID counter from the store.
    pub async fn load(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        let records = self.store.load_all().await?;
        let mut jobs = self.jobs.write().await;
        let mut max_id = 0;
        for record in &records {
            max_id = max_id.max(record.definition.id);
            jobs.insert(record.definition.id, record.clone());
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        info!("Loaded {} jobs from store", jobs.len());
        Ok(records)
    }

    /// Create a job from a spec. Validates the trigger expression and label
    /// uniqueness, assigns the next ID and persists before returning.
    pub async fn create(&self, spec: JobSpec) -> Result<JobId, SchedulerError> {
        parse_schedule(&spec.cron_expr)?;

        let mut jobs = self.jobs.write().await;
        if jobs.values().any(|r| r.definition.label == spec.label) {
            return Err(SchedulerError::DuplicateLabel(spec.label));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let state = if spec.enabled { JobState::Normal } else { JobState::Disabled };
        let record = JobRecord {
            definition: JobDefinition::from_spec(id, spec, Utc::now()),
            state,
        };
        self.store.save(&record).await?;
        debug!("Created job {} ({})", id, record.definition.label);
        jobs.insert(id, record);
        Ok(id)
    }

    /// Replace a job's spec. Re-validates the trigger expression; identity
    /// and creation time are preserved. Resets the state from the enabled
    /// flag (a paused job that is updated comes back as normal).
    pub async fn update(&self, id: JobId, spec: JobSpec) -> Result<(), SchedulerError> {
        parse_schedule(&spec.cron_expr)?;

        let mut jobs = self.jobs.write().await;
        if jobs
            .values()
            .any(|r| r.definition.id != id && r.definition.label == spec.label)
        {
            return Err(SchedulerError::DuplicateLabel(spec.label));
        }

        let record = jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        let mut updated = record.clone();
        updated.state = if spec.enabled { JobState::Normal } else { JobState::Disabled };
        updated.definition.apply_spec(spec, Utc::now());

        self.store.save(&updated).await?;
        debug!("Updated job {} ({})", id, updated.definition.label);
        *record = updated;
        Ok(())
    }

    /// Get a job definition.
    pub async fn get(&self, id: JobId) -> Result<JobDefinition, SchedulerError> {
        let jobs = self.jobs.read().await;
        jobs.get(&id)
            .map(|r| r.definition.clone())
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Get a job record (definition plus state).
    pub async fn record(&self, id: JobId) -> Result<JobRecord, SchedulerError> {
        let jobs = self.jobs.read().await;
        jobs.get(&id).cloned().ok_or(SchedulerError::NotFound(id))
    }

    /// Get a job's administrative state.
    pub async fn state(&self, id: JobId) -> Result<JobState, SchedulerError> {
        Ok(self.record(id).await?.state)
    }

    /// Transition a job's state and persist it.
    pub async fn set_state(&self, id: JobId, state: JobState) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        if record.state == state {
            return Ok(());
        }
        let mut updated = record.clone();
        updated.state = state;
        self.store.save(&updated).await?;
        debug!("Job {} state: {:?} -> {:?}", id, record.state, state);
        *record = updated;
        Ok(())
    }

    /// Query jobs, ordered by job ID ascending. `page` and `page_size` are
    /// 1-based; a `page_size` above the configured maximum is clamped.
    pub async fn query(
        &self,
        filter: &JobFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<JobRecord>, SchedulerError> {
        if page == 0 || page_size == 0 {
            return Err(SchedulerError::InvalidPage);
        }
        let page_size = page_size.min(self.max_page_size);

        let jobs = self.jobs.read().await;
        let mut matching: Vec<&JobRecord> = jobs.values().filter(|r| filter.matches(r)).collect();
        matching.sort_by_key(|r| r.definition.id);

        let total = matching.len();
        let start = (page as usize - 1) * page_size as usize;
        let items = matching
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    /// Remove a job. Fails with `NotFound` if it does not exist.
    pub async fn remove(&self, id: JobId) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&id) {
            return Err(SchedulerError::NotFound(id));
        }
        self.store.delete(id).await?;
        jobs.remove(&id);
        debug!("Removed job {}", id);
        Ok(())
    }

    /// Number of registered jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(MemoryJobStore::new()), 100)
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let registry = registry();
        let a = registry.create(JobSpec::new("a", "0 * * * * *", "t")).await.unwrap();
        let b = registry.create(JobSpec::new("b", "0 * * * * *", "t")).await.unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_trigger() {
        let registry = registry();
        let err = registry
            .create(JobSpec::new("a", "every tuesday", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTrigger { .. }));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_label() {
        let registry = registry();
        registry.create(JobSpec::new("a", "0 * * * * *", "t")).await.unwrap();
        let err = registry
            .create(JobSpec::new("a", "0 * * * * *", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateLabel(_)));
    }

    #[tokio::test]
    async fn test_disabled_spec_starts_disabled() {
        let registry = registry();
        let id = registry
            .create(JobSpec::new("a", "0 * * * * *", "t").with_enabled(false))
            .await
            .unwrap();
        assert_eq!(registry.state(id).await.unwrap(), JobState::Disabled);
    }

    #[tokio::test]
    async fn test_update_validates_and_preserves_identity() {
        let registry = registry();
        let id = registry.create(JobSpec::new("a", "0 * * * * *", "t")).await.unwrap();
        let created = registry.get(id).await.unwrap().created_at;

        let err = registry
            .update(id, JobSpec::new("a", "nope", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTrigger { .. }));
        // Failed update leaves the job untouched.
        assert_eq!(registry.get(id).await.unwrap().cron_expr, "0 * * * * *");

        registry
            .update(id, JobSpec::new("a2", "0 0 * * * *", "t"))
            .await
            .unwrap();
        let def = registry.get(id).await.unwrap();
        assert_eq!(def.label, "a2");
        assert_eq!(def.created_at, created);

        let missing = registry.update(999, JobSpec::new("x", "0 * * * * *", "t")).await;
        assert!(matches!(missing, Err(SchedulerError::NotFound(999))));
    }

    #[tokio::test]
    async fn test_update_rejects_label_taken_by_sibling() {
        let registry = registry();
        registry.create(JobSpec::new("a", "0 * * * * *", "t")).await.unwrap();
        let b = registry.create(JobSpec::new("b", "0 * * * * *", "t")).await.unwrap();

        let err = registry
            .update(b, JobSpec::new("a", "0 * * * * *", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateLabel(_)));

        // Keeping its own label is fine.
        registry.update(b, JobSpec::new("b", "0 * * * * *", "t")).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_orders_filters_and_clamps() {
        let registry = JobRegistry::new(Arc::new(MemoryJobStore::new()), 2);
        for label in ["alpha", "beta", "alpine", "gamma"] {
            registry.create(JobSpec::new(label, "0 * * * * *", "t")).await.unwrap();
        }

        let filter = JobFilter {
            label_contains: Some("al".to_string()),
            state: None,
        };
        let page = registry.query(&filter, 1, 50).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.page_size, 2); // clamped to the configured maximum
        assert_eq!(page.items[0].definition.label, "alpha");
        assert_eq!(page.items[1].definition.label, "alpine");

        let page2 = registry.query(&JobFilter::default(), 2, 2).await.unwrap();
        assert_eq!(page2.total, 4);
        assert_eq!(page2.items.len(), 2);
        assert_eq!(page2.items[0].definition.label, "alpine");

        assert!(matches!(
            registry.query(&JobFilter::default(), 0, 2).await,
            Err(SchedulerError::InvalidPage)
        ));
    }

    #[tokio::test]
    async fn test_query_by_state() {
        let registry = registry();
        let a = registry.create(JobSpec::new("a", "0 * * * * *", "t")).await.unwrap();
        registry.create(JobSpec::new("b", "0 * * * * *", "t")).await.unwrap();
        registry.set_state(a, JobState::Paused).await.unwrap();

        let filter = JobFilter {
            label_contains: None,
            state: Some(JobState::Paused),
        };
        let page = registry.query(&filter, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].definition.id, a);
    }

    #[tokio::test]
    async fn test_remove_and_not_found() {
        let registry = registry();
        let id = registry.create(JobSpec::new("a", "0 * * * * *", "t")).await.unwrap();
        registry.remove(id).await.unwrap();
        assert!(matches!(registry.get(id).await, Err(SchedulerError::NotFound(_))));
        assert!(matches!(registry.remove(id).await, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_rebuilds_id_counter() {
        let store = Arc::new(MemoryJobStore::new());
        let first = JobRegistry::new(store.clone(), 100);
        let a = first.create(JobSpec::new("a", "0 * * * * *", "t")).await.unwrap();
        let b = first.create(JobSpec::new("b", "0 * * * * *", "t")).await.unwrap();

        let second = JobRegistry::new(store, 100);
        second.load().await.unwrap();
        assert_eq!(second.len().await, 2);
        let c = second.create(JobSpec::new("c", "0 * * * * *", "t")).await.unwrap();
        assert!(c > a && c > b);
    }
}
