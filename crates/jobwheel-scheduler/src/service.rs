//! Scheduler service: administrative facade and lifecycle state machine.
//!
//! One explicit instance owns the registry, trigger engine, coordinator and
//! execution log. Every mutating call updates the engine before returning,
//! so callers never observe a registry write without its scheduling effect.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use jobwheel_protocols::{
    ExecutionOutcome, ExecutionRecord, FireEvent, JobDefinition, JobId, JobSpec, JobState,
};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::execution_log::ExecutionLog;
use crate::executor::{ExecutionCoordinator, JobLocks};
use crate::registry::{JobFilter, JobRegistry, Page};
use crate::store::JobStore;
use crate::target::TargetRegistry;
use crate::trigger::{EngineEvent, TriggerEngine};

/// Listing view: definition, state and the latest execution outcome.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    /// The job definition.
    pub definition: JobDefinition,
    /// Current administrative state.
    pub state: JobState,
    /// Projected next fire time, if the job has a live trigger.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Outcome of the most recent fire attempt.
    pub last_outcome: Option<ExecutionOutcome>,
    /// Start time of the most recent fire attempt.
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// Per-ID outcome of one batch operation entry.
#[derive(Debug)]
pub struct BatchResult {
    /// The job the entry refers to.
    pub job_id: JobId,
    /// Outcome for this ID; siblings are unaffected by a failure here.
    pub outcome: Result<(), SchedulerError>,
}

/// Combined result of a batch operation, in input order.
#[derive(Debug)]
pub struct BatchReport {
    /// One entry per requested job ID.
    pub results: Vec<BatchResult>,
}

impl BatchReport {
    /// True when every entry succeeded (vacuously true for empty input).
    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_ok())
    }

    /// Whether the batch had no entries.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Outcome for one job ID, if it was part of the batch.
    pub fn outcome(&self, job_id: JobId) -> Option<&Result<(), SchedulerError>> {
        self.results
            .iter()
            .find(|r| r.job_id == job_id)
            .map(|r| &r.outcome)
    }
}

/// The scheduling service.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    engine: Arc<TriggerEngine>,
    coordinator: Arc<ExecutionCoordinator>,
    log: Arc<ExecutionLog>,
    targets: Arc<TargetRegistry>,
    locks: Arc<JobLocks>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Wire up a scheduler over a job store and a target registry.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        targets: Arc<TargetRegistry>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(store, config.max_page_size));
        let (engine, events) =
            TriggerEngine::new(StdDuration::from_secs(config.misfire_grace_secs));
        let engine = Arc::new(engine);
        let log = Arc::new(ExecutionLog::new(config.max_log_entries));
        let locks = Arc::new(JobLocks::new());
        let cancel = CancellationToken::new();
        let coordinator = Arc::new(ExecutionCoordinator::new(
            registry.clone(),
            targets.clone(),
            engine.clone(),
            log.clone(),
            locks.clone(),
            cancel.clone(),
            config.default_timeout_secs,
            config.failure_threshold,
        ));

        Self {
            config,
            registry,
            engine,
            coordinator,
            log,
            targets,
            locks,
            events: Mutex::new(Some(events)),
            cancel,
            tracker: TaskTracker::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Load persisted jobs, schedule the enabled ones and start the engine
    /// loop and dispatch task.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let Some(events) = self.events.lock().await.take() else {
            warn!("Scheduler already started");
            return Ok(());
        };

        let records = self.registry.load().await?;
        let mut scheduled = 0;
        for record in records {
            if record.state != JobState::Normal {
                continue;
            }
            let def = &record.definition;
            match self.engine.schedule(def.id, &def.cron_expr, def.misfire_policy).await {
                Ok(()) => scheduled += 1,
                Err(e) => {
                    // Should have been rejected at save time; quarantine it.
                    warn!("Job {} has an unusable trigger, marking errored: {}", def.id, e);
                    self.registry.set_state(def.id, JobState::Error).await?;
                }
            }
        }
        info!("Scheduler started with {} scheduled jobs", scheduled);

        let engine = self.engine.clone();
        let engine_cancel = self.cancel.child_token();
        let engine_loop = tokio::spawn(async move { engine.run(engine_cancel).await });

        let dispatch_loop = tokio::spawn(dispatch(
            events,
            self.coordinator.clone(),
            self.registry.clone(),
            self.tracker.clone(),
            self.cancel.child_token(),
        ));

        let mut loops = self.loops.lock().await;
        loops.push(engine_loop);
        loops.push(dispatch_loop);
        Ok(())
    }

    /// Stop scheduling, send the advisory cancel to in-flight executions
    /// and wait for them up to the configured grace period.
    pub async fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.cancel.cancel();
        self.engine.clear().await;

        self.tracker.close();
        let grace = StdDuration::from_secs(self.config.shutdown_grace_secs.max(1));
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("Shutdown grace elapsed, abandoning in-flight executions");
        }

        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }

    /// Validate and persist a new job; enabled jobs are scheduled before
    /// this returns.
    pub async fn save_job(&self, spec: JobSpec) -> Result<JobId, SchedulerError> {
        if !self.targets.contains(&spec.target).await {
            return Err(SchedulerError::UnknownTarget(spec.target));
        }
        let enabled = spec.enabled;
        let cron_expr = spec.cron_expr.clone();
        let misfire_policy = spec.misfire_policy;

        let id = self.registry.create(spec).await?;
        if enabled {
            self.engine.schedule(id, &cron_expr, misfire_policy).await?;
        }
        info!("Saved job {} (enabled: {})", id, enabled);
        Ok(id)
    }

    /// Re-validate and replace a job's definition, then re-schedule it.
    pub async fn update_job(&self, id: JobId, spec: JobSpec) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(id).await;

        if !self.targets.contains(&spec.target).await {
            return Err(SchedulerError::UnknownTarget(spec.target));
        }
        let enabled = spec.enabled;
        let cron_expr = spec.cron_expr.clone();
        let misfire_policy = spec.misfire_policy;

        self.registry.update(id, spec).await?;
        self.engine.unschedule(id).await;
        if enabled {
            self.engine.schedule(id, &cron_expr, misfire_policy).await?;
        }
        info!("Updated job {}", id);
        Ok(())
    }

    /// Get a job definition.
    pub async fn get_job(&self, id: JobId) -> Result<JobDefinition, SchedulerError> {
        self.registry.get(id).await
    }

    /// Get a job's administrative state.
    pub async fn job_state(&self, id: JobId) -> Result<JobState, SchedulerError> {
        self.registry.state(id).await
    }

    /// Projected next fire time for a job.
    pub async fn next_fire_time(&self, id: JobId) -> Option<DateTime<Utc>> {
        self.engine.next_fire_time(id).await
    }

    /// Recent execution records for a job, newest first.
    pub async fn executions(&self, id: JobId, limit: usize) -> Vec<ExecutionRecord> {
        self.log.for_job(id, limit).await
    }

    /// Paginated job listing merged with the latest execution outcome.
    pub async fn query_jobs(
        &self,
        filter: &JobFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<JobSummary>, SchedulerError> {
        let page = self.registry.query(filter, page, page_size).await?;
        let mut items = Vec::with_capacity(page.items.len());
        for record in &page.items {
            let id = record.definition.id;
            let latest = self.log.latest(id).await;
            items.push(JobSummary {
                definition: record.definition.clone(),
                state: record.state,
                next_fire_time: self.engine.next_fire_time(id).await,
                last_outcome: latest.as_ref().map(|r| r.outcome.clone()),
                last_fired_at: latest.map(|r| r.started_at),
            });
        }
        Ok(Page {
            items,
            total: page.total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    /// Fire each job immediately, regardless of state. Leaves job state and
    /// the schedule untouched.
    pub async fn run_jobs(&self, ids: &[JobId]) -> BatchReport {
        self.batch(ids, |id| self.run_one(id)).await
    }

    /// Pause each job: `Normal` becomes `Paused`; anything else is a no-op.
    pub async fn pause_jobs(&self, ids: &[JobId]) -> BatchReport {
        self.batch(ids, |id| self.pause_one(id)).await
    }

    /// Resume each job: `Paused` becomes `Normal` with a next-fire time
    /// recomputed from now; anything else is a no-op.
    pub async fn resume_jobs(&self, ids: &[JobId]) -> BatchReport {
        self.batch(ids, |id| self.resume_one(id)).await
    }

    /// Delete each job from any state. In-flight executions get an advisory
    /// cancel and still write their record.
    pub async fn delete_jobs(&self, ids: &[JobId]) -> BatchReport {
        self.batch(ids, |id| self.delete_one(id)).await
    }

    async fn batch<F, Fut>(&self, ids: &[JobId], op: F) -> BatchReport
    where
        F: Fn(JobId) -> Fut,
        Fut: Future<Output = Result<(), SchedulerError>>,
    {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            results.push(BatchResult {
                job_id: id,
                outcome: op(id).await,
            });
        }
        BatchReport { results }
    }

    async fn run_one(&self, id: JobId) -> Result<(), SchedulerError> {
        self.registry.get(id).await?;
        let event = FireEvent::manual(id);
        debug!("Manual fire {} for job {}", event.fire_id, id);
        let coordinator = self.coordinator.clone();
        self.tracker.spawn(async move { coordinator.fire(event).await });
        Ok(())
    }

    async fn pause_one(&self, id: JobId) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(id).await;
        if self.registry.state(id).await? == JobState::Normal {
            self.engine.pause(id).await;
            self.registry.set_state(id, JobState::Paused).await?;
            info!("Paused job {}", id);
        }
        Ok(())
    }

    async fn resume_one(&self, id: JobId) -> Result<(), SchedulerError> {
        let _guard = self.locks.acquire(id).await;
        let record = self.registry.record(id).await?;
        if record.state == JobState::Paused {
            let def = &record.definition;
            if !self.engine.resume(id).await {
                self.engine.schedule(id, &def.cron_expr, def.misfire_policy).await?;
            }
            self.registry.set_state(id, JobState::Normal).await?;
            info!("Resumed job {}", id);
        }
        Ok(())
    }

    async fn delete_one(&self, id: JobId) -> Result<(), SchedulerError> {
        let guard = self.locks.acquire(id).await;
        self.engine.unschedule(id).await;
        self.coordinator.cancel_running(id).await;
        let result = self.registry.remove(id).await;
        drop(guard);
        if result.is_ok() {
            self.locks.forget(id).await;
            info!("Deleted job {}", id);
        }
        result
    }
}

/// Forwards engine events to the coordinator; each fire runs on its own
/// tracked task so a slow job never blocks the loop or its siblings.
async fn dispatch(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    coordinator: Arc<ExecutionCoordinator>,
    registry: Arc<JobRegistry>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    EngineEvent::Fire(event) => {
                        let coordinator = coordinator.clone();
                        tracker.spawn(async move { coordinator.fire(event).await });
                    }
                    EngineEvent::MisfireSkipped { job_id, missed } => {
                        coordinator.record_misfire(job_id, missed).await;
                    }
                    EngineEvent::Exhausted { job_id } => {
                        match registry.set_state(job_id, JobState::Disabled).await {
                            Ok(()) => info!("Job {} schedule exhausted, disabled", job_id),
                            Err(e) => debug!("Exhausted job {} no longer exists: {}", job_id, e),
                        }
                    }
                }
            }
        }
    }
    debug!("Dispatch task stopped");
}
