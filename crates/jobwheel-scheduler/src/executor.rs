//! Execution coordinator: runs fire events on independent tasks.
//!
//! One execution record is written per fire attempt, including the ones
//! that are skipped. Handler failures, panics and timeouts are captured
//! here and never reach the scheduling loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use jobwheel_protocols::{
    ConcurrencyPolicy, ExecutionOutcome, ExecutionRecord, FireEvent, FireOrigin, HandlerError,
    JobContext, JobDefinition, JobId, JobState, SkipReason,
};

use crate::execution_log::ExecutionLog;
use crate::registry::JobRegistry;
use crate::target::TargetRegistry;
use crate::trigger::TriggerEngine;

/// Per-job mutexes serializing administrative transitions against fires.
///
/// A fire either fully observes a pause/delete and is skipped, or fully
/// proceeds; the lock is held only around the state check, never across
/// the execution itself.
pub struct JobLocks {
    inner: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl JobLocks {
    /// Create an empty lock map.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for one job.
    pub async fn acquire(&self, job_id: JobId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks
                .entry(job_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for a deleted job.
    pub async fn forget(&self, job_id: JobId) {
        self.inner.lock().await.remove(&job_id);
    }
}

impl Default for JobLocks {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningJob {
    active: u32,
    token: CancellationToken,
}

/// Receives fire events, enforces per-job policy and invokes handlers.
pub struct ExecutionCoordinator {
    registry: Arc<JobRegistry>,
    targets: Arc<TargetRegistry>,
    engine: Arc<TriggerEngine>,
    log: Arc<ExecutionLog>,
    locks: Arc<JobLocks>,
    running: Mutex<HashMap<JobId, RunningJob>>,
    failures: Mutex<HashMap<JobId, u32>>,
    cancel: CancellationToken,
    default_timeout_secs: u64,
    failure_threshold: u32,
}

impl ExecutionCoordinator {
    /// Create a coordinator. `cancel` is the scheduler's root token; every
    /// run gets a child of it so shutdown is an advisory cancel for all
    /// in-flight work.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<JobRegistry>,
        targets: Arc<TargetRegistry>,
        engine: Arc<TriggerEngine>,
        log: Arc<ExecutionLog>,
        locks: Arc<JobLocks>,
        cancel: CancellationToken,
        default_timeout_secs: u64,
        failure_threshold: u32,
    ) -> Self {
        Self {
            registry,
            targets,
            engine,
            log,
            locks,
            running: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            cancel,
            default_timeout_secs,
            failure_threshold,
        }
    }

    /// Execute one fire attempt to completion, writing its record.
    pub async fn fire(&self, event: FireEvent) {
        let guard = self.locks.acquire(event.job_id).await;

        let record = match self.registry.record(event.job_id).await {
            Ok(record) => record,
            Err(_) => {
                // Deleted between dispatch and execution; nothing to record.
                debug!("Dropping fire {} for deleted job {}", event.fire_id, event.job_id);
                return;
            }
        };
        let def = record.definition;

        if event.origin == FireOrigin::Scheduled && record.state != JobState::Normal {
            drop(guard);
            debug!(
                "Job {} is {:?}, skipping scheduled fire {}",
                event.job_id, record.state, event.fire_id
            );
            self.append_skip(&event, SkipReason::Paused).await;
            return;
        }

        let run_token = {
            let mut running = self.running.lock().await;
            let overlapping = running.get(&event.job_id).map(|r| r.active > 0).unwrap_or(false);
            if overlapping && def.concurrency == ConcurrencyPolicy::Forbid {
                drop(running);
                drop(guard);
                warn!("Job {} is still running, skipping fire {}", event.job_id, event.fire_id);
                self.append_skip(&event, SkipReason::Overlap).await;
                return;
            }
            match running.get_mut(&event.job_id) {
                Some(run) => {
                    run.active += 1;
                    run.token.clone()
                }
                None => {
                    let token = self.cancel.child_token();
                    running.insert(
                        event.job_id,
                        RunningJob {
                            active: 1,
                            token: token.clone(),
                        },
                    );
                    token
                }
            }
        };
        drop(guard);

        let started_at = Utc::now();
        let outcome = self.invoke(&event, &def, run_token).await;
        let finished_at = Utc::now();
        self.finish_run(event.job_id).await;

        if let ExecutionOutcome::Failure(detail) = &outcome {
            error!("Job {} fire {} failed: {}", event.job_id, event.fire_id, detail);
        }

        self.log
            .append(ExecutionRecord::new(
                event.job_id,
                event.fire_id,
                event.origin,
                event.scheduled_time,
                started_at,
                finished_at,
                outcome.clone(),
            ))
            .await;

        if outcome.is_failure() {
            self.note_failure(event.job_id).await;
        } else if matches!(outcome, ExecutionOutcome::Success) {
            self.failures.lock().await.remove(&event.job_id);
        }
    }

    /// Record a slot dropped by the `Skip` misfire policy.
    pub async fn record_misfire(&self, job_id: JobId, missed: DateTime<Utc>) {
        let now = Utc::now();
        self.log
            .append(ExecutionRecord::new(
                job_id,
                uuid::Uuid::new_v4(),
                FireOrigin::Scheduled,
                missed,
                now,
                now,
                ExecutionOutcome::Skipped(SkipReason::Misfire),
            ))
            .await;
    }

    /// Send the advisory cancellation signal to a job's in-flight runs.
    pub async fn cancel_running(&self, job_id: JobId) {
        if let Some(run) = self.running.lock().await.get(&job_id) {
            debug!("Cancelling in-flight execution of job {}", job_id);
            run.token.cancel();
        }
    }

    /// Whether a job has an in-flight execution.
    pub async fn is_running(&self, job_id: JobId) -> bool {
        self.running
            .lock()
            .await
            .get(&job_id)
            .map(|r| r.active > 0)
            .unwrap_or(false)
    }

    async fn invoke(
        &self,
        event: &FireEvent,
        def: &JobDefinition,
        run_token: CancellationToken,
    ) -> ExecutionOutcome {
        let handler = match self.targets.get(&def.target).await {
            Some(handler) => handler,
            None => {
                // Targets are validated at save time; losing one afterwards
                // is a wiring bug, not a scheduling error.
                return ExecutionOutcome::Failure(format!("unknown target: {}", def.target));
            }
        };

        let ctx = JobContext {
            job_id: event.job_id,
            fire_id: event.fire_id,
            origin: event.origin,
            params: def.params.clone(),
            cancel: run_token.clone(),
        };

        debug!("Executing job {} fire {} ({})", event.job_id, event.fire_id, def.target);
        let mut task = tokio::spawn(async move { handler.run(ctx).await });

        match self.effective_timeout(def) {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => join_outcome(joined),
                Err(_) => {
                    warn!(
                        "Job {} fire {} exceeded {}s deadline, abandoning",
                        event.job_id,
                        event.fire_id,
                        limit.as_secs()
                    );
                    run_token.cancel();
                    task.abort();
                    ExecutionOutcome::TimedOut
                }
            },
            None => join_outcome(task.await),
        }
    }

    fn effective_timeout(&self, def: &JobDefinition) -> Option<StdDuration> {
        match def.timeout_secs {
            Some(0) => None,
            Some(secs) => Some(StdDuration::from_secs(secs)),
            None if self.default_timeout_secs > 0 => {
                Some(StdDuration::from_secs(self.default_timeout_secs))
            }
            None => None,
        }
    }

    async fn append_skip(&self, event: &FireEvent, reason: SkipReason) {
        let now = Utc::now();
        self.log
            .append(ExecutionRecord::new(
                event.job_id,
                event.fire_id,
                event.origin,
                event.scheduled_time,
                now,
                now,
                ExecutionOutcome::Skipped(reason),
            ))
            .await;
    }

    async fn finish_run(&self, job_id: JobId) {
        let mut running = self.running.lock().await;
        if let Some(run) = running.get_mut(&job_id) {
            run.active = run.active.saturating_sub(1);
            if run.active == 0 {
                running.remove(&job_id);
            }
        }
    }

    async fn note_failure(&self, job_id: JobId) {
        if self.failure_threshold == 0 {
            return;
        }
        let count = {
            let mut failures = self.failures.lock().await;
            let count = failures.entry(job_id).or_insert(0);
            *count += 1;
            *count
        };
        if count >= self.failure_threshold {
            warn!(
                "Job {} failed {} times in a row, moving to error state",
                job_id, count
            );
            self.engine.unschedule(job_id).await;
            if let Err(e) = self.registry.set_state(job_id, JobState::Error).await {
                debug!("Could not mark job {} as errored: {}", job_id, e);
            }
            self.failures.lock().await.remove(&job_id);
        }
    }
}

fn join_outcome(joined: Result<Result<(), HandlerError>, JoinError>) -> ExecutionOutcome {
    match joined {
        Ok(Ok(())) => ExecutionOutcome::Success,
        Ok(Err(e)) => ExecutionOutcome::Failure(e.to_string()),
        Err(e) if e.is_panic() => ExecutionOutcome::Failure(format!("handler panicked: {}", e)),
        Err(e) => ExecutionOutcome::Failure(format!("handler task aborted: {}", e)),
    }
}
