//! Trigger engine: next-fire bookkeeping and the scheduling loop.
//!
//! The engine keeps a derived, recomputable view (next-fire time per job)
//! over the registry. It is a cache, never authoritative: after a restart
//! it is rebuilt from the persisted definitions and the current clock.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobwheel_protocols::{FireEvent, JobId, MisfirePolicy};

use crate::error::SchedulerError;

/// Upper bound on how long the loop sleeps without an external wakeup.
const MAX_IDLE_WAIT: StdDuration = StdDuration::from_secs(1);

/// Parse a cron trigger expression.
pub(crate) fn parse_schedule(expr: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidTrigger {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Events raised by the engine, consumed by the service dispatch task.
#[derive(Debug)]
pub enum EngineEvent {
    /// A trigger became due; execute the job.
    Fire(FireEvent),
    /// A missed slot was dropped under the `Skip` misfire policy.
    MisfireSkipped {
        job_id: JobId,
        missed: DateTime<Utc>,
    },
    /// The trigger expression has no further occurrences.
    Exhausted { job_id: JobId },
}

struct TriggerEntry {
    schedule: Schedule,
    misfire_policy: MisfirePolicy,
    next_fire: Option<DateTime<Utc>>,
    paused: bool,
}

/// Maintains next-fire times and raises fire events from one loop task.
pub struct TriggerEngine {
    entries: RwLock<HashMap<JobId, TriggerEntry>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    wake: Notify,
    grace: Duration,
}

impl TriggerEngine {
    /// Create an engine and the receiving end of its event channel.
    pub fn new(misfire_grace: StdDuration) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            entries: RwLock::new(HashMap::new()),
            events: tx,
            wake: Notify::new(),
            grace: Duration::from_std(misfire_grace).unwrap_or_else(|_| Duration::seconds(60)),
        };
        (engine, rx)
    }

    /// Schedule a job. The first fire time is strictly after now; an
    /// expression with no upcoming occurrence is reported as exhausted on
    /// the next loop pass.
    pub async fn schedule(
        &self,
        job_id: JobId,
        cron_expr: &str,
        misfire_policy: MisfirePolicy,
    ) -> Result<(), SchedulerError> {
        let schedule = parse_schedule(cron_expr)?;
        let next_fire = schedule.after(&Utc::now()).next();
        debug!("Scheduled job {} ({}), next fire {:?}", job_id, cron_expr, next_fire);

        let mut entries = self.entries.write().await;
        entries.insert(
            job_id,
            TriggerEntry {
                schedule,
                misfire_policy,
                next_fire,
                paused: false,
            },
        );
        drop(entries);
        self.wake.notify_one();
        Ok(())
    }

    /// Remove a job's trigger. Idempotent: unscheduling an unknown job is
    /// a no-op.
    pub async fn unschedule(&self, job_id: JobId) {
        let mut entries = self.entries.write().await;
        if entries.remove(&job_id).is_some() {
            debug!("Unscheduled job {}", job_id);
        }
        drop(entries);
        self.wake.notify_one();
    }

    /// Suspend trigger evaluation for a job, keeping its entry.
    pub async fn pause(&self, job_id: JobId) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&job_id) {
            entry.paused = true;
            debug!("Paused trigger for job {}", job_id);
        }
        drop(entries);
        self.wake.notify_one();
    }

    /// Resume a paused trigger, recomputing the next fire time from now so
    /// slots missed while paused are never fired in a burst. Returns false
    /// if the job has no entry.
    pub async fn resume(&self, job_id: JobId) -> bool {
        let mut entries = self.entries.write().await;
        let resumed = match entries.get_mut(&job_id) {
            Some(entry) => {
                entry.paused = false;
                entry.next_fire = entry.schedule.after(&Utc::now()).next();
                debug!("Resumed trigger for job {}, next fire {:?}", job_id, entry.next_fire);
                true
            }
            None => false,
        };
        drop(entries);
        self.wake.notify_one();
        resumed
    }

    /// Projected next fire time for a job, if it has a live trigger.
    pub async fn next_fire_time(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(&job_id).and_then(|e| e.next_fire)
    }

    /// Whether a job has a live trigger entry.
    pub async fn contains(&self, job_id: JobId) -> bool {
        self.entries.read().await.contains_key(&job_id)
    }

    /// Number of live trigger entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the engine has no live triggers.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every trigger entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.wake.notify_one();
    }

    /// Run the scheduling loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Trigger engine loop started");
        loop {
            let wait = self.idle_wait().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {
                    self.evaluate_due(Utc::now()).await;
                }
            }
        }
        info!("Trigger engine loop stopped");
    }

    /// Time until the earliest unpaused next-fire, capped at the poll
    /// interval.
    async fn idle_wait(&self) -> StdDuration {
        let entries = self.entries.read().await;
        let next = entries
            .values()
            .filter(|e| !e.paused)
            .filter_map(|e| e.next_fire)
            .min();
        match next {
            Some(at) => {
                let ms = (at - Utc::now()).num_milliseconds();
                if ms <= 0 {
                    StdDuration::ZERO
                } else {
                    StdDuration::from_millis(ms as u64).min(MAX_IDLE_WAIT)
                }
            }
            None => MAX_IDLE_WAIT,
        }
    }

    /// Evaluate every due trigger against `now`, applying misfire policy
    /// to slots older than the grace window.
    pub(crate) async fn evaluate_due(&self, now: DateTime<Utc>) {
        let mut exhausted = Vec::new();
        let mut entries = self.entries.write().await;

        for (&job_id, entry) in entries.iter_mut() {
            if entry.paused {
                continue;
            }
            let Some(due) = entry.next_fire else {
                exhausted.push(job_id);
                continue;
            };
            if due > now {
                continue;
            }

            if now - due <= self.grace {
                self.emit(EngineEvent::Fire(FireEvent::scheduled(job_id, due, now)));
                entry.next_fire = entry.schedule.after(&due).next();
            } else {
                match entry.misfire_policy {
                    MisfirePolicy::FireImmediately => {
                        warn!("Job {} misfired at {}, firing for the missed slot", job_id, due);
                        self.emit(EngineEvent::Fire(FireEvent::scheduled(job_id, due, now)));
                    }
                    MisfirePolicy::Skip => {
                        warn!("Job {} misfired at {}, skipping", job_id, due);
                        self.emit(EngineEvent::MisfireSkipped { job_id, missed: due });
                    }
                    MisfirePolicy::FireOnceNow => {
                        // Coalesce all missed slots into one fire stamped
                        // with the latest of them.
                        let mut last_missed = due;
                        for slot in entry.schedule.after(&due) {
                            if slot > now {
                                break;
                            }
                            last_missed = slot;
                        }
                        warn!(
                            "Job {} misfired, coalescing slots up to {} into one fire",
                            job_id, last_missed
                        );
                        self.emit(EngineEvent::Fire(FireEvent::scheduled(job_id, last_missed, now)));
                    }
                }
                entry.next_fire = entry.schedule.after(&now).next();
            }

            if entry.next_fire.is_none() {
                exhausted.push(job_id);
            }
        }

        for job_id in exhausted {
            entries.remove(&job_id);
            info!("Trigger for job {} is exhausted", job_id);
            self.emit(EngineEvent::Exhausted { job_id });
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("Engine event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVERY_SECOND: &str = "* * * * * *";

    fn engine() -> (TriggerEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        TriggerEngine::new(StdDuration::from_secs(60))
    }

    #[tokio::test]
    async fn test_schedule_computes_future_fire() {
        let (engine, _rx) = engine();
        engine.schedule(1, "0 * * * * *", MisfirePolicy::Skip).await.unwrap();

        let next = engine.next_fire_time(1).await.unwrap();
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn test_schedule_rejects_invalid_expression() {
        let (engine, _rx) = engine();
        let err = engine.schedule(1, "not cron", MisfirePolicy::Skip).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTrigger { .. }));
        assert!(engine.is_empty().await);
    }

    #[tokio::test]
    async fn test_unschedule_is_idempotent() {
        let (engine, _rx) = engine();
        engine.schedule(1, EVERY_SECOND, MisfirePolicy::Skip).await.unwrap();
        engine.unschedule(1).await;
        assert!(!engine.contains(1).await);
        // Second unschedule is a no-op, not an error.
        engine.unschedule(1).await;
    }

    #[tokio::test]
    async fn test_fire_within_grace_advances_next() {
        let (engine, mut rx) = engine();
        engine.schedule(1, EVERY_SECOND, MisfirePolicy::Skip).await.unwrap();
        let due = engine.next_fire_time(1).await.unwrap();

        engine.evaluate_due(due + Duration::milliseconds(100)).await;

        match rx.try_recv().unwrap() {
            EngineEvent::Fire(event) => {
                assert_eq!(event.job_id, 1);
                assert_eq!(event.scheduled_time, due);
            }
            other => panic!("expected fire, got {:?}", other),
        }
        // Recomputed next fire is strictly later than the slot that fired.
        assert!(engine.next_fire_time(1).await.unwrap() > due);
    }

    #[tokio::test]
    async fn test_misfire_skip_emits_single_notice() {
        let (engine, mut rx) = engine();
        engine.schedule(1, EVERY_SECOND, MisfirePolicy::Skip).await.unwrap();
        let due = engine.next_fire_time(1).await.unwrap();

        // Stall well past the grace window; many slots were missed.
        let resumed_at = due + Duration::minutes(3);
        engine.evaluate_due(resumed_at).await;

        match rx.try_recv().unwrap() {
            EngineEvent::MisfireSkipped { job_id, missed } => {
                assert_eq!(job_id, 1);
                assert_eq!(missed, due);
            }
            other => panic!("expected misfire skip, got {:?}", other),
        }
        // Exactly one notice, not one per missed slot.
        assert!(rx.try_recv().is_err());
        // Next real fire is after the stall, no burst catch-up.
        assert!(engine.next_fire_time(1).await.unwrap() > resumed_at);
    }

    #[tokio::test]
    async fn test_misfire_fire_once_now_coalesces() {
        let (engine, mut rx) = engine();
        engine
            .schedule(1, EVERY_SECOND, MisfirePolicy::FireOnceNow)
            .await
            .unwrap();
        let due = engine.next_fire_time(1).await.unwrap();

        let resumed_at = due + Duration::minutes(2);
        engine.evaluate_due(resumed_at).await;

        match rx.try_recv().unwrap() {
            EngineEvent::Fire(event) => {
                assert!(event.scheduled_time >= due);
                assert!(event.scheduled_time <= resumed_at);
            }
            other => panic!("expected fire, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_misfire_fire_immediately_fires_missed_slot() {
        let (engine, mut rx) = engine();
        engine
            .schedule(1, EVERY_SECOND, MisfirePolicy::FireImmediately)
            .await
            .unwrap();
        let due = engine.next_fire_time(1).await.unwrap();

        engine.evaluate_due(due + Duration::minutes(2)).await;

        match rx.try_recv().unwrap() {
            EngineEvent::Fire(event) => assert_eq!(event.scheduled_time, due),
            other => panic!("expected fire, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_paused_trigger_does_not_fire() {
        let (engine, mut rx) = engine();
        engine.schedule(1, EVERY_SECOND, MisfirePolicy::Skip).await.unwrap();
        let due = engine.next_fire_time(1).await.unwrap();

        engine.pause(1).await;
        engine.evaluate_due(due + Duration::seconds(10)).await;
        assert!(rx.try_recv().is_err());

        // Resume recomputes from now; nothing missed is caught up.
        assert!(engine.resume(1).await);
        let next = engine.next_fire_time(1).await.unwrap();
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn test_resume_without_entry_reports_false() {
        let (engine, _rx) = engine();
        assert!(!engine.resume(42).await);
    }

    #[tokio::test]
    async fn test_exhausted_schedule_is_dropped() {
        let (engine, mut rx) = engine();
        // Year field in the past: no upcoming occurrence at all.
        engine
            .schedule(1, "0 0 0 1 1 * 2020", MisfirePolicy::Skip)
            .await
            .unwrap();
        assert!(engine.next_fire_time(1).await.is_none());

        engine.evaluate_due(Utc::now()).await;

        match rx.try_recv().unwrap() {
            EngineEvent::Exhausted { job_id } => assert_eq!(job_id, 1),
            other => panic!("expected exhausted, got {:?}", other),
        }
        assert!(!engine.contains(1).await);
    }
}
