//! Job definitions, states, fire events and execution records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier, assigned by the registry at creation time.
pub type JobId = u64;

/// What to do with fire slots the engine failed to evaluate in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisfirePolicy {
    /// Fire once for the missed slot, then resume the normal cadence.
    FireImmediately,
    /// Drop the missed slot and log it as skipped.
    Skip,
    /// Coalesce any number of missed slots into a single immediate fire.
    FireOnceNow,
}

impl Default for MisfirePolicy {
    fn default() -> Self {
        MisfirePolicy::Skip
    }
}

/// Per-job concurrency rule applied by the execution coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    /// Never overlap: a fire while a previous run is active is skipped.
    Forbid,
    /// Allow overlapping runs of the same job.
    Allow,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        ConcurrencyPolicy::Forbid
    }
}

/// Administrative state of a job. Exactly one state per job at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// No live trigger.
    Disabled,
    /// Scheduled, may fire.
    Normal,
    /// Trigger evaluation suspended; next-fire time is recomputed on resume.
    Paused,
    /// Trigger validation failed or repeated execution failures.
    Error,
}

/// Origin of a fire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FireOrigin {
    /// Raised by the trigger engine on schedule.
    Scheduled,
    /// Synthesized by an administrative run-now command.
    Manual,
}

/// Payload accepted by save/update: everything about a job except its
/// registry-assigned identity and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-facing label (unique across jobs).
    pub label: String,
    /// Cron trigger expression (seconds-first, 6 or 7 fields).
    pub cron_expr: String,
    /// Name of the registered handler to invoke.
    pub target: String,
    /// String parameters passed to the handler on each fire.
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Whether the job should be scheduled at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Misfire policy.
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    /// Concurrency policy.
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    /// Per-job execution timeout in seconds (None = scheduler default).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Free-form operator note.
    #[serde(default)]
    pub remark: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl JobSpec {
    /// Create a spec with the mandatory fields and defaults for the rest.
    pub fn new(
        label: impl Into<String>,
        cron_expr: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            cron_expr: cron_expr.into(),
            target: target.into(),
            params: HashMap::new(),
            enabled: true,
            misfire_policy: MisfirePolicy::default(),
            concurrency: ConcurrencyPolicy::default(),
            timeout_secs: None,
            remark: None,
        }
    }

    /// Add a handler parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the misfire policy.
    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    /// Set the concurrency policy.
    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    /// Set a per-job execution timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set the operator remark.
    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }
}

/// A job as known to the registry: spec plus identity and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job ID, immutable after creation.
    pub id: JobId,
    /// Human-facing label.
    pub label: String,
    /// Cron trigger expression.
    pub cron_expr: String,
    /// Registered handler name.
    pub target: String,
    /// Handler parameters.
    pub params: HashMap<String, String>,
    /// Whether the job should be scheduled.
    pub enabled: bool,
    /// Misfire policy.
    pub misfire_policy: MisfirePolicy,
    /// Concurrency policy.
    pub concurrency: ConcurrencyPolicy,
    /// Per-job execution timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Free-form operator note.
    pub remark: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    /// Materialize a definition from a spec with a freshly assigned ID.
    pub fn from_spec(id: JobId, spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            label: spec.label,
            cron_expr: spec.cron_expr,
            target: spec.target,
            params: spec.params,
            enabled: spec.enabled,
            misfire_policy: spec.misfire_policy,
            concurrency: spec.concurrency,
            timeout_secs: spec.timeout_secs,
            remark: spec.remark,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an updated spec, preserving identity and creation time.
    pub fn apply_spec(&mut self, spec: JobSpec, now: DateTime<Utc>) {
        self.label = spec.label;
        self.cron_expr = spec.cron_expr;
        self.target = spec.target;
        self.params = spec.params;
        self.enabled = spec.enabled;
        self.misfire_policy = spec.misfire_policy;
        self.concurrency = spec.concurrency;
        self.timeout_secs = spec.timeout_secs;
        self.remark = spec.remark;
        self.updated_at = now;
    }
}

/// Persisted unit: the definition together with its administrative state,
/// so a paused job stays paused across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// The job definition.
    pub definition: JobDefinition,
    /// Current administrative state.
    pub state: JobState,
}

/// Ephemeral fire event, consumed immediately by the execution coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireEvent {
    /// Correlation ID for this fire attempt.
    pub fire_id: Uuid,
    /// Job being fired.
    pub job_id: JobId,
    /// Scheduled or manual.
    pub origin: FireOrigin,
    /// The slot this fire corresponds to.
    pub scheduled_time: DateTime<Utc>,
    /// When the engine actually raised the event.
    pub actual_time: DateTime<Utc>,
}

impl FireEvent {
    /// A fire raised by the trigger engine for a schedule slot.
    pub fn scheduled(job_id: JobId, scheduled_time: DateTime<Utc>, actual_time: DateTime<Utc>) -> Self {
        Self {
            fire_id: Uuid::new_v4(),
            job_id,
            origin: FireOrigin::Scheduled,
            scheduled_time,
            actual_time,
        }
    }

    /// A fire synthesized by an administrative run-now command.
    pub fn manual(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            fire_id: Uuid::new_v4(),
            job_id,
            origin: FireOrigin::Manual,
            scheduled_time: now,
            actual_time: now,
        }
    }
}

/// Why a fire attempt was skipped instead of executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// A previous run of the same job was still active.
    Overlap,
    /// The slot was missed and the job's misfire policy dropped it.
    Misfire,
    /// A scheduled fire reached a job that was no longer in normal state.
    Paused,
}

/// Terminal outcome of a fire attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    /// Handler completed without error.
    Success,
    /// Handler returned an error or panicked.
    Failure(String),
    /// The attempt was recorded but not executed.
    Skipped(SkipReason),
    /// The handler exceeded its deadline and was abandoned.
    TimedOut,
}

impl ExecutionOutcome {
    /// True for `Failure` and `TimedOut`.
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionOutcome::Failure(_) | ExecutionOutcome::TimedOut)
    }
}

/// Append-only record of one fire attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Monotonically increasing log ID, assigned by the execution log.
    pub log_id: u64,
    /// Job the attempt belongs to (may reference a since-deleted job).
    pub job_id: JobId,
    /// Correlation ID of the fire event.
    pub fire_id: Uuid,
    /// Scheduled or manual.
    pub origin: FireOrigin,
    /// The slot the fire corresponded to.
    pub scheduled_time: DateTime<Utc>,
    /// Execution start (equals finish for skipped attempts).
    pub started_at: DateTime<Utc>,
    /// Execution finish.
    pub finished_at: DateTime<Utc>,
    /// Terminal outcome.
    pub outcome: ExecutionOutcome,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionRecord {
    /// Build a record for a fire attempt. The log assigns `log_id` on append.
    pub fn new(
        job_id: JobId,
        fire_id: Uuid,
        origin: FireOrigin,
        scheduled_time: DateTime<Utc>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
    ) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            log_id: 0,
            job_id,
            fire_id,
            origin,
            scheduled_time,
            started_at,
            finished_at,
            outcome,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_spec_defaults() {
        let spec = JobSpec::new("nightly-report", "0 0 2 * * *", "report");
        assert!(spec.enabled);
        assert_eq!(spec.misfire_policy, MisfirePolicy::Skip);
        assert_eq!(spec.concurrency, ConcurrencyPolicy::Forbid);
        assert!(spec.timeout_secs.is_none());
        assert!(spec.params.is_empty());
    }

    #[test]
    fn test_spec_builder() {
        let spec = JobSpec::new("sync", "0 */5 * * * *", "sync")
            .with_param("source", "upstream")
            .with_enabled(false)
            .with_misfire_policy(MisfirePolicy::FireOnceNow)
            .with_concurrency(ConcurrencyPolicy::Allow)
            .with_timeout_secs(30)
            .with_remark("mirrors upstream every 5 minutes");

        assert_eq!(spec.params.get("source").map(String::as_str), Some("upstream"));
        assert!(!spec.enabled);
        assert_eq!(spec.misfire_policy, MisfirePolicy::FireOnceNow);
        assert_eq!(spec.concurrency, ConcurrencyPolicy::Allow);
        assert_eq!(spec.timeout_secs, Some(30));
    }

    #[test]
    fn test_definition_apply_spec_preserves_identity() {
        let created = Utc::now();
        let mut def = JobDefinition::from_spec(7, JobSpec::new("a", "0 * * * * *", "t"), created);

        let later = created + Duration::seconds(10);
        def.apply_spec(JobSpec::new("b", "0 0 * * * *", "t2"), later);

        assert_eq!(def.id, 7);
        assert_eq!(def.created_at, created);
        assert_eq!(def.updated_at, later);
        assert_eq!(def.label, "b");
        assert_eq!(def.cron_expr, "0 0 * * * *");
    }

    #[test]
    fn test_manual_fire_event() {
        let event = FireEvent::manual(3);
        assert_eq!(event.origin, FireOrigin::Manual);
        assert_eq!(event.scheduled_time, event.actual_time);
    }

    #[test]
    fn test_record_duration() {
        let start = Utc::now();
        let end = start + Duration::milliseconds(1500);
        let record = ExecutionRecord::new(
            1,
            Uuid::new_v4(),
            FireOrigin::Scheduled,
            start,
            start,
            end,
            ExecutionOutcome::Success,
        );
        assert_eq!(record.duration_ms, 1500);
        assert!(!record.outcome.is_failure());
    }

    #[test]
    fn test_record_serde_round_trip() {
        let record = ExecutionRecord::new(
            9,
            Uuid::new_v4(),
            FireOrigin::Manual,
            Utc::now(),
            Utc::now(),
            Utc::now(),
            ExecutionOutcome::Skipped(SkipReason::Overlap),
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, 9);
        assert_eq!(back.outcome, ExecutionOutcome::Skipped(SkipReason::Overlap));
    }
}
