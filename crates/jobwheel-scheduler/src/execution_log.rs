//! Append-only execution log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use jobwheel_protocols::{ExecutionRecord, JobId};

/// Append-only record of fire attempts.
///
/// Log IDs increase monotonically from 1 and records are never mutated
/// after append. An optional cap bounds memory by dropping oldest records;
/// anything longer-term belongs to an external sink.
pub struct ExecutionLog {
    records: RwLock<VecDeque<ExecutionRecord>>,
    next_id: AtomicU64,
    max_entries: usize,
}

impl ExecutionLog {
    /// Create a log. `max_entries` of 0 means unbounded.
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            max_entries,
        }
    }

    /// Append a record, assigning its log ID. Returns the assigned ID.
    pub async fn append(&self, mut record: ExecutionRecord) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        record.log_id = id;
        debug!(
            "Execution record {} for job {}: {:?}",
            id, record.job_id, record.outcome
        );

        let mut records = self.records.write().await;
        records.push_back(record);
        if self.max_entries > 0 && records.len() > self.max_entries {
            records.pop_front();
        }
        id
    }

    /// Records for one job, newest first, up to `limit`.
    pub async fn for_job(&self, job_id: JobId, limit: usize) -> Vec<ExecutionRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .filter(|r| r.job_id == job_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Most recent record for one job.
    pub async fn latest(&self, job_id: JobId) -> Option<ExecutionRecord> {
        let records = self.records.read().await;
        records.iter().rev().find(|r| r.job_id == job_id).cloned()
    }

    /// Number of retained records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
