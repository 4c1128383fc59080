//! # Jobwheel Scheduler
//!
//! Scheduled-job management core: job registry, trigger engine, execution
//! coordinator, execution log and the lifecycle service tying them together.
//!
//! ## Architecture
//!
//! - [`registry::JobRegistry`] owns job definitions and states, backed by a
//!   pluggable [`store::JobStore`].
//! - [`trigger::TriggerEngine`] keeps a derived next-fire view for every
//!   scheduled job and raises fire events from a single loop task.
//! - [`executor::ExecutionCoordinator`] runs fires on independent tasks,
//!   enforces concurrency and timeout policy, and writes one
//!   execution record per fire attempt.
//! - [`service::Scheduler`] is the administrative facade: save, update,
//!   query, and the batch run/pause/resume/delete state machine.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jobwheel_protocols::JobSpec;
//! use jobwheel_scheduler::{MemoryJobStore, Scheduler, SchedulerConfig, TargetRegistry};
//!
//! let targets = Arc::new(TargetRegistry::new());
//! targets.register("report", Arc::new(ReportHandler))?;
//!
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     Arc::new(MemoryJobStore::new()),
//!     targets,
//! );
//! scheduler.start().await?;
//!
//! let id = scheduler.save_job(JobSpec::new("nightly", "0 0 2 * * *", "report")).await?;
//! scheduler.run_jobs(&[id]).await;
//! ```

pub mod config;
pub mod error;
pub mod execution_log;
pub mod executor;
pub mod registry;
pub mod service;
pub mod store;
pub mod target;
pub mod trigger;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use execution_log::ExecutionLog;
pub use executor::ExecutionCoordinator;
pub use registry::{JobFilter, JobRegistry, Page};
pub use service::{BatchReport, BatchResult, JobSummary, Scheduler};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use target::TargetRegistry;
pub use trigger::{EngineEvent, TriggerEngine};
