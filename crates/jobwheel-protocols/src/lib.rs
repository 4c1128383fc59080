//! # Jobwheel Protocols
//!
//! Shared types for the jobwheel scheduling service.
//!
//! This crate defines the job model (definitions, states, fire events and
//! execution records) and the handler seam through which scheduled work is
//! invoked. It contains no scheduling logic; the engine lives in
//! `jobwheel-scheduler`.

pub mod handler;
pub mod job;

pub use handler::{HandlerError, JobContext, JobHandler};
pub use job::{
    ConcurrencyPolicy, ExecutionOutcome, ExecutionRecord, FireEvent, FireOrigin, JobDefinition,
    JobId, JobRecord, JobSpec, JobState, MisfirePolicy, SkipReason,
};
