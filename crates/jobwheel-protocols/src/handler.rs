//! The handler seam: the fixed invocation interface scheduled work implements.
//!
//! Targets are plain async handlers registered by name at startup. The
//! scheduler resolves a job's `target` string to a handler and invokes it
//! with the job's parameters on every fire.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::{FireOrigin, JobId};

/// Errors a job handler may return.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The work itself failed.
    #[error("job execution failed: {0}")]
    Failed(String),

    /// The configured parameters were unusable.
    #[error("bad job parameters: {0}")]
    BadParams(String),
}

/// Everything a handler gets to see about the fire it is servicing.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job being executed.
    pub job_id: JobId,
    /// Correlation ID of this fire attempt.
    pub fire_id: Uuid,
    /// Scheduled or manual.
    pub origin: FireOrigin,
    /// Parameters configured on the job definition.
    pub params: HashMap<String, String>,
    /// Advisory cancellation signal. Cancelled when the job is deleted or
    /// the scheduler shuts down; handlers may observe it or ignore it.
    pub cancel: CancellationToken,
}

/// A registered unit of work.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one fire of the job.
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
            ctx.params
                .get("message")
                .map(|_| ())
                .ok_or_else(|| HandlerError::BadParams("missing 'message'".into()))
        }
    }

    fn context(params: HashMap<String, String>) -> JobContext {
        JobContext {
            job_id: 1,
            fire_id: Uuid::new_v4(),
            origin: FireOrigin::Manual,
            params,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let handler = Echo;
        let mut params = HashMap::new();
        params.insert("message".to_string(), "hi".to_string());
        assert!(handler.run(context(params)).await.is_ok());
    }

    #[tokio::test]
    async fn test_handler_bad_params() {
        let handler = Echo;
        let err = handler.run(context(HashMap::new())).await.unwrap_err();
        assert!(err.to_string().contains("bad job parameters"));
    }
}
