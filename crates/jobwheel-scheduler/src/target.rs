//! Target registry: name to handler lookup.
//!
//! Replaces by-name reflection with an explicit capability map populated at
//! startup. Job definitions referencing an unregistered target are rejected
//! at save time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use jobwheel_protocols::JobHandler;

use crate::error::SchedulerError;

/// Registry of invocable targets.
pub struct TargetRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl TargetRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under a unique name.
    pub async fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&name) {
            return Err(SchedulerError::TargetExists(name));
        }
        debug!("Registered job target: {}", name);
        handlers.insert(name, handler);
        Ok(())
    }

    /// Look up a handler by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    /// Check whether a target name is registered.
    pub async fn contains(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// Registered target names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobwheel_protocols::{HandlerError, JobContext};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn run(&self, _ctx: JobContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = TargetRegistry::new();
        registry.register("noop", Arc::new(Noop)).await.unwrap();

        assert!(registry.contains("noop").await);
        assert!(registry.get("noop").await.is_some());
        assert!(registry.get("missing").await.is_none());
        assert_eq!(registry.names().await, vec!["noop".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = TargetRegistry::new();
        registry.register("noop", Arc::new(Noop)).await.unwrap();

        let err = registry.register("noop", Arc::new(Noop)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TargetExists(_)));
    }
}
