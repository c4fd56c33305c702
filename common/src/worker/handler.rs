// Job handler capability and the registry resolving handlers by klass

use crate::errors::WorkerError;
use crate::lifecycle::{Lifecycle, LifecycleListener};
use crate::models::{Job, DEFAULT_PERFORM_METHOD};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// JobHandler runs the body of one job.
///
/// Handlers own the job outcome: call `job.complete`, `job.retry` or
/// `job.fail` from `perform`. An `Err` or a panic escaping any hook is turned
/// into a `system:fatal` failure at the perform boundary.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn set_up(&self, _job: &mut Job) -> anyhow::Result<()> {
        Ok(())
    }

    async fn perform(&self, job: &mut Job) -> anyhow::Result<()>;

    /// Dispatch the entry point named by the job's `performMethod` data key.
    /// Handlers with more than one entry point override this.
    async fn perform_method(&self, method: &str, job: &mut Job) -> anyhow::Result<()> {
        if method == DEFAULT_PERFORM_METHOD {
            self.perform(job).await
        } else {
            anyhow::bail!("handler does not contain perform method \"{}\"", method)
        }
    }

    async fn tear_down(&self, _job: &mut Job) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handlers keyed by klass, populated once at worker setup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    fallback: Option<Arc<dyn JobHandler>>,
    lifecycle: Lifecycle,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `klass`; registering the same klass twice is an error
    pub fn register(
        &mut self,
        klass: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<&mut Self, WorkerError> {
        let klass = klass.into();
        if klass.trim().is_empty() {
            return Err(WorkerError::Configuration(
                "Handler klass cannot be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(&klass) {
            return Err(WorkerError::Configuration(format!(
                "Handler already registered for klass {}",
                klass
            )));
        }
        self.handlers.insert(klass, handler);
        Ok(self)
    }

    /// Handler used for every klass without a dedicated registration
    pub fn set_default(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.fallback = Some(handler);
        self
    }

    /// Listen to lifecycle points of every job this registry performs
    pub fn listen(&mut self, listener: Arc<dyn LifecycleListener>) -> &mut Self {
        self.lifecycle.subscribe(listener);
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn resolve(&self, klass: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(klass)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }

    pub fn klasses(&self) -> Vec<&str> {
        let mut klasses: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        klasses.sort_unstable();
        klasses
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("klasses", &self.klasses())
            .field("has_default", &self.fallback.is_some())
            .field("listeners", &self.lifecycle.len())
            .finish()
    }
}
