// Job lifecycle hooks: before/after perform, on failure and after enqueue

use crate::models::{Job, JobData};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Observer of job lifecycle points.
///
/// `before_perform` runs after the handler's `set_up`, `after_perform` runs
/// before its `tear_down`. An `Err` from either is handled like a handler
/// error and fails the job with `system:fatal`. `on_failure` and
/// `after_enqueue` are notifications only.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn before_perform(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_perform(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired before the failure reaches the backend
    async fn on_failure(&self, _job: &Job, _group: &str, _message: &str) {}

    /// Fired once the backend accepted a `Queue::put`
    async fn after_enqueue(&self, _queue: &str, _jid: &str, _klass: &str, _data: &JobData) {}
}

/// Ordered set of listeners shared by a client, its jobs and the executor
#[derive(Clone, Default)]
pub struct Lifecycle {
    listeners: Arc<Vec<Arc<dyn LifecycleListener>>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; listeners fire in registration order
    pub fn subscribe(&mut self, listener: Arc<dyn LifecycleListener>) -> &mut Self {
        Arc::make_mut(&mut self.listeners).push(listener);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) async fn before_perform(&self, job: &Job) -> anyhow::Result<()> {
        for listener in self.listeners.iter() {
            listener.before_perform(job).await?;
        }
        Ok(())
    }

    pub(crate) async fn after_perform(&self, job: &Job) -> anyhow::Result<()> {
        for listener in self.listeners.iter() {
            listener.after_perform(job).await?;
        }
        Ok(())
    }

    pub(crate) async fn on_failure(&self, job: &Job, group: &str, message: &str) {
        for listener in self.listeners.iter() {
            listener.on_failure(job, group, message).await;
        }
    }

    pub(crate) async fn after_enqueue(&self, queue: &str, jid: &str, klass: &str, data: &JobData) {
        for listener in self.listeners.iter() {
            listener.after_enqueue(queue, jid, klass, data).await;
        }
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LifecycleListener for Recording {
        async fn after_enqueue(&self, queue: &str, jid: &str, klass: &str, _data: &JobData) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}:{}", self.name, queue, jid, klass));
        }
    }

    #[tokio::test]
    async fn test_listeners_fire_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.is_empty());
        lifecycle
            .subscribe(Arc::new(Recording { name: "a", seen: seen.clone() }))
            .subscribe(Arc::new(Recording { name: "b", seen: seen.clone() }));

        // Clones taken earlier keep their own listener set
        let snapshot = lifecycle.clone();
        lifecycle.subscribe(Arc::new(Recording { name: "c", seen: seen.clone() }));
        assert_eq!(snapshot.len(), 2);

        snapshot.after_enqueue("q", "j1", "Mailer", &JobData::new()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a:q:j1:Mailer", "b:q:j1:Mailer"]);
    }
}
