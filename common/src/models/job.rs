// Job handle: a backend job snapshot plus the commands that mutate it

use super::{HistoryEntry, JobData, JobRecord};
use crate::backend::{now, Backend, CompleteRequest, PutRequest, TagOp};
use crate::errors::QueueError;
use crate::lifecycle::Lifecycle;
use crate::telemetry;
use crate::worker::diagnostic::panic_message;
use crate::worker::handler::{HandlerRegistry, JobHandler};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Failure group used when a job body blows up or a child dies
pub const FATAL_GROUP: &str = "system:fatal";

/// Data key selecting the handler entry point
pub const PERFORM_METHOD_KEY: &str = "performMethod";

/// Entry point used when the data names none
pub const DEFAULT_PERFORM_METHOD: &str = "perform";

/// Where a completed job goes next
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompleteNext {
    pub queue: String,
    pub delay: u64,
    pub depends: Vec<String>,
}

impl CompleteNext {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: u64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_depends(mut self, depends: Vec<String>) -> Self {
        self.depends = depends;
        self
    }
}

/// Overrides for `requeue`; unset fields keep the job's current values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequeueOptions {
    pub delay: u64,
    pub data: Option<JobData>,
    pub priority: Option<i64>,
    pub retries: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub depends: Option<Vec<String>>,
}

/// How the perform boundary resolved a job
#[derive(Debug, Clone, PartialEq)]
pub enum PerformOutcome {
    /// The handler returned normally
    Performed,
    /// The handler failed and the job was failed with `system:fatal`
    Failed { message: String },
}

/// Handle over one job record.
///
/// The backend is the source of truth. Every command issues exactly one
/// backend call and only then overwrites the local fields the call echoes;
/// on error the snapshot is left untouched.
#[derive(Clone)]
pub struct Job {
    record: JobRecord,
    backend: Arc<dyn Backend>,
    lifecycle: Lifecycle,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("record", &self.record).finish()
    }
}

impl Job {
    pub fn new(record: JobRecord, backend: Arc<dyn Backend>) -> Self {
        Self {
            record,
            backend,
            lifecycle: Lifecycle::default(),
        }
    }

    /// Attach the listeners fired around perform and on failure
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Handler entry point named by the `performMethod` data key
    pub fn perform_method(&self) -> &str {
        self.record
            .data
            .get(PERFORM_METHOD_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PERFORM_METHOD)
    }

    pub fn jid(&self) -> &str {
        &self.record.jid
    }

    pub fn klass(&self) -> &str {
        &self.record.klass
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    pub fn data(&self) -> &JobData {
        &self.record.data
    }

    pub fn data_mut(&mut self) -> &mut JobData {
        &mut self.record.data
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.record.history
    }

    pub fn dependencies(&self) -> &[String] {
        &self.record.dependencies
    }

    pub fn dependents(&self) -> &[String] {
        &self.record.dependents
    }

    pub fn priority(&self) -> i64 {
        self.record.priority
    }

    /// Current lease holder
    pub fn worker(&self) -> &str {
        &self.record.worker
    }

    pub fn tags(&self) -> &[String] {
        &self.record.tags
    }

    pub fn expires(&self) -> f64 {
        self.record.expires
    }

    pub fn remaining(&self) -> i64 {
        self.record.remaining
    }

    pub fn retries(&self) -> i64 {
        self.record.retries
    }

    pub fn state(&self) -> Option<&str> {
        self.record.state.as_deref()
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn into_record(self) -> JobRecord {
        self.record
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Seconds left on the lease; negative once it has expired
    pub fn ttl(&self) -> f64 {
        self.record.expires - now()
    }

    pub async fn tag<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<(), QueueError> {
        self.change_tags(TagOp::Add, tags).await
    }

    pub async fn untag<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<(), QueueError> {
        self.change_tags(TagOp::Remove, tags).await
    }

    async fn change_tags<S: AsRef<str>>(&mut self, op: TagOp, tags: &[S]) -> Result<(), QueueError> {
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        let current = self.backend.tag(op, &self.record.jid, &tags).await?;
        self.record.tags = current;
        Ok(())
    }

    /// Complete the job, optionally advancing it to another queue
    #[instrument(skip(self), fields(jid = %self.record.jid))]
    pub async fn complete(&mut self, next: Option<CompleteNext>) -> Result<String, QueueError> {
        let request = CompleteRequest {
            jid: self.record.jid.clone(),
            worker: self.record.worker.clone(),
            queue: self.record.queue.clone(),
            data: self.record.data.clone(),
            next: next.as_ref().map(|n| n.queue.clone()),
            delay: next.as_ref().map(|n| n.delay).unwrap_or(0),
            depends: next.as_ref().map(|n| n.depends.clone()).unwrap_or_default(),
        };

        let state = self.backend.complete(request).await?;

        if let Some(next) = next {
            self.record.queue = next.queue;
        }
        self.record.state = Some(state.clone());
        Ok(state)
    }

    /// Put the job back, into `queue` or its current queue
    #[instrument(skip(self, options), fields(jid = %self.record.jid))]
    pub async fn requeue(
        &mut self,
        queue: Option<&str>,
        options: RequeueOptions,
    ) -> Result<String, QueueError> {
        let request = PutRequest {
            worker: self.record.worker.clone(),
            queue: queue.unwrap_or(&self.record.queue).to_string(),
            jid: self.record.jid.clone(),
            klass: self.record.klass.clone(),
            data: options.data.unwrap_or_else(|| self.record.data.clone()),
            delay: options.delay,
            priority: options.priority.unwrap_or(self.record.priority),
            tags: options.tags.unwrap_or_else(|| self.record.tags.clone()),
            retries: options.retries.unwrap_or(self.record.retries),
            depends: options
                .depends
                .unwrap_or_else(|| self.record.dependencies.clone()),
            backoff: None,
        };

        let jid = self.backend.requeue(request.clone()).await?;

        self.record.queue = request.queue;
        self.record.data = request.data;
        self.record.priority = request.priority;
        self.record.tags = request.tags;
        self.record.retries = request.retries;
        self.record.dependencies = request.depends;
        self.record.worker = String::new();
        self.record.state = Some(if request.delay > 0 { "scheduled" } else { "waiting" }.to_string());
        Ok(jid)
    }

    /// Return the job to its queue, consuming one retry
    #[instrument(skip(self, message), fields(jid = %self.record.jid))]
    pub async fn retry(&mut self, group: &str, message: &str, delay: u64) -> Result<i64, QueueError> {
        let remaining = self
            .backend
            .retry(
                &self.record.jid,
                &self.record.queue,
                &self.record.worker,
                delay,
                group,
                message,
            )
            .await?;

        self.record.remaining = remaining;
        self.record.state = Some(if remaining < 0 { "failed" } else { "waiting" }.to_string());
        Ok(remaining)
    }

    /// Renew the lease with the current data, returning the new expiry.
    ///
    /// Any answer other than a transport failure means the lease is gone.
    pub async fn heartbeat(&mut self) -> Result<f64, QueueError> {
        let expires = self
            .backend
            .heartbeat(&self.record.jid, &self.record.worker, &self.record.data)
            .await
            .map_err(|e| match e {
                QueueError::Transport(_)
                | QueueError::Serialization(_)
                | QueueError::LostLock { .. } => e,
                other => QueueError::LostLock {
                    jid: self.record.jid.clone(),
                    operation: "heartbeat".to_string(),
                    message: other.to_string(),
                },
            })?;

        self.record.expires = expires;
        Ok(expires)
    }

    /// Cancel the job; with `with_dependents`, its recorded dependents go too
    #[instrument(skip(self), fields(jid = %self.record.jid))]
    pub async fn cancel(&mut self, with_dependents: bool) -> Result<Vec<String>, QueueError> {
        let mut jids = vec![self.record.jid.clone()];
        if with_dependents {
            jids.extend(self.record.dependents.iter().cloned());
        }

        let canceled = self.backend.cancel(&jids).await?;
        self.record.state = Some("canceled".to_string());
        Ok(canceled)
    }

    /// Fail the job with a group and message; `None` when the backend declined
    #[instrument(skip(self, message), fields(jid = %self.record.jid))]
    pub async fn fail(&mut self, group: &str, message: &str) -> Result<Option<String>, QueueError> {
        self.lifecycle.on_failure(self, group, message).await;

        let failed = self
            .backend
            .fail(
                &self.record.jid,
                &self.record.worker,
                group,
                message,
                Some(self.record.data.clone()),
            )
            .await?;

        if failed.is_some() {
            self.record.state = Some("failed".to_string());
        }
        Ok(failed)
    }

    pub async fn timeout(&mut self) -> Result<(), QueueError> {
        self.backend.timeout(&self.record.jid).await?;
        self.record.state = Some("stalled".to_string());
        Ok(())
    }

    /// Run the registered handler for this job's klass.
    ///
    /// Handler errors, panics and a missing handler never escape: each is
    /// recorded as a `system:fatal` failure. An `Err` here means that failure
    /// itself could not be recorded.
    #[instrument(skip(self, registry), fields(jid = %self.record.jid, klass = %self.record.klass))]
    pub async fn perform(&mut self, registry: &HandlerRegistry) -> Result<PerformOutcome, QueueError> {
        let klass = self.record.klass.clone();

        let handler = match registry.resolve(&klass) {
            Some(handler) => handler,
            None => {
                return self
                    .fail_fatal(format!("{}: no handler registered for this klass", klass))
                    .await;
            }
        };

        let result = AssertUnwindSafe(run_handler(handler.as_ref(), self))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                info!("Job performed");
                Ok(PerformOutcome::Performed)
            }
            Ok(Err(err)) => self.fail_fatal(format!("{}: {:#}", klass, err)).await,
            Err(payload) => {
                self.fail_fatal(format!("{}: panicked: {}", klass, panic_message(payload.as_ref())))
                    .await
            }
        }
    }

    async fn fail_fatal(&mut self, message: String) -> Result<PerformOutcome, QueueError> {
        error!(jid = %self.record.jid, message = %message, "Job failed at the perform boundary");
        telemetry::record_job_fatal(&self.record.klass);

        match self.fail(FATAL_GROUP, &message).await? {
            Some(_) => {}
            None => warn!(jid = %self.record.jid, "Backend declined the failure"),
        }
        Ok(PerformOutcome::Failed { message })
    }
}

async fn run_handler(handler: &dyn JobHandler, job: &mut Job) -> anyhow::Result<()> {
    let lifecycle = job.lifecycle.clone();
    let method = job.perform_method().to_string();

    handler.set_up(job).await?;
    lifecycle.before_perform(job).await?;
    handler.perform_method(&method, job).await?;
    lifecycle.after_perform(job).await?;
    handler.tear_down(job).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use async_trait::async_trait;
    use mockall::predicate::eq;

    fn running_record() -> JobRecord {
        let mut record = JobRecord::new("jid-1", "Sample", "default");
        record.worker = "w-1".to_string();
        record.expires = 100.0;
        record.dependents = vec!["d1".to_string(), "d2".to_string()];
        record.state = Some("running".to_string());
        record
    }

    fn job_with(mock: MockBackend) -> Job {
        Job::new(running_record(), Arc::new(mock))
    }

    #[tokio::test]
    async fn test_heartbeat_updates_expires() {
        let mut mock = MockBackend::new();
        mock.expect_heartbeat()
            .withf(|jid, worker, _| jid == "jid-1" && worker == "w-1")
            .times(1)
            .returning(|_, _, _| Ok(160.0));

        let mut job = job_with(mock);
        assert_eq!(job.heartbeat().await.unwrap(), 160.0);
        assert_eq!(job.expires(), 160.0);
    }

    #[tokio::test]
    async fn test_heartbeat_rejection_is_lost_lock_without_mutation() {
        let mut mock = MockBackend::new();
        mock.expect_heartbeat().returning(|_, _, _| {
            Err(QueueError::Backend {
                area: "Heartbeat".to_string(),
                message: "Job given to someone else".to_string(),
            })
        });

        let mut job = job_with(mock);
        let err = job.heartbeat().await.unwrap_err();
        assert!(err.is_lost_lock());
        assert_eq!(job.expires(), 100.0);
    }

    #[tokio::test]
    async fn test_heartbeat_transport_error_propagates() {
        let mut mock = MockBackend::new();
        mock.expect_heartbeat()
            .returning(|_, _, _| Err(QueueError::Transport("refused".to_string())));

        let mut job = job_with(mock);
        assert!(job.heartbeat().await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_cancel_with_dependents_sends_single_batch() {
        let mut mock = MockBackend::new();
        mock.expect_cancel()
            .withf(|jids| jids.to_vec() == vec!["jid-1", "d1", "d2"])
            .times(1)
            .returning(|jids| Ok(jids.to_vec()));

        let mut job = job_with(mock);
        let canceled = job.cancel(true).await.unwrap();
        assert_eq!(canceled.len(), 3);
        assert_eq!(job.state(), Some("canceled"));
    }

    #[tokio::test]
    async fn test_cancel_alone_surfaces_backend_refusal() {
        let mut mock = MockBackend::new();
        mock.expect_cancel()
            .withf(|jids| jids.to_vec() == vec!["jid-1"])
            .returning(|_| {
                Err(QueueError::Backend {
                    area: "Cancel".to_string(),
                    message: "jid-1 is a dependency of d1 but is not mentioned to be canceled"
                        .to_string(),
                })
            });

        let mut job = job_with(mock);
        assert!(job.cancel(false).await.is_err());
        assert_eq!(job.state(), Some("running"));
    }

    #[tokio::test]
    async fn test_complete_with_next_moves_queue() {
        let mut mock = MockBackend::new();
        mock.expect_complete()
            .withf(|req| {
                req.next.as_deref() == Some("later") && req.delay == 5 && req.queue == "default"
            })
            .returning(|_| Ok("scheduled".to_string()));

        let mut job = job_with(mock);
        let state = job
            .complete(Some(CompleteNext::new("later").with_delay(5)))
            .await
            .unwrap();
        assert_eq!(state, "scheduled");
        assert_eq!(job.queue(), "later");
    }

    #[tokio::test]
    async fn test_complete_lost_lock_keeps_snapshot() {
        let mut mock = MockBackend::new();
        mock.expect_complete().returning(|req| {
            Err(QueueError::LostLock {
                jid: req.jid,
                operation: "complete".to_string(),
                message: "Job not currently running".to_string(),
            })
        });

        let mut job = job_with(mock);
        assert!(job.complete(None).await.unwrap_err().is_lost_lock());
        assert_eq!(job.state(), Some("running"));
    }

    #[tokio::test]
    async fn test_tag_replaces_tags_with_backend_answer() {
        let mut mock = MockBackend::new();
        mock.expect_tag()
            .withf(|op, jid, tags| *op == TagOp::Add && jid == "jid-1" && tags.len() == 1)
            .returning(|_, _, _| Ok(vec!["existing".to_string(), "new".to_string()]));

        let mut job = job_with(mock);
        job.tag(&["new"]).await.unwrap();
        assert_eq!(job.tags(), ["existing", "new"]);
    }

    #[tokio::test]
    async fn test_retry_records_remaining() {
        let mut mock = MockBackend::new();
        mock.expect_retry()
            .with(
                eq("jid-1"),
                eq("default"),
                eq("w-1"),
                eq(10u64),
                eq("net"),
                eq("timeout"),
            )
            .returning(|_, _, _, _, _, _| Ok(3));

        let mut job = job_with(mock);
        assert_eq!(job.retry("net", "timeout", 10).await.unwrap(), 3);
        assert_eq!(job.remaining(), 3);
    }

    #[tokio::test]
    async fn test_requeue_missing_job_is_invalid_job() {
        let mut mock = MockBackend::new();
        mock.expect_requeue().returning(|req| {
            Err(QueueError::InvalidJob {
                jid: req.jid,
                message: "Job does not exist".to_string(),
            })
        });

        let mut job = job_with(mock);
        let err = job.requeue(Some("other"), RequeueOptions::default()).await;
        assert!(matches!(err, Err(QueueError::InvalidJob { .. })));
        assert_eq!(job.queue(), "default");
    }

    struct Exploding;

    #[async_trait]
    impl JobHandler for Exploding {
        async fn perform(&self, _job: &mut Job) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    struct Erroring;

    #[async_trait]
    impl JobHandler for Erroring {
        async fn perform(&self, _job: &mut Job) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    fn expect_one_fatal(mock: &mut MockBackend, needle: &'static str) {
        mock.expect_fail()
            .withf(move |jid, worker, group, message, _| {
                jid == "jid-1" && worker == "w-1" && group == FATAL_GROUP && message.contains(needle)
            })
            .times(1)
            .returning(|jid, _, _, _, _| Ok(Some(jid.to_string())));
    }

    #[tokio::test]
    async fn test_perform_converts_panic_into_fatal_failure() {
        let mut mock = MockBackend::new();
        expect_one_fatal(&mut mock, "boom");

        let mut registry = HandlerRegistry::new();
        registry.register("Sample", Arc::new(Exploding)).unwrap();

        let mut job = job_with(mock);
        let outcome = job.perform(&registry).await.unwrap();
        assert!(matches!(outcome, PerformOutcome::Failed { .. }));
        assert_eq!(job.state(), Some("failed"));
    }

    #[tokio::test]
    async fn test_perform_converts_error_into_fatal_failure() {
        let mut mock = MockBackend::new();
        expect_one_fatal(&mut mock, "database unavailable");

        let mut registry = HandlerRegistry::new();
        registry.register("Sample", Arc::new(Erroring)).unwrap();

        let mut job = job_with(mock);
        let outcome = job.perform(&registry).await.unwrap();
        assert_eq!(
            outcome,
            PerformOutcome::Failed {
                message: "Sample: database unavailable".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_perform_without_handler_fails_job() {
        let mut mock = MockBackend::new();
        expect_one_fatal(&mut mock, "no handler registered");

        let mut job = job_with(mock);
        let outcome = job.perform(&HandlerRegistry::new()).await.unwrap();
        assert!(matches!(outcome, PerformOutcome::Failed { .. }));
    }

    type Stack = Arc<std::sync::Mutex<Vec<String>>>;

    struct HookRecorder {
        stack: Stack,
    }

    #[async_trait]
    impl crate::lifecycle::LifecycleListener for HookRecorder {
        async fn before_perform(&self, job: &Job) -> anyhow::Result<()> {
            self.stack.lock().unwrap().push(format!("{}:beforePerform", job.jid()));
            Ok(())
        }

        async fn after_perform(&self, job: &Job) -> anyhow::Result<()> {
            self.stack.lock().unwrap().push(format!("{}:afterPerform", job.jid()));
            Ok(())
        }

        async fn on_failure(&self, job: &Job, group: &str, _message: &str) {
            self.stack.lock().unwrap().push(format!("{}:onFailure:{}", job.jid(), group));
        }
    }

    struct Stacking {
        stack: Stack,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for Stacking {
        async fn set_up(&self, job: &mut Job) -> anyhow::Result<()> {
            self.stack.lock().unwrap().push(format!("{}:setUp", job.jid()));
            Ok(())
        }

        async fn perform(&self, job: &mut Job) -> anyhow::Result<()> {
            self.stack.lock().unwrap().push(format!("{}:perform", job.jid()));
            if self.fail {
                anyhow::bail!("rejected");
            }
            Ok(())
        }

        async fn perform_method(&self, method: &str, job: &mut Job) -> anyhow::Result<()> {
            match method {
                "deliver" => {
                    self.stack.lock().unwrap().push(format!("{}:deliver", job.jid()));
                    Ok(())
                }
                _ => self.perform(job).await,
            }
        }

        async fn tear_down(&self, job: &mut Job) -> anyhow::Result<()> {
            self.stack.lock().unwrap().push(format!("{}:tearDown", job.jid()));
            Ok(())
        }
    }

    async fn traced(data: JobData, stack: &Stack, fail: bool) -> (Job, HandlerRegistry) {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "Sample",
                Arc::new(Stacking {
                    stack: stack.clone(),
                    fail,
                }),
            )
            .unwrap();
        registry.listen(Arc::new(HookRecorder {
            stack: stack.clone(),
        }));

        let backend = Arc::new(crate::backend::MemoryBackend::new());
        backend
            .put(PutRequest {
                worker: String::new(),
                queue: "default".to_string(),
                jid: "jid-1".to_string(),
                klass: "Sample".to_string(),
                data,
                delay: 0,
                priority: 0,
                tags: Vec::new(),
                retries: 5,
                depends: Vec::new(),
                backoff: None,
            })
            .await
            .unwrap();
        let record = backend.pop("default", "w-1", 1).await.unwrap().remove(0);
        let job = Job::new(record, backend).with_lifecycle(registry.lifecycle().clone());
        (job, registry)
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_wrap_perform() {
        let stack: Stack = Arc::default();
        let (mut job, registry) = traced(JobData::new(), &stack, false).await;

        let outcome = job.perform(&registry).await.unwrap();
        assert_eq!(outcome, PerformOutcome::Performed);
        assert_eq!(
            *stack.lock().unwrap(),
            vec![
                "jid-1:setUp",
                "jid-1:beforePerform",
                "jid-1:perform",
                "jid-1:afterPerform",
                "jid-1:tearDown",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_perform_fires_on_failure_instead_of_after_perform() {
        let stack: Stack = Arc::default();
        let (mut job, registry) = traced(JobData::new(), &stack, true).await;

        let outcome = job.perform(&registry).await.unwrap();
        assert!(matches!(outcome, PerformOutcome::Failed { .. }));
        assert_eq!(
            *stack.lock().unwrap(),
            vec![
                "jid-1:setUp",
                "jid-1:beforePerform",
                "jid-1:perform",
                "jid-1:onFailure:system:fatal",
            ]
        );
    }

    #[tokio::test]
    async fn test_perform_method_key_selects_entry_point() {
        let stack: Stack = Arc::default();
        let mut data = JobData::new();
        data.insert(PERFORM_METHOD_KEY.to_string(), serde_json::json!("deliver"));
        let (mut job, registry) = traced(data, &stack, false).await;
        assert_eq!(job.perform_method(), "deliver");

        job.perform(&registry).await.unwrap();
        assert!(stack.lock().unwrap().contains(&"jid-1:deliver".to_string()));
        assert!(!stack.lock().unwrap().contains(&"jid-1:perform".to_string()));
    }
}
