// Client facade over a backend: queues, jobs, recurring jobs and config

use crate::backend::{Backend, BackoffStrategy, PutRequest, RedisBackend};
use crate::config::RedisConfig;
use crate::errors::QueueError;
use crate::lifecycle::Lifecycle;
use crate::models::{Job, JobData, JobRecord, QueueCounts, RecurringJob};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Entry point shared by the supervisor, reservers and job handlers
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
    worker_name: String,
    lifecycle: Lifecycle,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("worker_name", &self.worker_name)
            .finish()
    }
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>, worker_name: impl Into<String>) -> Self {
        Self {
            backend,
            worker_name: worker_name.into(),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Fire `lifecycle` for enqueues and for the jobs this client hands out
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn wrap(&self, record: JobRecord) -> Job {
        Job::new(record, Arc::clone(&self.backend)).with_lifecycle(self.lifecycle.clone())
    }

    /// Connect to Redis and load the command script
    pub async fn connect(
        config: &RedisConfig,
        worker_name: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let backend = RedisBackend::connect(config).await?;
        Ok(Self::new(Arc::new(backend), worker_name))
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn queue(&self, name: impl Into<String>) -> Queue {
        Queue {
            name: name.into(),
            client: self.clone(),
        }
    }

    /// Look up a job by jid
    pub async fn job(&self, jid: &str) -> Result<Option<Job>, QueueError> {
        let record = self.backend.get(jid).await?;
        Ok(record.map(|r| self.wrap(r)))
    }

    pub async fn recurring_job(&self, jid: &str) -> Result<Option<RecurringJob>, QueueError> {
        let record = self.backend.get_recurring(jid).await?;
        Ok(record.map(|r| RecurringJob::new(r, Arc::clone(&self.backend))))
    }

    pub fn config(&self) -> ConfigStore {
        ConfigStore {
            backend: Arc::clone(&self.backend),
        }
    }

    /// Counters for every queue the backend advertises
    pub async fn queue_counts(&self) -> Result<Vec<QueueCounts>, QueueError> {
        self.backend.queues().await
    }

    pub async fn reconnect(&self) -> Result<(), QueueError> {
        self.backend.reconnect().await
    }
}

/// Backend-wide settings such as `heartbeat`
#[derive(Clone)]
pub struct ConfigStore {
    backend: Arc<dyn Backend>,
}

impl ConfigStore {
    pub async fn get(&self, name: &str) -> Result<Option<String>, QueueError> {
        self.backend.config_get(name).await
    }

    pub async fn set(&self, name: &str, value: impl ToString) -> Result<(), QueueError> {
        self.backend.config_set(name, &value.to_string()).await
    }

    pub async fn unset(&self, name: &str) -> Result<(), QueueError> {
        self.backend.config_unset(name).await
    }
}

/// Options for `Queue::put`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    /// Generated when absent
    pub jid: Option<String>,
    pub delay: u64,
    pub priority: i64,
    pub tags: Vec<String>,
    /// Defaults to 5 like the backend
    pub retries: Option<i64>,
    pub depends: Vec<String>,
    /// Retry backoff forwarded to the backend
    pub backoff: Option<BackoffStrategy>,
}

/// Handle over one named queue
#[derive(Clone)]
pub struct Queue {
    name: String,
    client: Client,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lease at most one job for this client's worker
    pub async fn pop(&self) -> Result<Option<Job>, QueueError> {
        Ok(self.pop_many(1).await?.into_iter().next())
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn pop_many(&self, count: usize) -> Result<Vec<Job>, QueueError> {
        let records = self
            .client
            .backend
            .pop(&self.name, &self.client.worker_name, count)
            .await?;
        debug!(popped = records.len(), "Popped jobs");
        Ok(records.into_iter().map(|r| self.client.wrap(r)).collect())
    }

    /// Enqueue a job, returning its jid. Lifecycle listeners see the enqueue
    /// once the backend accepted it.
    #[instrument(skip(self, data, options), fields(queue = %self.name))]
    pub async fn put(
        &self,
        klass: &str,
        data: JobData,
        options: PutOptions,
    ) -> Result<String, QueueError> {
        let jid = options
            .jid
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let jid = self
            .client
            .backend
            .put(PutRequest {
                worker: self.client.worker_name.clone(),
                queue: self.name.clone(),
                jid,
                klass: klass.to_string(),
                data: data.clone(),
                delay: options.delay,
                priority: options.priority,
                tags: options.tags,
                retries: options.retries.unwrap_or(5),
                depends: options.depends,
                backoff: options.backoff,
            })
            .await?;

        self.client
            .lifecycle
            .after_enqueue(&self.name, &jid, klass, &data)
            .await;
        Ok(jid)
    }

    pub async fn length(&self) -> Result<u64, QueueError> {
        self.client.backend.length(&self.name).await
    }

    /// Statistics for the day containing `date` (Unix seconds)
    pub async fn stats(&self, date: i64) -> Result<serde_json::Value, QueueError> {
        self.client.backend.stats(&self.name, date).await
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Queue").field(&self.name).finish()
    }
}
