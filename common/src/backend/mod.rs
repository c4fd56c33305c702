// Command surface of the scriptable queue store

pub mod memory;
pub mod redis_backend;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use crate::errors::QueueError;
use crate::models::{JobData, JobRecord, QueueCounts, RecurField, RecurringRecord};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;

/// Raw payloads received on subscribed pub/sub channels
pub type MessageStream = BoxStream<'static, String>;

/// Tag operation for `tag`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOp {
    Add,
    Remove,
}

impl TagOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagOp::Add => "add",
            TagOp::Remove => "remove",
        }
    }
}

/// Exponential retry backoff: `initial_delay` seconds, multiplied by
/// `factor` on every further retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStrategy {
    pub initial_delay: u64,
    pub factor: u64,
}

impl BackoffStrategy {
    pub fn new(initial_delay: u64, factor: u64) -> Self {
        Self {
            initial_delay,
            factor,
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::json!({
            "factor": self.factor,
            "initial_delay": self.initial_delay,
        })
        .to_string()
    }
}

/// Arguments for `put` and `requeue`
#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub worker: String,
    pub queue: String,
    pub jid: String,
    pub klass: String,
    pub data: JobData,
    pub delay: u64,
    pub priority: i64,
    pub tags: Vec<String>,
    pub retries: i64,
    pub depends: Vec<String>,
    pub backoff: Option<BackoffStrategy>,
}

/// Arguments for `complete`
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteRequest {
    pub jid: String,
    pub worker: String,
    pub queue: String,
    pub data: JobData,
    pub next: Option<String>,
    pub delay: u64,
    pub depends: Vec<String>,
}

/// Current Unix time in fractional seconds, the clock argument of every command
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Typed view of the backend command set.
///
/// Lease management, retry bookkeeping and dependency resolution are owned by
/// the backend and assumed atomic; implementations only translate calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Lease up to `count` jobs from `queue` for `worker`
    async fn pop(&self, queue: &str, worker: &str, count: usize)
        -> Result<Vec<JobRecord>, QueueError>;

    async fn get(&self, jid: &str) -> Result<Option<JobRecord>, QueueError>;

    async fn get_recurring(&self, jid: &str) -> Result<Option<RecurringRecord>, QueueError>;

    /// Enqueue a job, returning its jid
    async fn put(&self, request: PutRequest) -> Result<String, QueueError>;

    /// Renew the lease, returning the new expiry timestamp
    async fn heartbeat(&self, jid: &str, worker: &str, data: &JobData)
        -> Result<f64, QueueError>;

    /// Complete a job, returning its new state
    async fn complete(&self, request: CompleteRequest) -> Result<String, QueueError>;

    /// Fail a job; `None` when the backend declined
    async fn fail(
        &self,
        jid: &str,
        worker: &str,
        group: &str,
        message: &str,
        data: Option<JobData>,
    ) -> Result<Option<String>, QueueError>;

    /// Return a job to its queue, returning the retries left
    async fn retry(
        &self,
        jid: &str,
        queue: &str,
        worker: &str,
        delay: u64,
        group: &str,
        message: &str,
    ) -> Result<i64, QueueError>;

    /// Cancel all given jobs atomically, returning the canceled jids
    async fn cancel(&self, jids: &[String]) -> Result<Vec<String>, QueueError>;

    async fn requeue(&self, request: PutRequest) -> Result<String, QueueError>;

    async fn timeout(&self, jid: &str) -> Result<(), QueueError>;

    /// Add or remove tags, returning the authoritative tag list
    async fn tag(&self, op: TagOp, jid: &str, tags: &[String])
        -> Result<Vec<String>, QueueError>;

    async fn recur_tag(&self, op: TagOp, jid: &str, tags: &[String])
        -> Result<Vec<String>, QueueError>;

    async fn recur_update(&self, jid: &str, field: RecurField, value: &str)
        -> Result<bool, QueueError>;

    async fn unrecur(&self, jid: &str) -> Result<u64, QueueError>;

    async fn config_get(&self, name: &str) -> Result<Option<String>, QueueError>;

    async fn config_set(&self, name: &str, value: &str) -> Result<(), QueueError>;

    async fn config_unset(&self, name: &str) -> Result<(), QueueError>;

    async fn stats(&self, queue: &str, date: i64) -> Result<serde_json::Value, QueueError>;

    /// Queues currently advertised by the backend
    async fn queues(&self) -> Result<Vec<QueueCounts>, QueueError>;

    async fn length(&self, queue: &str) -> Result<u64, QueueError>;

    /// Subscribe to pub/sub channels on a dedicated connection
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, QueueError>;

    /// Drop and re-establish the command connection
    async fn reconnect(&self) -> Result<(), QueueError>;
}
