// In-memory backend for tests and local runs without Redis

use super::{now, Backend, CompleteRequest, MessageStream, PutRequest, TagOp};
use crate::errors::QueueError;
use crate::models::{HistoryEntry, JobData, JobRecord, QueueCounts, RecurField, RecurringRecord};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const EVENTS_CHANNEL: &str = "ql:log";

/// A `fail` call recorded by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub jid: String,
    pub worker: String,
    pub group: String,
    pub message: String,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, JobRecord>,
    /// Waiting jids per queue in insertion order
    waiting: BTreeMap<String, Vec<String>>,
    /// Delayed jids and the time they become available
    scheduled: HashMap<String, f64>,
    recurring: HashMap<String, RecurringRecord>,
    config: HashMap<String, String>,
    failures: Vec<FailureRecord>,
}

/// Backend double honoring the lease, retry and dependency rules of the
/// Lua command script closely enough for supervisor tests
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<String>,
    reconnects: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lost_lock(jid: &str, operation: &str, message: impl Into<String>) -> QueueError {
    QueueError::LostLock {
        jid: jid.to_string(),
        operation: operation.to_string(),
        message: message.into(),
    }
}

fn missing(jid: &str) -> QueueError {
    QueueError::InvalidJob {
        jid: jid.to_string(),
        message: "Job does not exist".to_string(),
    }
}

fn check_lease(job: &JobRecord, worker: &str, operation: &str) -> Result<(), QueueError> {
    if job.state.as_deref() != Some("running") {
        return Err(lost_lock(&job.jid, operation, "Job not currently running"));
    }
    if job.worker != worker {
        return Err(lost_lock(
            &job.jid,
            operation,
            format!("Job given out to another worker: {}", job.worker),
        ));
    }
    Ok(())
}

fn envelope(event: &str, jid: &str, fields: &[(&str, &str)]) -> String {
    let mut map = Map::new();
    map.insert("event".to_string(), json!(event));
    map.insert("jid".to_string(), json!(jid));
    for (key, value) in fields {
        map.insert(key.to_string(), json!(value));
    }
    Value::Object(map).to_string()
}

fn default_config(name: &str) -> Option<&'static str> {
    match name {
        "heartbeat" => Some("60"),
        "grace-period" => Some("10"),
        "jobs-history" => Some("604800"),
        "jobs-history-count" => Some("50000"),
        "stats-history" => Some("30"),
        "histogram-history" => Some("7"),
        _ => None,
    }
}

impl MemoryState {
    fn heartbeat_seconds(&self) -> f64 {
        self.config
            .get("heartbeat")
            .map(String::as_str)
            .or_else(|| default_config("heartbeat"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(60.0)
    }

    fn unlink(&mut self, jid: &str) {
        for jids in self.waiting.values_mut() {
            jids.retain(|j| j != jid);
        }
        self.scheduled.remove(jid);
    }

    fn enqueue(&mut self, jid: &str, queue: &str, delay: u64, at: f64) -> &'static str {
        self.waiting.entry(queue.to_string()).or_default();
        let blocked = self
            .jobs
            .get(jid)
            .map(|job| !job.dependencies.is_empty())
            .unwrap_or(false);
        if blocked {
            "depends"
        } else if delay > 0 {
            self.scheduled.insert(jid.to_string(), at + delay as f64);
            "scheduled"
        } else {
            if let Some(jids) = self.waiting.get_mut(queue) {
                jids.push(jid.to_string());
            }
            "waiting"
        }
    }

    fn promote_scheduled(&mut self, at: f64) {
        let due: Vec<String> = self
            .scheduled
            .iter()
            .filter(|(_, when)| **when <= at)
            .map(|(jid, _)| jid.clone())
            .collect();
        for jid in due {
            self.scheduled.remove(&jid);
            if let Some(job) = self.jobs.get_mut(&jid) {
                job.state = Some("waiting".to_string());
                let queue = job.queue.clone();
                self.waiting.entry(queue).or_default().push(jid);
            }
        }
    }

    // Highest priority first; insertion order among equals
    fn take_waiting(&mut self, queue: &str) -> Option<String> {
        let jids = self.waiting.get(queue)?;
        let mut best: Option<(usize, i64)> = None;
        for (idx, jid) in jids.iter().enumerate() {
            let priority = self.jobs.get(jid).map(|j| j.priority).unwrap_or(0);
            if best.map(|(_, p)| priority > p).unwrap_or(true) {
                best = Some((idx, priority));
            }
        }
        let (idx, _) = best?;
        self.waiting.get_mut(queue).map(|jids| jids.remove(idx))
    }

    fn release_dependents(&mut self, jid: &str) {
        let dependents = self
            .jobs
            .get(jid)
            .map(|job| job.dependents.clone())
            .unwrap_or_default();
        for dependent in dependents {
            let ready = match self.jobs.get_mut(&dependent) {
                Some(job) => {
                    job.dependencies.retain(|d| d != jid);
                    job.dependencies.is_empty() && job.state.as_deref() == Some("depends")
                }
                None => false,
            };
            if ready {
                if let Some(job) = self.jobs.get_mut(&dependent) {
                    job.state = Some("waiting".to_string());
                    let queue = job.queue.clone();
                    self.waiting.entry(queue).or_default().push(dependent);
                }
            }
        }
    }

    fn record_history(&mut self, jid: &str, what: &str, worker: Option<&str>) {
        if let Some(job) = self.jobs.get_mut(jid) {
            job.history.push(HistoryEntry {
                when: now(),
                what: what.to_string(),
                queue: Some(job.queue.clone()),
                worker: worker.map(str::to_string),
            });
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            reconnects: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a raw payload on the events channel
    pub fn publish(&self, payload: impl Into<String>) {
        let _ = self.events.send(payload.into());
    }

    /// Number of live subscriptions to the events channel
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.lock().failures.clone()
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Hand a running job to another worker, as an expired lease would
    pub fn reassign(&self, jid: &str, worker: &str) -> Result<(), QueueError> {
        let previous = {
            let mut state = self.lock();
            let expires = now() + state.heartbeat_seconds();
            let job = state.jobs.get_mut(jid).ok_or_else(|| missing(jid))?;
            let previous = std::mem::replace(&mut job.worker, worker.to_string());
            job.state = Some("running".to_string());
            job.expires = expires;
            previous
        };
        if !previous.is_empty() && previous != worker {
            self.publish(envelope("lock_lost", jid, &[("worker", &previous)]));
        }
        Ok(())
    }

    pub fn add_recurring(&self, record: RecurringRecord) {
        self.lock().recurring.insert(record.jid.clone(), record);
    }

    fn store(&self, request: PutRequest) -> String {
        let mut lost = None;
        let jid = request.jid.clone();
        {
            let mut state = self.lock();
            let at = now();
            state.unlink(&jid);

            let mut record = JobRecord::new(&jid, &request.klass, &request.queue);
            if let Some(old) = state.jobs.get(&jid) {
                if old.state.as_deref() == Some("running")
                    && !old.worker.is_empty()
                    && old.worker != request.worker
                {
                    lost = Some(old.worker.clone());
                }
                record.history = old.history.clone();
                record.dependents = old.dependents.clone();
            }
            record.data = request.data;
            record.priority = request.priority;
            record.tags = request.tags;
            record.retries = request.retries;
            record.remaining = request.retries;

            let mut dependencies = Vec::new();
            for dep in request.depends {
                let pending = state
                    .jobs
                    .get(&dep)
                    .map(|d| d.state.as_deref() != Some("complete"))
                    .unwrap_or(false);
                if pending {
                    if let Some(d) = state.jobs.get_mut(&dep) {
                        if !d.dependents.contains(&jid) {
                            d.dependents.push(jid.clone());
                        }
                    }
                    dependencies.push(dep);
                }
            }
            record.dependencies = dependencies;
            state.jobs.insert(jid.clone(), record);

            let status = state.enqueue(&jid, &request.queue, request.delay, at);
            if let Some(job) = state.jobs.get_mut(&jid) {
                job.state = Some(status.to_string());
            }
            state.record_history(&jid, "put", None);
        }
        if let Some(worker) = lost {
            self.publish(envelope("lock_lost", &jid, &[("worker", &worker)]));
        }
        jid
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn pop(
        &self,
        queue: &str,
        worker: &str,
        count: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        let mut popped = Vec::new();
        let mut lost = Vec::new();
        {
            let mut state = self.lock();
            let at = now();
            let expires = at + state.heartbeat_seconds();
            state.waiting.entry(queue.to_string()).or_default();
            state.promote_scheduled(at);

            // Expired leases are handed out before fresh work
            let mut stale: Vec<String> = state
                .jobs
                .values()
                .filter(|job| {
                    job.queue == queue
                        && matches!(job.state.as_deref(), Some("running") | Some("stalled"))
                        && job.expires < at
                })
                .map(|job| job.jid.clone())
                .collect();
            stale.sort();

            let mut candidates = Vec::new();
            for jid in stale.into_iter().take(count) {
                if let Some(job) = state.jobs.get(&jid) {
                    if !job.worker.is_empty() && job.worker != worker {
                        lost.push((jid.clone(), job.worker.clone()));
                    }
                }
                candidates.push(jid);
            }
            while candidates.len() < count {
                match state.take_waiting(queue) {
                    Some(jid) => candidates.push(jid),
                    None => break,
                }
            }

            for jid in candidates {
                if let Some(job) = state.jobs.get_mut(&jid) {
                    job.worker = worker.to_string();
                    job.state = Some("running".to_string());
                    job.expires = expires;
                }
                state.record_history(&jid, "popped", Some(worker));
                if let Some(job) = state.jobs.get(&jid) {
                    popped.push(job.clone());
                }
            }
        }
        for (jid, previous) in lost {
            self.publish(envelope("lock_lost", &jid, &[("worker", &previous)]));
        }
        Ok(popped)
    }

    async fn get(&self, jid: &str) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.lock().jobs.get(jid).cloned())
    }

    async fn get_recurring(&self, jid: &str) -> Result<Option<RecurringRecord>, QueueError> {
        Ok(self.lock().recurring.get(jid).cloned())
    }

    async fn put(&self, request: PutRequest) -> Result<String, QueueError> {
        Ok(self.store(request))
    }

    async fn heartbeat(&self, jid: &str, worker: &str, data: &JobData) -> Result<f64, QueueError> {
        let mut state = self.lock();
        let expires = now() + state.heartbeat_seconds();
        let job = state.jobs.get_mut(jid).ok_or_else(|| missing(jid))?;
        check_lease(job, worker, "heartbeat")?;
        job.data = data.clone();
        job.expires = expires;
        Ok(expires)
    }

    async fn complete(&self, request: CompleteRequest) -> Result<String, QueueError> {
        let jid = request.jid.clone();
        let status = {
            let mut state = self.lock();
            let at = now();
            let job = state.jobs.get_mut(&jid).ok_or_else(|| missing(&jid))?;
            check_lease(job, &request.worker, "complete")?;
            if job.queue != request.queue {
                return Err(QueueError::Backend {
                    area: "Complete".to_string(),
                    message: format!("Job running in another queue: {}", job.queue),
                });
            }
            job.data = request.data;
            job.worker = String::new();
            job.expires = 0.0;

            let status = match request.next {
                Some(next) => {
                    job.queue = next.clone();
                    for dep in &request.depends {
                        if !job.dependencies.contains(dep) {
                            job.dependencies.push(dep.clone());
                        }
                    }
                    state.enqueue(&jid, &next, request.delay, at)
                }
                None => "complete",
            };
            if let Some(job) = state.jobs.get_mut(&jid) {
                job.state = Some(status.to_string());
            }
            state.record_history(&jid, "done", None);
            if status == "complete" {
                state.release_dependents(&jid);
            }
            status
        };
        self.publish(envelope("completed", &jid, &[("queue", &request.queue)]));
        Ok(status.to_string())
    }

    async fn fail(
        &self,
        jid: &str,
        worker: &str,
        group: &str,
        message: &str,
        data: Option<JobData>,
    ) -> Result<Option<String>, QueueError> {
        {
            let mut state = self.lock();
            let job = state.jobs.get_mut(jid).ok_or_else(|| missing(jid))?;
            check_lease(job, worker, "fail")?;
            if let Some(data) = data {
                job.data = data;
            }
            job.state = Some("failed".to_string());
            job.worker = String::new();
            job.expires = 0.0;
            state.record_history(jid, "failed", Some(worker));
            state.failures.push(FailureRecord {
                jid: jid.to_string(),
                worker: worker.to_string(),
                group: group.to_string(),
                message: message.to_string(),
            });
        }
        self.publish(envelope(
            "failed",
            jid,
            &[("worker", worker), ("group", group), ("message", message)],
        ));
        Ok(Some(jid.to_string()))
    }

    async fn retry(
        &self,
        jid: &str,
        queue: &str,
        worker: &str,
        delay: u64,
        group: &str,
        message: &str,
    ) -> Result<i64, QueueError> {
        let remaining = {
            let mut state = self.lock();
            let at = now();
            let job = state.jobs.get_mut(jid).ok_or_else(|| missing(jid))?;
            check_lease(job, worker, "retry")?;
            job.remaining -= 1;
            job.worker = String::new();
            job.expires = 0.0;
            let remaining = job.remaining;

            if remaining < 0 {
                job.state = Some("failed".to_string());
                state.failures.push(FailureRecord {
                    jid: jid.to_string(),
                    worker: worker.to_string(),
                    group: group.to_string(),
                    message: message.to_string(),
                });
            } else {
                let status = state.enqueue(jid, queue, delay, at);
                if let Some(job) = state.jobs.get_mut(jid) {
                    job.state = Some(status.to_string());
                }
            }
            state.record_history(jid, "retried", Some(worker));
            remaining
        };
        if remaining < 0 {
            self.publish(envelope(
                "failed",
                jid,
                &[("worker", worker), ("group", group), ("message", message)],
            ));
        }
        Ok(remaining)
    }

    async fn cancel(&self, jids: &[String]) -> Result<Vec<String>, QueueError> {
        let mut canceled = Vec::new();
        {
            let mut state = self.lock();
            // Validate the whole batch before touching anything
            for jid in jids {
                if let Some(job) = state.jobs.get(jid) {
                    for dependent in &job.dependents {
                        let live = state.jobs.contains_key(dependent);
                        if live && !jids.contains(dependent) {
                            return Err(QueueError::Backend {
                                area: "Cancel".to_string(),
                                message: format!(
                                    "{} is a dependency of {} but is not mentioned to be canceled",
                                    jid, dependent
                                ),
                            });
                        }
                    }
                }
            }
            for jid in jids {
                state.unlink(jid);
                if let Some(job) = state.jobs.remove(jid) {
                    canceled.push((job.jid, job.worker, job.queue));
                }
            }
        }
        for (jid, worker, queue) in &canceled {
            self.publish(envelope(
                "canceled",
                jid,
                &[("worker", worker), ("queue", queue)],
            ));
        }
        Ok(canceled.into_iter().map(|(jid, _, _)| jid).collect())
    }

    async fn requeue(&self, request: PutRequest) -> Result<String, QueueError> {
        if !self.lock().jobs.contains_key(&request.jid) {
            return Err(missing(&request.jid));
        }
        Ok(self.store(request))
    }

    async fn timeout(&self, jid: &str) -> Result<(), QueueError> {
        let worker = {
            let mut state = self.lock();
            let job = state.jobs.get_mut(jid).ok_or_else(|| missing(jid))?;
            if job.state.as_deref() != Some("running") {
                return Err(QueueError::Backend {
                    area: "Timeout".to_string(),
                    message: format!("Job {} not running", jid),
                });
            }
            job.state = Some("stalled".to_string());
            job.expires = 0.0;
            job.worker.clone()
        };
        self.publish(envelope("lock_lost", jid, &[("worker", &worker)]));
        Ok(())
    }

    async fn tag(&self, op: TagOp, jid: &str, tags: &[String]) -> Result<Vec<String>, QueueError> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(jid).ok_or_else(|| missing(jid))?;
        apply_tags(&mut job.tags, op, tags);
        Ok(job.tags.clone())
    }

    async fn recur_tag(
        &self,
        op: TagOp,
        jid: &str,
        tags: &[String],
    ) -> Result<Vec<String>, QueueError> {
        let mut state = self.lock();
        let job = state.recurring.get_mut(jid).ok_or_else(|| missing(jid))?;
        apply_tags(&mut job.tags, op, tags);
        Ok(job.tags.clone())
    }

    async fn recur_update(
        &self,
        jid: &str,
        field: RecurField,
        value: &str,
    ) -> Result<bool, QueueError> {
        let mut state = self.lock();
        let job = state
            .recurring
            .get_mut(jid)
            .ok_or_else(|| QueueError::Backend {
                area: "Recur.update".to_string(),
                message: format!("No recurring job {}", jid),
            })?;

        let number = || {
            value.parse::<i64>().map_err(|_| QueueError::Backend {
                area: "Recur.update".to_string(),
                message: format!("Arg \"{}\" must be a number: {}", field, value),
            })
        };
        match field {
            RecurField::Interval => job.interval = number()?,
            RecurField::Backlog => job.backlog = number()?,
            RecurField::Retries => job.retries = number()?,
            RecurField::Priority => job.priority = number()?,
            RecurField::Data => {
                job.data = JobData::from_json_str(value).map_err(|e| QueueError::Backend {
                    area: "Recur.update".to_string(),
                    message: e,
                })?
            }
            RecurField::Klass => job.klass = value.to_string(),
            RecurField::Queue => job.queue = value.to_string(),
        }
        Ok(true)
    }

    async fn unrecur(&self, jid: &str) -> Result<u64, QueueError> {
        Ok(self.lock().recurring.remove(jid).map(|_| 1).unwrap_or(0))
    }

    async fn config_get(&self, name: &str) -> Result<Option<String>, QueueError> {
        let state = self.lock();
        Ok(state
            .config
            .get(name)
            .cloned()
            .or_else(|| default_config(name).map(str::to_string)))
    }

    async fn config_set(&self, name: &str, value: &str) -> Result<(), QueueError> {
        self.lock()
            .config
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn config_unset(&self, name: &str) -> Result<(), QueueError> {
        self.lock().config.remove(name);
        Ok(())
    }

    async fn stats(&self, queue: &str, _date: i64) -> Result<Value, QueueError> {
        let state = self.lock();
        let failed = state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.state.as_deref() == Some("failed"))
            .count();
        let retries: i64 = state
            .jobs
            .values()
            .filter(|job| job.queue == queue)
            .map(|job| (job.retries - job.remaining).max(0))
            .sum();
        Ok(json!({"failed": failed, "failures": failed, "retries": retries}))
    }

    async fn queues(&self) -> Result<Vec<QueueCounts>, QueueError> {
        let state = self.lock();
        let counts = state
            .waiting
            .iter()
            .map(|(name, waiting)| {
                let in_queue = |status: &str| {
                    state
                        .jobs
                        .values()
                        .filter(|job| job.queue == *name && job.state.as_deref() == Some(status))
                        .count() as u64
                };
                QueueCounts {
                    name: name.clone(),
                    waiting: waiting.len() as u64,
                    running: in_queue("running"),
                    scheduled: in_queue("scheduled"),
                    stalled: in_queue("stalled"),
                    depends: in_queue("depends"),
                    recurring: state
                        .recurring
                        .values()
                        .filter(|r| r.queue == *name)
                        .count() as u64,
                    paused: false,
                }
            })
            .collect();
        Ok(counts)
    }

    async fn length(&self, queue: &str) -> Result<u64, QueueError> {
        let state = self.lock();
        Ok(state
            .jobs
            .values()
            .filter(|job| {
                job.queue == queue
                    && matches!(
                        job.state.as_deref(),
                        Some("waiting") | Some("running") | Some("scheduled") | Some("stalled")
                    )
            })
            .count() as u64)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, QueueError> {
        if !channels.iter().any(|c| c == EVENTS_CHANNEL) {
            return Ok(futures::stream::pending::<String>().boxed());
        }
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(|msg| async move { msg.ok() });
        Ok(stream.boxed())
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn apply_tags(current: &mut Vec<String>, op: TagOp, tags: &[String]) {
    match op {
        TagOp::Add => {
            for tag in tags {
                if !current.contains(tag) {
                    current.push(tag.clone());
                }
            }
        }
        TagOp::Remove => current.retain(|t| !tags.contains(t)),
    }
}
