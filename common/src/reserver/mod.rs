// Reservation strategies choosing which queue to pop next

pub mod ordered;
pub mod round_robin;
pub mod shuffled;
pub mod spec;

pub use ordered::OrderedReserver;
pub use round_robin::RoundRobinReserver;
pub use shuffled::ShuffledRoundRobinReserver;
pub use spec::SpecReserver;

use crate::client::{Client, Queue};
use crate::config::{ReserverKind, WorkerConfig};
use crate::errors::{QueueError, WorkerError};
use crate::models::Job;
use crate::telemetry;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

/// Reserver selects the next job for a worker.
///
/// `reserve` returns `Ok(None)` when nothing is available and only errors on
/// backend failures.
#[async_trait]
pub trait Reserver: Send {
    /// Queues in the order the next scan will try them
    fn queues(&self) -> &[Queue];

    async fn reserve(&mut self) -> Result<Option<Job>, QueueError>;

    /// Human readable identity, e.g. `a, b (round robin)`
    fn description(&self) -> String;

    /// Called right before the worker starts a new executor
    async fn before_fork(&mut self) -> Result<(), QueueError> {
        Ok(())
    }
}

impl ReserverKind {
    pub fn label(&self) -> &'static str {
        match self {
            ReserverKind::Ordered => "ordered",
            ReserverKind::RoundRobin => "round robin",
            ReserverKind::ShuffledRoundRobin => "shuffled round robin",
        }
    }
}

pub(crate) fn describe(queues: &[Queue], label: &str) -> String {
    let names: Vec<&str> = queues.iter().map(Queue::name).collect();
    format!("{} ({})", names.join(", "), label)
}

/// Pop from `queue`, logging and counting a hit
pub(crate) async fn try_pop(queue: &Queue) -> Result<Option<Job>, QueueError> {
    let job = queue.pop().await?;
    if let Some(job) = &job {
        info!(queue = %queue, jid = %job.jid(), "Found a job");
        telemetry::record_job_reserved(queue.name());
    }
    Ok(job)
}

/// Build the reserver for `kind` over a fixed queue list
pub fn build(kind: ReserverKind, queues: Vec<Queue>) -> Box<dyn Reserver> {
    match kind {
        ReserverKind::Ordered => Box::new(OrderedReserver::new(queues)),
        ReserverKind::RoundRobin => Box::new(RoundRobinReserver::new(queues)),
        ReserverKind::ShuffledRoundRobin => Box::new(ShuffledRoundRobinReserver::new(queues)),
    }
}

/// Build the configured reserver; patterns yield a dynamically resolved one
pub async fn from_config(
    client: &Client,
    config: &WorkerConfig,
) -> Result<Box<dyn Reserver>, WorkerError> {
    let spec = QueueSpec::new(config.queues.clone())?;
    if spec.is_static() {
        let queues = spec.literals().map(|name| client.queue(name)).collect();
        return Ok(build(config.reserver, queues));
    }

    let reserver = SpecReserver::new(client.clone(), spec, config.reserver).await?;
    debug!(reserver = %reserver.description(), "Resolved queue patterns");
    Ok(Box::new(reserver))
}

#[derive(Debug, Clone)]
enum SpecEntry {
    Literal(String),
    Pattern { raw: String, regex: Regex },
}

/// Ordered list of queue names and `*`/`?` wildcard patterns
#[derive(Debug, Clone)]
pub struct QueueSpec {
    entries: Vec<SpecEntry>,
}

impl QueueSpec {
    pub fn new(entries: Vec<String>) -> Result<Self, WorkerError> {
        if entries.is_empty() {
            return Err(WorkerError::Configuration(
                "Either a queue list or queue patterns are required.".to_string(),
            ));
        }

        let entries = entries
            .into_iter()
            .map(|raw| {
                let raw = raw.trim().to_string();
                if raw.is_empty() {
                    return Err(WorkerError::Configuration(
                        "Queue names cannot be empty".to_string(),
                    ));
                }
                if !raw.contains(['*', '?']) {
                    return Ok(SpecEntry::Literal(raw));
                }
                let regex = Regex::new(&wildcard_to_regex(&raw)).map_err(|e| {
                    WorkerError::Configuration(format!("Invalid queue pattern {}: {}", raw, e))
                })?;
                Ok(SpecEntry::Pattern { raw, regex })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { entries })
    }

    /// True when no entry needs resolving against the backend
    pub fn is_static(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e, SpecEntry::Literal(_)))
    }

    pub fn literals(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            SpecEntry::Literal(name) => Some(name.as_str()),
            SpecEntry::Pattern { .. } => None,
        })
    }

    /// Expand against the advertised queue names.
    ///
    /// Literal names are always kept; each pattern contributes its matches in
    /// sorted order. Entry order is preserved and duplicates dropped.
    pub fn resolve(&self, advertised: &[String]) -> Vec<String> {
        let mut sorted: Vec<&String> = advertised.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for entry in &self.entries {
            match entry {
                SpecEntry::Literal(name) => {
                    if seen.insert(name.clone()) {
                        resolved.push(name.clone());
                    }
                }
                SpecEntry::Pattern { regex, .. } => {
                    for name in sorted.iter().filter(|n| regex.is_match(n)) {
                        if seen.insert((*name).clone()) {
                            resolved.push((*name).clone());
                        }
                    }
                }
            }
        }
        resolved
    }
}

impl fmt::Display for QueueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw: Vec<&str> = self
            .entries
            .iter()
            .map(|e| match e {
                SpecEntry::Literal(name) => name.as_str(),
                SpecEntry::Pattern { raw, .. } => raw.as_str(),
            })
            .collect();
        f.write_str(&raw.join(", "))
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}
