// Recurring job handle

use super::{JobData, RecurringRecord};
use crate::backend::{Backend, TagOp};
use crate::errors::QueueError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument};

/// The closed set of fields `recur.update` accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecurField {
    Interval,
    Backlog,
    Retries,
    Data,
    Klass,
    Queue,
    Priority,
}

impl RecurField {
    pub const ALL: [RecurField; 7] = [
        RecurField::Interval,
        RecurField::Backlog,
        RecurField::Retries,
        RecurField::Data,
        RecurField::Klass,
        RecurField::Queue,
        RecurField::Priority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecurField::Interval => "interval",
            RecurField::Backlog => "backlog",
            RecurField::Retries => "retries",
            RecurField::Data => "data",
            RecurField::Klass => "klass",
            RecurField::Queue => "queue",
            RecurField::Priority => "priority",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            RecurField::Interval | RecurField::Backlog | RecurField::Retries | RecurField::Priority
        )
    }
}

impl fmt::Display for RecurField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecurField {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecurField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| {
                QueueError::Validation(format!("{} is not an updatable recurring job field", s))
            })
    }
}

/// Handle over a recurring job template
#[derive(Clone)]
pub struct RecurringJob {
    record: RecurringRecord,
    backend: Arc<dyn Backend>,
}

impl fmt::Debug for RecurringJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurringJob")
            .field("record", &self.record)
            .finish()
    }
}

impl RecurringJob {
    pub fn new(record: RecurringRecord, backend: Arc<dyn Backend>) -> Self {
        Self { record, backend }
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

    pub fn priority(&self) -> i64 {
        self.record.priority
    }

    pub fn tags(&self) -> &[String] {
        &self.record.tags
    }

    pub fn retries(&self) -> i64 {
        self.record.retries
    }

    pub fn interval(&self) -> i64 {
        self.record.interval
    }

    /// Occurrences spawned so far
    pub fn count(&self) -> i64 {
        self.record.count
    }

    pub fn backlog(&self) -> i64 {
        self.record.backlog
    }

    pub fn record(&self) -> &RecurringRecord {
        &self.record
    }

    /// Update one field; the local copy changes only once the backend agrees.
    ///
    /// Values are validated locally first: numeric fields must parse as
    /// integers and `data` must be a JSON object.
    #[instrument(skip(self, value), fields(jid = %self.record.jid, field = %field))]
    pub async fn update(&mut self, field: RecurField, value: &str) -> Result<bool, QueueError> {
        let number = if field.is_numeric() {
            Some(value.trim().parse::<i64>().map_err(|_| {
                QueueError::Validation(format!("{} must be an integer, got {:?}", field, value))
            })?)
        } else {
            None
        };
        let data = match field {
            RecurField::Data => Some(JobData::from_json_str(value).map_err(QueueError::Validation)?),
            _ => None,
        };

        let wire = match (&number, &data) {
            (Some(n), _) => n.to_string(),
            (_, Some(d)) => d.to_json_string(),
            _ => value.to_string(),
        };

        let updated = self
            .backend
            .recur_update(&self.record.jid, field, &wire)
            .await?;
        if !updated {
            return Ok(false);
        }

        match field {
            RecurField::Interval => self.record.interval = number.unwrap_or(self.record.interval),
            RecurField::Backlog => self.record.backlog = number.unwrap_or(self.record.backlog),
            RecurField::Retries => self.record.retries = number.unwrap_or(self.record.retries),
            RecurField::Priority => self.record.priority = number.unwrap_or(self.record.priority),
            RecurField::Data => {
                if let Some(data) = data {
                    self.record.data = data;
                }
            }
            RecurField::Klass => self.record.klass = value.to_string(),
            RecurField::Queue => self.record.queue = value.to_string(),
        }
        info!("Recurring job updated");
        Ok(true)
    }

    /// Update a field named at runtime; unknown names are rejected before any call
    pub async fn update_named(&mut self, field: &str, value: &str) -> Result<bool, QueueError> {
        let field = field.parse::<RecurField>()?;
        self.update(field, value).await
    }

    /// Move future occurrences to another queue
    pub async fn requeue(&mut self, queue: &str) -> Result<bool, QueueError> {
        self.update(RecurField::Queue, queue).await
    }

    pub async fn tag<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<(), QueueError> {
        self.change_tags(TagOp::Add, tags).await
    }

    pub async fn untag<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<(), QueueError> {
        self.change_tags(TagOp::Remove, tags).await
    }

    async fn change_tags<S: AsRef<str>>(&mut self, op: TagOp, tags: &[S]) -> Result<(), QueueError> {
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        self.record.tags = self.backend.recur_tag(op, &self.record.jid, &tags).await?;
        Ok(())
    }

    /// Stop the recurrence; returns how many templates were removed
    pub async fn cancel(&self) -> Result<u64, QueueError> {
        self.backend.unrecur(&self.record.jid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use mockall::predicate::eq;
    use serde_json::json;

    fn template() -> RecurringRecord {
        serde_json::from_value(json!({
            "jid": "r-1",
            "klass": "Report",
            "queue": "reports",
            "interval": 3600,
            "count": 4
        }))
        .unwrap()
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in RecurField::ALL {
            assert_eq!(field.as_str().parse::<RecurField>().unwrap(), field);
        }
        assert!(matches!(
            "expires".parse::<RecurField>(),
            Err(QueueError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_commits_only_after_ack() {
        let mut mock = MockBackend::new();
        mock.expect_recur_update()
            .with(eq("r-1"), eq(RecurField::Interval), eq("60"))
            .times(1)
            .returning(|_, _, _| Ok(true));
        mock.expect_recur_update()
            .with(eq("r-1"), eq(RecurField::Backlog), eq("3"))
            .times(1)
            .returning(|_, _, _| Ok(false));

        let mut job = RecurringJob::new(template(), Arc::new(mock));
        assert!(job.update(RecurField::Interval, "60").await.unwrap());
        assert_eq!(job.interval(), 60);

        assert!(!job.update(RecurField::Backlog, "3").await.unwrap());
        assert_eq!(job.backlog(), 0);
    }

    #[tokio::test]
    async fn test_invalid_values_never_reach_backend() {
        let mock = MockBackend::new();
        let mut job = RecurringJob::new(template(), Arc::new(mock));

        assert!(job.update(RecurField::Retries, "many").await.is_err());
        assert!(job.update(RecurField::Data, "[1, 2]").await.is_err());
        assert!(job.update_named("count", "2").await.is_err());
        assert_eq!(job.retries(), 0);
    }

    #[tokio::test]
    async fn test_requeue_updates_queue() {
        let mut mock = MockBackend::new();
        mock.expect_recur_update()
            .with(eq("r-1"), eq(RecurField::Queue), eq("nightly"))
            .returning(|_, _, _| Ok(true));

        let mut job = RecurringJob::new(template(), Arc::new(mock));
        assert!(job.requeue("nightly").await.unwrap());
        assert_eq!(job.queue(), "nightly");
    }

    #[tokio::test]
    async fn test_tags_and_cancel() {
        let mut mock = MockBackend::new();
        mock.expect_recur_tag()
            .withf(|op, jid, _| *op == TagOp::Remove && jid == "r-1")
            .returning(|_, _, _| Ok(Vec::new()));
        mock.expect_unrecur().with(eq("r-1")).returning(|_| Ok(1));

        let mut job = RecurringJob::new(template(), Arc::new(mock));
        job.untag(&["old"]).await.unwrap();
        assert!(job.tags().is_empty());
        assert_eq!(job.cancel().await.unwrap(), 1);
        assert_eq!(job.count(), 4);
    }
}
