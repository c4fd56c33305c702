// Reserver whose queue set is resolved from name patterns on every poll

use super::{build, QueueSpec, Reserver};
use crate::client::{Client, Queue};
use crate::config::ReserverKind;
use crate::errors::QueueError;
use crate::models::Job;
use async_trait::async_trait;
use tracing::{info, instrument};

pub struct SpecReserver {
    client: Client,
    spec: QueueSpec,
    kind: ReserverKind,
    inner: Box<dyn Reserver>,
}

impl SpecReserver {
    /// Resolve `spec` once against the backend and wrap a `kind` reserver
    pub async fn new(
        client: Client,
        spec: QueueSpec,
        kind: ReserverKind,
    ) -> Result<Self, QueueError> {
        let names = resolve_names(&client, &spec).await?;
        let inner = build(kind, names.iter().map(|n| client.queue(n.clone())).collect());
        info!(spec = %spec, queues = ?names, "Resolved queue patterns");
        Ok(Self {
            client,
            spec,
            kind,
            inner,
        })
    }

    pub fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    fn current_names(&self) -> Vec<&str> {
        self.inner.queues().iter().map(Queue::name).collect()
    }

    /// Re-resolve the patterns, rebuilding the inner reserver only when the
    /// queue set changed so rotation state survives
    async fn refresh(&mut self) -> Result<(), QueueError> {
        let names = resolve_names(&self.client, &self.spec).await?;

        let mut sorted_current: Vec<&str> = self.current_names();
        sorted_current.sort_unstable();
        let mut sorted_new: Vec<&str> = names.iter().map(String::as_str).collect();
        sorted_new.sort_unstable();

        if sorted_current != sorted_new {
            info!(queues = ?names, "Queue set changed");
            self.inner = build(
                self.kind,
                names.iter().map(|n| self.client.queue(n.clone())).collect(),
            );
        }
        Ok(())
    }
}

async fn resolve_names(client: &Client, spec: &QueueSpec) -> Result<Vec<String>, QueueError> {
    let advertised: Vec<String> = client
        .queue_counts()
        .await?
        .into_iter()
        .map(|counts| counts.name)
        .collect();
    Ok(spec.resolve(&advertised))
}

#[async_trait]
impl Reserver for SpecReserver {
    fn queues(&self) -> &[Queue] {
        self.inner.queues()
    }

    async fn reserve(&mut self) -> Result<Option<Job>, QueueError> {
        self.refresh().await?;
        self.inner.reserve().await
    }

    fn description(&self) -> String {
        format!("{} ({})", self.spec, self.kind.label())
    }

    #[instrument(skip(self), fields(spec = %self.spec))]
    async fn before_fork(&mut self) -> Result<(), QueueError> {
        self.refresh().await?;
        self.inner.before_fork().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::client::PutOptions;
    use crate::models::JobData;
    use std::sync::Arc;

    async fn put(client: &Client, queue: &str) {
        client
            .queue(queue)
            .put("Sample", JobData::new(), PutOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_picks_up_new_matching_queues_before_fork() {
        let client = Client::new(Arc::new(MemoryBackend::new()), "w");
        put(&client, "batch-a").await;
        put(&client, "other").await;

        let spec = QueueSpec::new(vec!["critical".to_string(), "batch-*".to_string()]).unwrap();
        let mut reserver = SpecReserver::new(client.clone(), spec, ReserverKind::Ordered)
            .await
            .unwrap();
        assert_eq!(reserver.current_names(), vec!["critical", "batch-a"]);
        assert_eq!(reserver.description(), "critical, batch-* (ordered)");

        put(&client, "batch-b").await;
        reserver.before_fork().await.unwrap();
        assert_eq!(reserver.current_names(), vec!["critical", "batch-a", "batch-b"]);

        let first = reserver.reserve().await.unwrap().unwrap();
        let second = reserver.reserve().await.unwrap().unwrap();
        assert_eq!(first.queue(), "batch-a");
        assert_eq!(second.queue(), "batch-b");
        assert!(reserver.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_discovers_queues_created_after_an_empty_resolve() {
        let client = Client::new(Arc::new(MemoryBackend::new()), "w");
        let spec = QueueSpec::new(vec!["batch-*".to_string()]).unwrap();
        let mut reserver = SpecReserver::new(client.clone(), spec, ReserverKind::RoundRobin)
            .await
            .unwrap();
        assert!(reserver.current_names().is_empty());
        assert!(reserver.reserve().await.unwrap().is_none());

        put(&client, "batch-a").await;
        let job = reserver.reserve().await.unwrap().unwrap();
        assert_eq!(job.queue(), "batch-a");
        assert_eq!(reserver.current_names(), vec!["batch-a"]);
    }
}
