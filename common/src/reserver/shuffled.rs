// Round robin over a queue order reshuffled before every fork

use super::{describe, Reserver, RoundRobinReserver};
use crate::client::Queue;
use crate::errors::QueueError;
use crate::models::Job;
use async_trait::async_trait;
use rand::seq::SliceRandom;

pub struct ShuffledRoundRobinReserver {
    inner: RoundRobinReserver,
}

impl ShuffledRoundRobinReserver {
    pub fn new(mut queues: Vec<Queue>) -> Self {
        queues.shuffle(&mut rand::thread_rng());
        Self {
            inner: RoundRobinReserver::new(queues),
        }
    }

    pub fn index(&self) -> usize {
        self.inner.index()
    }
}

#[async_trait]
impl Reserver for ShuffledRoundRobinReserver {
    fn queues(&self) -> &[Queue] {
        self.inner.queues()
    }

    async fn reserve(&mut self) -> Result<Option<Job>, QueueError> {
        self.inner.reserve().await
    }

    fn description(&self) -> String {
        describe(self.inner.queues(), "shuffled round robin")
    }

    async fn before_fork(&mut self) -> Result<(), QueueError> {
        self.inner.queues_mut().shuffle(&mut rand::thread_rng());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::client::Client;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn names(reserver: &ShuffledRoundRobinReserver) -> Vec<String> {
        reserver
            .queues()
            .iter()
            .map(|q| q.name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_before_fork_permutes_and_varies_order() {
        let client = Client::new(Arc::new(MemoryBackend::new()), "w");
        let configured: Vec<String> = (0..6).map(|i| format!("q{}", i)).collect();
        let mut reserver = ShuffledRoundRobinReserver::new(
            configured.iter().map(|q| client.queue(q.clone())).collect(),
        );

        let mut orders = HashSet::new();
        for _ in 0..50 {
            reserver.before_fork().await.unwrap();
            let mut current = names(&reserver);
            orders.insert(current.clone());
            current.sort();
            assert_eq!(current, configured);
        }
        assert!(orders.len() > 1);
        assert!(reserver.description().ends_with("(shuffled round robin)"));
    }
}
