// Round robin reserver: rotates the starting queue on every call

use super::{describe, try_pop, Reserver};
use crate::client::Queue;
use crate::errors::QueueError;
use crate::models::Job;
use async_trait::async_trait;
use tracing::debug;

pub struct RoundRobinReserver {
    queues: Vec<Queue>,
    index: usize,
}

impl RoundRobinReserver {
    pub fn new(queues: Vec<Queue>) -> Self {
        Self { queues, index: 0 }
    }

    /// Position the next call starts scanning from
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn queues_mut(&mut self) -> &mut Vec<Queue> {
        &mut self.queues
    }
}

#[async_trait]
impl Reserver for RoundRobinReserver {
    fn queues(&self) -> &[Queue] {
        &self.queues
    }

    async fn reserve(&mut self) -> Result<Option<Job>, QueueError> {
        let count = self.queues.len();
        if count == 0 {
            return Ok(None);
        }
        debug!(reserver = %self.description(), start = self.index, "Attempting to reserve a job");

        let start = self.index;
        // Advance once per call, hit or miss
        self.index = (start + 1) % count;

        for offset in 0..count {
            let queue = &self.queues[(start + offset) % count];
            if let Some(job) = try_pop(queue).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    fn description(&self) -> String {
        describe(&self.queues, "round robin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::client::{Client, PutOptions};
    use crate::models::JobData;
    use std::sync::Arc;

    fn setup() -> (Client, RoundRobinReserver) {
        let client = Client::new(Arc::new(MemoryBackend::new()), "w");
        let queues = ["a", "b", "c"].iter().map(|q| client.queue(*q)).collect();
        (client, RoundRobinReserver::new(queues))
    }

    #[tokio::test]
    async fn test_index_advances_on_miss() {
        let (_client, mut reserver) = setup();
        for expected in [1, 2, 0, 1] {
            assert!(reserver.reserve().await.unwrap().is_none());
            assert_eq!(reserver.index(), expected);
        }
    }

    #[tokio::test]
    async fn test_rotation_spreads_across_queues() {
        let (client, mut reserver) = setup();
        for queue in ["a", "b", "c"] {
            for _ in 0..2 {
                client
                    .queue(queue)
                    .put("Sample", JobData::new(), PutOptions::default())
                    .await
                    .unwrap();
            }
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(reserver.reserve().await.unwrap().unwrap().queue().to_string());
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_only_non_empty_queue_is_found_from_any_start() {
        let (client, mut reserver) = setup();
        for _ in 0..3 {
            client
                .queue("c")
                .put("Sample", JobData::new(), PutOptions::default())
                .await
                .unwrap();
        }
        for _ in 0..3 {
            let job = reserver.reserve().await.unwrap().unwrap();
            assert_eq!(job.queue(), "c");
        }
        assert_eq!(reserver.index(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_list_reserves_nothing() {
        let mut reserver = RoundRobinReserver::new(Vec::new());
        assert!(reserver.reserve().await.unwrap().is_none());
        assert_eq!(reserver.description(), " (round robin)");
    }
}
