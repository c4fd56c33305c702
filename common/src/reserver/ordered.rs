// Ordered reserver: always scans queues in configured order

use super::{describe, try_pop, Reserver};
use crate::client::Queue;
use crate::errors::QueueError;
use crate::models::Job;
use async_trait::async_trait;
use tracing::debug;

pub struct OrderedReserver {
    queues: Vec<Queue>,
}

impl OrderedReserver {
    pub fn new(queues: Vec<Queue>) -> Self {
        Self { queues }
    }
}

#[async_trait]
impl Reserver for OrderedReserver {
    fn queues(&self) -> &[Queue] {
        &self.queues
    }

    async fn reserve(&mut self) -> Result<Option<Job>, QueueError> {
        debug!(reserver = %self.description(), "Attempting to reserve a job");
        for queue in &self.queues {
            if let Some(job) = try_pop(queue).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    fn description(&self) -> String {
        describe(&self.queues, "ordered")
    }
}
