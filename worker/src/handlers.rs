// Handlers bundled with the worker binary

use anyhow::Context;
use async_trait::async_trait;
use common::errors::WorkerError;
use common::lifecycle::LifecycleListener;
use common::models::Job;
use common::worker::{HandlerRegistry, JobHandler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Logs the job payload and completes the job
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn perform(&self, job: &mut Job) -> anyhow::Result<()> {
        info!(
            jid = %job.jid(),
            queue = %job.queue(),
            data = %job.data().to_json_string(),
            "Echo"
        );
        job.complete(None).await?;
        Ok(())
    }
}

/// Sleeps for `data.seconds`, renewing the lease along the way, then completes
pub struct SleepHandler;

impl SleepHandler {
    fn seconds(job: &Job) -> anyhow::Result<u64> {
        match job.data().get("seconds") {
            None => Ok(0),
            Some(value) => value
                .as_u64()
                .with_context(|| format!("seconds must be a non-negative integer, got {}", value)),
        }
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn perform(&self, job: &mut Job) -> anyhow::Result<()> {
        let mut left = Duration::from_secs(Self::seconds(job)?);

        while !left.is_zero() {
            // Renew at half the remaining lease, at least once a second
            let step = Duration::from_secs_f64((job.ttl() / 2.0).max(1.0)).min(left);
            tokio::time::sleep(step).await;
            left -= step;
            if !left.is_zero() {
                job.heartbeat().await?;
            }
        }

        job.complete(None).await?;
        Ok(())
    }
}

/// Traces job lifecycle points
pub struct LifecycleLogger;

#[async_trait]
impl LifecycleListener for LifecycleLogger {
    async fn before_perform(&self, job: &Job) -> anyhow::Result<()> {
        debug!(
            jid = %job.jid(),
            klass = %job.klass(),
            method = %job.perform_method(),
            "Performing job"
        );
        Ok(())
    }

    async fn after_perform(&self, job: &Job) -> anyhow::Result<()> {
        debug!(jid = %job.jid(), state = ?job.state(), "Job performed");
        Ok(())
    }

    async fn on_failure(&self, job: &Job, group: &str, message: &str) {
        warn!(jid = %job.jid(), group = %group, message = %message, "Failing job");
    }
}

pub fn registry() -> Result<HandlerRegistry, WorkerError> {
    let mut registry = HandlerRegistry::new();
    registry
        .register("Echo", Arc::new(EchoHandler))?
        .register("Sleep", Arc::new(SleepHandler))?
        .listen(Arc::new(LifecycleLogger));
    Ok(registry)
}
