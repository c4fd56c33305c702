// Master loop: reserve a job, fork executor and watchdog, reap both, repeat

use super::child::{ChildExit, ChildProcess, ChildRole, WatchdogVerdict};
use super::control::{self, ControlCommand, SupervisorHandle};
use super::limits::{LimitExceeded, ResourceLimits};
use super::process::ProcessLauncher;
use crate::client::Client;
use crate::config::LimitsConfig;
use crate::errors::{QueueError, WorkerError};
use crate::models::{Job, FATAL_GROUP};
use crate::reserver::Reserver;
use crate::telemetry;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Poll period while paused
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Why `Supervisor::run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    /// No job was available and the poll interval is zero
    Drained,
    Limit(LimitExceeded),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => f.write_str("shutdown requested"),
            StopReason::Drained => f.write_str("queues drained"),
            StopReason::Limit(limit) => write!(f, "limit reached: {}", limit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub jobs_processed: u64,
    pub reason: StopReason,
}

#[derive(Default)]
struct Children {
    executor: Option<Box<dyn ChildProcess>>,
    watchdog: Option<Box<dyn ChildProcess>>,
}

impl Children {
    fn is_empty(&self) -> bool {
        self.executor.is_none() && self.watchdog.is_none()
    }
}

enum CycleEvent {
    Exited(ChildRole, Result<ChildExit, WorkerError>),
    Command(Option<ControlCommand>),
}

async fn wait_slot(slot: &mut Option<Box<dyn ChildProcess>>) -> Result<ChildExit, WorkerError> {
    match slot {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

fn kill_if_running(child: &mut dyn ChildProcess) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        Ok(None) => {
            if let Err(e) = child.kill() {
                warn!(role = %child.role(), error = %e, "Failed to kill child");
            } else {
                info!(role = %child.role(), pid = ?child.id(), "Killed child");
            }
        }
        Err(e) => warn!(role = %child.role(), error = %e, "Failed to poll child"),
    }
}

fn exit_outcome(exit: ChildExit) -> &'static str {
    match exit {
        ChildExit::Exited(0) => "success",
        ChildExit::Exited(_) => "failure",
        ChildExit::Signaled => "killed",
    }
}

/// Never performs a job itself; every job runs in an executor child while a
/// watchdog child follows the job's events.
pub struct Supervisor {
    client: Client,
    reserver: Box<dyn Reserver>,
    launcher: Arc<dyn ProcessLauncher>,
    limits: ResourceLimits,
    interval: Duration,
    handle: SupervisorHandle,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    children: Children,
    paused: bool,
    shutdown: bool,
    jobs_processed: u64,
}

impl Supervisor {
    pub fn new(
        client: Client,
        reserver: Box<dyn Reserver>,
        launcher: Arc<dyn ProcessLauncher>,
        interval: Duration,
        limits: &LimitsConfig,
    ) -> Self {
        let (handle, commands) = control::channel();
        Self {
            client,
            reserver,
            launcher,
            limits: ResourceLimits::new(limits),
            interval,
            handle,
            commands,
            children: Children::default(),
            paused: false,
            shutdown: false,
            jobs_processed: 0,
        }
    }

    /// Sender for pause, resume and shutdown commands
    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed
    }

    /// Run job cycles until shutdown, a limit, or an empty poll with a zero
    /// interval. Backend transport failures end the run with an error.
    #[instrument(skip(self), fields(worker = %self.client.worker_name()))]
    pub async fn run(&mut self) -> Result<RunSummary, WorkerError> {
        info!(reserver = %self.reserver.description(), "Supervisor started");
        self.limits.start();

        let result = self.run_cycles().await;
        self.kill_children();

        if let Ok(summary) = &result {
            info!(
                jobs_processed = summary.jobs_processed,
                reason = %summary.reason,
                "Supervisor stopped"
            );
        }
        result
    }

    async fn run_cycles(&mut self) -> Result<RunSummary, WorkerError> {
        let reason = loop {
            self.drain_commands();
            if self.shutdown {
                break StopReason::Shutdown;
            }
            if let Some(limit) = self.limits.check(self.jobs_processed) {
                info!(limit = %limit, "Resource limit reached");
                break StopReason::Limit(limit);
            }
            if self.paused {
                self.idle(PAUSE_POLL_INTERVAL).await;
                continue;
            }

            let job = match self.reserver.reserve().await? {
                Some(job) => job,
                None if self.interval.is_zero() => break StopReason::Drained,
                None => {
                    debug!(interval = ?self.interval, "No job available, sleeping");
                    self.idle(self.interval).await;
                    continue;
                }
            };

            self.run_cycle(job).await?;
            self.jobs_processed += 1;
            self.client.reconnect().await?;
        };

        Ok(RunSummary {
            jobs_processed: self.jobs_processed,
            reason,
        })
    }

    /// Sleep until `duration` elapses or any control command arrives
    async fn idle(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            command = self.commands.recv() => {
                if let Some(command) = command {
                    self.apply(command);
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Pause => {
                if !self.paused {
                    info!("Pausing: no new jobs will be reserved");
                }
                self.paused = true;
            }
            ControlCommand::Resume => {
                if self.paused {
                    info!("Resuming");
                }
                self.paused = false;
            }
            ControlCommand::Shutdown => {
                info!("Shutdown requested, finishing current cycle");
                self.shutdown = true;
            }
            ControlCommand::ShutdownNow => {
                warn!("Immediate shutdown requested");
                self.shutdown = true;
                self.kill_children();
            }
            ControlCommand::KillChildren => self.kill_children(),
        }
    }

    /// Kill every live child of the current cycle; a no-op between cycles
    pub fn kill_children(&mut self) {
        if let Some(executor) = self.children.executor.as_mut() {
            kill_if_running(executor.as_mut());
        }
        if let Some(watchdog) = self.children.watchdog.as_mut() {
            kill_if_running(watchdog.as_mut());
        }
    }

    #[instrument(skip(self, job), fields(jid = %job.jid(), klass = %job.klass()))]
    async fn run_cycle(&mut self, mut job: Job) -> Result<(), WorkerError> {
        let started = Instant::now();
        self.reserver.before_fork().await?;

        let executor = self.launcher.spawn_executor(job.record()).await?;
        self.children.executor = Some(executor);

        match self.launcher.spawn_watchdog(job.jid(), job.worker()).await {
            Ok(watchdog) => self.children.watchdog = Some(watchdog),
            Err(e) => {
                error!(error = %e, "Watchdog could not be started, stopping executor");
                self.reap_executor().await;
                return Err(e);
            }
        }

        let result = self.supervise(&mut job).await;
        telemetry::record_cycle_duration(started.elapsed().as_secs_f64());
        result
    }

    /// Kill the executor of the current cycle and wait for it to go away
    async fn reap_executor(&mut self) {
        if let Some(mut executor) = self.children.executor.take() {
            kill_if_running(executor.as_mut());
            if let Err(e) = executor.wait().await {
                warn!(error = %e, "Failed to reap executor");
            }
        }
    }

    /// Reap both children, reacting to each exit and to control commands
    async fn supervise(&mut self, job: &mut Job) -> Result<(), WorkerError> {
        let mut interrupted = false;
        let mut watchdog_dismissed = false;

        while !self.children.is_empty() {
            let event = tokio::select! {
                exit = wait_slot(&mut self.children.executor) => {
                    CycleEvent::Exited(ChildRole::Executor, exit)
                }
                exit = wait_slot(&mut self.children.watchdog) => {
                    CycleEvent::Exited(ChildRole::Watchdog, exit)
                }
                command = self.commands.recv() => CycleEvent::Command(command),
            };

            match event {
                CycleEvent::Exited(ChildRole::Executor, result) => {
                    let Some(mut executor) = self.children.executor.take() else {
                        continue;
                    };
                    let exit = result.unwrap_or_else(|e| {
                        warn!(error = %e, "Lost track of executor");
                        ChildExit::Signaled
                    });
                    telemetry::record_child_exit("executor", exit_outcome(exit));
                    debug!(exit = %exit, "Executor exited");

                    if let Some(watchdog) = self.children.watchdog.as_mut() {
                        watchdog_dismissed = true;
                        kill_if_running(watchdog.as_mut());
                    }

                    if !exit.success() && !interrupted {
                        self.report_executor_failure(job, executor.as_mut(), exit)
                            .await?;
                    }
                }
                CycleEvent::Exited(ChildRole::Watchdog, result) => {
                    let Some(mut watchdog) = self.children.watchdog.take() else {
                        continue;
                    };
                    let exit = result.unwrap_or_else(|e| {
                        warn!(error = %e, "Lost track of watchdog");
                        ChildExit::Signaled
                    });
                    telemetry::record_child_exit("watchdog", exit_outcome(exit));

                    match WatchdogVerdict::from_exit(exit) {
                        Some(verdict) if verdict.interrupts() => {
                            if let Some(executor) = self.children.executor.as_mut() {
                                warn!(verdict = ?verdict, "Stopping executor");
                                interrupted = true;
                                kill_if_running(executor.as_mut());
                            }
                        }
                        Some(_) => debug!("Watchdog saw the job resolve"),
                        None if watchdog_dismissed => debug!("Watchdog dismissed"),
                        None => {
                            let diagnostic = watchdog.take_diagnostic().await;
                            warn!(
                                exit = %exit,
                                diagnostic = ?diagnostic.map(|d| d.to_string()),
                                "Watchdog ended without a verdict"
                            );
                        }
                    }
                }
                CycleEvent::Command(Some(command)) => self.apply(command),
                // The supervisor holds a sender, so the channel never closes
                CycleEvent::Command(None) => {}
            }
        }

        Ok(())
    }

    async fn report_executor_failure(
        &mut self,
        job: &mut Job,
        executor: &mut dyn ChildProcess,
        exit: ChildExit,
    ) -> Result<(), WorkerError> {
        let mut message = format!("{} process failed with status: {}", ChildRole::Executor, exit);
        if let Some(diagnostic) = executor.take_diagnostic().await {
            message = format!("{}: {}", message, diagnostic);
        }
        error!(message = %message, "Executor failed");
        telemetry::record_job_fatal(job.klass());

        match job.fail(FATAL_GROUP, &message).await {
            Ok(_) => Ok(()),
            Err(e @ QueueError::Transport(_)) => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Could not record executor failure");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("worker", &self.client.worker_name())
            .field("reserver", &self.reserver.description())
            .field("paused", &self.paused)
            .field("shutdown", &self.shutdown)
            .field("jobs_processed", &self.jobs_processed)
            .finish()
    }
}
