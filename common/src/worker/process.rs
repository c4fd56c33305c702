// Launchers for the executor and watchdog of a job cycle, and the entry
// points those children run

use super::child::{ChildExit, ChildProcess, ChildRole, FAILURE_EXIT_CODE, PANIC_EXIT_CODE};
use super::diagnostic::{install_panic_reporter, panic_message, Diagnostic};
use super::handler::HandlerRegistry;
use super::watchdog::watch;
use crate::backend::{Backend, RedisBackend};
use crate::config::Settings;
use crate::errors::{QueueError, WorkerError};
use crate::models::{Job, JobRecord};
use async_trait::async_trait;
use futures::FutureExt;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

/// How long the master waits for a dead child's stdout to drain
const DIAGNOSTIC_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Starts the two children of a job cycle
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start an executor that performs `job`
    async fn spawn_executor(&self, job: &JobRecord) -> Result<Box<dyn ChildProcess>, WorkerError>;

    /// Start a watchdog following events for `jid` leased by `worker`
    async fn spawn_watchdog(
        &self,
        jid: &str,
        worker: &str,
    ) -> Result<Box<dyn ChildProcess>, WorkerError>;
}

// ============================================================================
// OS process isolation
// ============================================================================

/// Re-executes the worker binary with the `executor` and `watchdog`
/// subcommands
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl SubprocessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the subcommand, e.g. global flags
    pub fn with_leading_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Launch children from the currently running executable
    pub fn current_exe() -> Result<Self, WorkerError> {
        let program = std::env::current_exe().map_err(|e| {
            WorkerError::Configuration(format!("Cannot locate worker executable: {}", e))
        })?;
        Ok(Self::new(program))
    }

    fn command(&self, role: ChildRole) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg(role.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Keep terminal signals aimed at the master away from the children
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

fn spawn_error(role: ChildRole, err: impl std::fmt::Display) -> WorkerError {
    WorkerError::Spawn {
        role: role.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl ProcessLauncher for SubprocessLauncher {
    async fn spawn_executor(&self, job: &JobRecord) -> Result<Box<dyn ChildProcess>, WorkerError> {
        let role = ChildRole::Executor;
        let snapshot = serde_json::to_vec(job).map_err(QueueError::from)?;

        let mut command = self.command(role);
        command.stdin(Stdio::piped());
        let mut child = command.spawn().map_err(|e| spawn_error(role, e))?;

        // The executor reads its job snapshot to EOF before anything else
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&snapshot)
                .await
                .map_err(|e| spawn_error(role, e))?;
            stdin.shutdown().await.map_err(|e| spawn_error(role, e))?;
        }

        debug!(jid = %job.jid, pid = ?child.id(), "Executor process started");
        Ok(Box::new(OsChild::new(role, child)))
    }

    async fn spawn_watchdog(
        &self,
        jid: &str,
        worker: &str,
    ) -> Result<Box<dyn ChildProcess>, WorkerError> {
        let role = ChildRole::Watchdog;
        let mut command = self.command(role);
        command.args(["--jid", jid, "--worker", worker]);
        let child = command.spawn().map_err(|e| spawn_error(role, e))?;

        debug!(jid = %jid, pid = ?child.id(), "Watchdog process started");
        Ok(Box::new(OsChild::new(role, child)))
    }
}

struct OsChild {
    role: ChildRole,
    child: Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
}

impl OsChild {
    fn new(role: ChildRole, mut child: Child) -> Self {
        // Drain stdout continuously so a chatty child never blocks on a full pipe
        let stdout = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let _ = out.read_to_end(&mut buffer).await;
                buffer
            })
        });
        Self {
            role,
            child,
            stdout,
        }
    }

    fn os_error(&self, err: std::io::Error) -> WorkerError {
        WorkerError::ChildProcess {
            role: self.role.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ChildProcess for OsChild {
    fn role(&self) -> ChildRole {
        self.role
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ChildExit, WorkerError> {
        match self.child.wait().await {
            Ok(status) => Ok(ChildExit::from(status)),
            Err(e) => Err(self.os_error(e)),
        }
    }

    fn try_wait(&mut self) -> Result<Option<ChildExit>, WorkerError> {
        match self.child.try_wait() {
            Ok(status) => Ok(status.map(ChildExit::from)),
            Err(e) => Err(self.os_error(e)),
        }
    }

    fn kill(&mut self) -> Result<(), WorkerError> {
        self.child.start_kill().map_err(|e| self.os_error(e))
    }

    async fn take_diagnostic(&mut self) -> Option<Diagnostic> {
        let mut reader = self.stdout.take()?;
        match tokio::time::timeout(DIAGNOSTIC_DRAIN_TIMEOUT, &mut reader).await {
            Ok(Ok(output)) => Diagnostic::parse_last(&output),
            Ok(Err(_)) => None,
            Err(_) => {
                reader.abort();
                None
            }
        }
    }
}

// ============================================================================
// In-process isolation
// ============================================================================

/// Runs executor and watchdog as tasks on the master's runtime.
///
/// Panics and aborts are contained per task, but memory and the runtime are
/// shared with the master.
#[derive(Clone)]
pub struct TaskLauncher {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    events_channel: String,
    live: Arc<AtomicUsize>,
}

impl TaskLauncher {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<HandlerRegistry>,
        events_channel: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            registry,
            events_channel: events_channel.into(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Children started by this launcher that have not finished yet
    pub fn live_children(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("events_channel", &self.events_channel)
            .field("live", &self.live_children())
            .finish()
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessLauncher for TaskLauncher {
    async fn spawn_executor(&self, job: &JobRecord) -> Result<Box<dyn ChildProcess>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        let guard = LiveGuard::enter(&self.live);
        let mut job = Job::new(job.clone(), Arc::clone(&self.backend))
            .with_lifecycle(self.registry.lifecycle().clone());
        let registry = Arc::clone(&self.registry);

        let handle = tokio::spawn(async move {
            let _guard = guard;
            match job.perform(&registry).await {
                Ok(_) => 0,
                Err(e) => {
                    let _ = tx.send(Diagnostic::failure(e.to_string()));
                    FAILURE_EXIT_CODE
                }
            }
        });

        Ok(Box::new(TaskChild::new(ChildRole::Executor, handle, rx)))
    }

    async fn spawn_watchdog(
        &self,
        jid: &str,
        worker: &str,
    ) -> Result<Box<dyn ChildProcess>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        let guard = LiveGuard::enter(&self.live);
        let backend = Arc::clone(&self.backend);
        let channel = self.events_channel.clone();
        let jid = jid.to_string();
        let worker = worker.to_string();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            match watch(backend.as_ref(), &channel, &jid, &worker).await {
                Ok(verdict) => verdict.code(),
                Err(e) => {
                    let _ = tx.send(Diagnostic::failure(e.to_string()));
                    FAILURE_EXIT_CODE
                }
            }
        });

        Ok(Box::new(TaskChild::new(ChildRole::Watchdog, handle, rx)))
    }
}

struct TaskChild {
    role: ChildRole,
    handle: JoinHandle<i32>,
    reported: oneshot::Receiver<Diagnostic>,
    panic: Option<Diagnostic>,
    exit: Option<ChildExit>,
}

impl TaskChild {
    fn new(role: ChildRole, handle: JoinHandle<i32>, reported: oneshot::Receiver<Diagnostic>) -> Self {
        Self {
            role,
            handle,
            reported,
            panic: None,
            exit: None,
        }
    }

    // A finished JoinHandle must not be polled again, so the exit is cached
    fn settle(&mut self, result: Result<i32, JoinError>) -> ChildExit {
        let exit = match result {
            Ok(code) => ChildExit::Exited(code),
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                self.panic = Some(Diagnostic::panic(panic_message(payload.as_ref()), ""));
                ChildExit::Exited(PANIC_EXIT_CODE)
            }
            Err(_) => ChildExit::Signaled,
        };
        self.exit = Some(exit);
        exit
    }
}

#[async_trait]
impl ChildProcess for TaskChild {
    fn role(&self) -> ChildRole {
        self.role
    }

    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<ChildExit, WorkerError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let result = (&mut self.handle).await;
        Ok(self.settle(result))
    }

    fn try_wait(&mut self) -> Result<Option<ChildExit>, WorkerError> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        if !self.handle.is_finished() {
            return Ok(None);
        }
        Ok((&mut self.handle)
            .now_or_never()
            .map(|result| self.settle(result)))
    }

    fn kill(&mut self) -> Result<(), WorkerError> {
        if self.exit.is_none() {
            self.handle.abort();
        }
        Ok(())
    }

    async fn take_diagnostic(&mut self) -> Option<Diagnostic> {
        if let Some(diagnostic) = self.panic.take() {
            return Some(diagnostic);
        }
        self.reported.try_recv().ok()
    }
}

// ============================================================================
// Child entry points
// ============================================================================

fn report(message: String) -> i32 {
    error!(message = %message, "Child process failed");
    Diagnostic::failure(message).emit();
    FAILURE_EXIT_CODE
}

/// Body of the `executor` subcommand: read the job snapshot from stdin,
/// perform it and return the process exit code.
pub async fn executor_main(settings: &Settings, registry: &HandlerRegistry) -> i32 {
    install_panic_reporter();

    let mut raw = String::new();
    if let Err(e) = tokio::io::stdin().read_to_string(&mut raw).await {
        return report(format!("Failed to read job snapshot: {}", e));
    }

    let record: JobRecord = match serde_json::from_str(&raw) {
        Ok(record) => record,
        Err(e) => return report(format!("Invalid job snapshot: {}", e)),
    };

    let backend: Arc<dyn Backend> = match RedisBackend::connect(&settings.redis).await {
        Ok(backend) => Arc::new(backend),
        Err(e) => return report(e.to_string()),
    };

    let mut job = Job::new(record, backend).with_lifecycle(registry.lifecycle().clone());
    match job.perform(registry).await {
        Ok(outcome) => {
            info!(jid = %job.jid(), outcome = ?outcome, "Executor finished");
            0
        }
        Err(e) => report(e.to_string()),
    }
}

/// Body of the `watchdog` subcommand; the exit code carries the verdict
pub async fn watchdog_main(settings: &Settings, jid: &str, worker: &str) -> i32 {
    install_panic_reporter();

    let backend = match RedisBackend::connect(&settings.redis).await {
        Ok(backend) => backend,
        Err(e) => return report(e.to_string()),
    };

    match watch(&backend, &settings.redis.events_channel, jid, worker).await {
        Ok(verdict) => verdict.code(),
        Err(e) => report(e.to_string()),
    }
}
