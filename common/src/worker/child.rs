// Handles over the executor and watchdog children of one job cycle

use super::diagnostic::Diagnostic;
use crate::errors::WorkerError;
use async_trait::async_trait;
use std::fmt;

/// Exit code of a child that panicked
pub const PANIC_EXIT_CODE: i32 = 101;

/// Exit code of a child that reported a failure on its diagnostic channel
pub const FAILURE_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRole {
    Executor,
    Watchdog,
}

impl ChildRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildRole::Executor => "executor",
            ChildRole::Watchdog => "watchdog",
        }
    }
}

impl fmt::Display for ChildRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    /// Killed by a signal or aborted
    Signaled,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ChildExit::Exited(code) => Some(*code),
            ChildExit::Signaled => None,
        }
    }
}

impl From<std::process::ExitStatus> for ChildExit {
    fn from(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => ChildExit::Exited(code),
            None => ChildExit::Signaled,
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "{}", code),
            ChildExit::Signaled => f.write_str("killed by signal"),
        }
    }
}

/// What the watchdog saw, carried as its exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// The job completed or failed normally
    Resolved,
    /// The lease was handed to another worker
    LockLost,
    Canceled,
}

impl WatchdogVerdict {
    pub fn code(&self) -> i32 {
        match self {
            WatchdogVerdict::Resolved => 0,
            WatchdogVerdict::LockLost => 3,
            WatchdogVerdict::Canceled => 4,
        }
    }

    pub fn from_exit(exit: ChildExit) -> Option<Self> {
        match exit.code()? {
            0 => Some(WatchdogVerdict::Resolved),
            3 => Some(WatchdogVerdict::LockLost),
            4 => Some(WatchdogVerdict::Canceled),
            _ => None,
        }
    }

    /// Whether the executor has to be stopped
    pub fn interrupts(&self) -> bool {
        !matches!(self, WatchdogVerdict::Resolved)
    }
}

/// A running executor or watchdog
#[async_trait]
pub trait ChildProcess: Send {
    fn role(&self) -> ChildRole;

    /// OS process id, when the child is a process
    fn id(&self) -> Option<u32>;

    /// Wait for the child to exit. Cancel-safe, so it can sit in `select!`.
    async fn wait(&mut self) -> Result<ChildExit, WorkerError>;

    /// Reap without blocking
    fn try_wait(&mut self) -> Result<Option<ChildExit>, WorkerError>;

    /// Start forcible termination; does not wait
    fn kill(&mut self) -> Result<(), WorkerError>;

    /// Read the failure record the child left behind, once, after it exited
    async fn take_diagnostic(&mut self) -> Option<Diagnostic>;
}
