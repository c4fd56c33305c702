// Worker process supervision: master loop, executor and watchdog children

pub mod child;
pub mod control;
pub mod diagnostic;
pub mod handler;
pub mod limits;
pub mod process;
pub mod supervisor;
pub mod watchdog;

pub use child::{ChildExit, ChildProcess, ChildRole, WatchdogVerdict};
pub use control::{ControlCommand, SupervisorHandle};
pub use diagnostic::Diagnostic;
pub use handler::{HandlerRegistry, JobHandler};
pub use limits::{LimitExceeded, ResourceLimits};
pub use process::{executor_main, watchdog_main, ProcessLauncher, SubprocessLauncher, TaskLauncher};
pub use supervisor::{RunSummary, StopReason, Supervisor};
