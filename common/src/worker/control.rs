// Control commands for a running supervisor and their signal bindings

use crate::errors::WorkerError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop reserving new jobs; the current cycle is not affected
    Pause,
    Resume,
    /// Exit after the current cycle
    Shutdown,
    /// Exit and terminate live children right away
    ShutdownNow,
    /// Terminate live children, keep running
    KillChildren,
}

/// Cloneable sender side of the supervisor's control channel
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl SupervisorHandle {
    /// Deliver a command; false once the supervisor is gone
    pub fn send(&self, command: ControlCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn pause(&self) -> bool {
        self.send(ControlCommand::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(ControlCommand::Resume)
    }

    pub fn shutdown(&self) -> bool {
        self.send(ControlCommand::Shutdown)
    }

    pub fn shutdown_now(&self) -> bool {
        self.send(ControlCommand::ShutdownNow)
    }

    pub fn kill_children(&self) -> bool {
        self.send(ControlCommand::KillChildren)
    }
}

pub fn channel() -> (SupervisorHandle, mpsc::UnboundedReceiver<ControlCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SupervisorHandle { tx }, rx)
}

/// Translate process signals into control commands.
///
/// USR2 pauses, HUP resumes, QUIT shuts down gracefully, TERM and INT shut
/// down immediately and USR1 kills the children of the current cycle.
#[cfg(unix)]
pub fn bind_signals(handle: SupervisorHandle) -> Result<JoinHandle<()>, WorkerError> {
    use tokio::signal::unix::{signal, SignalKind};

    let register = |kind: SignalKind, name: &str| {
        signal(kind).map_err(|e| WorkerError::Signal(format!("{}: {}", name, e)))
    };

    let mut pause = register(SignalKind::user_defined2(), "SIGUSR2")?;
    let mut resume = register(SignalKind::hangup(), "SIGHUP")?;
    let mut quit = register(SignalKind::quit(), "SIGQUIT")?;
    let mut terminate = register(SignalKind::terminate(), "SIGTERM")?;
    let mut interrupt = register(SignalKind::interrupt(), "SIGINT")?;
    let mut kill = register(SignalKind::user_defined1(), "SIGUSR1")?;

    Ok(tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                Some(()) = pause.recv() => ControlCommand::Pause,
                Some(()) = resume.recv() => ControlCommand::Resume,
                Some(()) = quit.recv() => ControlCommand::Shutdown,
                Some(()) = terminate.recv() => ControlCommand::ShutdownNow,
                Some(()) = interrupt.recv() => ControlCommand::ShutdownNow,
                Some(()) = kill.recv() => ControlCommand::KillChildren,
                else => break,
            };

            info!(command = ?command, "Received control signal");
            if !handle.send(command) {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_delivers_in_order() {
        let (handle, mut rx) = channel();
        assert!(handle.pause());
        assert!(handle.resume());
        assert!(handle.shutdown_now());

        assert_eq!(rx.recv().await, Some(ControlCommand::Pause));
        assert_eq!(rx.recv().await, Some(ControlCommand::Resume));
        assert_eq!(rx.recv().await, Some(ControlCommand::ShutdownNow));

        drop(rx);
        assert!(!handle.shutdown());
    }
}
