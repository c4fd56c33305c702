// Error handling framework

use regex::Regex;
use thiserror::Error;

/// Errors raised while talking to the queue backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Backend unreachable: {0}")]
    Transport(String),

    #[error("Lost lock on job {jid} during {operation}: {message}")]
    LostLock {
        jid: String,
        operation: String,
        message: String,
    },

    #[error("Invalid job {jid}: {message}")]
    InvalidJob { jid: String, message: String },

    #[error("{area}(): {message}")]
    Backend { area: String, message: String },

    #[error("Payload serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    Validation(String),
}

impl QueueError {
    /// True when the backend no longer considers the caller the lease holder.
    pub fn is_lost_lock(&self) -> bool {
        matches!(self, QueueError::LostLock { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, QueueError::Transport(_))
    }

    /// Re-tag a lease violation with the job and operation it happened on.
    pub fn for_job(self, jid: &str, operation: &str) -> Self {
        match self {
            QueueError::LostLock { message, .. } => QueueError::LostLock {
                jid: jid.to_string(),
                operation: operation.to_string(),
                message,
            },
            QueueError::InvalidJob { message, .. } => QueueError::InvalidJob {
                jid: jid.to_string(),
                message,
            },
            other => other,
        }
    }
}

/// Errors raised by the worker supervisor and its children
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{role} process failed: {message}")]
    ChildProcess { role: String, message: String },

    #[error("Failed to spawn {role} process: {message}")]
    Spawn { role: String, message: String },

    #[error("Failed to register signal handler: {0}")]
    Signal(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

lazy_static::lazy_static! {
    static ref SCRIPT_ERROR: Regex =
        Regex::new(r"user_script:\d+:\s*(?P<area>[\w.]+)\(\):\s*(?P<message>[^\n]*)")
            .expect("Invalid script error pattern");
}

/// Map a Lua command error message onto the error taxonomy.
///
/// Command errors follow the `Area(): message` convention, e.g.
/// `Heartbeat(): Job given out to another worker: worker-2`.
pub fn classify_script_error(raw: &str) -> QueueError {
    let (area, message) = match SCRIPT_ERROR.captures(raw) {
        Some(caps) => (
            caps["area"].to_string(),
            caps["message"].trim().to_string(),
        ),
        None => ("Unknown".to_string(), raw.trim().to_string()),
    };

    let lowered = message.to_lowercase();
    if lowered.contains("given out to another worker")
        || lowered.contains("not currently running")
        || lowered.contains("not running")
    {
        QueueError::LostLock {
            jid: String::new(),
            operation: area,
            message,
        }
    } else if lowered.contains("does not exist") {
        QueueError::InvalidJob {
            jid: String::new(),
            message,
        }
    } else {
        QueueError::Backend { area, message }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            return QueueError::Transport(err.to_string());
        }
        classify_script_error(&err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for WorkerError {
    fn from(err: config::ConfigError) -> Self {
        WorkerError::Configuration(err.to_string())
    }
}
