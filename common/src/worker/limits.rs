// Resource limits honored between job cycles

use crate::config::LimitsConfig;
use std::fmt;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Which limit stopped the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    MaxJobs(u64),
    TimeLimit(Duration),
    Memory { used_bytes: u64, limit_bytes: u64 },
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitExceeded::MaxJobs(max) => write!(f, "processed the maximum of {} jobs", max),
            LimitExceeded::TimeLimit(limit) => {
                write!(f, "ran past the time limit of {}s", limit.as_secs())
            }
            LimitExceeded::Memory {
                used_bytes,
                limit_bytes,
            } => write!(
                f,
                "resident memory {} bytes exceeds limit of {} bytes",
                used_bytes, limit_bytes
            ),
        }
    }
}

pub struct ResourceLimits {
    max_jobs: Option<u64>,
    time_limit: Option<Duration>,
    memory_limit_bytes: Option<u64>,
    started: Instant,
    system: System,
    pid: Pid,
}

impl ResourceLimits {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            max_jobs: config.max_jobs,
            time_limit: config.time_limit_seconds.map(Duration::from_secs),
            memory_limit_bytes: config
                .memory_limit_mb
                .map(|mb| mb.saturating_mul(1024 * 1024)),
            started: Instant::now(),
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(&LimitsConfig::default())
    }

    /// Restart the wall clock budget
    pub fn start(&mut self) {
        self.started = Instant::now();
    }

    /// First exceeded limit, if any
    pub fn check(&mut self, jobs_processed: u64) -> Option<LimitExceeded> {
        if let Some(max) = self.max_jobs {
            if jobs_processed >= max {
                return Some(LimitExceeded::MaxJobs(max));
            }
        }

        if let Some(limit) = self.time_limit {
            if self.started.elapsed() >= limit {
                return Some(LimitExceeded::TimeLimit(limit));
            }
        }

        if let Some(limit_bytes) = self.memory_limit_bytes {
            if let Some(used_bytes) = self.resident_memory() {
                if used_bytes > limit_bytes {
                    return Some(LimitExceeded::Memory {
                        used_bytes,
                        limit_bytes,
                    });
                }
            }
        }

        None
    }

    /// Resident set size of this process in bytes
    pub fn resident_memory(&mut self) -> Option<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(self.pid).map(|process| process.memory())
    }
}
