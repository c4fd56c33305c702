// Configuration management with layered configuration (file, env)

use crate::errors::WorkerError;
use crate::reserver::QueueSpec;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Lua command script implementing the queue semantics
    pub script_path: PathBuf,
    /// Pub/sub channel carrying job lifecycle envelopes
    pub events_channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            script_path: PathBuf::from("qless-core/qless.lua"),
            events_channel: "ql:log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserverKind {
    Ordered,
    RoundRobin,
    ShuffledRoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Executor and watchdog run as separate OS processes
    Process,
    /// Executor and watchdog run as supervised tasks inside the master
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identity used for leases; must be unique across the fleet
    pub name: String,
    /// Queue names or `*` glob patterns, in priority order
    pub queues: Vec<String>,
    pub reserver: ReserverKind,
    /// Seconds between polls when no job is available; 0 drains once and exits
    pub interval_seconds: u64,
    pub isolation: IsolationMode,
    pub limits: LimitsConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: Self::generated_name(),
            queues: vec!["default".to_string()],
            reserver: ReserverKind::Ordered,
            interval_seconds: 5,
            isolation: IsolationMode::Process,
            limits: LimitsConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Fallback identity `<$HOSTNAME>-<pid>` used when `worker.name` is unset
    pub fn generated_name() -> String {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        format!("{}-{}", host, std::process::id())
    }

    /// True when no explicit `worker.name` was configured
    pub fn has_generated_name(&self) -> bool {
        self.name == Self::generated_name()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_jobs: Option<u64>,
    pub time_limit_seconds: Option<u64>,
    pub memory_limit_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, WorkerError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, WorkerError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("QLESS")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("worker.queues")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.redis.url.is_empty() {
            return Err(WorkerError::Configuration(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if self.worker.name.trim().is_empty() {
            return Err(WorkerError::Configuration(
                "Worker name cannot be empty".to_string(),
            ));
        }

        // Rejects an empty list and malformed patterns
        QueueSpec::new(self.worker.queues.clone())?;

        if self.worker.limits.max_jobs == Some(0) {
            return Err(WorkerError::Configuration(
                "Worker max_jobs must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_worker_name() {
        let mut settings = Settings::default();
        settings.worker.name = "  ".to_string();
        assert!(matches!(
            settings.validate(),
            Err(WorkerError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_catches_empty_queue_list() {
        let mut settings = Settings::default();
        settings.worker.queues.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_max_jobs() {
        let mut settings = Settings::default();
        settings.worker.limits.max_jobs = Some(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_missing_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.redis.events_channel, "ql:log");
        assert_eq!(settings.worker.interval_seconds, 5);
        assert!(settings.worker.has_generated_name());
    }

    #[test]
    fn test_load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
[worker]
name = "box-1"
queues = ["critical", "batch-*"]
reserver = "shuffled_round_robin"
interval_seconds = 0
isolation = "task"

[worker.limits]
max_jobs = 10
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.worker.name, "box-1");
        assert!(!settings.worker.has_generated_name());
        assert_eq!(settings.worker.queues, vec!["critical", "batch-*"]);
        assert_eq!(settings.worker.reserver, ReserverKind::ShuffledRoundRobin);
        assert_eq!(settings.worker.isolation, IsolationMode::Task);
        assert_eq!(settings.worker.limits.max_jobs, Some(10));
        assert!(settings.validate().is_ok());
    }
}
