//! Configuration types.
//!
//! Every struct has a `Default` and deserializes from a JSON file with
//! missing keys falling back to defaults. `EngineConfig::load` layers
//! `LEASEQ_*` environment variables over the file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable carrying the serialized config to spawned workers.
pub const WORKER_CONFIG_ENV: &str = "LEASEQ_WORKER_CONFIG";

/// Payload compression applied on submit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            other => Err(ConfigError::InvalidValue {
                key: "compression".into(),
                message: format!("unknown compression '{other}' (expected none or gzip)"),
            }),
        }
    }
}

/// How processors execute: in-process tokio tasks or spawned OS processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorType {
    #[default]
    Process,
    Thread,
}

impl FromStr for ProcessorType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(ProcessorType::Process),
            "thread" => Ok(ProcessorType::Thread),
            other => Err(ConfigError::InvalidValue {
                key: "processor_type".into(),
                message: format!("unknown processor type '{other}' (expected thread or process)"),
            }),
        }
    }
}

/// Queue client defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Database file path, or `:memory:`.
    pub database: String,
    /// Name of the task table.
    pub table: String,
    /// Lease length in seconds granted by acquire and heartbeat.
    pub alive_time: i64,
    /// Seconds a finished task stays queryable before deletion.
    pub retention_time: i64,
    /// Seconds before a failed task becomes acquirable again.
    pub retry_wait: i64,
    /// Maximum tasks claimed per acquire (prefetch).
    pub max_acquire: usize,
    /// Compression applied to submitted payloads.
    pub compression: Compression,
    /// Acquire calls between cleanup passes.
    pub cleanup_interval: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database: "./data/lease-queue.db".to_string(),
            table: "tasks".to_string(),
            alive_time: 300,
            retention_time: 300,
            retry_wait: 300,
            max_acquire: 1,
            compression: Compression::None,
            cleanup_interval: 20,
        }
    }
}

/// Per-processor tuning. Propagated to running processors on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Seconds to sleep after an empty acquire.
    pub poll_interval: f64,
    /// Seconds between lease heartbeats. Derived from `alive_time` when unset.
    pub task_heartbeat_interval: Option<f64>,
    /// Seconds between liveness pulses sent to the parent.
    pub child_heartbeat_interval: f64,
    /// Seconds without a pulse before a child is considered hung.
    pub child_heartbeat_limit: f64,
    /// Seconds between repeated kill signals to a stopping child.
    pub child_kill_interval: f64,
    /// Seconds of graceful killing before escalating to SIGKILL. `None` never escalates.
    pub child_graceful_kill_limit: Option<f64>,
    /// Minimum seconds between two child spawns of one processor.
    pub child_fork_frequency_limit: f64,
    /// Child exits gracefully after this many tasks and is respawned.
    pub max_requests_per_child: Option<u64>,
    /// Release prefetched but unprocessed tasks when stopping.
    pub release_prefetched_on_stop: bool,
    /// Command used to spawn a worker child. Empty means `<current exe> worker`.
    pub worker_command: Vec<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: 1.0,
            task_heartbeat_interval: None,
            child_heartbeat_interval: 2.0,
            child_heartbeat_limit: 10.0,
            child_kill_interval: 2.0,
            child_graceful_kill_limit: None,
            child_fork_frequency_limit: 1.0,
            max_requests_per_child: None,
            release_prefetched_on_stop: false,
            worker_command: Vec::new(),
        }
    }
}

impl ProcessorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    /// Lease heartbeat interval; a quarter of the lease, clamped to 1..=60s, unless set.
    pub fn task_heartbeat_interval(&self, alive_time: i64) -> Duration {
        match self.task_heartbeat_interval {
            Some(secs) => Duration::from_secs_f64(secs),
            None => Duration::from_secs((alive_time / 4).clamp(1, 60) as u64),
        }
    }

    pub fn child_heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.child_heartbeat_interval)
    }

    pub fn child_heartbeat_limit(&self) -> Duration {
        Duration::from_secs_f64(self.child_heartbeat_limit)
    }

    pub fn child_kill_interval(&self) -> Duration {
        Duration::from_secs_f64(self.child_kill_interval)
    }

    pub fn child_graceful_kill_limit(&self) -> Option<Duration> {
        self.child_graceful_kill_limit.map(Duration::from_secs_f64)
    }

    pub fn child_fork_frequency_limit(&self) -> Duration {
        Duration::from_secs_f64(self.child_fork_frequency_limit)
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub client: ClientConfig,
    #[serde(flatten)]
    pub processor: ProcessorConfig,
    /// Processor variant.
    pub processor_type: ProcessorType,
    /// Number of processors in the pool.
    pub processors: usize,
    /// Log file; stderr when unset.
    pub log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            processor: ProcessorConfig::default(),
            processor_type: ProcessorType::default(),
            processors: 1,
            log: None,
        }
    }
}

impl EngineConfig {
    /// Load from an optional JSON file, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides. `LEASEQ_CONFIG` names a JSON file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("LEASEQ_CONFIG").ok().map(PathBuf::from);
        Self::load(path.as_deref())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw)
            .map_err(|e| ConfigError::ParseError(format!("invalid config JSON: {e}")))
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self)
            .map_err(|e| ConfigError::ParseError(format!("failed to serialize config: {e}")))
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("LEASEQ_DATABASE") {
            self.client.database = v;
        }
        if let Ok(v) = std::env::var("LEASEQ_TABLE") {
            self.client.table = v;
        }
        if let Ok(v) = std::env::var("LEASEQ_PROCESSOR_TYPE") {
            self.processor_type = v.parse()?;
        }
        if let Ok(v) = std::env::var("LEASEQ_PROCESSORS") {
            self.processors = parse_env("LEASEQ_PROCESSORS", &v)?;
        }
        if let Ok(v) = std::env::var("LEASEQ_ALIVE_TIME") {
            self.client.alive_time = parse_env("LEASEQ_ALIVE_TIME", &v)?;
        }
        if let Ok(v) = std::env::var("LEASEQ_RETRY_WAIT") {
            self.client.retry_wait = parse_env("LEASEQ_RETRY_WAIT", &v)?;
        }
        if let Ok(v) = std::env::var("LEASEQ_POLL_INTERVAL") {
            self.processor.poll_interval = parse_env("LEASEQ_POLL_INTERVAL", &v)?;
        }
        if let Ok(v) = std::env::var("LEASEQ_LOG") {
            self.log = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Reject values that would make the engine misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processors == 0 {
            return Err(invalid("processors", "must be at least 1"));
        }
        if self.client.table.is_empty()
            || !self
                .client
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid("table", "must be a non-empty identifier [A-Za-z0-9_]"));
        }
        if self.client.alive_time <= 0 {
            return Err(invalid("alive_time", "must be positive"));
        }
        if self.client.retention_time < 0 || self.client.retry_wait < 0 {
            return Err(invalid("retention_time/retry_wait", "must not be negative"));
        }
        if self.client.max_acquire == 0 {
            return Err(invalid("max_acquire", "must be at least 1"));
        }
        if self.processor.poll_interval <= 0.0 || self.processor.child_heartbeat_interval <= 0.0 {
            return Err(invalid("poll_interval/child_heartbeat_interval", "must be positive"));
        }
        if self.processor.child_heartbeat_limit <= self.processor.child_heartbeat_interval {
            return Err(invalid(
                "child_heartbeat_limit",
                "must exceed child_heartbeat_interval",
            ));
        }
        let p = &self.processor;
        let durations = [
            ("task_heartbeat_interval", p.task_heartbeat_interval.unwrap_or(1.0) > 0.0),
            ("child_kill_interval", p.child_kill_interval > 0.0),
            ("child_graceful_kill_limit", p.child_graceful_kill_limit.unwrap_or(0.0) >= 0.0),
            ("child_fork_frequency_limit", p.child_fork_frequency_limit >= 0.0),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, ok)| !ok) {
            return Err(invalid(key, "out of range"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{value}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.client.max_acquire, 1);
        assert_eq!(config.client.retry_wait, 300);
    }

    #[test]
    fn json_fills_missing_keys_with_defaults() {
        let config = EngineConfig::from_json(
            r#"{"processor_type": "thread", "processors": 3, "alive_time": 40, "poll_interval": 0.5}"#,
        )
        .unwrap();
        assert_eq!(config.processor_type, ProcessorType::Thread);
        assert_eq!(config.processors, 3);
        assert_eq!(config.client.alive_time, 40);
        assert_eq!(config.client.table, "tasks");
        assert_eq!(config.processor.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn unknown_processor_type_is_rejected() {
        assert!(EngineConfig::from_json(r#"{"processor_type": "fiber"}"#).is_err());
        assert!("fiber".parse::<ProcessorType>().is_err());
    }

    #[test]
    fn zero_processors_is_rejected() {
        let config = EngineConfig {
            processors: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn table_name_must_be_identifier() {
        let mut config = EngineConfig::default();
        config.client.table = "tasks; DROP TABLE x".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_interval_derived_from_lease() {
        let p = ProcessorConfig::default();
        assert_eq!(p.task_heartbeat_interval(300), Duration::from_secs(60));
        assert_eq!(p.task_heartbeat_interval(20), Duration::from_secs(5));
        assert_eq!(p.task_heartbeat_interval(2), Duration::from_secs(1));
    }

    #[test]
    fn config_survives_serialization_for_workers() {
        let mut config = EngineConfig::default();
        config.processor.max_requests_per_child = Some(5);
        config.client.compression = Compression::Gzip;
        let json = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }
}
