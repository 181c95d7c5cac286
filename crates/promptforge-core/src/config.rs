//! Environment-driven service configuration.

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

/// Lower bound for the cancel poll interval; anything smaller busy-spins.
pub const MIN_CANCEL_POLL_INTERVAL: f64 = 0.05;

/// Which job store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Embedded single-file SQLite store
    Local,

    /// Remote PostgreSQL store
    Remote,
}

impl StoreBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(StoreBackend::Local),
            "remote" => Some(StoreBackend::Remote),
            _ => None,
        }
    }
}

/// Job store connection settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub local_db_path: String,
    pub remote_db_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Local,
            local_db_path: "promptforge_jobs.db".to_string(),
            remote_db_url: None,
        }
    }
}

/// How job subprocesses are launched.
///
/// The accepted values mirror the classic multiprocessing start methods. A
/// multithreaded tokio process cannot fork safely, so every method launches a
/// fresh child process; requesting `fork` logs a warning that the run
/// proceeds with a fresh executor in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMethod {
    #[default]
    Fork,
    Spawn,
    Forkserver,
}

impl StartMethod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fork" => Some(StartMethod::Fork),
            "spawn" => Some(StartMethod::Spawn),
            "forkserver" => Some(StartMethod::Forkserver),
            _ => None,
        }
    }
}

/// Worker pool tuning knobs
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks
    pub concurrency: usize,

    /// Idle sleep between queue polls
    pub poll_interval: Duration,

    /// How often a worker re-checks the cancel flag while a child runs
    pub cancel_poll_interval: Duration,

    /// Seconds of silence before the health check declares the pool stuck
    pub stale_threshold: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs_f64(2.0),
            cancel_poll_interval: Duration::from_secs_f64(1.0),
            stale_threshold: Duration::from_secs(600),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub start_method: StartMethod,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            worker: WorkerConfig::default(),
            start_method: StartMethod::default(),
            log_level: "INFO".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServiceConfig {
    /// Build the configuration from environment variables, falling back to
    /// the documented defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = ServiceConfig::default();

        if let Some(raw) = read_env("JOB_STORE_BACKEND") {
            config.store.backend = StoreBackend::from_str(&raw).ok_or_else(|| {
                Error::Config(format!(
                    "JOB_STORE_BACKEND must be 'local' or 'remote', got '{raw}'"
                ))
            })?;
        }
        if let Some(path) = read_env("LOCAL_DB_PATH") {
            config.store.local_db_path = path;
        }
        config.store.remote_db_url = read_env("REMOTE_DB_URL");
        if config.store.backend == StoreBackend::Remote && config.store.remote_db_url.is_none() {
            return Err(Error::Config(
                "JOB_STORE_BACKEND=remote requires REMOTE_DB_URL".to_string(),
            ));
        }

        if let Some(raw) = read_env("WORKER_CONCURRENCY") {
            config.worker.concurrency = parse_env("WORKER_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = read_env("WORKER_POLL_INTERVAL") {
            config.worker.poll_interval = Duration::from_secs_f64(parse_env::<f64>(
                "WORKER_POLL_INTERVAL",
                &raw,
            )?);
        }
        if let Some(raw) = read_env("CANCEL_POLL_INTERVAL") {
            let seconds: f64 = parse_env("CANCEL_POLL_INTERVAL", &raw)?;
            config.worker.cancel_poll_interval =
                Duration::from_secs_f64(seconds.max(MIN_CANCEL_POLL_INTERVAL));
        }
        if let Some(raw) = read_env("WORKER_STALE_THRESHOLD") {
            config.worker.stale_threshold =
                Duration::from_secs_f64(parse_env::<f64>("WORKER_STALE_THRESHOLD", &raw)?);
        }

        if let Some(raw) = read_env("JOB_RUN_START_METHOD") {
            config.start_method = StartMethod::from_str(&raw).ok_or_else(|| {
                Error::Config(format!(
                    "JOB_RUN_START_METHOD must be one of fork/spawn/forkserver, got '{raw}'"
                ))
            })?;
        }

        if let Some(level) = read_env("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(host) = read_env("HOST") {
            config.host = host;
        }
        if let Some(raw) = read_env("PORT") {
            config.port = parse_env("PORT", &raw)?;
        }

        Ok(config)
    }
}

fn read_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {name}: '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.poll_interval, Duration::from_secs_f64(2.0));
        assert_eq!(config.store.backend, StoreBackend::Local);
        assert_eq!(config.start_method, StartMethod::Fork);
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!(StoreBackend::from_str("LOCAL"), Some(StoreBackend::Local));
        assert_eq!(StoreBackend::from_str("remote"), Some(StoreBackend::Remote));
        assert_eq!(StoreBackend::from_str("redis"), None);
    }

    #[test]
    fn test_start_method_parsing() {
        assert_eq!(StartMethod::from_str("fork"), Some(StartMethod::Fork));
        assert_eq!(StartMethod::from_str("SPAWN"), Some(StartMethod::Spawn));
        assert_eq!(StartMethod::from_str("threads"), None);
    }
}
