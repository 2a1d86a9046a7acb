//! Broker configuration.
//!
//! Every setting has a default, so the broker runs without a config file.
//! A TOML file may override any subset; durations are given in milliseconds:
//!
//! ```toml
//! [service]
//! port = 33277
//! drain_grace = 30000
//!
//! [restart]
//! initial_backoff = 1000
//! factor = 2.0
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use scan_types::DEFAULT_MAX_FRAME_LEN;

/// Port the broker listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 33277;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub worker: WorkerConfig,
    pub restart: RestartPolicy,
    pub bridge: BridgeConfig,
    pub session: SessionConfig,
    pub service: ServiceConfig,
}

/// How the worker process is launched and watched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable. A bare file name is looked up next to the broker
    /// binary first, then on `PATH`.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Time allowed between spawn and the worker's `Ready`.
    #[serde(with = "duration_ms")]
    pub startup_timeout: Duration,
    /// Time allowed between `Shutdown` and process exit before it is killed.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    /// Idle liveness check period.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("scan_worker"),
            args: Vec::new(),
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Restart rate limiting.
///
/// The delay before restart attempt `n` (0-indexed) is
/// `initial_backoff * factor^n`, capped at `max_backoff`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub factor: f64,
    /// Consecutive failures after which the worker is left down until an
    /// operator restart.
    pub max_consecutive_failures: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            factor: 2.0,
            max_consecutive_failures: 5,
        }
    }
}

impl RestartPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Request queue settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Waiting requests allowed before new submissions are refused.
    pub queue_depth: usize,
    /// Deadlines, counted from the moment a request enters service.
    #[serde(with = "duration_ms")]
    pub enumerate_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub scan_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            enumerate_timeout: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(600),
        }
    }
}

/// Per-connection timeouts. Clients may lower these in `hello`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    /// How long shutdown waits for sessions to flush their last replies.
    #[serde(with = "duration_ms")]
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3600),
            send_timeout: Duration::from_secs(3600),
            close_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// How long in-flight requests may run once shutdown begins.
    #[serde(with = "duration_ms")]
    pub drain_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            drain_grace: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl BrokerConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("worker.startup_timeout", self.worker.startup_timeout),
            ("worker.shutdown_grace", self.worker.shutdown_grace),
            ("worker.heartbeat_interval", self.worker.heartbeat_interval),
            ("worker.heartbeat_timeout", self.worker.heartbeat_timeout),
            ("bridge.enumerate_timeout", self.bridge.enumerate_timeout),
            ("bridge.scan_timeout", self.bridge.scan_timeout),
            ("session.idle_timeout", self.session.idle_timeout),
            ("session.send_timeout", self.session.send_timeout),
            ("session.close_grace", self.session.close_grace),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.bridge.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "bridge.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.worker.max_frame_len == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_frame_len must be at least 1".to_string(),
            ));
        }
        if self.restart.factor.is_nan() || self.restart.factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "restart.factor must be at least 1.0, got {}",
                self.restart.factor
            )));
        }
        if self.restart.max_backoff < self.restart.initial_backoff {
            return Err(ConfigError::Invalid(
                "restart.max_backoff must not be below restart.initial_backoff".to_string(),
            ));
        }
        if self.restart.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "restart.max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
