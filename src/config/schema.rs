//! Configuration schema definitions.
//!
//! `RawServerConfig` is what the CLI and config file produce; it derives
//! Serde traits so it can be read from TOML. `ServerConfig` can only be built
//! by `validation::validate_config`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::policy::ConnectionPolicy;
use crate::observability::logging::{LogConfig, Verbosity};

/// Default admission cap.
pub const DEFAULT_MAX_CONNECTIONS: i64 = 1;

/// Unvalidated startup parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawServerConfig {
    /// Listen address: `host:port`, `unix:/path` or a socket path.
    pub address: String,

    /// Maximum concurrently open connections.
    pub max_connections: i64,

    /// Numeric log level, `-1` (trace) to `5` (panic).
    pub log_verbosity: i64,

    /// Files handed opaquely to the handler constructor.
    pub artifacts: ArtifactPaths,

    /// Per-connection lifetime limits.
    pub policy: PolicyConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for RawServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9999".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_verbosity: Verbosity::default().as_level(),
            artifacts: ArtifactPaths::default(),
            policy: PolicyConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Proof artifact locations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ArtifactPaths {
    /// Compiled constraint system.
    pub r1cs: PathBuf,

    /// Proving key.
    pub proving_key: PathBuf,

    /// Verifying key.
    pub verifying_key: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            r1cs: PathBuf::from("r1cs.bin"),
            proving_key: PathBuf::from("pk.bin"),
            verifying_key: PathBuf::from("vk.bin"),
        }
    }
}

/// Connection policy as written in the config file, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub idle_timeout_ms: u64,
    pub max_age_ms: u64,
    pub max_age_grace_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub keep_alive_timeout_ms: u64,
}

impl From<ConnectionPolicy> for PolicyConfig {
    fn from(policy: ConnectionPolicy) -> Self {
        Self {
            idle_timeout_ms: policy.idle_timeout.as_millis() as u64,
            max_age_ms: policy.max_age.as_millis() as u64,
            max_age_grace_ms: policy.max_age_grace.as_millis() as u64,
            keep_alive_interval_ms: policy.keep_alive_interval.as_millis() as u64,
            keep_alive_timeout_ms: policy.keep_alive_timeout.as_millis() as u64,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        ConnectionPolicy::default().into()
    }
}

impl PolicyConfig {
    /// Convert to durations without range checks.
    pub(crate) fn to_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_age: Duration::from_millis(self.max_age_ms),
            max_age_grace: Duration::from_millis(self.max_age_grace_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            keep_alive_timeout: Duration::from_millis(self.keep_alive_timeout_ms),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Prometheus exporter bind address. Disabled when unset.
    pub metrics_address: Option<String>,

    /// Disable ANSI colours in log output.
    pub plain_logs: bool,
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// `host:port`, resolved at bind time.
    Tcp(String),
    /// Unix-domain socket path.
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => f.write_str(addr),
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Validated, immutable server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) address: ListenAddress,
    pub(crate) max_connections: u32,
    pub(crate) log: LogConfig,
    pub(crate) artifacts: ArtifactPaths,
    pub(crate) policy: ConnectionPolicy,
    pub(crate) metrics_address: Option<std::net::SocketAddr>,
}

impl ServerConfig {
    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    /// Admission cap, always at least 1.
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn log(&self) -> LogConfig {
        self.log
    }

    pub fn artifacts(&self) -> &ArtifactPaths {
        &self.artifacts
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    pub fn metrics_address(&self) -> Option<std::net::SocketAddr> {
        self.metrics_address
    }
}
