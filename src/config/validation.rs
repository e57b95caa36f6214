//! Configuration validation.
//!
//! # Responsibilities
//! - Check the log verbosity against the severity taxonomy
//! - Check the admission cap is a positive `u32`
//! - Check the listen address is syntactically valid
//! - Check policy durations are non-zero
//!
//! # Design Decisions
//! - Pure function: no sockets are opened and no files are touched
//! - Fails on the first offending field and names it

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::schema::{ListenAddress, RawServerConfig, ServerConfig};
use crate::observability::logging::{LogConfig, Verbosity};

/// An invalid startup parameter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("log level {value} is out of range: must be between {min} (trace) and {max} (panic)")]
    InvalidLogVerbosity { value: i64, min: i64, max: i64 },

    #[error("max connections must be a positive 32-bit integer, got {value}")]
    InvalidMaxConnections { value: i64 },

    #[error("invalid listen address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: &'static str },

    #[error("connection policy field {field} must be greater than zero")]
    InvalidPolicy { field: &'static str },

    #[error("invalid metrics address {value:?}")]
    InvalidMetricsAddress { value: String },
}

impl ConfigError {
    /// Name of the offending configuration field.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigError::InvalidLogVerbosity { .. } => "log_verbosity",
            ConfigError::InvalidMaxConnections { .. } => "max_connections",
            ConfigError::InvalidAddress { .. } => "address",
            ConfigError::InvalidPolicy { field } => field,
            ConfigError::InvalidMetricsAddress { .. } => "observability.metrics_address",
        }
    }
}

/// Validate raw parameters into a `ServerConfig`.
pub fn validate_config(raw: RawServerConfig) -> Result<ServerConfig, ConfigError> {
    let verbosity = validate_verbosity(raw.log_verbosity)?;
    let max_connections = validate_max_connections(raw.max_connections)?;
    let address = parse_address(&raw.address)?;

    let policy = &raw.policy;
    let durations = [
        ("policy.idle_timeout_ms", policy.idle_timeout_ms),
        ("policy.max_age_ms", policy.max_age_ms),
        ("policy.max_age_grace_ms", policy.max_age_grace_ms),
        ("policy.keep_alive_interval_ms", policy.keep_alive_interval_ms),
        ("policy.keep_alive_timeout_ms", policy.keep_alive_timeout_ms),
    ];
    if let Some((field, _)) = durations.into_iter().find(|(_, ms)| *ms == 0) {
        return Err(ConfigError::InvalidPolicy { field });
    }

    let metrics_address = match &raw.observability.metrics_address {
        Some(value) => Some(value.parse::<SocketAddr>().map_err(|_| {
            ConfigError::InvalidMetricsAddress {
                value: value.clone(),
            }
        })?),
        None => None,
    };

    let mut log = LogConfig::new(verbosity);
    log.ansi = !raw.observability.plain_logs;

    Ok(ServerConfig {
        address,
        max_connections,
        log,
        artifacts: raw.artifacts,
        policy: raw.policy.to_policy(),
        metrics_address,
    })
}

pub fn validate_verbosity(value: i64) -> Result<Verbosity, ConfigError> {
    Verbosity::from_level(value).ok_or(ConfigError::InvalidLogVerbosity {
        value,
        min: Verbosity::MIN,
        max: Verbosity::MAX,
    })
}

pub fn validate_max_connections(value: i64) -> Result<u32, ConfigError> {
    match u32::try_from(value) {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ConfigError::InvalidMaxConnections { value }),
    }
}

/// Parse `host:port`, `:port`, `unix:/path` or a bare socket path.
pub fn parse_address(value: &str) -> Result<ListenAddress, ConfigError> {
    let invalid = |reason| ConfigError::InvalidAddress {
        value: value.to_string(),
        reason,
    };

    let value = value.trim();
    if value.is_empty() {
        return Err(invalid("address is empty"));
    }

    if let Some(path) = value.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(invalid("unix socket path is empty"));
        }
        return Ok(ListenAddress::Unix(PathBuf::from(path)));
    }

    if value.parse::<SocketAddr>().is_ok() {
        return Ok(ListenAddress::Tcp(value.to_string()));
    }

    if let Some((host, port)) = value.rsplit_once(':') {
        if !host.contains('/') {
            if port.parse::<u16>().is_err() {
                return Err(invalid("port must be an integer between 0 and 65535"));
            }
            if host.is_empty() {
                return Ok(ListenAddress::Tcp(format!("0.0.0.0:{port}")));
            }
            if host.contains(char::is_whitespace) || host.contains(':') {
                return Err(invalid("malformed host"));
            }
            return Ok(ListenAddress::Tcp(value.to_string()));
        }
    }

    if value.contains('/') {
        return Ok(ListenAddress::Unix(PathBuf::from(value)));
    }

    Err(invalid("expected host:port or a socket path"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with(f: impl FnOnce(&mut RawServerConfig)) -> RawServerConfig {
        let mut raw = RawServerConfig::default();
        f(&mut raw);
        raw
    }

    #[test]
    fn accepts_every_verbosity_in_range_including_bounds() {
        for level in Verbosity::MIN..=Verbosity::MAX {
            let config = validate_config(raw_with(|r| r.log_verbosity = level)).unwrap();
            assert_eq!(config.log().verbosity.as_level(), level);
        }
    }

    #[test]
    fn rejects_verbosity_outside_range() {
        for level in [Verbosity::MIN - 1, Verbosity::MAX + 1, -100, 100, i64::MIN, i64::MAX] {
            let err = validate_config(raw_with(|r| r.log_verbosity = level)).unwrap_err();
            assert_eq!(
                err,
                ConfigError::InvalidLogVerbosity {
                    value: level,
                    min: -1,
                    max: 5
                }
            );
            assert_eq!(err.field(), "log_verbosity");
        }
    }

    #[test]
    fn rejects_non_positive_max_connections() {
        for value in [0, -1, i64::from(u32::MAX) + 1] {
            let err = validate_config(raw_with(|r| r.max_connections = value)).unwrap_err();
            assert_eq!(err, ConfigError::InvalidMaxConnections { value });
            assert_eq!(err.field(), "max_connections");
        }
        assert_eq!(validate_max_connections(1), Ok(1));
        assert_eq!(validate_max_connections(i64::from(u32::MAX)), Ok(u32::MAX));
    }

    #[test]
    fn parses_tcp_addresses() {
        assert_eq!(
            parse_address("127.0.0.1:9999").unwrap(),
            ListenAddress::Tcp("127.0.0.1:9999".into())
        );
        assert_eq!(parse_address("[::1]:80").unwrap(), ListenAddress::Tcp("[::1]:80".into()));
        assert_eq!(
            parse_address("localhost:8080").unwrap(),
            ListenAddress::Tcp("localhost:8080".into())
        );
        assert_eq!(parse_address(":7000").unwrap(), ListenAddress::Tcp("0.0.0.0:7000".into()));
    }

    #[test]
    fn parses_unix_paths() {
        assert_eq!(
            parse_address("unix:/tmp/prover.sock").unwrap(),
            ListenAddress::Unix("/tmp/prover.sock".into())
        );
        assert_eq!(
            parse_address("/run/prover.sock").unwrap(),
            ListenAddress::Unix("/run/prover.sock".into())
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        for value in ["", "   ", "localhost", "host:port", "host:70000", "unix:", "a b:80"] {
            let err = parse_address(value).unwrap_err();
            assert_eq!(err.field(), "address", "{value:?}");
        }
    }

    #[test]
    fn rejects_zero_policy_durations() {
        let err = validate_config(raw_with(|r| r.policy.max_age_grace_ms = 0)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidPolicy {
                field: "policy.max_age_grace_ms"
            }
        );
    }

    #[test]
    fn rejects_bad_metrics_address() {
        let err = validate_config(raw_with(|r| {
            r.observability.metrics_address = Some("not-an-addr".into())
        }))
        .unwrap_err();
        assert_eq!(err.field(), "observability.metrics_address");
    }

    #[test]
    fn defaults_are_valid() {
        let config = validate_config(RawServerConfig::default()).unwrap();
        assert_eq!(config.max_connections(), 1);
        assert_eq!(config.log().verbosity, Verbosity::Info);
        assert_eq!(config.policy(), crate::net::ConnectionPolicy::default());
        assert_eq!(config.metrics_address(), None);
    }
}
