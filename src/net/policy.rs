//! Per-connection lifetime limits.

use std::time::Duration;

/// Lifetime limits applied identically to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Close a connection that has had no call traffic for this long.
    pub idle_timeout: Duration,
    /// Start a graceful shutdown once a connection is this old.
    pub max_age: Duration,
    /// How long in-flight calls may run after the shutdown notice.
    pub max_age_grace: Duration,
    /// Interval between keep-alive pings.
    pub keep_alive_interval: Duration,
    /// Time a ping may stay unanswered before the connection is dropped.
    pub keep_alive_timeout: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            max_age: Duration::from_secs(5 * 60),
            max_age_grace: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(20),
        }
    }
}
