//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! launcher, listener, dispatch
//!     → logging.rs (structured events, scoped dispatcher)
//!     → metrics.rs (connection and call counters)
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{LogConfig, Verbosity};
