//! Structured logging.
//!
//! # Responsibilities
//! - Define the numeric verbosity taxonomy accepted on the command line
//! - Turn a validated `LogConfig` into a `tracing` dispatcher
//!
//! # Design Decisions
//! - No process-wide subscriber is installed; the launcher attaches the
//!   dispatcher to the futures it drives
//! - Output goes to stdout with file/line of the call site
//! - `RUST_LOG` directives, when present, refine the configured level

use tracing::level_filters::LevelFilter;
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

/// Ordered severity levels, numbered the way operators pass them on the
/// command line (`-1` = trace … `5` = panic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verbosity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

impl Verbosity {
    /// Lowest accepted numeric level (trace).
    pub const MIN: i64 = -1;
    /// Highest accepted numeric level (panic).
    pub const MAX: i64 = 5;

    /// Map a numeric level onto the taxonomy. Out-of-range values are
    /// rejected rather than clamped.
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            -1 => Some(Self::Trace),
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Warn),
            3 => Some(Self::Error),
            4 => Some(Self::Fatal),
            5 => Some(Self::Panic),
            _ => None,
        }
    }

    /// Numeric level of this verbosity.
    pub fn as_level(self) -> i64 {
        match self {
            Self::Trace => -1,
            Self::Debug => 0,
            Self::Info => 1,
            Self::Warn => 2,
            Self::Error => 3,
            Self::Fatal => 4,
            Self::Panic => 5,
        }
    }

    /// `tracing` has no fatal/panic levels; both collapse onto ERROR.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Trace => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error | Self::Fatal | Self::Panic => LevelFilter::ERROR,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Self::Info
    }
}

impl std::fmt::Display for Verbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Panic => "panic",
        };
        f.write_str(name)
    }
}

/// Logging configuration handed to the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum severity that is emitted.
    pub verbosity: Verbosity,
    /// Emit ANSI colour codes.
    pub ansi: bool,
}

impl LogConfig {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            ansi: true,
        }
    }

    /// Build the dispatcher for this configuration.
    pub fn dispatch(&self) -> Dispatch {
        let filter = EnvFilter::builder()
            .with_default_directive(self.verbosity.level_filter().into())
            .from_env_lossy();

        let subscriber = tracing_subscriber::fmt()
            .with_writer(std::io::stdout)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(self.ansi)
            .with_env_filter(filter)
            .finish();

        Dispatch::new(subscriber)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(Verbosity::default())
    }
}
