//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Bind listener → Wrap with admission cap
//!         → Construct handler → Attach → Serve
//!
//! Shutdown (shutdown.rs):
//!     SIGINT/SIGTERM → Close listener → Abort open connections → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: nothing touches the network until config is valid
//! - Listener closure is the single cancellation path

pub mod shutdown;
pub mod startup;

pub use shutdown::shutdown_signal;
pub use startup::{LaunchError, PreparedService, ServiceLauncher};
