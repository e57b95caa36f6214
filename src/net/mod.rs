//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP / Unix connection
//!     → listener.rs (slot acquisition, accept, close)
//!     → connection.rs (lifecycle state machine, tracking)
//!     → Hand off to the RPC dispatch layer
//!
//! Connection States:
//!     Idle → Active → (Aging | IdleTimedOut) → GracePeriod → Closed
//! ```
//!
//! # Design Decisions
//! - Admission is bounded at the transport layer only
//! - Any transport implementing `RawListener` can be wrapped
//! - Policy limits are fixed per deployment and shared by all connections

pub mod connection;
pub mod listener;
pub mod policy;

pub use connection::{CloseReason, ConnectionId, ConnectionState, ConnectionTracker, Lifecycle};
pub use listener::{
    AcceptError, AnyListener, BoundedListener, Connection, ConnectionSlot, ListenError,
    ListenerHandle, RawListener, TcpRawListener,
};
#[cfg(unix)]
pub use listener::UnixRawListener;
pub use policy::ConnectionPolicy;
