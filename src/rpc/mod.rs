//! RPC dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! BoundedListener::accept
//!     → server.rs (accept loop, one task per connection)
//!     → dispatch.rs (frame I/O, lifecycle timers, call worker)
//!     → handler.rs (external RequestHandler)
//! ```
//!
//! # Design Decisions
//! - The wire format is a small length-prefixed frame protocol (frame.rs);
//!   call bodies are opaque bytes
//! - The handler is registered once, before serving starts

pub mod client;
pub mod dispatch;
pub mod frame;
pub mod handler;
pub mod server;

pub use client::RpcClient;
pub use dispatch::MAX_QUEUED_CALLS;
pub use frame::{Frame, FrameError, Status};
pub use handler::{Call, ConstructionError, HandlerFactory, Reply, RequestHandler};
pub use server::{DispatchServer, ServeError};
