//! Bounded-concurrency RPC front-end for a proof-generation service.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod prover;
pub mod rpc;

pub use config::schema::{RawServerConfig, ServerConfig};
pub use lifecycle::{LaunchError, ServiceLauncher};
pub use net::{BoundedListener, ConnectionPolicy};
pub use rpc::DispatchServer;
