//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! CLI flags + optional TOML file
//!     → loader.rs (parse & deserialize into RawServerConfig)
//!     → validation.rs (range and syntax checks)
//!     → ServerConfig (validated, immutable)
//!     → owned by the launcher
//! ```
//!
//! # Design Decisions
//! - Config is immutable once validated; there is no runtime reload
//! - All fields have defaults to allow minimal configs
//! - Validation runs before any socket is opened

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, LoadError};
pub use schema::{
    ArtifactPaths, ListenAddress, ObservabilityConfig, PolicyConfig, RawServerConfig,
    ServerConfig,
};
pub use validation::{validate_config, ConfigError};
