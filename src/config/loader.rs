//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::RawServerConfig;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load raw configuration from a TOML file.
///
/// Missing keys take their defaults. Values are validated later, by the
/// launcher, together with any command-line overrides.
pub fn load_config(path: &Path) -> Result<RawServerConfig, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse raw configuration from TOML text.
pub fn parse_config(content: &str) -> Result<RawServerConfig, toml::de::Error> {
    toml::from_str(content)
}
