//! Proof artifacts loaded at handler construction.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ArtifactPaths;
use crate::rpc::ConstructionError;

/// Raw contents of the three artifact files. Never interpreted here.
#[derive(Debug, Clone)]
pub struct LoadedArtifacts {
    pub r1cs: Vec<u8>,
    pub proving_key: Vec<u8>,
    pub verifying_key: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSizes {
    pub r1cs: u64,
    pub proving_key: u64,
    pub verifying_key: u64,
}

impl LoadedArtifacts {
    /// Read every artifact, failing on the first one that cannot be read.
    pub fn load(paths: &ArtifactPaths) -> Result<Self, ConstructionError> {
        Ok(Self {
            r1cs: read_artifact("r1cs", &paths.r1cs)?,
            proving_key: read_artifact("proving key", &paths.proving_key)?,
            verifying_key: read_artifact("verifying key", &paths.verifying_key)?,
        })
    }

    pub fn sizes(&self) -> ArtifactSizes {
        ArtifactSizes {
            r1cs: self.r1cs.len() as u64,
            proving_key: self.proving_key.len() as u64,
            verifying_key: self.verifying_key.len() as u64,
        }
    }
}

fn read_artifact(artifact: &'static str, path: &Path) -> Result<Vec<u8>, ConstructionError> {
    let bytes = fs::read(path).map_err(|source| ConstructionError::Artifact {
        artifact,
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(artifact, path = %path.display(), bytes = bytes.len(), "Artifact loaded");
    Ok(bytes)
}
