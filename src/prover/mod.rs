//! Bundled request handler backed by proof artifacts.
//!
//! # Responsibilities
//! - Load the r1cs, proving key and verifying key at construction
//! - Answer `stats` with capacity, in-flight work and artifact sizes (JSON)
//! - Forward every other method to a pluggable `ProofBackend`
//!
//! # Design Decisions
//! - Backend calls run on the blocking pool, at most `capacity` at a time
//! - Without a backend, non-`stats` methods answer `Unimplemented`

pub mod artifacts;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::ArtifactPaths;
use crate::rpc::{Call, ConstructionError, HandlerFactory, Reply, RequestHandler, Status};
use crate::rpc::handler::HandlerFuture;

pub use artifacts::{ArtifactSizes, LoadedArtifacts};

/// Method answered by the handler itself.
pub const STATS_METHOD: &str = "stats";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("backend failure: {0}")]
    Failed(String),
}

/// The compute-bound work behind every method except `stats`.
///
/// Called on a blocking thread.
pub trait ProofBackend: Send + Sync + 'static {
    fn prove(&self, artifacts: &LoadedArtifacts, method: &str, body: &[u8]) -> Result<Vec<u8>, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStats {
    pub capacity: u32,
    pub in_flight: u32,
    pub artifacts: ArtifactSizes,
}

struct Inner {
    artifacts: Arc<LoadedArtifacts>,
    backend: Option<Arc<dyn ProofBackend>>,
    permits: Arc<Semaphore>,
    capacity: u32,
}

impl Inner {
    fn stats(&self) -> HandlerStats {
        let available = self.permits.available_permits() as u32;
        HandlerStats {
            capacity: self.capacity,
            in_flight: self.capacity.saturating_sub(available),
            artifacts: self.artifacts.sizes(),
        }
    }
}

#[derive(Clone)]
pub struct ArtifactHandler {
    inner: Arc<Inner>,
}

impl ArtifactHandler {
    pub fn new(capacity: u32, artifacts: LoadedArtifacts, backend: Option<Arc<dyn ProofBackend>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                artifacts: Arc::new(artifacts),
                backend,
                permits: Arc::new(Semaphore::new(capacity as usize)),
                capacity,
            }),
        }
    }

    pub fn stats(&self) -> HandlerStats {
        self.inner.stats()
    }
}

impl RequestHandler for ArtifactHandler {
    fn handle(&self, call: Call) -> HandlerFuture {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            if call.method == STATS_METHOD {
                return match serde_json::to_vec(&inner.stats()) {
                    Ok(body) => Reply::ok(body),
                    Err(e) => Reply::error(Status::Internal, e.to_string()),
                };
            }

            let Some(backend) = inner.backend.clone() else {
                return Reply::error(Status::Unimplemented, format!("unknown method {}", call.method));
            };
            let Ok(permit) = Arc::clone(&inner.permits).acquire_owned().await else {
                return Reply::error(Status::Unavailable, "handler is shutting down");
            };

            let artifacts = Arc::clone(&inner.artifacts);
            let Call { method, body, .. } = call;
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                backend.prove(&artifacts, &method, &body)
            })
            .await;

            match result {
                Ok(Ok(body)) => Reply::ok(body),
                Ok(Err(BackendError::InvalidArgument(msg))) => Reply::error(Status::InvalidArgument, msg),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Backend call failed");
                    Reply::error(Status::Internal, e.to_string())
                }
                Err(e) => {
                    tracing::error!(error = %e, "Backend task failed");
                    Reply::error(Status::Internal, "backend task failed")
                }
            }
        })
    }

    fn capacity(&self) -> Option<u32> {
        Some(self.inner.capacity)
    }
}

/// Builds an `ArtifactHandler` from the configured artifact paths.
#[derive(Clone, Default)]
pub struct ArtifactFactory {
    backend: Option<Arc<dyn ProofBackend>>,
}

impl ArtifactFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend<B: ProofBackend>(backend: B) -> Self {
        Self {
            backend: Some(Arc::new(backend)),
        }
    }
}

impl HandlerFactory for ArtifactFactory {
    type Handler = ArtifactHandler;

    fn construct(&self, capacity: u32, artifacts: &ArtifactPaths) -> Result<ArtifactHandler, ConstructionError> {
        let loaded = LoadedArtifacts::load(artifacts)?;
        let sizes = loaded.sizes();
        tracing::info!(
            capacity,
            r1cs_bytes = sizes.r1cs,
            proving_key_bytes = sizes.proving_key,
            verifying_key_bytes = sizes.verifying_key,
            backend = self.backend.is_some(),
            "Handler constructed"
        );
        Ok(ArtifactHandler::new(capacity, loaded, self.backend.clone()))
    }
}
