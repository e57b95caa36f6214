//! Handler-facing interfaces of the dispatch layer.
//!
//! The front-end never looks inside call bodies. A handler receives the method
//! name and body of each call and produces a status and body.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;

use thiserror::Error;

use crate::config::ArtifactPaths;
use crate::net::ConnectionId;
use crate::rpc::frame::Status;

/// One inbound call.
#[derive(Debug, Clone)]
pub struct Call {
    pub connection: ConnectionId,
    pub id: u32,
    pub method: String,
    pub body: Vec<u8>,
}

/// Handler result for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Status::Ok,
            body: body.into(),
        }
    }

    /// An error reply carrying a UTF-8 message as its body.
    pub fn error(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            body: message.into().into_bytes(),
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Reply> + Send + 'static>>;

/// The external request handler registered with the dispatch server.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, call: Call) -> HandlerFuture;

    /// Concurrency budget the handler was constructed with, if it has one.
    ///
    /// The launcher refuses handlers whose budget exceeds the admission cap.
    fn capacity(&self) -> Option<u32> {
        None
    }
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    fn handle(&self, call: Call) -> HandlerFuture {
        Box::pin(self(call))
    }
}

/// Handler failed to initialize from its resource paths.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("failed to load {artifact} from {path}: {source}")]
    Artifact {
        artifact: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("handler capacity {handler} exceeds the admission cap of {admission} connections")]
    CapacityExceeded { handler: u32, admission: u32 },

    #[error("handler construction failed: {0}")]
    Other(String),
}

/// Builds the request handler once the listener is open.
pub trait HandlerFactory {
    type Handler: RequestHandler;

    fn construct(
        &self,
        capacity: u32,
        artifacts: &ArtifactPaths,
    ) -> Result<Self::Handler, ConstructionError>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(u32, &ArtifactPaths) -> Result<H, ConstructionError>,
    H: RequestHandler,
{
    type Handler = H;

    fn construct(&self, capacity: u32, artifacts: &ArtifactPaths) -> Result<H, ConstructionError> {
        self(capacity, artifacts)
    }
}
