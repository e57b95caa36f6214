//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration before touching the network
//! - Bind the raw listener and wrap it with the admission cap
//! - Construct the handler with the same capacity and attach it
//! - Start the metrics exporter once nothing else can fail
//! - Serve until the listener is closed or the shutdown future resolves
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and returned to the caller
//! - Steps run strictly in order; a failed step drops everything acquired
//!   before it, so no socket outlives a failed launch. The exporter is
//!   process-global and cannot be uninstalled, so it starts last
//! - Logging is scoped: the dispatcher built from the validated `LogConfig`
//!   is attached to the launcher's futures, never installed globally

use std::future::Future;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::instrument::WithSubscriber;
use tracing::Dispatch;

use crate::config::{validate_config, ConfigError, RawServerConfig, ServerConfig};
use crate::net::{AnyListener, BoundedListener, ConnectionTracker, ListenError, ListenerHandle};
use crate::observability::metrics;
use crate::rpc::{ConstructionError, DispatchServer, HandlerFactory, RequestHandler, ServeError};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listen(#[from] ListenError),

    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Serve(#[from] ServeError),

    #[error("failed to start metrics exporter: {0}")]
    Metrics(String),
}

/// Runs the startup sequence.
#[derive(Default)]
pub struct ServiceLauncher {
    dispatch: Option<Dispatch>,
}

impl ServiceLauncher {
    /// Log through a dispatcher built from the validated configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log through `dispatch` instead of building one from the configuration.
    pub fn with_dispatch(dispatch: Dispatch) -> Self {
        Self {
            dispatch: Some(dispatch),
        }
    }

    /// Validate, bind, construct and attach, without serving yet.
    pub async fn prepare<F: HandlerFactory>(
        &self,
        raw: RawServerConfig,
        factory: &F,
    ) -> Result<PreparedService, LaunchError> {
        let config = validate_config(raw)?;
        let dispatch = self
            .dispatch
            .clone()
            .unwrap_or_else(|| config.log().dispatch());

        let (listener, server) = bind_and_attach(&config, factory)
            .with_subscriber(dispatch.clone())
            .await?;

        Ok(PreparedService {
            config,
            listener,
            server,
            dispatch,
        })
    }

    /// Prepare and serve until `shutdown` resolves or the listener closes.
    pub async fn launch<F, S>(&self, raw: RawServerConfig, factory: &F, shutdown: S) -> Result<(), LaunchError>
    where
        F: HandlerFactory,
        S: Future<Output = ()>,
    {
        self.prepare(raw, factory).await?.serve_until(shutdown).await
    }
}

async fn bind_and_attach<F: HandlerFactory>(
    config: &ServerConfig,
    factory: &F,
) -> Result<(BoundedListener<AnyListener>, DispatchServer), LaunchError> {
    tracing::info!(
        address = %config.address(),
        max_connections = config.max_connections(),
        log_level = %config.log().verbosity,
        "Starting prover gateway"
    );

    let raw = AnyListener::bind(config.address()).await?;
    let listener = BoundedListener::wrap(raw, config.max_connections() as usize);
    tracing::info!(address = %listener.local_addr(), "Listener bound");

    let handler = factory.construct(config.max_connections(), config.artifacts())?;
    if let Some(capacity) = handler.capacity() {
        if capacity > config.max_connections() {
            return Err(ConstructionError::CapacityExceeded {
                handler: capacity,
                admission: config.max_connections(),
            }
            .into());
        }
    }

    let mut server = DispatchServer::new(config.policy());
    server.attach(handler);

    if let Some(addr) = config.metrics_address() {
        metrics::init_metrics(addr).map_err(LaunchError::Metrics)?;
    }

    Ok((listener, server))
}

/// A bound listener with its handler attached, ready to serve.
pub struct PreparedService {
    config: ServerConfig,
    listener: BoundedListener<AnyListener>,
    server: DispatchServer,
    dispatch: Dispatch,
}

impl PreparedService {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bound address, e.g. with the actual port when configured with port 0.
    pub fn local_addr(&self) -> String {
        self.listener.local_addr()
    }

    /// Bound TCP socket address, if listening on TCP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.listener.raw() {
            AnyListener::Tcp(l) => Some(l.socket_addr()),
            #[cfg(unix)]
            AnyListener::Unix(_) => None,
        }
    }

    /// Handle that closes the listener, ending `serve_until`.
    pub fn handle(&self) -> ListenerHandle {
        self.listener.handle()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.server.tracker()
    }

    /// Serve until the listener is closed, closing it when `shutdown` resolves.
    pub async fn serve_until<S: Future<Output = ()>>(self, shutdown: S) -> Result<(), LaunchError> {
        let Self {
            listener,
            server,
            dispatch,
            ..
        } = self;
        let handle = listener.handle();

        async move {
            let serving = server.serve(listener);
            tokio::pin!(serving);

            tokio::select! {
                result = &mut serving => result?,
                _ = shutdown => {
                    tracing::info!("Shutdown requested, closing listener");
                    handle.close();
                    serving.await?;
                }
            }

            tracing::info!("Shutdown complete");
            Ok::<(), LaunchError>(())
        }
        .with_subscriber(dispatch)
        .await
    }
}
