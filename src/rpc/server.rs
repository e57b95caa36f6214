//! Dispatch server: the accept loop in front of the request handler.
//!
//! # Responsibilities
//! - Accept connections from a `BoundedListener`
//! - Spawn one dispatch actor per connection, holding its slot until it ends
//! - Keep serving through per-connection failures and transient accept errors
//! - Stop when the listener is closed
//!
//! # Design Decisions
//! - The server owns no shutdown channel; closing the listener is the only way
//!   to stop it
//! - Connection tasks live in a `JoinSet` so they are aborted together when
//!   serving ends and the handler is not invoked afterwards

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;

use crate::net::listener::{AcceptError, BoundedListener, RawListener};
use crate::net::{ConnectionPolicy, ConnectionTracker};
use crate::observability::metrics;
use crate::rpc::dispatch::serve_connection;
use crate::rpc::handler::RequestHandler;

const ACCEPT_BACKOFF_BASE_MS: u64 = 5;
const ACCEPT_BACKOFF_MAX_MS: u64 = 1000;

#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;

#[derive(Debug, Error)]
pub enum ServeError {
    /// The listener was already closed when serving began.
    #[error("listener is closed")]
    ListenerClosed,

    #[error("no request handler attached")]
    NoHandler,

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
}

/// Serves framed RPC calls on every accepted connection.
pub struct DispatchServer {
    policy: ConnectionPolicy,
    handler: Option<Arc<dyn RequestHandler>>,
    tracker: ConnectionTracker,
}

impl DispatchServer {
    pub fn new(policy: ConnectionPolicy) -> Self {
        Self {
            policy,
            handler: None,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Register the handler that receives every call. Replaces any earlier one.
    pub fn attach<H: RequestHandler>(&mut self, handler: H) {
        self.attach_shared(Arc::new(handler));
    }

    pub fn attach_shared(&mut self, handler: Arc<dyn RequestHandler>) {
        self.handler = Some(handler);
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    /// Live connection counter.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept and serve connections until the listener is closed.
    ///
    /// Returns `Ok(())` once the listener is closed while serving. Connections
    /// still open at that point are aborted.
    pub async fn serve<L: RawListener>(&self, listener: BoundedListener<L>) -> Result<(), ServeError> {
        if listener.is_closed() {
            return Err(ServeError::ListenerClosed);
        }
        let handler = self.handler.clone().ok_or(ServeError::NoHandler)?;

        tracing::info!(
            address = %listener.local_addr(),
            max_connections = listener.capacity(),
            "Serving"
        );

        let mut connections = JoinSet::new();
        let mut failures = 0u32;

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((connection, slot)) => {
                        failures = 0;
                        let guard = self.tracker.track();
                        let tracker = self.tracker.clone();
                        let handler = Arc::clone(&handler);
                        let policy = self.policy;
                        metrics::record_connection_opened(tracker.active_count());

                        connections.spawn(
                            async move {
                                let reason = serve_connection(connection, guard.id(), handler, policy).await;
                                drop(guard);
                                drop(slot);
                                metrics::record_connection_closed(reason.as_str(), tracker.active_count());
                            }
                            .with_current_subscriber(),
                        );
                    }
                    Err(AcceptError::ListenerClosed) => break Ok(()),
                    Err(AcceptError::Io(e)) if is_transient(&e) => {
                        failures += 1;
                        let delay = accept_backoff(failures);
                        tracing::warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Accept failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(AcceptError::Io(e)) => {
                        tracing::error!(error = %e, "Accept failed");
                        listener.close();
                        break Err(ServeError::Transport(e));
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        };

        let open = connections.len();
        connections.shutdown().await;
        tracing::info!(aborted_connections = open, "Stopped serving");
        result
    }
}

/// Errors after which accepting can continue.
fn is_transient(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE)) {
            return true;
        }
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Doubling delay between consecutive failed accepts, capped at one second.
fn accept_backoff(failures: u32) -> Duration {
    let factor = 2u64.saturating_pow(failures.saturating_sub(1));
    Duration::from_millis(ACCEPT_BACKOFF_BASE_MS.saturating_mul(factor).min(ACCEPT_BACKOFF_MAX_MS))
}
