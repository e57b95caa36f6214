//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track connection state (Idle → Active → Aging/IdleTimedOut → GracePeriod → Closed)
//! - Generate unique connection IDs for tracing
//! - Count open connections
//!
//! # Design Decisions
//! - `Lifecycle` is a plain value: the connection actor feeds it events
//!   (frames, timer expiries, worker completions) and executes the actions it
//!   returns, so the policy can be tested without sockets or clocks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts connections currently being served.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new open connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current open connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection untracked");
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open with no call in flight; the idle timer is running.
    Idle,
    /// At least one call is in flight.
    Active,
    /// Past max age; shutdown notice queued.
    Aging,
    /// Idle for longer than the idle timeout; shutdown notice queued.
    IdleTimedOut,
    /// Shutdown notice delivered; in-flight calls are finishing.
    GracePeriod,
    /// Connection is closed.
    Closed,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    /// Aged out and every in-flight call completed.
    MaxAgeDrained,
    /// Aged out and in-flight calls outlived the grace period.
    GraceExpired,
    KeepAliveTimeout,
    PeerClosed,
    TransportError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::MaxAgeDrained => "max_age",
            Self::GraceExpired => "grace_expired",
            Self::KeepAliveTimeout => "keepalive_timeout",
            Self::PeerClosed => "peer_closed",
            Self::TransportError => "transport_error",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    CallReceived,
    CallFinished,
    IdleTimerExpired,
    MaxAgeReached,
    /// The shutdown notice has been written to the peer.
    GoAwaySent,
    GraceExpired,
    KeepAliveTick,
    PongReceived,
    PongTimedOut,
    PeerClosed,
    TransportFailed,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Hand the call to the handler.
    Dispatch,
    /// Answer the call with `Unavailable` without invoking the handler.
    Refuse,
    ArmIdleTimer,
    DisarmIdleTimer,
    SendGoAway,
    ArmGraceTimer,
    SendPing,
    ArmPongTimer,
    DisarmPongTimer,
    Close(CloseReason),
}

/// Per-connection policy state.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    in_flight: usize,
    ping_outstanding: bool,
}

impl Lifecycle {
    /// A freshly accepted connection starts idle with its idle timer armed.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            in_flight: 0,
            ping_outstanding: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Apply `event` and return the actions the caller must perform, in order.
    pub fn on_event(&mut self, event: LifecycleEvent) -> Vec<LifecycleAction> {
        use ConnectionState as S;
        use LifecycleAction as A;
        use LifecycleEvent as E;

        if self.state == S::Closed {
            return Vec::new();
        }

        match event {
            E::CallReceived => match self.state {
                S::Idle | S::Active => {
                    self.in_flight += 1;
                    self.state = S::Active;
                    vec![A::DisarmIdleTimer, A::Dispatch]
                }
                _ => vec![A::Refuse],
            },
            E::CallFinished => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if self.in_flight > 0 {
                    return Vec::new();
                }
                match self.state {
                    S::Active => {
                        self.state = S::Idle;
                        vec![A::ArmIdleTimer]
                    }
                    S::GracePeriod => self.close(CloseReason::MaxAgeDrained),
                    _ => Vec::new(),
                }
            }
            E::IdleTimerExpired => match self.state {
                S::Idle => {
                    self.state = S::IdleTimedOut;
                    vec![A::SendGoAway, A::ArmGraceTimer]
                }
                _ => Vec::new(),
            },
            E::MaxAgeReached => match self.state {
                S::Idle | S::Active => {
                    self.state = S::Aging;
                    vec![A::DisarmIdleTimer, A::SendGoAway, A::ArmGraceTimer]
                }
                _ => Vec::new(),
            },
            E::GoAwaySent => match self.state {
                S::IdleTimedOut => self.close(CloseReason::IdleTimeout),
                S::Aging if self.in_flight == 0 => self.close(CloseReason::MaxAgeDrained),
                S::Aging => {
                    self.state = S::GracePeriod;
                    Vec::new()
                }
                _ => Vec::new(),
            },
            E::GraceExpired => match self.state {
                S::IdleTimedOut => self.close(CloseReason::IdleTimeout),
                S::Aging | S::GracePeriod => self.close(CloseReason::GraceExpired),
                _ => Vec::new(),
            },
            E::KeepAliveTick => {
                if self.ping_outstanding {
                    return Vec::new();
                }
                self.ping_outstanding = true;
                vec![A::SendPing, A::ArmPongTimer]
            }
            E::PongReceived => {
                if !self.ping_outstanding {
                    return Vec::new();
                }
                self.ping_outstanding = false;
                vec![A::DisarmPongTimer]
            }
            E::PongTimedOut => {
                if self.ping_outstanding {
                    self.close(CloseReason::KeepAliveTimeout)
                } else {
                    Vec::new()
                }
            }
            E::PeerClosed => self.close(CloseReason::PeerClosed),
            E::TransportFailed => self.close(CloseReason::TransportError),
        }
    }

    fn close(&mut self, reason: CloseReason) -> Vec<LifecycleAction> {
        self.state = ConnectionState::Closed;
        vec![LifecycleAction::Close(reason)]
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
