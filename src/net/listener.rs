//! Listener implementations with admission control.
//!
//! # Responsibilities
//! - Bind TCP or Unix-domain sockets
//! - Abstract raw listeners behind the `RawListener` capability
//! - Enforce max_connections via a semaphore of connection slots
//! - Wake every pending accept when the listener is closed
//!
//! # Design Decisions
//! - A slot is acquired before the peer is accepted, so excess peers wait in
//!   the kernel backlog instead of holding a file descriptor
//! - Slots are owned permits: release happens on drop, exactly once
//! - Closing takes the OS socket out of the raw listener, so the port stops
//!   accepting handshakes even while close handles are still alive
//! - A Unix bind only replaces an existing path if it is a socket

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::config::ListenAddress;

/// Error returned by `accept`.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed. This is a shutdown notification, not a fault.
    #[error("listener closed")]
    ListenerClosed,
    /// The underlying socket reported an error while accepting.
    #[error("failed to accept: {0}")]
    Io(#[from] io::Error),
}

/// Failure to open the raw listener.
#[derive(Debug, Error)]
#[error("failed to listen on {address}: {source}")]
pub struct ListenError {
    pub address: String,
    #[source]
    pub source: io::Error,
}

/// Byte stream of an accepted connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An accepted, transport-agnostic connection.
pub struct Connection {
    stream: Box<dyn AsyncStream>,
    peer: String,
}

impl Connection {
    pub fn new<S: AsyncStream>(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }

    /// Peer description for logs (socket address or "unix").
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// The accept/close capability a transport must provide to be wrapped by
/// `BoundedListener`.
pub trait RawListener: Send + Sync + 'static {
    /// Wait for the next inbound connection.
    ///
    /// Fails with `AcceptError::ListenerClosed` once `close` has been called,
    /// including for calls already waiting.
    fn accept(&self) -> impl Future<Output = Result<Connection, AcceptError>> + Send;

    /// Close the listener. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the listener has been closed.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    /// Human-readable bound address.
    fn local_addr(&self) -> String;
}

/// One-way closed flag that wakes every waiter.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent close is not missed.
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// OS listener that `close` can drop while the owning raw listener lives on.
///
/// Pending accepts hold a clone only until they observe the close signal.
#[derive(Debug)]
struct OsSocket<T>(Mutex<Option<Arc<T>>>);

impl<T> OsSocket<T> {
    fn new(inner: T) -> Self {
        Self(Mutex::new(Some(Arc::new(inner))))
    }

    fn get(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    fn take(&self) -> Option<Arc<T>> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Raw TCP listener.
#[derive(Debug)]
pub struct TcpRawListener {
    socket: OsSocket<TcpListener>,
    local_addr: SocketAddr,
    signal: CloseSignal,
}

impl TcpRawListener {
    pub async fn bind(address: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Self::from_listener(listener)
    }

    pub fn from_listener(inner: TcpListener) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Self {
            socket: OsSocket::new(inner),
            local_addr,
            signal: CloseSignal::new(),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl RawListener for TcpRawListener {
    fn accept(&self) -> impl Future<Output = Result<Connection, AcceptError>> + Send {
        async move {
            if self.signal.is_closed() {
                return Err(AcceptError::ListenerClosed);
            }
            let Some(listener) = self.socket.get() else {
                return Err(AcceptError::ListenerClosed);
            };
            tokio::select! {
                biased;
                _ = self.signal.wait() => Err(AcceptError::ListenerClosed),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    Ok(Connection::new(stream, peer.to_string()))
                }
            }
        }
    }

    fn close(&self) {
        self.signal.close();
        if self.socket.take().is_some() {
            tracing::debug!(address = %self.local_addr, "TCP listener released");
        }
    }

    fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    fn closed(&self) -> impl Future<Output = ()> + Send {
        self.signal.wait()
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }
}

/// Raw Unix-domain socket listener. Removes its socket file on close or drop.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixRawListener {
    socket: OsSocket<UnixListener>,
    path: PathBuf,
    signal: CloseSignal,
}

#[cfg(unix)]
impl UnixRawListener {
    /// Bind at `path`, replacing a stale socket file from a previous run.
    ///
    /// Fails with `AlreadyExists` if `path` is anything other than a socket.
    pub fn bind(path: &Path) -> io::Result<Self> {
        remove_stale_socket(path)?;
        let inner = UnixListener::bind(path)?;
        Ok(Self {
            socket: OsSocket::new(inner),
            path: path.to_path_buf(),
            signal: CloseSignal::new(),
        })
    }

    fn release(&self) {
        if self.socket.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
impl RawListener for UnixRawListener {
    fn accept(&self) -> impl Future<Output = Result<Connection, AcceptError>> + Send {
        async move {
            if self.signal.is_closed() {
                return Err(AcceptError::ListenerClosed);
            }
            let Some(listener) = self.socket.get() else {
                return Err(AcceptError::ListenerClosed);
            };
            tokio::select! {
                biased;
                _ = self.signal.wait() => Err(AcceptError::ListenerClosed),
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    Ok(Connection::new(stream, "unix"))
                }
            }
        }
    }

    fn close(&self) {
        self.signal.close();
        self.release();
    }

    fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    fn closed(&self) -> impl Future<Output = ()> + Send {
        self.signal.wait()
    }

    fn local_addr(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

#[cfg(unix)]
impl Drop for UnixRawListener {
    fn drop(&mut self) {
        self.release();
    }
}

/// Listener for whichever transport the configured address selects.
#[derive(Debug)]
pub enum AnyListener {
    Tcp(TcpRawListener),
    #[cfg(unix)]
    Unix(UnixRawListener),
}

impl AnyListener {
    /// Open a raw listener at `address`.
    pub async fn bind(address: &ListenAddress) -> Result<Self, ListenError> {
        let listen_error = |source| ListenError {
            address: address.to_string(),
            source,
        };
        match address {
            ListenAddress::Tcp(addr) => TcpRawListener::bind(addr)
                .await
                .map(Self::Tcp)
                .map_err(listen_error),
            #[cfg(unix)]
            ListenAddress::Unix(path) => UnixRawListener::bind(path)
                .map(Self::Unix)
                .map_err(listen_error),
            #[cfg(not(unix))]
            ListenAddress::Unix(_) => Err(listen_error(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            ))),
        }
    }
}

impl RawListener for AnyListener {
    fn accept(&self) -> impl Future<Output = Result<Connection, AcceptError>> + Send {
        async move {
            match self {
                Self::Tcp(l) => l.accept().await,
                #[cfg(unix)]
                Self::Unix(l) => l.accept().await,
            }
        }
    }

    fn close(&self) {
        match self {
            Self::Tcp(l) => l.close(),
            #[cfg(unix)]
            Self::Unix(l) => l.close(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Self::Tcp(l) => l.is_closed(),
            #[cfg(unix)]
            Self::Unix(l) => l.is_closed(),
        }
    }

    fn closed(&self) -> impl Future<Output = ()> + Send {
        async move {
            match self {
                Self::Tcp(l) => l.closed().await,
                #[cfg(unix)]
                Self::Unix(l) => l.closed().await,
            }
        }
    }

    fn local_addr(&self) -> String {
        match self {
            Self::Tcp(l) => l.local_addr(),
            #[cfg(unix)]
            Self::Unix(l) => l.local_addr(),
        }
    }
}

/// A raw listener limited to `capacity` concurrently open connections.
///
/// When every slot is taken, `accept` waits until one is released.
pub struct BoundedListener<L> {
    inner: Arc<L>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl<L: RawListener> BoundedListener<L> {
    /// Wrap `raw` with an admission cap of `capacity` connections.
    pub fn wrap(raw: L, capacity: usize) -> Self {
        tracing::debug!(
            address = %raw.local_addr(),
            max_connections = capacity,
            "Listener bounded"
        );
        Self {
            inner: Arc::new(raw),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Accept a connection once both a slot and a peer are available.
    ///
    /// The returned slot must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(Connection, ConnectionSlot), AcceptError> {
        let permit = tokio::select! {
            biased;
            _ = self.inner.closed() => return Err(AcceptError::ListenerClosed),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| AcceptError::ListenerClosed)?
            }
        };

        // On error the permit drops here and the slot returns to the pool.
        let connection = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %connection.peer(),
            available_slots = self.slots.available_permits(),
            "Connection accepted"
        );

        Ok((connection, ConnectionSlot { _permit: permit }))
    }

    /// Close the raw listener and the slot pool, waking every pending accept.
    pub fn close(&self) {
        self.inner.close();
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed() || self.slots.is_closed()
    }

    /// A handle that can close this listener from another task.
    pub fn handle(&self) -> ListenerHandle {
        let inner = Arc::clone(&self.inner);
        ListenerHandle {
            close: Arc::new(move || inner.close()),
            slots: Arc::clone(&self.slots),
        }
    }

    pub fn local_addr(&self) -> String {
        self.inner.local_addr()
    }

    /// Slots not currently held by a connection.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Configured admission cap.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The wrapped raw listener.
    pub fn raw(&self) -> &L {
        &self.inner
    }
}

/// Cloneable close handle for a `BoundedListener`.
#[derive(Clone)]
pub struct ListenerHandle {
    close: Arc<dyn Fn() + Send + Sync>,
    slots: Arc<Semaphore>,
}

impl ListenerHandle {
    pub fn close(&self) {
        (self.close)();
        self.slots.close();
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("available_slots", &self.slots.available_permits())
            .finish()
    }
}

/// One unit of admission capacity.
///
/// Dropping it releases the slot back to the pool, even if the connection
/// task panics or is aborted.
#[derive(Debug)]
pub struct ConnectionSlot {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    async fn bounded(capacity: usize) -> BoundedListener<TcpRawListener> {
        let raw = TcpRawListener::bind("127.0.0.1:0").await.unwrap();
        BoundedListener::wrap(raw, capacity)
    }

    #[tokio::test]
    async fn slot_released_when_connection_dropped() {
        let listener = bounded(1).await;
        let addr = listener.raw().socket_addr();

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let (conn, slot) = listener.accept().await.unwrap();
        assert_eq!(listener.available_slots(), 0);

        let _c2 = TcpStream::connect(addr).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(blocked.is_err(), "second accept must wait for a slot");

        drop(conn);
        drop(slot);
        assert_eq!(listener.available_slots(), 1);

        let second = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(matches!(second, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn close_wakes_every_pending_accept_once() {
        let listener = Arc::new(bounded(4).await);

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let listener = Arc::clone(&listener);
            waiters.push(tokio::spawn(async move { listener.accept().await }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.close();

        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("accept must return after close")
                .unwrap();
            assert!(matches!(result, Err(AcceptError::ListenerClosed)));
        }
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn closing_raw_listener_wakes_accept_waiting_for_slot() {
        let listener = Arc::new(bounded(1).await);
        let addr = listener.raw().socket_addr();

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _held = listener.accept().await.unwrap();

        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.raw().close();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AcceptError::ListenerClosed)));
    }

    #[tokio::test]
    async fn closing_through_handle_releases_the_port() {
        let listener = bounded(1).await;
        let addr = listener.raw().socket_addr();
        let handle = listener.handle();

        handle.close();

        // Both the listener and its handle are still alive.
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(std::net::TcpListener::bind(addr).is_ok());
        drop(handle);
    }

    #[tokio::test]
    async fn pending_accept_does_not_keep_the_port_open() {
        let listener = Arc::new(bounded(1).await);
        let addr = listener.raw().socket_addr();

        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.close();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AcceptError::ListenerClosed)));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn handle_closes_listener() {
        let listener = bounded(2).await;
        let handle = listener.handle();
        assert_eq!(handle.available_slots(), 2);

        handle.close();
        assert!(listener.is_closed());
        assert!(matches!(listener.accept().await, Err(AcceptError::ListenerClosed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_listener_accepts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.sock");

        let raw = UnixRawListener::bind(&path).unwrap();
        assert_eq!(raw.local_addr(), format!("unix:{}", path.display()));
        let listener = BoundedListener::wrap(raw, 1);

        let _client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (conn, _slot) = listener.accept().await.unwrap();
        assert_eq!(conn.peer(), "unix");

        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closing_unix_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.sock");

        let listener = BoundedListener::wrap(UnixRawListener::bind(&path).unwrap(), 1);
        listener.handle().close();

        assert!(!path.exists());
        assert!(tokio::net::UnixStream::connect(&path).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.sock");

        // A std listener leaves its socket file behind when dropped.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = BoundedListener::wrap(UnixRawListener::bind(&path).unwrap(), 1);
        let _client = tokio::net::UnixStream::connect(&path).await.unwrap();
        assert!(listener.accept().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_bind_refuses_to_replace_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pk.bin");
        std::fs::write(&path, b"proving key bytes").unwrap();

        let err = UnixRawListener::bind(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"proving key bytes");

        let address = ListenAddress::Unix(path.clone());
        let err = AnyListener::bind(&address).await.unwrap_err();
        assert_eq!(err.address, format!("unix:{}", path.display()));
        assert_eq!(std::fs::read(&path).unwrap(), b"proving key bytes");
    }
}
