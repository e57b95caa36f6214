//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use prover_gateway::config::{ArtifactPaths, RawServerConfig};
use prover_gateway::net::{BoundedListener, ConnectionTracker, ListenerHandle, TcpRawListener};
use prover_gateway::rpc::{Call, Reply, RequestHandler, ServeError};
use prover_gateway::{ConnectionPolicy, DispatchServer};

/// Write small artifact files into `dir`.
pub fn write_artifacts(dir: &Path) -> ArtifactPaths {
    let paths = ArtifactPaths {
        r1cs: dir.join("circuit.r1cs"),
        proving_key: dir.join("pk.bin"),
        verifying_key: dir.join("vk.bin"),
    };
    std::fs::write(&paths.r1cs, vec![0u8; 128]).unwrap();
    std::fs::write(&paths.proving_key, vec![1u8; 64]).unwrap();
    std::fs::write(&paths.verifying_key, vec![2u8; 32]).unwrap();
    paths
}

pub fn raw_config(address: &str, max_connections: i64, artifacts: ArtifactPaths) -> RawServerConfig {
    RawServerConfig {
        address: address.to_string(),
        max_connections,
        artifacts,
        ..RawServerConfig::default()
    }
}

/// An address nothing is listening on.
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// True if a fresh listener can bind `addr`.
pub fn can_bind(addr: SocketAddr) -> bool {
    std::net::TcpListener::bind(addr).is_ok()
}

/// A running dispatch server on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ListenerHandle,
    pub tracker: ConnectionTracker,
    pub serving: JoinHandle<Result<(), ServeError>>,
}

pub async fn start_server<H: RequestHandler>(capacity: usize, policy: ConnectionPolicy, handler: H) -> TestServer {
    let raw = TcpRawListener::bind("127.0.0.1:0").await.unwrap();
    let addr = raw.socket_addr();
    let listener = BoundedListener::wrap(raw, capacity);
    let handle = listener.handle();

    let mut server = DispatchServer::new(policy);
    server.attach(handler);
    let tracker = server.tracker();
    let serving = tokio::spawn(async move { server.serve(listener).await });

    TestServer {
        addr,
        handle,
        tracker,
        serving,
    }
}

/// Ordered record of handler events with their wall-clock times.
#[derive(Clone, Default)]
pub struct Timeline {
    events: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl Timeline {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push((event.into(), Instant::now()));
    }

    pub fn names(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn time_of(&self, event: &str) -> Instant {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, at)| *at)
            .unwrap_or_else(|| panic!("event {event} not recorded"))
    }
}

/// Handler that records `<body>-start` / `<body>-end` and sleeps `work` in between.
pub fn timed_handler(timeline: Timeline, work: Duration) -> impl RequestHandler {
    move |call: Call| {
        let timeline = timeline.clone();
        async move {
            let tag = String::from_utf8_lossy(&call.body).into_owned();
            timeline.record(format!("{tag}-start"));
            tokio::time::sleep(work).await;
            timeline.record(format!("{tag}-end"));
            Reply::ok(call.body)
        }
    }
}

pub fn echo_handler() -> impl RequestHandler {
    |call: Call| async move { Reply::ok(call.body) }
}
