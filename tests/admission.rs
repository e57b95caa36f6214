//! Admission cap behaviour over real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use prover_gateway::rpc::{Call, Reply, RpcClient};
use prover_gateway::ConnectionPolicy;

mod common;
use common::Timeline;

#[tokio::test]
async fn single_slot_serializes_connections() {
    let timeline = Timeline::default();
    let server = common::start_server(
        1,
        ConnectionPolicy::default(),
        common::timed_handler(timeline.clone(), Duration::from_millis(300)),
    )
    .await;

    let mut first = RpcClient::connect(server.addr).await.unwrap();
    let first_call = first.send_call("work", b"a".to_vec()).await.unwrap();

    // Connects at the TCP level but is not accepted until the first closes.
    let mut second = RpcClient::connect(server.addr).await.unwrap();
    let second_call = second.send_call("work", b"b".to_vec()).await.unwrap();

    let reply = first.wait_reply(first_call).await.unwrap();
    assert_eq!(reply, Reply::ok(b"a".to_vec()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(timeline.names(), vec!["a-start", "a-end"]);

    let first_closed = Instant::now();
    drop(first);

    let reply = second.wait_reply(second_call).await.unwrap();
    assert_eq!(reply, Reply::ok(b"b".to_vec()));
    assert_eq!(timeline.names(), vec!["a-start", "a-end", "b-start", "b-end"]);
    assert!(timeline.time_of("b-start") >= first_closed);
}

#[tokio::test]
async fn open_connections_never_exceed_cap() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        move |call: Call| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(150)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Reply::ok(call.body)
            }
        }
    };
    let server = common::start_server(2, ConnectionPolicy::default(), handler).await;

    let mut clients = Vec::new();
    for i in 0..6u8 {
        let addr = server.addr;
        let tracker = server.tracker.clone();
        clients.push(tokio::spawn(async move {
            let mut client = RpcClient::connect(addr).await.unwrap();
            let reply = client.call("work", vec![i]).await.unwrap();
            assert!(tracker.active_count() <= 2);
            reply
        }));
    }

    for (i, client) in clients.into_iter().enumerate() {
        let reply = client.await.unwrap();
        assert_eq!(reply, Reply::ok(vec![i as u8]));
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(server.tracker.active_count() <= 2);
}

#[tokio::test]
async fn close_unblocks_serve_while_slots_are_full() {
    let server = common::start_server(1, ConnectionPolicy::default(), common::echo_handler()).await;

    let mut holder = RpcClient::connect(server.addr).await.unwrap();
    holder.call("echo", Vec::new()).await.unwrap();
    assert_eq!(server.handle.available_slots(), 0);

    server.handle.close();
    let result = tokio::time::timeout(Duration::from_secs(2), server.serving).await;
    result.expect("serve did not return").unwrap().unwrap();

    holder.wait_closed().await.unwrap();
    assert_eq!(server.tracker.active_count(), 0);
}

#[tokio::test]
async fn new_connections_refused_after_close() {
    let server = common::start_server(4, ConnectionPolicy::default(), common::echo_handler()).await;
    server.handle.close();
    server.serving.await.unwrap().unwrap();

    // Closing released the socket although `server.handle` is still alive.
    assert!(RpcClient::connect(server.addr).await.is_err());
    assert!(common::can_bind(server.addr));
}

#[tokio::test]
async fn queued_call_never_reaches_handler_after_close() {
    let timeline = Timeline::default();
    let server = common::start_server(
        1,
        ConnectionPolicy::default(),
        common::timed_handler(timeline.clone(), Duration::from_millis(300)),
    )
    .await;

    let mut client = RpcClient::connect(server.addr).await.unwrap();
    client.send_call("work", b"running".to_vec()).await.unwrap();
    client.send_call("work", b"queued".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(timeline.names(), vec!["running-start"]);

    server.handle.close();
    tokio::time::timeout(Duration::from_secs(2), server.serving)
        .await
        .expect("serve did not return")
        .unwrap()
        .unwrap();

    // Well past the point where the queued call would have started.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(timeline.names(), vec!["running-start"]);
    client.wait_closed().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_listener_serves_calls() {
    use prover_gateway::net::{BoundedListener, UnixRawListener};
    use prover_gateway::DispatchServer;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.sock");

    let listener = BoundedListener::wrap(UnixRawListener::bind(&path).unwrap(), 1);
    let handle = listener.handle();
    let mut server = DispatchServer::new(ConnectionPolicy::default());
    server.attach(common::echo_handler());
    let serving = tokio::spawn(async move { server.serve(listener).await });

    let mut client = RpcClient::connect_unix(&path).await.unwrap();
    assert_eq!(client.call("echo", b"unix".to_vec()).await.unwrap(), Reply::ok(b"unix".to_vec()));

    drop(client);
    handle.close();
    serving.await.unwrap().unwrap();
}
