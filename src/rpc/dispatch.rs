//! Per-connection dispatch actor.
//!
//! # Data Flow
//! ```text
//! socket ─▶ reader task ──┐
//!                         ├─ events ─▶ actor (Lifecycle + timers) ─▶ call worker ─▶ handler
//! writer task ◀─ frames ──┘                 │                              │
//!      ▲                                    └──── control frames ──────────┤
//!      └──────────────────────────────────────────── replies ──────────────┘
//! ```
//!
//! # Design Decisions
//! - Only the actor touches policy state; everything else reaches it through
//!   the event channel
//! - Calls run one at a time, in arrival order, on the call worker, so pings
//!   and timers are serviced while the handler works
//! - The actor never blocks on a send; if an outbound queue is full the frame
//!   is dropped and the timers settle the connection's fate

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::instrument::WithSubscriber;

use crate::net::connection::{CloseReason, ConnectionId, Lifecycle, LifecycleAction, LifecycleEvent};
use crate::net::{Connection, ConnectionPolicy};
use crate::observability::metrics;
use crate::rpc::frame::{Frame, FrameError, Status};
use crate::rpc::handler::{Call, Reply, RequestHandler};

/// Calls accepted but not yet started; beyond this, calls are refused.
pub const MAX_QUEUED_CALLS: usize = 64;

const EVENT_QUEUE: usize = 128;
const OUTBOUND_QUEUE: usize = 128;

#[derive(Debug)]
enum ConnEvent {
    Frame(Frame),
    ReadEnded(Option<FrameError>),
    GoAwayWritten,
    WriteFailed(FrameError),
    CallDone,
}

/// Aborts the task when dropped.
struct TaskGuard<T>(JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Serve one connection until the policy closes it or the peer goes away.
///
/// The caller holds the connection slot and releases it when this returns.
pub async fn serve_connection(
    connection: Connection,
    id: ConnectionId,
    handler: Arc<dyn RequestHandler>,
    policy: ConnectionPolicy,
) -> CloseReason {
    let peer = connection.peer().to_string();
    let (read_half, write_half) = tokio::io::split(connection);

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (calls_tx, calls_rx) = mpsc::channel(MAX_QUEUED_CALLS);

    let reader = TaskGuard(tokio::spawn(
        read_frames(read_half, events_tx.clone()).with_current_subscriber(),
    ));
    let mut writer = TaskGuard(tokio::spawn(
        write_frames(write_half, out_rx, events_tx.clone()).with_current_subscriber(),
    ));
    let worker = TaskGuard(tokio::spawn(
        run_calls(id, calls_rx, handler, out_tx.clone(), events_tx).with_current_subscriber(),
    ));

    tracing::debug!(connection_id = %id, peer_addr = %peer, "Connection open");

    let mut lifecycle = Lifecycle::new();
    let mut last_dispatched = 0u32;
    let mut next_nonce = 0u32;
    let mut ping_nonce: Option<u32> = None;

    let idle = time::sleep(policy.idle_timeout);
    let max_age = time::sleep(policy.max_age);
    let grace = time::sleep(policy.max_age_grace);
    let pong_deadline = time::sleep(policy.keep_alive_timeout);
    tokio::pin!(idle, max_age, grace, pong_deadline);
    let mut idle_armed = true;
    let mut max_age_armed = true;
    let mut grace_armed = false;
    let mut pong_armed = false;

    let mut keep_alive = time::interval_at(
        time::Instant::now() + policy.keep_alive_interval,
        policy.keep_alive_interval,
    );
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = 'conn: loop {
        let step = tokio::select! {
            event = events_rx.recv() => match event {
                Some(ConnEvent::Frame(Frame::Call { id: call_id, method, body })) => Some((
                    LifecycleEvent::CallReceived,
                    Some(Call { connection: id, id: call_id, method, body }),
                )),
                Some(ConnEvent::Frame(Frame::Pong { nonce })) => {
                    if ping_nonce == Some(nonce) {
                        ping_nonce = None;
                        Some((LifecycleEvent::PongReceived, None))
                    } else {
                        None
                    }
                }
                Some(ConnEvent::Frame(Frame::Ping { nonce })) => {
                    let _ = out_tx.try_send(Frame::Pong { nonce });
                    None
                }
                Some(ConnEvent::Frame(frame)) => {
                    tracing::debug!(connection_id = %id, kind = ?frame.kind(), "Ignoring unexpected frame");
                    None
                }
                Some(ConnEvent::ReadEnded(None)) => Some((LifecycleEvent::PeerClosed, None)),
                Some(ConnEvent::ReadEnded(Some(e))) => {
                    tracing::warn!(connection_id = %id, error = %e, "Failed to read frame");
                    Some((LifecycleEvent::TransportFailed, None))
                }
                Some(ConnEvent::GoAwayWritten) => Some((LifecycleEvent::GoAwaySent, None)),
                Some(ConnEvent::WriteFailed(e)) => {
                    tracing::warn!(connection_id = %id, error = %e, "Failed to write frame");
                    Some((LifecycleEvent::TransportFailed, None))
                }
                Some(ConnEvent::CallDone) => Some((LifecycleEvent::CallFinished, None)),
                None => Some((LifecycleEvent::TransportFailed, None)),
            },
            _ = &mut idle, if idle_armed => {
                idle_armed = false;
                Some((LifecycleEvent::IdleTimerExpired, None))
            }
            _ = &mut max_age, if max_age_armed => {
                max_age_armed = false;
                Some((LifecycleEvent::MaxAgeReached, None))
            }
            _ = &mut grace, if grace_armed => {
                grace_armed = false;
                Some((LifecycleEvent::GraceExpired, None))
            }
            _ = &mut pong_deadline, if pong_armed => {
                pong_armed = false;
                Some((LifecycleEvent::PongTimedOut, None))
            }
            _ = keep_alive.tick() => Some((LifecycleEvent::KeepAliveTick, None)),
        };

        let Some((event, mut call)) = step else {
            continue;
        };

        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            for action in lifecycle.on_event(event) {
                match action {
                    LifecycleAction::Dispatch => {
                        let Some(c) = call.take() else { continue };
                        let call_id = c.id;
                        match calls_tx.try_send(c) {
                            Ok(()) => last_dispatched = call_id,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                let _ = out_tx.try_send(reply_frame(
                                    call_id,
                                    Reply::error(Status::ResourceExhausted, "too many queued calls"),
                                ));
                                pending.push(LifecycleEvent::CallFinished);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                pending.push(LifecycleEvent::TransportFailed);
                            }
                        }
                    }
                    LifecycleAction::Refuse => {
                        if let Some(c) = call.take() {
                            let _ = out_tx.try_send(reply_frame(
                                c.id,
                                Reply::error(Status::Unavailable, "connection is shutting down"),
                            ));
                        }
                    }
                    LifecycleAction::ArmIdleTimer => {
                        idle.as_mut().reset(time::Instant::now() + policy.idle_timeout);
                        idle_armed = true;
                    }
                    LifecycleAction::DisarmIdleTimer => idle_armed = false,
                    LifecycleAction::SendGoAway => {
                        tracing::debug!(connection_id = %id, state = ?lifecycle.state(), "Sending GoAway");
                        let _ = out_tx.try_send(Frame::GoAway {
                            last_id: last_dispatched,
                        });
                    }
                    LifecycleAction::ArmGraceTimer => {
                        grace.as_mut().reset(time::Instant::now() + policy.max_age_grace);
                        grace_armed = true;
                    }
                    LifecycleAction::SendPing => {
                        next_nonce = next_nonce.wrapping_add(1);
                        ping_nonce = Some(next_nonce);
                        let _ = out_tx.try_send(Frame::Ping { nonce: next_nonce });
                    }
                    LifecycleAction::ArmPongTimer => {
                        pong_deadline.as_mut().reset(time::Instant::now() + policy.keep_alive_timeout);
                        pong_armed = true;
                    }
                    LifecycleAction::DisarmPongTimer => pong_armed = false,
                    LifecycleAction::Close(reason) => break 'conn reason,
                }
            }
        }
    };

    // Let the worker exit and the writer drain replies already queued.
    drop(calls_tx);
    drop(out_tx);
    if matches!(reason, CloseReason::IdleTimeout | CloseReason::MaxAgeDrained) {
        let _ = time::timeout(policy.max_age_grace, &mut writer.0).await;
    }
    drop(worker);
    drop(reader);
    drop(writer);

    match reason {
        CloseReason::PeerClosed | CloseReason::IdleTimeout | CloseReason::MaxAgeDrained => {
            tracing::debug!(connection_id = %id, peer_addr = %peer, reason = %reason, "Connection closed");
        }
        _ => {
            tracing::info!(
                connection_id = %id,
                peer_addr = %peer,
                reason = %reason,
                in_flight = lifecycle.in_flight(),
                "Connection closed by policy"
            );
        }
    }

    reason
}

fn reply_frame(id: u32, reply: Reply) -> Frame {
    Frame::Reply {
        id,
        status: reply.status,
        body: reply.body,
    }
}

async fn read_frames<R>(reader: R, events: mpsc::Sender<ConnEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        match Frame::read_from(&mut reader).await {
            Ok(frame) => {
                if events.send(ConnEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Err(FrameError::Closed) => {
                let _ = events.send(ConnEvent::ReadEnded(None)).await;
                return;
            }
            Err(e) => {
                let _ = events.send(ConnEvent::ReadEnded(Some(e))).await;
                return;
            }
        }
    }
}

async fn write_frames<W>(writer: W, mut frames: mpsc::Receiver<Frame>, events: mpsc::Sender<ConnEvent>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(frame) = frames.recv().await {
        if let Err(e) = frame.write_to(&mut writer).await {
            let _ = events.send(ConnEvent::WriteFailed(e)).await;
            return;
        }
        if matches!(frame, Frame::GoAway { .. }) && events.send(ConnEvent::GoAwayWritten).await.is_err() {
            return;
        }
    }
}

async fn run_calls(
    connection: ConnectionId,
    mut calls: mpsc::Receiver<Call>,
    handler: Arc<dyn RequestHandler>,
    out: mpsc::Sender<Frame>,
    events: mpsc::Sender<ConnEvent>,
) {
    while let Some(call) = calls.recv().await {
        let call_id = call.id;
        let method = call.method.clone();
        let start = Instant::now();

        // Run on its own task so a panicking handler fails only this call.
        let mut task = TaskGuard(tokio::spawn(handler.handle(call).with_current_subscriber()));
        let reply = match (&mut task.0).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(connection_id = %connection, call_id, method = %method, error = %e, "Handler failed");
                Reply::error(Status::Internal, "handler failed")
            }
        };

        metrics::record_call(&method, reply.status.as_str(), start);
        tracing::debug!(
            connection_id = %connection,
            call_id,
            method = %method,
            status = reply.status.as_str(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Call completed"
        );

        if out.send(reply_frame(call_id, reply)).await.is_err() {
            return;
        }
        if events.send(ConnEvent::CallDone).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    use crate::rpc::client::RpcClient;

    fn echo_handler() -> Arc<dyn RequestHandler> {
        Arc::new(|call: Call| async move {
            match call.method.as_str() {
                "slow" => {
                    time::sleep(Duration::from_secs(2)).await;
                    Reply::ok(call.body)
                }
                "stuck" => {
                    time::sleep(Duration::from_secs(3600)).await;
                    Reply::ok(call.body)
                }
                "boom" => panic!("handler blew up"),
                _ => Reply::ok(call.body),
            }
        })
    }

    fn spawn_conn(policy: ConnectionPolicy) -> (RpcClient<DuplexStream>, JoinHandle<CloseReason>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(server, "test-peer");
        let task = tokio::spawn(serve_connection(connection, ConnectionId::new(), echo_handler(), policy));
        (RpcClient::new(client), task)
    }

    #[tokio::test(start_paused = true)]
    async fn call_gets_reply_and_peer_close_ends_connection() {
        let (mut client, task) = spawn_conn(ConnectionPolicy::default());

        let reply = client.call("echo", b"hello".to_vec()).await.unwrap();
        assert_eq!(reply, Reply::ok(b"hello".to_vec()));

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_closes_even_when_pings_are_answered() {
        let (mut client, task) = spawn_conn(ConnectionPolicy::default());
        let start = Instant::now();

        client.wait_closed().await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(12));
        assert_eq!(client.goaway(), Some(0));
        assert_eq!(task.await.unwrap(), CloseReason::IdleTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_restarts_after_a_call() {
        let (mut client, task) = spawn_conn(ConnectionPolicy::default());
        let start = Instant::now();

        time::sleep(Duration::from_secs(8)).await;
        client.call("echo", Vec::new()).await.unwrap();
        client.wait_closed().await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(18));
        assert_eq!(task.await.unwrap(), CloseReason::IdleTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn max_age_lets_in_flight_call_finish_and_refuses_new_ones() {
        let policy = ConnectionPolicy {
            max_age: Duration::from_secs(1),
            max_age_grace: Duration::from_secs(5),
            ..ConnectionPolicy::default()
        };
        let (mut client, task) = spawn_conn(policy);

        let first = client.send_call("slow", b"a".to_vec()).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Frame::GoAway { last_id: first });

        let second = client.send_call("echo", b"b".to_vec()).await.unwrap();
        let refused = client.wait_reply(second).await.unwrap();
        assert_eq!(refused.status, Status::Unavailable);

        let finished = client.wait_reply(first).await.unwrap();
        assert_eq!(finished, Reply::ok(b"a".to_vec()));

        client.wait_closed().await.unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::MaxAgeDrained);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_force_closes_with_call_in_flight() {
        let policy = ConnectionPolicy {
            max_age: Duration::from_secs(1),
            max_age_grace: Duration::from_secs(1),
            ..ConnectionPolicy::default()
        };
        let (mut client, task) = spawn_conn(policy);
        let start = Instant::now();

        client.send_call("stuck", Vec::new()).await.unwrap();
        client.wait_closed().await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(task.await.unwrap(), CloseReason::GraceExpired);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_closes_connection() {
        let policy = ConnectionPolicy {
            idle_timeout: Duration::from_secs(3600),
            max_age: Duration::from_secs(3600),
            ..ConnectionPolicy::default()
        };
        let (mut client, task) = spawn_conn(policy);
        client.set_auto_pong(false);
        let start = Instant::now();

        client.wait_closed().await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(25));
        assert!(start.elapsed() < Duration::from_secs(26));
        assert_eq!(task.await.unwrap(), CloseReason::KeepAliveTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_busy_connection_open() {
        let policy = ConnectionPolicy {
            idle_timeout: Duration::from_secs(3600),
            max_age: Duration::from_secs(3600),
            ..ConnectionPolicy::default()
        };
        let (mut client, task) = spawn_conn(policy);

        // Reading while the call runs answers every ping.
        let id = client.send_call("stuck", Vec::new()).await.unwrap();
        let waited = time::timeout(Duration::from_secs(60), client.wait_reply(id)).await;
        assert!(waited.is_err());
        assert!(!task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_fails_only_its_call() {
        let (mut client, _task) = spawn_conn(ConnectionPolicy::default());

        let failed = client.call("boom", Vec::new()).await.unwrap();
        assert_eq!(failed.status, Status::Internal);

        let next = client.call("echo", b"still here".to_vec()).await.unwrap();
        assert_eq!(next, Reply::ok(b"still here".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn calls_are_answered_in_arrival_order() {
        let (mut client, _task) = spawn_conn(ConnectionPolicy::default());

        let slow = client.send_call("slow", b"1".to_vec()).await.unwrap();
        let fast = client.send_call("echo", b"2".to_vec()).await.unwrap();

        match client.recv().await.unwrap() {
            Frame::Reply { id, .. } => assert_eq!(id, slow),
            other => panic!("unexpected frame {other:?}"),
        }
        match client.recv().await.unwrap() {
            Frame::Reply { id, .. } => assert_eq!(id, fast),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
