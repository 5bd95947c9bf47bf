//! Whole-stack scenarios: manager, connection actors and transports running
//! together against mock sockets and services.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::TransportMode;
use crate::dispatch::DispatchOutcome;
use crate::manager::ConnectionManager;
use crate::request::{AuthClass, ChatRequest, RequestAuth};
use crate::signals::SignalEvent;
use crate::state_machine::ConnectionEvent;
use crate::test_helpers::{MockServer, TestEnv, next_state, wait_for_state};
use crate::transport::ConnectionState;
use crate::transport::frame::{
    KEEPALIVE_PATH, MESSAGE_PATH, QUEUE_EMPTY_PATH, RequestFrame, ResponseFrame, WireMessage,
};

fn push(path: &str, id: u64, headers: Vec<String>, body: &[u8]) -> WireMessage {
    WireMessage::Request(RequestFrame {
        verb: "PUT".to_string(),
        path: path.to_string(),
        id,
        headers,
        body: Some(body.to_vec()),
    })
}

fn answer(server: &MockServer, id: u64, status: u16, body: &[u8]) {
    server.send(WireMessage::Response(ResponseFrame {
        id,
        status,
        message: String::new(),
        headers: vec!["Content-Type: application/json".to_string()],
        body: Some(body.to_vec()),
    }));
}

/// Accept sockets until one for `class` shows up. Others are returned too so
/// their connections stay alive.
async fn accept_for(env: &TestEnv, class: AuthClass) -> (MockServer, Vec<MockServer>) {
    let mut others = Vec::new();
    loop {
        let server = env.connector.accept().await;
        if server.class() == Some(class) {
            return (server, others);
        }
        others.push(server);
    }
}

fn legal(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Closed, Connecting) | (Connecting, Open) | (Connecting, Closed) | (Open, Closed)
    )
}

fn drain_states(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    class: AuthClass,
) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::StateChanged { class: c, state } = event
            && c == class
        {
            states.push(state);
        }
    }
    states
}

#[tokio::test]
async fn request_while_closed_connects_then_succeeds() {
    let env = TestEnv::new();
    let manager = Arc::new(ConnectionManager::start(env.config.clone(), env.collaborators()));
    let mut events = manager.subscribe();
    assert_eq!(manager.connection_state(AuthClass::Unidentified), ConnectionState::Closed);

    let request = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .make_request(ChatRequest::get("/v1/profile/abc", RequestAuth::Anonymous))
                .await
        }
    });

    let mut server = env.connector.accept().await;
    assert_eq!(server.class(), Some(AuthClass::Unidentified));
    wait_for_state(&mut events, AuthClass::Unidentified, ConnectionState::Connecting).await;
    wait_for_state(&mut events, AuthClass::Unidentified, ConnectionState::Open).await;

    let WireMessage::Request(sent) = server.next_frame().await else {
        panic!("expected request frame");
    };
    assert!(sent.is("GET", "/v1/profile/abc"));
    answer(&server, sent.id, 200, b"{\"name\":\"alice\"}");

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_deref(), Some(&b"{\"name\":\"alice\"}"[..]));
    assert_eq!(response.headers.get("content-type"), Some("application/json"));

    let metrics = manager.metrics();
    assert_eq!(metrics.connections.opened, 1);
    assert_eq!(metrics.requests.sent, 1);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_heartbeat_closes_and_arms_reconnect() {
    let env = TestEnv::new();
    let (handle, mut events) = env.spawn_connection(AuthClass::Unidentified);

    let _token = handle.request_connection();
    let mut server = env.connector.accept().await;
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Open);
    let opened_at = Instant::now();

    let WireMessage::Request(ping) = server.next_frame().await else {
        panic!("expected keepalive");
    };
    assert!(ping.is("GET", KEEPALIVE_PATH));
    assert!(opened_at.elapsed() >= env.config.heartbeat_interval);

    // Never answered, so the next tick gives up on the socket.
    assert_eq!(next_state(&mut events).await, ConnectionState::Closed);
    assert!(opened_at.elapsed() >= env.config.heartbeat_interval * 2);
    assert!(env.outage.failures() >= 1);
    let closed_at = Instant::now();

    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert!(closed_at.elapsed() >= env.config.reconnect_interval);
    let _second = env.connector.accept().await;
    assert_eq!(next_state(&mut events).await, ConnectionState::Open);

    let metrics = env.metrics.snapshot();
    assert_eq!(metrics.connections.attempts, 2);
    assert_eq!(metrics.requests.heartbeats, 1);
}

#[tokio::test(start_paused = true)]
async fn unacked_push_leaves_keepalive_working() {
    let env = TestEnv::new();
    env.dispatcher
        .set_outcome(DispatchOutcome::ShouldNotAck("envelope failed to decrypt".into()));
    let (handle, mut events) = env.spawn_connection(AuthClass::Unidentified);

    let _token = handle.request_connection();
    let mut server = env.connector.accept().await;
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Open);

    server.send(push(
        MESSAGE_PATH,
        41,
        vec!["X-Delivery-Timestamp: 1700000000000".to_string()],
        b"sealed",
    ));
    env.dispatcher.wait_for_decisions(1).await;
    assert_eq!(env.dispatcher.processed(), vec![(b"sealed".to_vec(), 1_700_000_000_000)]);

    // The first frame the server sees is the heartbeat, not an ack.
    for _ in 0..3 {
        let WireMessage::Request(ping) = server.next_frame().await else {
            panic!("expected keepalive, not an ack");
        };
        assert!(ping.is("GET", KEEPALIVE_PATH));
        server.send(WireMessage::Response(ResponseFrame::ack(ping.id)));
    }
    assert_eq!(handle.state(), ConnectionState::Open);

    let metrics = env.metrics.snapshot();
    assert_eq!(metrics.pushes.received, 1);
    assert_eq!(metrics.pushes.acked, 0);
    assert_eq!(metrics.requests.heartbeats, 3);
}

#[tokio::test(start_paused = true)]
async fn observed_states_follow_the_lifecycle() {
    let env = TestEnv::new();
    let (handle, mut events) = env.spawn_connection(AuthClass::Unidentified);

    let token = handle.request_connection();
    let _first = env.connector.accept().await;
    handle.wait_for_open().await.unwrap();

    // The cycle's reconnect is refused, so the reconnect timer retries it.
    env.connector.fail_next("connection refused");
    env.signals.notify(SignalEvent::ProxyChanged);
    let _second = env.connector.accept().await;
    handle.wait_for_open().await.unwrap();
    assert_eq!(env.metrics.snapshot().connections.attempts, 3);

    token.release();
    while handle.state() != ConnectionState::Closed {
        tokio::task::yield_now().await;
    }

    let states = drain_states(&mut events, AuthClass::Unidentified);
    let mut previous = ConnectionState::Closed;
    for state in &states {
        assert!(legal(previous, *state), "{previous} -> {state}");
        previous = *state;
    }
    assert_eq!(previous, ConnectionState::Closed);
    assert_eq!(states.iter().filter(|s| **s == ConnectionState::Open).count(), 2);
}

#[tokio::test]
async fn queue_emptied_once_per_socket() {
    let env = TestEnv::new();
    let (handle, mut events) = env.spawn_connection(AuthClass::Identified);

    let _token = handle.request_connection();
    let mut server = env.connector.accept().await;
    handle.wait_for_open().await.unwrap();
    assert!(!handle.has_emptied_initial_queue());

    server.send(push(QUEUE_EMPTY_PATH, 1, vec![], b""));
    server.send(push(QUEUE_EMPTY_PATH, 2, vec![], b""));
    assert_eq!(server.next_frame().await, WireMessage::Response(ResponseFrame::ack(1)));
    assert_eq!(server.next_frame().await, WireMessage::Response(ResponseFrame::ack(2)));
    assert!(handle.has_emptied_initial_queue());

    let emptied = |events: &mut broadcast::Receiver<ConnectionEvent>| {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectionEvent::InitialQueueEmptied { class: AuthClass::Identified }) {
                count += 1;
            }
        }
        count
    };
    assert_eq!(emptied(&mut events), 1);

    // A fresh socket has a fresh queue.
    env.signals.notify(SignalEvent::ProxyChanged);
    let mut server = env.connector.accept().await;
    handle.wait_for_open().await.unwrap();
    assert!(!handle.has_emptied_initial_queue());
    let _ = emptied(&mut events);

    server.send(push(QUEUE_EMPTY_PATH, 3, vec![], b""));
    assert_eq!(server.next_frame().await, WireMessage::Response(ResponseFrame::ack(3)));
    assert!(handle.has_emptied_initial_queue());
    assert_eq!(emptied(&mut events), 1);
}

#[tokio::test]
async fn queue_empty_is_announced_after_preceding_messages() {
    let env = TestEnv::new();
    let (handle, mut events) = env.spawn_connection(AuthClass::Identified);

    let _token = handle.request_connection();
    let mut server = env.connector.accept().await;
    handle.wait_for_open().await.unwrap();

    server.send(push(
        MESSAGE_PATH,
        7,
        vec!["X-Delivery-Timestamp: 1700000000001".to_string()],
        b"first",
    ));
    server.send(push(QUEUE_EMPTY_PATH, 8, vec![], b""));

    loop {
        if let ConnectionEvent::InitialQueueEmptied { class } = events.recv().await.unwrap() {
            assert_eq!(class, AuthClass::Identified);
            break;
        }
    }
    assert_eq!(env.dispatcher.processed(), vec![(b"first".to_vec(), 1_700_000_000_001)]);

    let mut acked = vec![server.next_frame().await, server.next_frame().await];
    acked.sort_by_key(|frame| match frame {
        WireMessage::Response(response) => response.id,
        WireMessage::Request(request) => request.id,
    });
    assert_eq!(
        acked,
        vec![
            WireMessage::Response(ResponseFrame::ack(7)),
            WireMessage::Response(ResponseFrame::ack(8)),
        ]
    );
}

#[tokio::test]
async fn service_transport_delivers_pushes_and_queue_empty() {
    let env = TestEnv::with_service();
    let (handle, mut events) = env.spawn_connection_in(AuthClass::Identified, TransportMode::Service);

    let _token = handle.request_connection();
    assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
    assert_eq!(next_state(&mut events).await, ConnectionState::Open);
    let service = env.service();

    service.push_message(b"from-service", 99);
    env.dispatcher.wait_for_decisions(1).await;
    while service.acks.load(Ordering::SeqCst) < 1 {
        tokio::task::yield_now().await;
    }
    assert_eq!(env.dispatcher.processed(), vec![(b"from-service".to_vec(), 99)]);

    service.push_queue_empty();
    loop {
        if let ConnectionEvent::InitialQueueEmptied { class } = events.recv().await.unwrap() {
            assert_eq!(class, AuthClass::Identified);
            break;
        }
    }
    assert!(handle.has_emptied_initial_queue());

    let response = handle
        .make_request(ChatRequest::get("/v1/config", RequestAuth::Identified))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(service.sent_paths(), vec!["/v1/config".to_string()]);
}

#[tokio::test]
async fn manager_falls_back_to_framed_without_services() {
    let mut env = TestEnv::new();
    env.config.unidentified_mode = TransportMode::Shadowed;
    let manager = ConnectionManager::start(env.config.clone(), env.collaborators());

    let _tokens = manager.request_connections();
    let (_server, _others) = accept_for(&env, AuthClass::Unidentified).await;
    tokio::time::timeout(
        Duration::from_secs(5),
        manager.wait_for_open(AuthClass::Unidentified),
    )
    .await
    .unwrap()
    .unwrap();
    manager.shutdown().await;
}
