// TURN allocation lifecycle: the unauthenticated-then-challenged allocate
// handshake, relay learning, scheduled refresh, and refresh exhaustion
// tearing the relay down.

use std::net::SocketAddr;
use std::time::Duration;

use natlink_agent::codec::{Method, ParsedMessage, StunMessage};
use natlink_agent::{AgentConfig, BindingKind, BindingStatus, NatAgent, SocketHandle};
use natlink_integration_tests::{init_tracing, RecordingTransport};

fn server() -> SocketAddr {
    "192.0.2.8:3478".parse().unwrap()
}

fn relay() -> SocketAddr {
    "192.0.2.8:49152".parse().unwrap()
}

async fn step_timeout(agent: &NatAgent, config: &AgentConfig) {
    tokio::time::advance(config.response_timeout() + Duration::from_millis(1)).await;
    agent.synchronize_async().await;
}

/// Drive an allocation through the 401 challenge to success.
async fn establish(
    agent: &NatAgent,
    transport: &RecordingTransport,
    socket: SocketHandle,
    lifetime: u32,
) {
    assert!(agent.enable_turn(socket, server(), 0, "alice", "wonderland"));
    agent.synchronize_async().await;

    // First allocate goes out bare.
    let first = transport.frames().last().unwrap().clone();
    let decoded = StunMessage::decode(&first.payload).unwrap();
    assert_eq!(decoded.method, Method::Allocate);
    assert!(!decoded.is_authenticated());

    // Server challenges; the agent retries once with credentials.
    agent.handle_inbound_message(
        socket,
        ParsedMessage::error(Method::Allocate, decoded.transaction_id, 401)
            .with_auth_challenge("example.org", "nonce-1"),
    );
    agent.synchronize_async().await;

    let second = transport.frames().last().unwrap().clone();
    let decoded = StunMessage::decode(&second.payload).unwrap();
    assert_eq!(decoded.method, Method::Allocate);
    assert!(decoded.is_authenticated());
    assert!(decoded.verify_message_integrity("wonderland").unwrap());

    agent.handle_inbound_message(
        socket,
        ParsedMessage::success(Method::Allocate, decoded.transaction_id)
            .with_relayed(relay())
            .with_lifetime(lifetime),
    );
    agent.synchronize_async().await;
}

#[tokio::test(start_paused = true)]
async fn allocate_authenticates_after_challenge() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let socket = SocketHandle(1);

    establish(&agent, &transport, socket, 600).await;

    let snap = agent.inspect(socket, BindingKind::TurnAllocation).unwrap();
    assert_eq!(snap.status, BindingStatus::Success);
    assert_eq!(snap.relay, Some(relay()));
    assert!(snap.has_timer, "a refresh must be scheduled for a live allocation");
    assert_eq!(agent.relay_address(socket), Some(relay()));

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_fires_before_expiry_and_reschedules() {
    init_tracing();
    let config = AgentConfig::default();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), config.clone());
    let socket = SocketHandle(2);

    establish(&agent, &transport, socket, 600).await;
    let sent_before = transport.sent_count();

    // Refresh is due at lifetime - margin = 540s.
    tokio::time::advance(Duration::from_secs(541)).await;
    agent.synchronize_async().await;

    assert_eq!(transport.sent_count(), sent_before + 1);
    let refresh = transport.frames().last().unwrap().clone();
    let decoded = StunMessage::decode(&refresh.payload).unwrap();
    assert_eq!(decoded.method, Method::Refresh);
    assert!(decoded.is_authenticated(), "refresh reuses the learned credentials");

    agent.handle_inbound_message(
        socket,
        ParsedMessage::success(Method::Refresh, decoded.transaction_id).with_lifetime(600),
    );
    agent.synchronize_async().await;

    let snap = agent.inspect(socket, BindingKind::TurnAllocation).unwrap();
    assert_eq!(snap.status, BindingStatus::Success);
    assert_eq!(snap.relay, Some(relay()), "refresh keeps the relay");
    assert_eq!(snap.refresh_error_count, 0);
    assert!(snap.has_timer, "next refresh scheduled");

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_exhaustion_invalidates_the_relay() {
    init_tracing();
    // Small ceiling so the refresh round exhausts quickly: 1 send + 2
    // retries, then the 3rd unanswered timeout is terminal.
    let config = AgentConfig { discovery_max_attempts: 2, ..Default::default() };
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), config.clone());
    let socket = SocketHandle(3);

    establish(&agent, &transport, socket, 600).await;
    assert_eq!(agent.relay_address(socket), Some(relay()));

    tokio::time::advance(Duration::from_secs(541)).await;
    agent.synchronize_async().await;

    // Let every refresh attempt time out.
    for _ in 0..3 {
        step_timeout(&agent, &config).await;
    }

    let snap = agent.inspect(socket, BindingKind::TurnAllocation).unwrap();
    assert_eq!(snap.status, BindingStatus::Failed);
    assert!(!snap.has_timer);
    assert_eq!(snap.relay, None, "refresh exhaustion tears the relay down");
    assert!(snap.refresh_error_count > 0);
    assert_eq!(agent.relay_address(socket), None);

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn non_auth_error_is_terminal() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let socket = SocketHandle(4);

    agent.enable_turn(socket, server(), 0, "alice", "wonderland");
    agent.synchronize_async().await;
    let txid = transport.last_transaction_id().unwrap();

    agent.handle_inbound_message(socket, ParsedMessage::error(Method::Allocate, txid, 508));
    agent.synchronize_async().await;

    let snap = agent.inspect(socket, BindingKind::TurnAllocation).unwrap();
    assert_eq!(snap.status, BindingStatus::Failed);
    assert!(!snap.has_timer);

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_enable_turn_rejected() {
    init_tracing();
    let agent = NatAgent::spawn(RecordingTransport::new(), AgentConfig::default());
    let socket = SocketHandle(5);

    assert!(agent.enable_turn(socket, server(), 0, "alice", "wonderland"));
    assert!(!agent.enable_turn(socket, server(), 0, "alice", "wonderland"));
    assert!(agent.disable_turn(socket));
    assert!(agent.enable_turn(socket, server(), 0, "alice", "wonderland"));

    agent.shutdown_async().await;
}
