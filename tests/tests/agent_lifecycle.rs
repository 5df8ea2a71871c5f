// Binding lifecycle: enable/disable, duplicate rejection, mapping
// learning, the synchronize barrier, and deterministic shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use natlink_agent::codec::{Method, ParsedMessage};
use natlink_agent::{AgentConfig, BindingKind, BindingStatus, NatAgent, SocketHandle, StunOptions};
use natlink_integration_tests::{init_tracing, RecordingTransport};

fn server() -> SocketAddr {
    "192.0.2.1:3478".parse().unwrap()
}

#[tokio::test]
async fn discovery_learns_mapped_address() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let socket = SocketHandle(1);

    assert!(agent.enable_stun(socket, server(), StunOptions::default(), 0));
    agent.synchronize_async().await;

    // Exactly one binding request went out and a response timer is armed.
    assert_eq!(transport.sent_count(), 1);
    let snap = agent.inspect(socket, BindingKind::StunDiscovery).unwrap();
    assert_eq!(snap.status, BindingStatus::Sending);
    assert_eq!(snap.abort_count, 1);
    assert!(snap.has_timer);

    let request = transport.frames()[0].parsed().unwrap();
    assert_eq!(request.method, Method::Binding);

    let mapped: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    agent.handle_inbound_message(
        socket,
        ParsedMessage::success(Method::Binding, request.transaction_id).with_mapped(mapped),
    );
    agent.synchronize_async().await;

    // Success with no keepalive cadence: terminal, no timer left.
    let snap = agent.inspect(socket, BindingKind::StunDiscovery).unwrap();
    assert_eq!(snap.status, BindingStatus::Success);
    assert!(!snap.has_timer);
    assert_eq!(snap.mapped, Some(mapped));
    assert_eq!(agent.mapped_address(socket), Some(mapped));

    agent.shutdown_async().await;
}

#[tokio::test]
async fn duplicate_enable_is_rejected() {
    init_tracing();
    let agent = NatAgent::spawn(RecordingTransport::new(), AgentConfig::default());
    let socket = SocketHandle(2);

    assert!(agent.enable_stun(socket, server(), StunOptions::default(), 0));
    assert!(!agent.enable_stun(socket, server(), StunOptions::default(), 0));
    assert_eq!(agent.binding_count(), 1);

    // Disable, then enabling again is fine.
    assert!(agent.disable_stun(socket));
    assert!(!agent.disable_stun(socket));
    assert!(agent.enable_stun(socket, server(), StunOptions::default(), 0));

    agent.shutdown_async().await;
}

#[tokio::test]
async fn synchronize_observes_all_prior_requests() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let socket = SocketHandle(3);

    let n = 32;
    for i in 0..n {
        let dest: SocketAddr = format!("198.51.100.{}:4000", i + 1).parse().unwrap();
        assert!(agent.send_stun_probe(socket, dest, i));
    }
    agent.synchronize_async().await;

    // Every probe enqueued before the barrier has visibly taken effect.
    assert_eq!(transport.sent_count(), n as usize);
    assert_eq!(agent.binding_count(), n as usize);

    agent.shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_synchronize_from_foreign_thread() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let socket = SocketHandle(4);

    agent.enable_stun(socket, server(), StunOptions::default(), 0);

    let blocking_agent = agent.clone();
    tokio::task::spawn_blocking(move || blocking_agent.synchronize())
        .await
        .unwrap();

    assert_eq!(transport.sent_count(), 1);
    agent.shutdown_async().await;
}

#[tokio::test]
async fn socket_teardown_removes_everything() {
    init_tracing();
    let agent = NatAgent::spawn(RecordingTransport::new(), AgentConfig::default());
    let socket = SocketHandle(5);
    let peer: SocketAddr = "198.51.100.7:5060".parse().unwrap();

    agent.enable_stun(socket, server(), StunOptions::default(), 30);
    agent.add_crlf_keepalive(socket, peer, 15, None);
    agent.add_external_binding(socket, peer, "1.2.3.4:6000".parse().unwrap());
    agent.synchronize_async().await;
    assert_eq!(agent.binding_count(), 2);

    agent.socket_closed(socket);
    agent.synchronize_async().await;

    assert_eq!(agent.binding_count(), 0);
    assert!(agent.inspect(socket, BindingKind::StunDiscovery).is_none());
    assert!(agent.find_external_binding("198.51.100.7", 5060, Duration::ZERO).is_none());

    agent.shutdown_async().await;
}

#[tokio::test]
async fn shutdown_is_deterministic_and_terminal() {
    init_tracing();
    let agent = NatAgent::spawn(RecordingTransport::new(), AgentConfig::default());
    let socket = SocketHandle(6);

    agent.enable_stun(socket, server(), StunOptions::default(), 30);
    agent.enable_turn(socket, server(), 0, "alice", "wonderland");
    agent.synchronize_async().await;
    assert_eq!(agent.binding_count(), 2);

    agent.shutdown_async().await;
    assert_eq!(agent.binding_count(), 0);

    // The processor is gone: manipulators refuse new work instead of
    // leaking contexts that nothing will ever drive.
    assert!(!agent.enable_stun(socket, server(), StunOptions::default(), 0));
    assert_eq!(agent.binding_count(), 0);
}
