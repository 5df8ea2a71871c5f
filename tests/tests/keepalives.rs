// Keepalive cadences: CRLF fire-and-forget pings, STUN keepalive rounds
// with listener callbacks, and removal semantics.

use std::net::SocketAddr;
use std::time::Duration;

use natlink_agent::codec::{Method, ParsedMessage};
use natlink_agent::{
    AgentConfig, BindingKind, BindingStatus, KeepaliveEvent, NatAgent, SocketHandle,
};
use natlink_integration_tests::{init_tracing, RecordingListener, RecordingTransport};

fn peer() -> SocketAddr {
    "198.51.100.20:5004".parse().unwrap()
}

async fn step_timeout(agent: &NatAgent, config: &AgentConfig) {
    tokio::time::advance(config.response_timeout() + Duration::from_millis(1)).await;
    agent.synchronize_async().await;
}

#[tokio::test(start_paused = true)]
async fn crlf_keepalive_pings_on_cadence() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let listener = RecordingListener::new();
    let socket = SocketHandle(1);

    assert!(agent.add_crlf_keepalive(socket, peer(), 15, Some(listener.clone())));
    agent.synchronize_async().await;

    let crlf_count =
        |t: &RecordingTransport| t.frames().iter().filter(|f| f.is_crlf()).count();
    assert_eq!(crlf_count(&transport), 1);

    for expected in [2, 3, 4] {
        tokio::time::advance(Duration::from_secs(15)).await;
        agent.synchronize_async().await;
        assert_eq!(crlf_count(&transport), expected);
    }

    assert_eq!(listener.count(|e| matches!(e, KeepaliveEvent::Started { .. })), 1);

    // Removal stops the cadence and notifies the listener.
    assert!(agent.remove_crlf_keepalive(socket, peer()));
    assert!(!agent.remove_crlf_keepalive(socket, peer()));
    agent.synchronize_async().await;
    assert_eq!(listener.count(|e| matches!(e, KeepaliveEvent::Stopped { .. })), 1);

    let frames_after_removal = crlf_count(&transport);
    tokio::time::advance(Duration::from_secs(60)).await;
    agent.synchronize_async().await;
    assert_eq!(crlf_count(&transport), frames_after_removal);

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn crlf_send_errors_do_not_stop_the_cadence() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let socket = SocketHandle(2);

    transport.set_fail_sends(true);
    agent.add_crlf_keepalive(socket, peer(), 15, None);
    agent.synchronize_async().await;

    let snap = agent.inspect(socket, BindingKind::CrlfKeepalive).unwrap();
    assert_eq!(snap.status, BindingStatus::SendingError);
    assert!(snap.has_timer, "a failed ping still reschedules");

    transport.set_fail_sends(false);
    tokio::time::advance(Duration::from_secs(15)).await;
    agent.synchronize_async().await;

    let snap = agent.inspect(socket, BindingKind::CrlfKeepalive).unwrap();
    assert_eq!(snap.status, BindingStatus::Success);
    assert_eq!(transport.sent_count(), 2);

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn stun_keepalive_rounds_report_the_mapping() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let listener = RecordingListener::new();
    let socket = SocketHandle(3);
    let mapped: SocketAddr = "203.0.113.2:42000".parse().unwrap();

    assert!(agent.add_stun_keepalive(socket, peer(), 20, Some(listener.clone())));
    agent.synchronize_async().await;
    assert_eq!(transport.sent_count(), 1);

    let txid = transport.last_transaction_id().unwrap();
    agent.handle_inbound_message(
        socket,
        ParsedMessage::success(Method::Binding, txid).with_mapped(mapped),
    );
    agent.synchronize_async().await;

    let snap = agent.inspect(socket, BindingKind::StunKeepalive).unwrap();
    assert_eq!(snap.status, BindingStatus::Success);
    assert_eq!(snap.mapped, Some(mapped));
    assert!(snap.has_timer, "next round is scheduled after success");
    assert_eq!(
        listener.count(|e| matches!(
            e,
            KeepaliveEvent::Succeeded { mapped: Some(m), .. } if *m == mapped
        )),
        1
    );

    // Next round starts on the interval with a fresh transaction id.
    tokio::time::advance(Duration::from_secs(21)).await;
    agent.synchronize_async().await;
    assert_eq!(transport.sent_count(), 2);
    let ids = transport.transaction_ids();
    assert_ne!(ids[0], ids[1]);

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn stun_keepalive_exhaustion_notifies_failure() {
    init_tracing();
    let config = AgentConfig { discovery_max_attempts: 2, ..Default::default() };
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), config.clone());
    let listener = RecordingListener::new();
    let socket = SocketHandle(4);

    agent.add_stun_keepalive(socket, peer(), 20, Some(listener.clone()));
    agent.synchronize_async().await;

    // 1 send + 2 retries, then the next timeout is terminal.
    for _ in 0..3 {
        step_timeout(&agent, &config).await;
    }

    let snap = agent.inspect(socket, BindingKind::StunKeepalive).unwrap();
    assert_eq!(snap.status, BindingStatus::Failed);
    assert!(!snap.has_timer);
    assert_eq!(listener.count(|e| matches!(e, KeepaliveEvent::Failed { .. })), 1);

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn discovery_keepalive_interval_refreshes_the_mapping() {
    init_tracing();
    let transport = RecordingTransport::new();
    let agent = NatAgent::spawn(transport.clone(), AgentConfig::default());
    let socket = SocketHandle(5);
    let server: SocketAddr = "192.0.2.1:3478".parse().unwrap();

    agent.enable_stun(socket, server, Default::default(), 30);
    agent.synchronize_async().await;
    let txid = transport.last_transaction_id().unwrap();
    agent.handle_inbound_message(socket, ParsedMessage::success(Method::Binding, txid));
    agent.synchronize_async().await;

    let snap = agent.inspect(socket, BindingKind::StunDiscovery).unwrap();
    assert_eq!(snap.status, BindingStatus::Success);
    assert!(snap.has_timer, "keepalive cadence keeps a timer across success");

    tokio::time::advance(Duration::from_secs(31)).await;
    agent.synchronize_async().await;
    assert_eq!(transport.sent_count(), 2, "discovery re-ran on its keepalive interval");

    agent.shutdown_async().await;
}

#[tokio::test(start_paused = true)]
async fn bulk_removal_is_safe_and_complete() {
    init_tracing();
    let agent = NatAgent::spawn(RecordingTransport::new(), AgentConfig::default());
    let socket = SocketHandle(6);
    let other: SocketAddr = "198.51.100.21:5004".parse().unwrap();

    // Safe to call with nothing registered.
    assert_eq!(agent.remove_keepalives(socket), 0);

    agent.add_crlf_keepalive(socket, peer(), 15, None);
    agent.add_stun_keepalive(socket, peer(), 20, None);
    agent.add_crlf_keepalive(socket, other, 15, None);
    agent.synchronize_async().await;
    assert_eq!(agent.binding_count(), 3);

    assert_eq!(agent.remove_keepalives(socket), 3);
    agent.synchronize_async().await;
    assert_eq!(agent.binding_count(), 0);

    // Duplicate registration on a live keepalive is rejected.
    assert!(agent.add_crlf_keepalive(socket, peer(), 15, None));
    assert!(!agent.add_crlf_keepalive(socket, peer(), 15, None));

    agent.shutdown_async().await;
}
