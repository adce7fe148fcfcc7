//! End-to-end session lifecycle over an in-memory relay and mock transport
//!
//! Mock negotiators are attached under the same names as the relay
//! addresses their engines claim, so the two layers agree on peer naming.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use peerlink::session::{SessionEvent, SessionOrchestrator};
use peerlink::signaling::{MemoryRelay, NegotiationMessage, RelayEvent, RendezvousClient};
use peerlink::transport::{MockNetwork, TransportState};
use peerlink::{Error, Identity, PeerLinkConfig};

fn test_config() -> PeerLinkConfig {
    PeerLinkConfig {
        reconnect_base_ms: 20,
        max_reconnect_attempts: 3,
        ..Default::default()
    }
}

/// Build an engine and claim `name` as its relay address
async fn engine(
    relay: &Arc<MemoryRelay>,
    network: &Arc<MockNetwork>,
    name: &str,
    config: PeerLinkConfig,
) -> (SessionOrchestrator, mpsc::Receiver<SessionEvent>) {
    let link = relay.connect().await;
    let (rendezvous, relay_events) = RendezvousClient::start(link);
    let (negotiator, transport_events) = network
        .attach(name, Identity::new(format!("id-{}", name), name))
        .await;
    let (handle, events) = SessionOrchestrator::start(
        config,
        rendezvous,
        relay_events,
        Arc::new(negotiator),
        transport_events,
    );
    handle.host(Some(name.to_string())).await.unwrap();
    (handle, events)
}

async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches
async fn wait_for<F>(events: &mut mpsc::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn wait_for_state(
    events: &mut mpsc::Receiver<SessionEvent>,
    peer: &str,
    state: TransportState,
) {
    wait_for(events, |e| {
        matches!(e, SessionEvent::StateChanged { peer: p, state: s }
            if p.as_str() == peer && *s == state)
    })
    .await;
}

async fn assert_quiet(events: &mut mpsc::Receiver<SessionEvent>) {
    let extra = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(extra.is_err(), "unexpected event: {:?}", extra);
}

#[tokio::test]
async fn test_join_opens_session_on_both_sides() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (_host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    joiner.join("host", false).await.unwrap();

    wait_for_state(&mut joiner_events, "host", TransportState::Negotiating).await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;

    // Identities crossed over the direct channel
    let identified = wait_for(&mut joiner_events, |e| {
        matches!(e, SessionEvent::PeerIdentified { .. })
    })
    .await;
    assert_eq!(
        identified,
        SessionEvent::PeerIdentified {
            peer: "host".to_string(),
            identity: Identity::new("id-host", "host"),
        }
    );
    wait_for(&mut host_events, |e| {
        matches!(e, SessionEvent::PeerIdentified { identity, .. }
            if identity.stable_id == "id-joiner")
    })
    .await;

    assert_eq!(
        joiner.sessions().await.unwrap(),
        vec![("host".to_string(), TransportState::Open)]
    );
}

#[tokio::test]
async fn test_payloads_flow_both_ways() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    joiner.join("host", false).await.unwrap();
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;

    host.send_to("joiner", b"ping".to_vec()).await.unwrap();
    let payload = wait_for(&mut joiner_events, |e| {
        matches!(e, SessionEvent::Payload { .. })
    })
    .await;
    assert_eq!(
        payload,
        SessionEvent::Payload {
            peer: "host".to_string(),
            data: b"ping".to_vec(),
        }
    );

    joiner.broadcast(b"pong".to_vec()).await.unwrap();
    let payload = wait_for(&mut host_events, |e| {
        matches!(e, SessionEvent::Payload { .. })
    })
    .await;
    assert_eq!(
        payload,
        SessionEvent::Payload {
            peer: "joiner".to_string(),
            data: b"pong".to_vec(),
        }
    );
}

#[tokio::test]
async fn test_deliberate_disconnect_is_sticky() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    joiner.join("host", false).await.unwrap();
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;

    host.disconnect("joiner").await.unwrap();

    wait_for_state(&mut joiner_events, "host", TransportState::Closed).await;
    wait_for_state(&mut host_events, "joiner", TransportState::Closed).await;

    // The joiner honors the disconnect intent: no reconnection attempts
    assert_quiet(&mut joiner_events).await;
    assert!(joiner.sessions().await.unwrap().is_empty());
    assert!(host.sessions().await.unwrap().is_empty());

    // And a plain rejoin is refused until the user asks for it
    let err = joiner.join("host", false).await.unwrap_err();
    assert!(matches!(err, Error::SignalingError(_)));
}

#[tokio::test]
async fn test_manual_rejoin_overrides_block() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    joiner.join("host", false).await.unwrap();
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;

    host.disconnect("joiner").await.unwrap();
    wait_for_state(&mut joiner_events, "host", TransportState::Closed).await;

    // Manual join clears the block on both ends
    joiner.join("host", true).await.unwrap();
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
}

#[tokio::test]
async fn test_link_loss_triggers_reconnect() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (_host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    joiner.join("host", false).await.unwrap();
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;

    // Sever the channel without any disconnect intent
    network.drop_link("host", "joiner").await;
    wait_for_state(&mut joiner_events, "host", TransportState::Closed).await;

    // The joiner redials on its own; the host just answers
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
    assert_eq!(
        joiner.sessions().await.unwrap(),
        vec![("host".to_string(), TransportState::Open)]
    );
}

#[tokio::test]
async fn test_reconnect_exhaustion_fires_once() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    // Nobody is listening at this address
    joiner.join("ghost", false).await.unwrap();

    let exhausted = wait_for(&mut joiner_events, |e| {
        matches!(e, SessionEvent::ReconnectExhausted { .. })
    })
    .await;
    assert_eq!(
        exhausted,
        SessionEvent::ReconnectExhausted {
            peer: "ghost".to_string()
        }
    );

    // Exactly once, and the session is gone
    assert_quiet(&mut joiner_events).await;
    assert!(joiner.sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_degraded_transport_can_recover() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (_host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    joiner.join("host", false).await.unwrap();
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;

    network.degrade("host", "joiner").await;
    wait_for_state(&mut joiner_events, "host", TransportState::Degraded).await;

    network.restore("host", "joiner").await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;

    // Recovery must not have burned a session
    assert_eq!(
        joiner.sessions().await.unwrap(),
        vec![("host".to_string(), TransportState::Open)]
    );
}

#[tokio::test]
async fn test_session_capacity_rejects_extra_peers() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let host_config = PeerLinkConfig {
        max_peers: 1,
        ..test_config()
    };
    let (host, mut host_events) = engine(&relay, &network, "host", host_config).await;
    let (a, mut a_events) = engine(&relay, &network, "a", test_config()).await;
    let (b, _b_events) = engine(&relay, &network, "b", test_config()).await;

    a.join("host", false).await.unwrap();
    wait_for_state(&mut a_events, "host", TransportState::Open).await;
    wait_for_state(&mut host_events, "a", TransportState::Open).await;

    b.join("host", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_explicit_address_collision_surfaces() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (host, _events) = engine(&relay, &network, "host", test_config()).await;
    let (other, _other_events) = engine(&relay, &network, "other", test_config()).await;

    // The helper already claimed "host" for the first engine
    let err = other.host(Some("host".to_string())).await.unwrap_err();
    assert!(matches!(err, Error::AddressTaken(_)));
    drop(host);
}

#[tokio::test]
async fn test_hosting_side_sends_the_offer() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (_host, _host_events) = engine(&relay, &network, "host", test_config()).await;

    // A bare rendezvous client dials in; the hosting engine must open the
    // exchange with its offer
    let (visitor, mut visitor_rx) = RendezvousClient::start(relay.connect().await);
    visitor.listen(Some("visitor".to_string())).await.unwrap();
    visitor.connect_to("host", false).await.unwrap();

    assert_eq!(
        timeout(Duration::from_secs(2), visitor_rx.recv())
            .await
            .unwrap(),
        Some(RelayEvent::Connected("host".to_string()))
    );
    match timeout(Duration::from_secs(2), visitor_rx.recv())
        .await
        .unwrap()
    {
        Some(RelayEvent::Message(NegotiationMessage::Offer { .. }, from)) => {
            assert_eq!(from, "host");
        }
        other => panic!("expected the offer from the host, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    joiner.join("host", false).await.unwrap();
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;

    host.disconnect("joiner").await.unwrap();
    wait_for_state(&mut host_events, "joiner", TransportState::Closed).await;

    // The session is already gone; disconnecting again is a no-op
    host.disconnect("joiner").await.unwrap();

    // So is disconnecting a peer that never had a session
    host.disconnect("stranger").await.unwrap();
}

#[tokio::test]
async fn test_send_without_open_channel_is_dropped() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (host, mut host_events) = engine(&relay, &network, "host", test_config()).await;

    // Payloads are datagrams: no channel just means nothing is delivered
    host.send_to("nobody", b"hello".to_vec()).await.unwrap();
    host.broadcast(b"hello".to_vec()).await.unwrap();
    assert_quiet(&mut host_events).await;
}

#[tokio::test]
async fn test_fault_in_one_session_leaves_others_open() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (a, mut a_events) = engine(&relay, &network, "a", test_config()).await;
    let (b, mut b_events) = engine(&relay, &network, "b", test_config()).await;
    let (c, mut c_events) = engine(&relay, &network, "c", test_config()).await;

    a.join("host", false).await.unwrap();
    wait_for_state(&mut a_events, "host", TransportState::Open).await;
    wait_for_state(&mut host_events, "a", TransportState::Open).await;
    b.join("host", false).await.unwrap();
    wait_for_state(&mut b_events, "host", TransportState::Open).await;
    wait_for_state(&mut host_events, "b", TransportState::Open).await;
    c.join("host", false).await.unwrap();
    wait_for_state(&mut c_events, "host", TransportState::Open).await;
    wait_for_state(&mut host_events, "c", TransportState::Open).await;

    // Drain the handshake's identity announcements so the quiet checks
    // below observe only fault leakage
    for events in [&mut a_events, &mut b_events, &mut c_events] {
        wait_for(events, |e| matches!(e, SessionEvent::PeerIdentified { .. })).await;
    }

    // One transport dies; the other two sessions must not move
    network.drop_link("host", "b").await;
    wait_for_state(&mut b_events, "host", TransportState::Closed).await;

    let sessions = host.sessions().await.unwrap();
    for peer in ["a", "c"] {
        assert_eq!(
            sessions.iter().find(|(p, _)| p == peer),
            Some(&(peer.to_string(), TransportState::Open)),
            "session with {} disturbed",
            peer
        );
    }
    assert_quiet(&mut a_events).await;
    assert_quiet(&mut c_events).await;
}

#[tokio::test]
async fn test_refused_retry_reports_exhaustion() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (_host, mut host_events) = engine(&relay, &network, "host", test_config()).await;

    // Wired by hand to keep a handle on the rendezvous client
    let (rendezvous, relay_events) = RendezvousClient::start(relay.connect().await);
    let (negotiator, transport_events) = network
        .attach("joiner", Identity::new("id-joiner", "joiner"))
        .await;
    let (joiner, mut joiner_events) = SessionOrchestrator::start(
        test_config(),
        Arc::clone(&rendezvous),
        relay_events,
        Arc::new(negotiator),
        transport_events,
    );
    joiner.host(Some("joiner".to_string())).await.unwrap();

    joiner.join("host", false).await.unwrap();
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;

    // Block at the rendezvous layer, then sever the channel: the scheduled
    // redial is refused and the retry chain ends with one terminal event
    rendezvous.block("host").await;
    network.drop_link("host", "joiner").await;
    wait_for_state(&mut joiner_events, "host", TransportState::Closed).await;

    let exhausted = wait_for(&mut joiner_events, |e| {
        matches!(e, SessionEvent::ReconnectExhausted { .. })
    })
    .await;
    assert_eq!(
        exhausted,
        SessionEvent::ReconnectExhausted {
            peer: "host".to_string()
        }
    );
    assert_quiet(&mut joiner_events).await;
    assert!(joiner.sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_tears_everything_down() {
    let relay = MemoryRelay::new();
    let network = MockNetwork::new();
    let (host, mut host_events) = engine(&relay, &network, "host", test_config()).await;
    let (joiner, mut joiner_events) = engine(&relay, &network, "joiner", test_config()).await;

    joiner.join("host", false).await.unwrap();
    wait_for_state(&mut host_events, "joiner", TransportState::Open).await;
    wait_for_state(&mut joiner_events, "host", TransportState::Open).await;

    joiner.shutdown().await;
    wait_for_state(&mut host_events, "joiner", TransportState::Closed).await;
    assert!(joiner.sessions().await.is_err());
}
