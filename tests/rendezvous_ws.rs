//! Rendezvous round-trips over a real WebSocket relay

use std::time::Duration;

use tokio::time::timeout;

use peerlink::signaling::{
    ClientFrame, Description, NegotiationMessage, RelayEvent, RelayLink, RelayServer,
    RelayServerHandle, RendezvousClient, ServerFrame, WsLink,
};

async fn relay() -> (RelayServerHandle, String) {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let url = server.url();
    (server.start(), url)
}

#[tokio::test]
async fn test_listen_over_websocket() {
    let (handle, url) = relay().await;

    let link = WsLink::connect(&url).await.unwrap();
    link.send(ClientFrame::Listen {
        address: "123456".to_string(),
    })
    .await
    .unwrap();

    let frame = timeout(Duration::from_secs(2), link.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        frame,
        ServerFrame::ListenOk {
            address: "123456".to_string()
        }
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn test_negotiation_round_trip_through_relay() {
    let (handle, url) = relay().await;

    let (host, mut host_events) =
        RendezvousClient::start(WsLink::connect(&url).await.unwrap());
    let (joiner, mut joiner_events) =
        RendezvousClient::start(WsLink::connect(&url).await.unwrap());

    host.listen(Some("host".to_string())).await.unwrap();
    joiner.listen(Some("joiner".to_string())).await.unwrap();

    joiner.connect_to("host", false).await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(2), host_events.recv())
            .await
            .unwrap(),
        Some(RelayEvent::Connected("joiner".to_string()))
    );
    assert_eq!(
        timeout(Duration::from_secs(2), joiner_events.recv())
            .await
            .unwrap(),
        Some(RelayEvent::Connected("host".to_string()))
    );

    let offer = NegotiationMessage::Offer {
        body: Description::new("offer-blob"),
    };
    joiner.send(&offer, "host").await;
    assert_eq!(
        timeout(Duration::from_secs(2), host_events.recv())
            .await
            .unwrap(),
        Some(RelayEvent::Message(offer, "joiner".to_string()))
    );

    let answer = NegotiationMessage::Answer {
        body: Description::new("answer-blob"),
    };
    host.send(&answer, "joiner").await;
    assert_eq!(
        timeout(Duration::from_secs(2), joiner_events.recv())
            .await
            .unwrap(),
        Some(RelayEvent::Message(answer, "host".to_string()))
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn test_peer_departure_closes_link() {
    let (handle, url) = relay().await;

    let (host, mut host_events) =
        RendezvousClient::start(WsLink::connect(&url).await.unwrap());
    let (joiner, mut joiner_events) =
        RendezvousClient::start(WsLink::connect(&url).await.unwrap());

    host.listen(Some("host".to_string())).await.unwrap();
    joiner.listen(Some("joiner".to_string())).await.unwrap();
    joiner.connect_to("host", false).await.unwrap();
    let _ = host_events.recv().await;
    let _ = joiner_events.recv().await;

    joiner.shutdown().await;
    assert_eq!(
        timeout(Duration::from_secs(2), host_events.recv())
            .await
            .unwrap(),
        Some(RelayEvent::Closed("joiner".to_string()))
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn test_address_collision_over_websocket() {
    let (handle, url) = relay().await;

    let (a, _a_events) = RendezvousClient::start(WsLink::connect(&url).await.unwrap());
    let (b, _b_events) = RendezvousClient::start(WsLink::connect(&url).await.unwrap());

    a.listen(Some("999000".to_string())).await.unwrap();
    let err = b.listen(Some("999000".to_string())).await.unwrap_err();
    assert!(matches!(err, peerlink::Error::AddressTaken(_)));

    // A different address still works on the same link
    let address = b.listen(None).await.unwrap();
    assert_eq!(address.len(), 6);

    handle.shutdown().await;
}
