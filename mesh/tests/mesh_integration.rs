// Copyright (c) 2026 The Omerta Project

//! End-to-end scenarios over loopback UDP: real sockets, real envelopes,
//! several nodes per test.

use assert_matches::assert_matches;
use om_common::{Capabilities, Endpoint, MachineId, NatType, NodeIdentity, ValidationMode};
use om_envelope::{ChannelHash, Envelope, EnvelopeCodec, NetworkKey};
use om_mesh::{
    dispatcher::SendStrategy, events::MeshEvent, node::NodeHandle, MeshConfig, MeshError, MeshNode,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn test_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.transport.bind_host = "127.0.0.1".to_string();
    config.transport.validation_mode = ValidationMode::AllowAll;
    config.keepalive.interval_secs = 1;
    config.keepalive.response_timeout_secs = 1;
    config.gossip.interval_secs = 1;
    config.gossip.announcement_ttl_secs = 600;
    config.hole_punch.attempt_window_ms = 2_000;
    config.stun.servers = Vec::new();
    config
}

async fn start_node(
    network_key: [u8; 32],
    capabilities: Capabilities,
    config: MeshConfig,
) -> (NodeHandle, mpsc::Receiver<MeshEvent>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let identity = NodeIdentity::from_random(&mut rand::thread_rng());
    let machine_id = MachineId::from_random(&mut rand::thread_rng());
    MeshNode::new(
        identity,
        machine_id,
        NetworkKey::from_bytes(network_key),
        config,
    )
    .with_capabilities(capabilities)
    .start()
    .await
    .expect("node starts")
}

/// Wait until `predicate` holds or the deadline passes.
async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = timeout(deadline, async {
        loop {
            if predicate().await {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_pong_between_two_nodes() {
    let key = [0x42; 32];
    let (a, _a_events) = start_node(key, Capabilities::GOSSIP, test_config()).await;
    let (b, _b_events) = start_node(key, Capabilities::GOSSIP, test_config()).await;

    let replied = b
        .send_ping(
            a.peer_id().clone(),
            a.machine_id().clone(),
            a.local_endpoint().clone(),
        )
        .await
        .unwrap();
    assert!(replied, "pong should arrive on loopback");

    // A observed B's source address while handling the ping.
    let seen = a
        .get_endpoint(b.peer_id().clone(), Some(b.machine_id().clone()))
        .await
        .unwrap();
    assert_eq!(seen, Some(b.local_endpoint().clone()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_delivery_and_replay_suppression() {
    let key = [0x43; 32];
    let (b, _b_events) = start_node(key, Capabilities::GOSSIP, test_config()).await;

    let (handler_tx, mut handler_rx) = mpsc::channel(16);
    b.register_channel("chat", handler_tx).await.unwrap();

    // Craft one envelope by hand and deliver the identical bytes twice.
    let codec = EnvelopeCodec::new(&NetworkKey::from_bytes(key));
    let sender = NodeIdentity::from_random(&mut rand::thread_rng());
    let envelope = Envelope::new_signed(
        &sender,
        "machine-x".parse().unwrap(),
        Some(b.peer_id().clone()),
        ChannelHash::of("chat"),
        b"hello mesh".to_vec(),
    );
    let packet = codec.encode(&envelope).unwrap();

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = b.local_endpoint().socket_addr();
    socket.send_to(&packet, target).await.unwrap();
    socket.send_to(&packet, target).await.unwrap();

    let message = timeout(Duration::from_secs(2), handler_rx.recv())
        .await
        .expect("first delivery")
        .unwrap();
    assert_eq!(message.payload, b"hello mesh");
    assert_eq!(message.from_peer_id, sender.peer_id());

    // The replay is dropped before routing.
    sleep(Duration::from_millis(300)).await;
    assert!(handler_rx.try_recv().is_err(), "replay must not be delivered");
    let counters = b.counters().await.unwrap();
    assert_eq!(counters.duplicate_envelopes, 1);
    assert_eq!(counters.delivered, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cross_network_envelopes_are_dropped() {
    let (a, _a_events) = start_node([0x11; 32], Capabilities::GOSSIP, test_config()).await;
    let (b, _b_events) = start_node([0x22; 32], Capabilities::GOSSIP, test_config()).await;

    let (handler_tx, mut handler_rx) = mpsc::channel(16);
    b.register_channel("chat", handler_tx).await.unwrap();

    a.send(
        b.peer_id().clone(),
        ChannelHash::of("chat"),
        b"should never arrive".to_vec(),
        SendStrategy::Direct(b.local_endpoint().clone()),
    )
    .await
    .unwrap();

    sleep(Duration::from_millis(400)).await;
    assert!(handler_rx.try_recv().is_err());
    let counters = b.counters().await.unwrap();
    assert_eq!(counters.delivered, 0);
    assert!(
        counters.header_tag_mismatch + counters.network_mismatch >= 1,
        "foreign-network packet must be counted as a crypto drop"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gossip_disseminates_third_party_announcements() {
    let key = [0x44; 32];
    let (a, _a_events) = start_node(key, Capabilities::GOSSIP, test_config()).await;
    let (b, _b_events) = start_node(key, Capabilities::GOSSIP, test_config()).await;
    let (c, _c_events) = start_node(key, Capabilities::GOSSIP, test_config()).await;

    // A knows B; B knows A and C. A should learn C through B's gossip.
    a.add_peer(b.announcement().await.unwrap()).await.unwrap();
    b.add_peer(a.announcement().await.unwrap()).await.unwrap();
    b.add_peer(c.announcement().await.unwrap()).await.unwrap();

    let c_peer = c.peer_id().clone();
    wait_for("A to learn C via gossip", Duration::from_secs(10), || {
        let a = a.clone();
        let c_peer = c_peer.clone();
        async move {
            a.get_endpoint(c_peer, None)
                .await
                .map(|endpoint| endpoint.is_some())
                .unwrap_or(false)
        }
    })
    .await;

    let stats = a.cache_stats().await.unwrap();
    assert!(stats.total_peers >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keepalive_failure_fires_exactly_once() {
    let key = [0x45; 32];
    let mut config = test_config();
    config.keepalive.missed_threshold = 2;
    let (a, mut a_events) = start_node(key, Capabilities::GOSSIP, config.clone()).await;
    let (b, _b_events) = start_node(key, Capabilities::GOSSIP, config).await;

    // One ping makes A track B's machine at its live endpoint.
    let replied = b
        .send_ping(
            a.peer_id().clone(),
            a.machine_id().clone(),
            a.local_endpoint().clone(),
        )
        .await
        .unwrap();
    assert!(replied);

    let b_peer = b.peer_id().clone();
    let b_machine = b.machine_id().clone();
    b.shutdown().await.unwrap();

    // A's keepalive now pings a dead socket until the threshold trips.
    let mut failures = 0u32;
    let collect = timeout(Duration::from_secs(15), async {
        while let Some(event) = a_events.recv().await {
            if let MeshEvent::KeepaliveFailed {
                peer_id,
                machine_id,
                ..
            } = event
            {
                assert_eq!(peer_id, b_peer);
                assert_eq!(machine_id, b_machine);
                failures += 1;
                break;
            }
        }
    })
    .await;
    assert!(collect.is_ok(), "keepalive failure never reported");
    assert_eq!(failures, 1);

    // No second report for the same machine, and no path left to B.
    sleep(Duration::from_secs(3)).await;
    while let Ok(event) = a_events.try_recv() {
        assert!(
            !matches!(event, MeshEvent::KeepaliveFailed { .. }),
            "failure handler invoked more than once"
        );
    }
    let result = a
        .send(
            b_peer,
            ChannelHash::of("chat"),
            b"anyone there".to_vec(),
            SendStrategy::Auto,
        )
        .await;
    assert_matches!(result, Err(MeshError::Unreachable(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_symmetric_pair_refused_then_relayed() {
    let key = [0x46; 32];
    let mut nat_bound = test_config();
    nat_bound.nat_override = Some(NatType::Symmetric);
    let mut open = test_config();
    open.nat_override = Some(NatType::Public);

    let (a, _a_events) = start_node(key, Capabilities::GOSSIP, nat_bound.clone()).await;
    let (b, _b_events) = start_node(key, Capabilities::GOSSIP, nat_bound).await;
    let (c, _c_events) = start_node(
        key,
        Capabilities::GOSSIP | Capabilities::RELAY | Capabilities::COORDINATOR,
        open,
    )
    .await;

    // Everyone knows the coordinator; the coordinator knows both ends.
    a.add_peer(c.announcement().await.unwrap()).await.unwrap();
    b.add_peer(c.announcement().await.unwrap()).await.unwrap();
    c.add_peer(a.announcement().await.unwrap()).await.unwrap();
    c.add_peer(b.announcement().await.unwrap()).await.unwrap();

    assert_eq!(
        a.get_coordinator_peer_id().await.unwrap(),
        Some(c.peer_id().clone())
    );

    // Symmetric x symmetric: the coordinator refuses the punch.
    let punch = a.start_hole_punch(b.peer_id().clone()).await;
    assert!(
        matches!(punch, Err(MeshError::HolePunchImpossible(_))),
        "expected impossible verdict, got {punch:?}"
    );

    // Fall through to a relay session via C.
    let (handler_tx, mut handler_rx) = mpsc::channel(16);
    b.register_channel("files", handler_tx).await.unwrap();

    let session = a
        .open_relay(c.peer_id().clone(), b.peer_id().clone())
        .await
        .unwrap();
    assert_eq!(&session.remote_peer, b.peer_id());

    // Give the far end a moment to install its half of the session.
    sleep(Duration::from_millis(300)).await;

    a.send(
        b.peer_id().clone(),
        ChannelHash::of("files"),
        b"relayed payload".to_vec(),
        SendStrategy::Relay(c.peer_id().clone()),
    )
    .await
    .unwrap();

    let message = timeout(Duration::from_secs(3), handler_rx.recv())
        .await
        .expect("relayed delivery")
        .unwrap();
    assert_eq!(message.payload, b"relayed payload");
    assert_eq!(&message.from_peer_id, a.peer_id());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_forward_delivers_one_shot_payload() {
    let key = [0x48; 32];
    let (b, _b_events) = start_node(key, Capabilities::GOSSIP, test_config()).await;
    let (c, _c_events) = start_node(key, Capabilities::GOSSIP | Capabilities::RELAY, test_config())
        .await;

    c.add_peer(b.announcement().await.unwrap()).await.unwrap();

    let (handler_tx, mut handler_rx) = mpsc::channel(16);
    b.register_channel("oneshot", handler_tx).await.unwrap();

    // A third party with no path to B asks C to forward a sealed envelope.
    let codec = EnvelopeCodec::new(&NetworkKey::from_bytes(key));
    let sender = NodeIdentity::from_random(&mut rand::thread_rng());
    let inner = Envelope::new_signed(
        &sender,
        "machine-x".parse().unwrap(),
        Some(b.peer_id().clone()),
        ChannelHash::of("oneshot"),
        b"forwarded once".to_vec(),
    );
    let inner_bytes = codec.encode(&inner).unwrap();

    let forward = om_mesh::messages::ProtocolMessage::RelayForward {
        forward_id: uuid::Uuid::new_v4(),
        target: b.peer_id().clone(),
        payload: inner_bytes,
    };
    let outer = Envelope::new_signed(
        &sender,
        "machine-x".parse().unwrap(),
        Some(c.peer_id().clone()),
        ChannelHash::MESH,
        forward.to_payload(),
    );
    let packet = codec.encode(&outer).unwrap();
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&packet, c.local_endpoint().socket_addr())
        .await
        .unwrap();

    let message = timeout(Duration::from_secs(3), handler_rx.recv())
        .await
        .expect("forwarded delivery")
        .unwrap();
    assert_eq!(message.payload, b"forwarded once");
    assert_eq!(message.from_peer_id, sender.peer_id());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hole_punch_between_cone_nats() {
    let key = [0x47; 32];
    let mut cone = test_config();
    cone.nat_override = Some(NatType::PortRestrictedCone);
    let mut open = test_config();
    open.nat_override = Some(NatType::Public);

    let (a, _a_events) = start_node(key, Capabilities::GOSSIP, cone.clone()).await;
    let (b, _b_events) = start_node(key, Capabilities::GOSSIP, cone).await;
    let (c, _c_events) = start_node(
        key,
        Capabilities::GOSSIP | Capabilities::COORDINATOR,
        open,
    )
    .await;

    a.add_peer(c.announcement().await.unwrap()).await.unwrap();
    b.add_peer(c.announcement().await.unwrap()).await.unwrap();
    c.add_peer(a.announcement().await.unwrap()).await.unwrap();
    c.add_peer(b.announcement().await.unwrap()).await.unwrap();

    let endpoint = a
        .start_hole_punch(b.peer_id().clone())
        .await
        .expect("punch should open a loopback path");
    assert_eq!(endpoint.port(), b.local_endpoint().port());

    // The opened endpoint is now the best path to B.
    let best = a.get_endpoint(b.peer_id().clone(), None).await.unwrap();
    assert!(best.is_some());
}
