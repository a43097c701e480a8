// Copyright (c) 2026 The Omerta Project

//! The single receive path and the mutable heart of a node.
//!
//! One dispatcher per node, driven by one task: every inbound datagram,
//! command, and timer tick funnels through `&mut self` methods here, so the
//! peer tables have exactly one logical writer. Datagram-plane failures are
//! counted and dropped, never propagated; request-shaped operations resolve
//! their callers through oneshot waiters.

use crate::{
    config::MeshConfig,
    endpoint_manager::EndpointManager,
    error::{MeshError, MeshResult},
    events::MeshEvent,
    gossip::GossipEngine,
    holepunch::{strategy_for, HolePunchCoordinator, PendingRendezvous, PunchState, PunchStrategy},
    keepalive::KeepaliveScheduler,
    messages::{GossipSummary, PeerAnnouncement, ProtocolMessage},
    peer_cache::{InsertOutcome, PeerCache},
    relay::{self, ClientSession, PendingOpen, RelayClient, RelayServer},
    seen::SeenMessages,
    transport::Transport,
};
use om_common::{
    time, Capabilities, Endpoint, MachineId, NatType, NodeIdentity, PeerId, ReachabilityPath,
};
use om_envelope::{ChannelHash, ChannelRegistry, Envelope, EnvelopeCodec, EnvelopeError, NetworkKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// A payload delivered to an application channel handler.
#[derive(Clone, Debug)]
pub struct ChannelMessage {
    pub from_peer_id: PeerId,
    pub machine_id: MachineId,
    pub payload: Vec<u8>,
}

/// Drop and routing counters, one per rejection cause. Single writer, so
/// plain integers; `snapshot` hands out a copy.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DispatcherCounters {
    pub invalid_magic: u64,
    pub unsupported_version: u64,
    pub truncated_packet: u64,
    pub header_tag_mismatch: u64,
    pub network_mismatch: u64,
    pub payload_tag_mismatch: u64,
    pub malformed_header: u64,
    pub peer_id_not_derived: u64,
    pub signature_invalid: u64,
    pub duplicate_envelopes: u64,
    pub duplicate_announcements: u64,
    pub expired_announcements: u64,
    pub unknown_channel: u64,
    pub hop_limit_exceeded: u64,
    pub relay_unknown_token: u64,
    pub malformed_relay_frame: u64,
    pub malformed_payload: u64,
    pub forwarded: u64,
    pub delivered: u64,
}

impl DispatcherCounters {
    fn count_decode_error(&mut self, error: &EnvelopeError) {
        match error {
            EnvelopeError::InvalidMagic => self.invalid_magic += 1,
            EnvelopeError::UnsupportedVersion(_) => self.unsupported_version += 1,
            EnvelopeError::TruncatedPacket => self.truncated_packet += 1,
            EnvelopeError::HeaderTagMismatch => self.header_tag_mismatch += 1,
            EnvelopeError::NetworkMismatch => self.network_mismatch += 1,
            EnvelopeError::PayloadTagMismatch => self.payload_tag_mismatch += 1,
            EnvelopeError::MalformedHeader | EnvelopeError::FieldTooLong(_) => {
                self.malformed_header += 1
            }
        }
    }
}

/// Deadlines the dispatcher schedules against itself.
#[derive(Clone, Copy, Debug)]
pub enum Deadline {
    Ping(Uuid),
}

enum PingPurpose {
    Keepalive,
    Caller(oneshot::Sender<bool>),
}

struct PendingPing {
    peer_id: PeerId,
    machine_id: MachineId,
    endpoint: Endpoint,
    purpose: PingPurpose,
}

/// All mutable node state plus the I/O handles needed to act on it.
pub struct Dispatcher {
    identity: NodeIdentity,
    machine_id: MachineId,
    capabilities: Capabilities,
    config: MeshConfig,

    codec: EnvelopeCodec,
    transport: Transport,

    endpoints: EndpointManager,
    cache: PeerCache,
    seen: SeenMessages,
    keepalive: KeepaliveScheduler,
    gossip: GossipEngine,
    punch: HolePunchCoordinator,
    relay_server: RelayServer,
    relay_client: RelayClient,

    channels: HashMap<ChannelHash, mpsc::Sender<ChannelMessage>>,
    registry: ChannelRegistry,

    pending_pings: HashMap<Uuid, PendingPing>,
    deadline_tx: mpsc::Sender<Deadline>,
    event_tx: mpsc::Sender<MeshEvent>,

    /// Our own verdict, from the STUN classifier.
    nat_type: NatType,
    /// Our mapping as seen from outside (STUN first, pong echoes otherwise).
    observed_endpoint: Option<Endpoint>,
    /// Last classified NAT per peer, learned from hole-punch traffic.
    peer_nat: HashMap<PeerId, NatType>,
    /// Advertised relay capacity per peer.
    relay_slots: HashMap<PeerId, u32>,

    local_announcement: PeerAnnouncement,
    pub counters: DispatcherCounters,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: NodeIdentity,
        machine_id: MachineId,
        network_key: &NetworkKey,
        capabilities: Capabilities,
        config: MeshConfig,
        transport: Transport,
        deadline_tx: mpsc::Sender<Deadline>,
        event_tx: mpsc::Sender<MeshEvent>,
    ) -> Self {
        let codec = EnvelopeCodec::new(network_key);
        let endpoints = EndpointManager::new(config.transport.validation_mode);
        let cache = PeerCache::new(config.cache.max_entries);
        let keepalive = KeepaliveScheduler::new(config.keepalive.clone());
        let gossip = GossipEngine::new(config.gossip.clone());
        let punch = HolePunchCoordinator::new(config.hole_punch.clone());
        let relay_server = RelayServer::new(config.relay.clone());

        let mut dispatcher = Self {
            identity,
            machine_id,
            capabilities,
            config,
            codec,
            transport,
            endpoints,
            cache,
            seen: SeenMessages::default(),
            keepalive,
            gossip,
            punch,
            relay_server,
            relay_client: RelayClient::new(),
            channels: HashMap::new(),
            registry: ChannelRegistry::new(),
            pending_pings: HashMap::new(),
            deadline_tx,
            event_tx,
            nat_type: NatType::Unknown,
            observed_endpoint: None,
            peer_nat: HashMap::new(),
            relay_slots: HashMap::new(),
            local_announcement: PeerAnnouncement::new(
                PeerId::default(),
                [0u8; 32],
                Vec::new(),
                Capabilities::default(),
                0,
                0,
            ),
            counters: DispatcherCounters::default(),
        };
        dispatcher.refresh_local_announcement();
        dispatcher
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn local_announcement(&self) -> &PeerAnnouncement {
        &self.local_announcement
    }

    fn emit(&self, event: MeshEvent) {
        // Events are advisory; a slow consumer loses them rather than
        // stalling the dispatch loop.
        let _ = self.event_tx.try_send(event);
    }

    // ------------------------------------------------------------------
    // Local announcement
    // ------------------------------------------------------------------

    /// Re-sign the local announcement from current reachability knowledge.
    pub fn refresh_local_announcement(&mut self) {
        let mut reachability = Vec::new();
        if let Some(observed) = &self.observed_endpoint {
            reachability.push(ReachabilityPath::Direct {
                endpoint: observed.clone(),
            });
        }
        let local = self.transport.local_addr();
        if !local.ip().is_unspecified() {
            let endpoint = Endpoint::from_socket_addr(local);
            if reachability.is_empty()
                || self.observed_endpoint.as_ref() != Some(&endpoint)
            {
                reachability.push(ReachabilityPath::Direct { endpoint });
            }
        }

        let mut announcement = PeerAnnouncement::new(
            self.identity.peer_id(),
            self.identity.public_key_bytes(),
            reachability,
            self.capabilities,
            time::now_secs(),
            self.config.gossip.announcement_ttl_secs,
        );
        announcement.sign(&self.identity);
        self.local_announcement = announcement;
    }

    fn local_announcement_is_stale(&self) -> bool {
        time::now_secs().saturating_sub(self.local_announcement.timestamp)
            >= self.config.gossip.interval_secs
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Entry point for every datagram the transport delivers.
    pub async fn handle_datagram(&mut self, bytes: Vec<u8>, source: SocketAddr) {
        // Relay frames are the only non-envelope traffic on the socket; they
        // never start with the protocol magic.
        if !bytes.starts_with(&om_envelope::codec::MAGIC) {
            self.handle_relay_frame(bytes, source).await;
            return;
        }
        self.handle_envelope_bytes(bytes, source, false).await;
    }

    async fn handle_envelope_bytes(&mut self, bytes: Vec<u8>, source: SocketAddr, via_relay: bool) {
        let envelope = match self.codec.decode(&bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                trace!(%source, %error, "dropping undecodable datagram");
                self.counters.count_decode_error(&error);
                return;
            }
        };

        if !envelope.peer_id_is_derived() {
            self.counters.peer_id_not_derived += 1;
            return;
        }
        if !envelope.signature_is_valid() {
            self.counters.signature_invalid += 1;
            return;
        }
        if envelope.from_peer_id == self.peer_id() {
            // Our own broadcast reflected back.
            return;
        }
        if !self
            .seen
            .insert(&envelope.from_peer_id, envelope.message_id)
        {
            self.counters.duplicate_envelopes += 1;
            return;
        }

        // Bookkeeping: the source address is the freshest endpoint for this
        // machine, unless the bytes came out of a relay unwrap, in which case
        // the source is the relay and proves nothing about the sender.
        if !via_relay {
            let endpoint = Endpoint::from_socket_addr(source);
            self.endpoints.record_received(
                &envelope.from_peer_id,
                &envelope.machine_id,
                endpoint.clone(),
            );
            self.keepalive.track(
                &envelope.from_peer_id,
                &envelope.machine_id,
                time::now_millis(),
            );
            self.keepalive.record_success(
                &envelope.from_peer_id,
                &envelope.machine_id,
                Some(endpoint),
                time::now_millis(),
            );
        } else {
            self.keepalive.track(
                &envelope.from_peer_id,
                &envelope.machine_id,
                time::now_millis(),
            );
            self.keepalive.record_success(
                &envelope.from_peer_id,
                &envelope.machine_id,
                None,
                time::now_millis(),
            );
        }

        // A directed envelope for someone else is forwarded, not delivered.
        if let Some(to) = &envelope.to_peer_id {
            if to != &self.peer_id() {
                self.forward_envelope(envelope).await;
                return;
            }
        }

        if envelope.channel.is_mesh() {
            let message = match ProtocolMessage::from_payload(&envelope.payload) {
                Ok(message) => message,
                Err(error) => {
                    debug!(%error, "malformed mesh payload");
                    self.counters.malformed_payload += 1;
                    return;
                }
            };
            self.handle_mesh_message(&envelope, message, source).await;
        } else {
            match self.channels.get(&envelope.channel) {
                Some(handler) => {
                    self.counters.delivered += 1;
                    let _ = handler.try_send(ChannelMessage {
                        from_peer_id: envelope.from_peer_id.clone(),
                        machine_id: envelope.machine_id.clone(),
                        payload: envelope.payload.clone(),
                    });
                }
                None => {
                    trace!(channel = %self.registry.describe(envelope.channel), "no handler");
                    self.counters.unknown_channel += 1;
                }
            }
        }
    }

    async fn forward_envelope(&mut self, mut envelope: Envelope) {
        if envelope.hop_count >= self.config.gossip.max_hops {
            self.counters.hop_limit_exceeded += 1;
            return;
        }
        envelope.hop_count += 1;
        let Some(to) = envelope.to_peer_id.clone() else {
            return;
        };
        // The signature excludes the hop count, so the envelope stays valid.
        match self.encode(&envelope) {
            Ok(bytes) => {
                if self.send_best_effort(&to, &bytes).await {
                    self.counters.forwarded += 1;
                } else {
                    debug!(%to, "no path to forward envelope");
                }
            }
            Err(error) => warn!(%error, "could not re-encode envelope for forwarding"),
        }
    }

    async fn handle_relay_frame(&mut self, bytes: Vec<u8>, source: SocketAddr) {
        let Some((token, payload)) = relay::parse_frame(&bytes) else {
            self.counters.malformed_relay_frame += 1;
            return;
        };

        // Relay role: forward between the session's two ends.
        let source_endpoint = Endpoint::from_socket_addr(source);
        if let Some(session) = self.relay_server.touch(token) {
            let destination = session.other_endpoint(&source_endpoint).clone();
            trace!(token, %destination, "forwarding relay frame");
            if let Err(error) = self.transport.send_to(&bytes, &destination).await {
                debug!(%error, "relay forward failed");
            }
            return;
        }

        // Client role: unwrap traffic belonging to one of our sessions. The
        // inner bytes are a full envelope; boxing breaks the async cycle
        // frame -> envelope -> relay-data -> frame.
        if self.relay_client.session_for_token(token).is_some() {
            let inner = payload.to_vec();
            Box::pin(self.handle_envelope_bytes(inner, source, true)).await;
            return;
        }

        self.counters.relay_unknown_token += 1;
    }

    // ------------------------------------------------------------------
    // Mesh protocol handlers
    // ------------------------------------------------------------------

    async fn handle_mesh_message(
        &mut self,
        envelope: &Envelope,
        message: ProtocolMessage,
        source: SocketAddr,
    ) {
        let sender = envelope.from_peer_id.clone();
        match message {
            ProtocolMessage::Ping => {
                let pong = ProtocolMessage::Pong {
                    in_reply_to: envelope.message_id,
                    your_endpoint: Endpoint::from_socket_addr(source),
                };
                self.send_message_to_addr(&sender, pong, source).await;
            }

            ProtocolMessage::Pong {
                in_reply_to,
                your_endpoint,
            } => {
                self.on_pong(in_reply_to, your_endpoint).await;
            }

            ProtocolMessage::FindPeer { peer_id } => {
                let reply = match self.cache.get(&peer_id).cloned() {
                    Some(announcement) => ProtocolMessage::PeerInfo { announcement },
                    None => ProtocolMessage::PeerList {
                        announcements: self.cache.sample(
                            self.config.gossip.max_announcements_per_message,
                            &sender,
                            time::now_secs(),
                            &mut rand::thread_rng(),
                        ),
                    },
                };
                self.send_message_to_addr(&sender, reply, source).await;
            }

            ProtocolMessage::PeerInfo { announcement } => {
                self.accept_announcement(announcement, envelope.hop_count, &sender, false)
                    .await;
            }

            ProtocolMessage::PeerList { announcements } => {
                for announcement in announcements {
                    self.accept_announcement(announcement, envelope.hop_count, &sender, false)
                        .await;
                }
            }

            ProtocolMessage::Announce { announcements } => {
                let limit = self.config.gossip.max_announcements_per_message;
                for announcement in announcements.into_iter().take(limit) {
                    self.accept_announcement(announcement, envelope.hop_count, &sender, true)
                        .await;
                }
            }

            ProtocolMessage::WhoHasRecent { since } => {
                let entries: Vec<GossipSummary> = self
                    .cache
                    .newer_than(since)
                    .into_iter()
                    .map(|ann| GossipSummary {
                        peer_id: ann.peer_id.clone(),
                        timestamp: ann.timestamp,
                    })
                    .collect();
                self.send_message_to_addr(&sender, ProtocolMessage::IHaveRecent { entries }, source)
                    .await;
            }

            ProtocolMessage::IHaveRecent { entries } => {
                for entry in entries {
                    let newer_than_cached = self
                        .cache
                        .peek(&entry.peer_id)
                        .map(|cached| entry.timestamp > cached.timestamp)
                        .unwrap_or(true);
                    if newer_than_cached && entry.peer_id != self.peer_id() {
                        self.send_message_to_addr(
                            &sender,
                            ProtocolMessage::FindPeer {
                                peer_id: entry.peer_id,
                            },
                            source,
                        )
                        .await;
                    }
                }
            }

            ProtocolMessage::HolePunchRequest {
                attempt_id,
                target,
                endpoint,
                nat_type,
            } => {
                self.peer_nat.insert(sender.clone(), nat_type);
                self.coordinate_punch(attempt_id, sender, endpoint, nat_type, target, source)
                    .await;
            }

            ProtocolMessage::HolePunchInvite {
                attempt_id,
                from_peer_id,
                their_endpoint,
                their_nat,
            } => {
                self.peer_nat.insert(from_peer_id.clone(), their_nat);
                self.on_punch_invite(attempt_id, from_peer_id, their_endpoint, sender, source)
                    .await;
            }

            ProtocolMessage::HolePunchAccept {
                attempt_id,
                endpoint,
                nat_type,
            } => {
                self.peer_nat.insert(sender.clone(), nat_type);
                self.on_punch_accept(attempt_id, sender, endpoint, nat_type)
                    .await;
            }

            ProtocolMessage::HolePunchExecute {
                attempt_id,
                target_endpoint,
                simultaneous_send,
            } => {
                // `simultaneous_send` is advisory: probes always go out as
                // soon as the execute arrives.
                let _ = simultaneous_send;
                self.fire_probes(attempt_id, target_endpoint).await;
            }

            ProtocolMessage::HolePunchResult {
                attempt_id,
                success,
            } => {
                if !success {
                    if let Some(attempt) = self
                        .punch
                        .fail(&attempt_id, MeshError::HolePunchImpossible(sender))
                    {
                        self.emit(MeshEvent::HolePunchFailed {
                            peer_id: attempt.remote_peer,
                        });
                    }
                }
            }

            ProtocolMessage::HolePunchProbe { attempt_id, ack } => {
                self.on_punch_probe(attempt_id, ack, &sender, source).await;
            }

            ProtocolMessage::RelayRequest { session_id, target } => {
                self.on_relay_request(session_id, sender, target, source)
                    .await;
            }

            ProtocolMessage::RelayAccept {
                session_id,
                token,
                peer,
            } => {
                self.on_relay_accept(session_id, token, peer, sender, source);
            }

            ProtocolMessage::RelayDeny { session_id, reason } => {
                if let Some(pending) = self.relay_client.take_pending(&session_id) {
                    let _ = pending.waiter.send(Err(MeshError::RelayDenied {
                        relay: sender,
                        reason,
                    }));
                }
            }

            ProtocolMessage::RelayEnd { session_id } => {
                if self.relay_server.close_by_id(&session_id).is_some()
                    || self.relay_client.close(&session_id).is_some()
                {
                    self.emit(MeshEvent::RelaySessionClosed { session_id });
                }
            }

            ProtocolMessage::RelayData { token, payload } => {
                // Same contract as a raw frame, delivered inside an envelope.
                let frame = relay::wrap_frame(token, &payload);
                self.handle_relay_frame(frame, source).await;
            }

            ProtocolMessage::RelayForward {
                forward_id,
                target,
                payload,
            } => {
                let success = self.send_best_effort(&target, &payload).await;
                self.send_message_to_addr(
                    &sender,
                    ProtocolMessage::RelayForwardResult {
                        forward_id,
                        success,
                    },
                    source,
                )
                .await;
            }

            ProtocolMessage::RelayForwardResult {
                forward_id,
                success,
            } => {
                trace!(%forward_id, success, "relay forward result");
            }

            ProtocolMessage::RelayAvailability {
                reachable_peers,
                available_slots,
            } => {
                trace!(%sender, available_slots, peers = reachable_peers.len(), "relay availability");
                self.relay_slots.insert(sender, available_slots);
            }
        }
    }

    async fn accept_announcement(
        &mut self,
        announcement: PeerAnnouncement,
        hop_count: u8,
        sender: &PeerId,
        rebroadcast: bool,
    ) {
        if announcement.peer_id == self.peer_id() {
            return;
        }
        if !announcement.verify() {
            self.counters.signature_invalid += 1;
            return;
        }
        let now = time::now_secs();
        if announcement.is_expired(now) {
            self.counters.expired_announcements += 1;
            return;
        }

        let peer_id = announcement.peer_id.clone();
        match self.cache.insert(announcement.clone(), now) {
            InsertOutcome::New => {
                self.emit(MeshEvent::PeerDiscovered(peer_id.clone()));
                self.emit(MeshEvent::AnnouncementReceived(announcement.clone()));
            }
            InsertOutcome::Refreshed => {
                self.emit(MeshEvent::AnnouncementReceived(announcement.clone()));
            }
            InsertOutcome::Rejected => {
                self.counters.duplicate_announcements += 1;
            }
        }

        if rebroadcast && self.gossip.should_rebroadcast(&announcement, hop_count) {
            let targets = self.gossip.rebroadcast_targets(
                &self.cache,
                &self.peer_id(),
                sender,
                &peer_id,
                now,
                &mut rand::thread_rng(),
            );
            let message = ProtocolMessage::Announce {
                announcements: vec![announcement],
            };
            for target in targets {
                self.send_message_with_hops(&target, message.clone(), hop_count + 1)
                    .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Ping / keepalive
    // ------------------------------------------------------------------

    async fn on_pong(&mut self, in_reply_to: Uuid, your_endpoint: Endpoint) {
        let Some(pending) = self.pending_pings.remove(&in_reply_to) else {
            return;
        };
        let now = time::now_millis();
        self.keepalive.track(&pending.peer_id, &pending.machine_id, now);
        self.keepalive.record_success(
            &pending.peer_id,
            &pending.machine_id,
            Some(pending.endpoint.clone()),
            now,
        );
        self.endpoints.record_send_success(
            &pending.peer_id,
            &pending.machine_id,
            pending.endpoint.clone(),
        );

        // The pong carries our mapping as the remote saw it; without STUN it
        // is the best public-endpoint estimate we have.
        if self.observed_endpoint.is_none()
            && your_endpoint.is_valid_under(self.config.transport.validation_mode)
        {
            self.observed_endpoint = Some(your_endpoint);
            self.refresh_local_announcement();
        }

        if let PingPurpose::Caller(waiter) = pending.purpose {
            let _ = waiter.send(true);
        }
    }

    /// A scheduled ping deadline fired; if the ping is still pending it
    /// failed.
    pub async fn on_deadline(&mut self, deadline: Deadline) {
        match deadline {
            Deadline::Ping(message_id) => {
                let Some(pending) = self.pending_pings.remove(&message_id) else {
                    return;
                };
                match pending.purpose {
                    PingPurpose::Caller(waiter) => {
                        let _ = waiter.send(false);
                    }
                    PingPurpose::Keepalive => {
                        self.on_keepalive_miss(
                            &pending.peer_id,
                            &pending.machine_id,
                            Some(pending.endpoint),
                        );
                    }
                }
            }
        }
    }

    fn on_keepalive_miss(
        &mut self,
        peer_id: &PeerId,
        machine_id: &MachineId,
        endpoint: Option<Endpoint>,
    ) {
        if let Some(removed) = self.keepalive.record_failure(peer_id, machine_id) {
            // Threshold hit: invalidate the path and tell the upper layers
            // exactly once. Recovery (new endpoint, punch, relay) is their
            // call.
            let failed_endpoint = endpoint.or(removed.last_known_endpoint);
            if let Some(failed) = &failed_endpoint {
                self.endpoints.remove_endpoint(peer_id, failed);
            }
            self.endpoints.remove_machine(peer_id, machine_id);
            self.seen.remove_peer(peer_id);
            info!(%peer_id, %machine_id, "machine removed after keepalive failures");
            self.emit(MeshEvent::KeepaliveFailed {
                peer_id: peer_id.clone(),
                machine_id: machine_id.clone(),
                endpoint: failed_endpoint,
            });
        }
    }

    /// Issue one ping; the outcome resolves through `on_pong` or the
    /// scheduled deadline.
    async fn issue_ping(
        &mut self,
        peer_id: PeerId,
        machine_id: MachineId,
        endpoint: Endpoint,
        purpose: PingPurpose,
    ) {
        let envelope = Envelope::new_signed(
            &self.identity,
            self.machine_id.clone(),
            Some(peer_id.clone()),
            ChannelHash::MESH,
            ProtocolMessage::Ping.to_payload(),
        );
        let message_id = envelope.message_id;
        match self.encode(&envelope) {
            Ok(bytes) => {
                if let Err(error) = self.transport.send_to(&bytes, &endpoint).await {
                    debug!(%error, "ping send failed");
                }
            }
            Err(error) => {
                warn!(%error, "ping encode failed");
            }
        }
        self.pending_pings.insert(
            message_id,
            PendingPing {
                peer_id,
                machine_id,
                endpoint,
                purpose,
            },
        );
        let deadline_tx = self.deadline_tx.clone();
        let timeout = self.config.keepalive.response_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = deadline_tx.send(Deadline::Ping(message_id)).await;
        });
    }

    /// One keepalive cycle: weighted sample, ping each selected machine.
    pub async fn on_keepalive_tick(&mut self) {
        let now = time::now_millis();
        let selected = self
            .keepalive
            .select_for_cycle(now, &mut rand::thread_rng());
        trace!(selected = selected.len(), "keepalive cycle");
        for (peer_id, machine_id) in selected {
            match self.endpoints.get_best(&peer_id, &machine_id).cloned() {
                Some(endpoint) => {
                    self.issue_ping(peer_id, machine_id, endpoint, PingPurpose::Keepalive)
                        .await;
                }
                None => {
                    // Nothing to ping is as bad as a missed pong.
                    self.on_keepalive_miss(&peer_id, &machine_id, None);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Gossip
    // ------------------------------------------------------------------

    pub async fn on_gossip_tick(&mut self) {
        if self.local_announcement_is_stale() {
            self.refresh_local_announcement();
        }
        let own = self.local_announcement.clone();
        let now = time::now_secs();
        let plan = self
            .gossip
            .plan_round(&own, &self.cache, now, &mut rand::thread_rng());
        if let Some(plan) = plan {
            let message = ProtocolMessage::Announce {
                announcements: plan.announcements,
            };
            for target in plan.targets {
                self.send_message(&target, message.clone()).await;
            }
        }

        // Pull side of anti-entropy: ask one random peer what it has heard
        // since our freshest announcement.
        let newest = self.cache.stats().newest_announcement;
        let pull_target = self
            .cache
            .sample(1, &self.peer_id(), now, &mut rand::thread_rng())
            .into_iter()
            .map(|ann| ann.peer_id)
            .next();
        if let Some(target) = pull_target {
            self.send_message(&target, ProtocolMessage::WhoHasRecent { since: newest })
                .await;
        }

        // Relay-capable nodes advertise remaining capacity alongside gossip.
        if self.capabilities.contains(Capabilities::RELAY) {
            let reachable: Vec<PeerId> = self
                .cache
                .sample(
                    self.config.gossip.max_announcements_per_message,
                    &self.peer_id(),
                    now,
                    &mut rand::thread_rng(),
                )
                .into_iter()
                .map(|ann| ann.peer_id)
                .collect();
            if !reachable.is_empty() {
                let availability = ProtocolMessage::RelayAvailability {
                    reachable_peers: reachable.clone(),
                    available_slots: self.relay_server.available_slots(),
                };
                for target in reachable.into_iter().take(self.config.gossip.fanout) {
                    self.send_message(&target, availability.clone()).await;
                }
            }
        }
    }

    /// Expiry and sweep pass, run on its own slower interval.
    pub async fn on_cleanup_tick(&mut self) {
        let now_secs = time::now_secs();
        for peer_id in self.cache.cleanup_expired(now_secs) {
            self.emit(MeshEvent::PeerExpired(peer_id));
        }

        let now = Instant::now();
        for attempt in self.punch.sweep(now) {
            self.emit(MeshEvent::HolePunchFailed {
                peer_id: attempt.remote_peer,
            });
        }
        for session in self.relay_server.sweep_idle(now) {
            self.emit(MeshEvent::RelaySessionClosed {
                session_id: session.session_id,
            });
        }
        self.relay_client.sweep_pending(now);
    }

    // ------------------------------------------------------------------
    // Hole punching
    // ------------------------------------------------------------------

    /// Initiator entry point.
    pub async fn start_hole_punch(
        &mut self,
        target: PeerId,
        waiter: oneshot::Sender<Result<Endpoint, MeshError>>,
    ) {
        if self.nat_type == NatType::Unknown {
            let _ = waiter.send(Err(MeshError::HolePunchImpossible(target)));
            return;
        }
        let Some(coordinator) = self.pick_coordinator(&target) else {
            let _ = waiter.send(Err(MeshError::Unreachable(target)));
            return;
        };
        let Some(my_endpoint) = self.best_self_endpoint() else {
            let _ = waiter.send(Err(MeshError::NoEndpoint(self.peer_id())));
            return;
        };

        let attempt_id = self
            .punch
            .begin_attempt(target.clone(), PunchState::Requested, Some(waiter));
        let request = ProtocolMessage::HolePunchRequest {
            attempt_id,
            target,
            endpoint: my_endpoint,
            nat_type: self.nat_type,
        };
        debug!(%attempt_id, %coordinator, "requesting hole punch");
        self.send_message(&coordinator, request).await;
    }

    /// Coordinator: an initiator asked to reach `target`.
    async fn coordinate_punch(
        &mut self,
        attempt_id: Uuid,
        initiator: PeerId,
        initiator_endpoint: Endpoint,
        initiator_nat: NatType,
        target: PeerId,
        source: SocketAddr,
    ) {
        if self.best_peer_endpoint(&target).is_none() {
            debug!(%target, "cannot coordinate punch to unknown target");
            self.send_message_to_addr(
                &initiator,
                ProtocolMessage::HolePunchResult {
                    attempt_id,
                    success: false,
                },
                source,
            )
            .await;
            return;
        }

        self.punch.begin_rendezvous(
            attempt_id,
            PendingRendezvous {
                initiator: initiator.clone(),
                initiator_endpoint: initiator_endpoint.clone(),
                initiator_nat,
                target: target.clone(),
                deadline: Instant::now() + self.config.hole_punch.attempt_window(),
            },
        );
        let invite = ProtocolMessage::HolePunchInvite {
            attempt_id,
            from_peer_id: initiator,
            their_endpoint: initiator_endpoint,
            their_nat: initiator_nat,
        };
        self.send_message(&target, invite).await;
    }

    /// Responder: a coordinator invited us into a punch. Replies go back to
    /// the coordinator, who owns the rendezvous.
    async fn on_punch_invite(
        &mut self,
        attempt_id: Uuid,
        initiator: PeerId,
        _initiator_endpoint: Endpoint,
        coordinator: PeerId,
        source: SocketAddr,
    ) {
        if self.nat_type == NatType::Unknown {
            // Addressed to the initiator; the coordinator forwards it.
            self.send_message_to_addr(
                &initiator,
                ProtocolMessage::HolePunchResult {
                    attempt_id,
                    success: false,
                },
                source,
            )
            .await;
            return;
        }
        let Some(my_endpoint) = self.best_self_endpoint() else {
            return;
        };
        self.punch.accept_invite(attempt_id, initiator);
        let accept = ProtocolMessage::HolePunchAccept {
            attempt_id,
            endpoint: my_endpoint,
            nat_type: self.nat_type,
        };
        self.send_message_to_addr(&coordinator, accept, source).await;
    }

    /// Coordinator: the responder accepted; derive a strategy and execute.
    async fn on_punch_accept(
        &mut self,
        attempt_id: Uuid,
        responder: PeerId,
        responder_endpoint: Endpoint,
        responder_nat: NatType,
    ) {
        let Some(rendezvous) = self.punch.take_rendezvous(&attempt_id) else {
            debug!(%attempt_id, "accept for unknown rendezvous");
            return;
        };
        if responder != rendezvous.target {
            debug!(%attempt_id, "accept from unexpected responder");
            return;
        }

        let strategy = strategy_for(rendezvous.initiator_nat, responder_nat);
        match strategy {
            None | Some(PunchStrategy::Impossible) => {
                debug!(%attempt_id, "punch impossible for this NAT pairing");
                let result = ProtocolMessage::HolePunchResult {
                    attempt_id,
                    success: false,
                };
                self.send_message(&rendezvous.initiator, result.clone()).await;
                self.send_message(&rendezvous.target, result).await;
            }
            Some(strategy) => {
                let simultaneous = strategy == PunchStrategy::Simultaneous;
                debug!(%attempt_id, ?strategy, "executing hole punch");
                self.send_message(
                    &rendezvous.initiator,
                    ProtocolMessage::HolePunchExecute {
                        attempt_id,
                        target_endpoint: responder_endpoint,
                        simultaneous_send: simultaneous,
                    },
                )
                .await;
                self.send_message(
                    &rendezvous.target,
                    ProtocolMessage::HolePunchExecute {
                        attempt_id,
                        target_endpoint: rendezvous.initiator_endpoint,
                        simultaneous_send: simultaneous,
                    },
                )
                .await;
            }
        }
    }

    /// Either endpoint: fire the probe burst at the indicated endpoint.
    async fn fire_probes(&mut self, attempt_id: Uuid, target_endpoint: Endpoint) {
        let Some(attempt) = self.punch.attempt_mut(&attempt_id) else {
            debug!(%attempt_id, "execute for unknown attempt");
            return;
        };
        attempt.state = PunchState::Probing;
        let remote = attempt.remote_peer.clone();

        let probes = self.config.hole_punch.probes_per_attempt;
        let probe = ProtocolMessage::HolePunchProbe {
            attempt_id,
            ack: false,
        };
        for _ in 0..probes {
            let envelope = Envelope::new_signed(
                &self.identity,
                self.machine_id.clone(),
                Some(remote.clone()),
                ChannelHash::MESH,
                probe.to_payload(),
            );
            match self.encode(&envelope) {
                Ok(bytes) => {
                    if let Err(error) = self.transport.send_to(&bytes, &target_endpoint).await {
                        debug!(%error, "probe send failed");
                    }
                }
                Err(error) => warn!(%error, "probe encode failed"),
            }
        }
    }

    async fn on_punch_probe(
        &mut self,
        attempt_id: Uuid,
        ack: bool,
        sender: &PeerId,
        source: SocketAddr,
    ) {
        let endpoint = Endpoint::from_socket_addr(source);
        if !ack {
            // Confirm the inbound path for the prober.
            let reply = ProtocolMessage::HolePunchProbe {
                attempt_id,
                ack: true,
            };
            self.send_message_to_addr(sender, reply, source).await;
        }
        // Either direction of probe traffic proves the path: the endpoint
        // manager already promoted `source` in the receive bookkeeping.
        if matches!(
            self.punch.attempt_state(&attempt_id),
            Some(PunchState::Probing) | Some(PunchState::Invited)
        ) {
            if let Some(attempt) = self.punch.succeed(&attempt_id, endpoint.clone()) {
                info!(peer_id = %attempt.remote_peer, %endpoint, "hole punch succeeded");
                self.emit(MeshEvent::HolePunchSucceeded {
                    peer_id: attempt.remote_peer,
                    endpoint,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------

    /// Client entry point: open a session to `target` through `via`.
    pub async fn open_relay(
        &mut self,
        via: PeerId,
        target: PeerId,
        waiter: oneshot::Sender<MeshResult<ClientSession>>,
    ) {
        let session_id = Uuid::new_v4();
        self.relay_client.begin_open(
            session_id,
            PendingOpen {
                relay_peer: via.clone(),
                target: target.clone(),
                waiter,
                deadline: Instant::now() + self.config.keepalive.response_timeout(),
            },
        );
        self.send_message(&via, ProtocolMessage::RelayRequest { session_id, target })
            .await;
    }

    /// Relay server: a client asked us to forward to `target`.
    async fn on_relay_request(
        &mut self,
        session_id: Uuid,
        initiator: PeerId,
        target: PeerId,
        source: SocketAddr,
    ) {
        let initiator_endpoint = Endpoint::from_socket_addr(source);
        let Some(target_endpoint) = self.best_peer_endpoint(&target) else {
            self.send_message_to_addr(
                &initiator,
                ProtocolMessage::RelayDeny {
                    session_id,
                    reason: "target unknown".to_string(),
                },
                source,
            )
            .await;
            return;
        };

        let opened = self.relay_server.open(
            session_id,
            initiator.clone(),
            initiator_endpoint,
            target.clone(),
            target_endpoint,
            &mut rand::thread_rng(),
        );
        match opened {
            Ok(session) => {
                let token = session.token;
                self.emit(MeshEvent::RelaySessionOpened {
                    session_id,
                    peer_id: initiator.clone(),
                    via: self.peer_id(),
                });
                self.send_message_to_addr(
                    &initiator,
                    ProtocolMessage::RelayAccept {
                        session_id,
                        token,
                        peer: target.clone(),
                    },
                    source,
                )
                .await;
                self.send_message(
                    &target,
                    ProtocolMessage::RelayAccept {
                        session_id,
                        token,
                        peer: initiator,
                    },
                )
                .await;
            }
            Err(error) => {
                self.send_message_to_addr(
                    &initiator,
                    ProtocolMessage::RelayDeny {
                        session_id,
                        reason: error.to_string(),
                    },
                    source,
                )
                .await;
            }
        }
    }

    /// Either end: the relay accepted a session we participate in.
    fn on_relay_accept(
        &mut self,
        session_id: Uuid,
        token: u32,
        peer: PeerId,
        relay: PeerId,
        source: SocketAddr,
    ) {
        let session = ClientSession {
            session_id,
            token,
            remote_peer: peer.clone(),
            relay_peer: relay.clone(),
            relay_endpoint: Endpoint::from_socket_addr(source),
        };
        self.relay_client.install(session.clone());
        self.emit(MeshEvent::RelaySessionOpened {
            session_id,
            peer_id: peer,
            via: relay,
        });
        if let Some(pending) = self.relay_client.take_pending(&session_id) {
            let _ = pending.waiter.send(Ok(session));
        }
    }

    // ------------------------------------------------------------------
    // Service operations (driven by node commands)
    // ------------------------------------------------------------------

    /// Send an application payload with an explicit strategy.
    pub async fn send(
        &mut self,
        to: PeerId,
        channel: ChannelHash,
        payload: Vec<u8>,
        strategy: SendStrategy,
    ) -> MeshResult<()> {
        let envelope = Envelope::new_signed(
            &self.identity,
            self.machine_id.clone(),
            Some(to.clone()),
            channel,
            payload,
        );
        let bytes = self.encode(&envelope)?;

        match strategy {
            SendStrategy::Direct(endpoint) => {
                self.transport.send_to(&bytes, &endpoint).await?;
                Ok(())
            }
            SendStrategy::Relay(via) => {
                let Some(session) = self.relay_client.session_for_peer(&to) else {
                    return Err(MeshError::NoSession(to));
                };
                if session.relay_peer != via {
                    return Err(MeshError::NoSession(to));
                }
                let frame = relay::wrap_frame(session.token, &bytes);
                let relay_endpoint = session.relay_endpoint.clone();
                self.transport.send_to(&frame, &relay_endpoint).await?;
                Ok(())
            }
            SendStrategy::Auto => {
                if self.send_best_effort(&to, &bytes).await {
                    Ok(())
                } else {
                    Err(MeshError::Unreachable(to))
                }
            }
        }
    }

    /// Broadcast an application payload to up to `fanout` cached peers.
    pub async fn broadcast(&mut self, channel: ChannelHash, payload: Vec<u8>) -> MeshResult<usize> {
        let now = time::now_secs();
        let targets: Vec<PeerId> = self
            .cache
            .sample(
                self.config.gossip.fanout,
                &self.peer_id(),
                now,
                &mut rand::thread_rng(),
            )
            .into_iter()
            .map(|ann| ann.peer_id)
            .collect();

        let mut sent = 0;
        for target in targets {
            let envelope = Envelope::new_signed(
                &self.identity,
                self.machine_id.clone(),
                Some(target.clone()),
                channel,
                payload.clone(),
            );
            let bytes = self.encode(&envelope)?;
            if self.send_best_effort(&target, &bytes).await {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// `sendPing` from the service interface: true iff a pong arrives in time.
    pub async fn send_ping(
        &mut self,
        peer_id: PeerId,
        machine_id: MachineId,
        endpoint: Endpoint,
        reply: oneshot::Sender<bool>,
    ) {
        self.issue_ping(peer_id, machine_id, endpoint, PingPurpose::Caller(reply))
            .await;
    }

    pub fn register_channel(
        &mut self,
        name: &str,
        handler: mpsc::Sender<ChannelMessage>,
    ) -> MeshResult<ChannelHash> {
        let hash = self.registry.register(name)?;
        self.channels.insert(hash, handler);
        Ok(hash)
    }

    pub fn get_endpoint(&self, peer_id: &PeerId, machine_id: Option<&MachineId>) -> Option<Endpoint> {
        match machine_id {
            Some(machine_id) => self.endpoints.get_best(peer_id, machine_id).cloned(),
            None => self.best_peer_endpoint(peer_id),
        }
    }

    pub fn get_nat_type(&self, peer_id: &PeerId) -> NatType {
        if peer_id == &self.peer_id() {
            return self.nat_type;
        }
        self.peer_nat.get(peer_id).copied().unwrap_or_default()
    }

    /// Any peer advertising the coordinator capability, excluding `exclude`.
    pub fn pick_coordinator(&self, exclude: &PeerId) -> Option<PeerId> {
        let now = time::now_secs();
        self.cache
            .with_capabilities(Capabilities::COORDINATOR, now)
            .into_iter()
            .map(|ann| ann.peer_id.clone())
            .find(|peer| peer != exclude && peer != &self.peer_id())
    }

    /// Relay candidates ranked by advertised free slots.
    pub fn pick_relay(&self, exclude: &PeerId) -> Option<PeerId> {
        let now = time::now_secs();
        let mut candidates: Vec<PeerId> = self
            .cache
            .with_capabilities(Capabilities::RELAY, now)
            .into_iter()
            .map(|ann| ann.peer_id.clone())
            .filter(|peer| peer != exclude && peer != &self.peer_id())
            .collect();
        candidates.sort_by_key(|peer| {
            std::cmp::Reverse(self.relay_slots.get(peer).copied().unwrap_or(0))
        });
        candidates.into_iter().next()
    }

    /// Remove one path from the caches (service `invalidateCache`).
    pub fn invalidate_path(&mut self, peer_id: &PeerId, path: &ReachabilityPath) {
        match path {
            ReachabilityPath::Direct { endpoint } => {
                self.endpoints.remove_endpoint(peer_id, endpoint);
            }
            ReachabilityPath::Relay { relay_peer_id, .. } => {
                if let Some(session) = self.relay_client.session_for_peer(peer_id) {
                    if &session.relay_peer == relay_peer_id {
                        let session_id = session.session_id;
                        self.relay_client.close(&session_id);
                        self.emit(MeshEvent::RelaySessionClosed { session_id });
                    }
                }
            }
            ReachabilityPath::HolePunch { .. } => {
                // Punched paths live in the endpoint manager as direct
                // endpoints; nothing else to drop.
            }
        }
    }

    /// Bootstrap/testing: accept an announcement handed over out of band.
    pub async fn add_peer(&mut self, announcement: PeerAnnouncement) -> bool {
        let peer_id = announcement.peer_id.clone();
        self.accept_announcement(announcement, 0, &peer_id, false)
            .await;
        self.cache.contains(&peer_id)
    }

    pub fn set_nat_classification(
        &mut self,
        nat_type: NatType,
        public_endpoint: Option<Endpoint>,
    ) {
        self.nat_type = nat_type;
        if public_endpoint.is_some() {
            self.observed_endpoint = public_endpoint.clone();
        }
        self.refresh_local_announcement();
        self.emit(MeshEvent::NatClassified {
            nat_type,
            public_endpoint,
        });
    }

    pub fn cache_stats(&self) -> crate::peer_cache::PeerCacheStats {
        self.cache.stats()
    }

    /// Fail every pending waiter; called on shutdown.
    pub fn fail_pending(&mut self) {
        for (_, pending) in self.pending_pings.drain() {
            if let PingPurpose::Caller(waiter) = pending.purpose {
                let _ = waiter.send(false);
            }
        }
        let now = Instant::now() + std::time::Duration::from_secs(3600);
        self.relay_client.sweep_pending(now);
        for attempt in self.punch.sweep(now) {
            self.emit(MeshEvent::HolePunchFailed {
                peer_id: attempt.remote_peer,
            });
        }
        self.emit(MeshEvent::Stopped);
    }

    // ------------------------------------------------------------------
    // Send helpers
    // ------------------------------------------------------------------

    fn encode(&self, envelope: &Envelope) -> MeshResult<Vec<u8>> {
        Ok(self.codec.encode(envelope)?)
    }

    /// Best endpoint we can claim for ourselves: STUN/pong-observed mapping,
    /// else the concrete bind address.
    fn best_self_endpoint(&self) -> Option<Endpoint> {
        if let Some(observed) = &self.observed_endpoint {
            return Some(observed.clone());
        }
        let local = self.transport.local_addr();
        if local.ip().is_unspecified() {
            None
        } else {
            Some(Endpoint::from_socket_addr(local))
        }
    }

    /// Best endpoint for a peer: live endpoint manager state first, then the
    /// direct endpoint from its cached announcement.
    fn best_peer_endpoint(&self, peer_id: &PeerId) -> Option<Endpoint> {
        self.endpoints.get_best_any(peer_id).or_else(|| {
            self.cache
                .peek(peer_id)
                .and_then(|ann| ann.direct_endpoint().cloned())
        })
    }

    /// Send raw bytes to a peer by the best available path: direct endpoint,
    /// else an established relay session. Returns false when no path exists.
    async fn send_best_effort(&mut self, to: &PeerId, bytes: &[u8]) -> bool {
        if let Some(endpoint) = self.best_peer_endpoint(to) {
            return self.transport.send_to(bytes, &endpoint).await.is_ok();
        }
        if let Some(session) = self.relay_client.session_for_peer(to) {
            let frame = relay::wrap_frame(session.token, bytes);
            let relay_endpoint = session.relay_endpoint.clone();
            return self.transport.send_to(&frame, &relay_endpoint).await.is_ok();
        }
        false
    }

    /// Send a mesh protocol message to a peer by the best available path.
    async fn send_message(&mut self, to: &PeerId, message: ProtocolMessage) {
        self.send_message_with_hops(to, message, 0).await;
    }

    async fn send_message_with_hops(&mut self, to: &PeerId, message: ProtocolMessage, hops: u8) {
        let mut envelope = Envelope::new_signed(
            &self.identity,
            self.machine_id.clone(),
            Some(to.clone()),
            ChannelHash::MESH,
            message.to_payload(),
        );
        envelope.hop_count = hops;
        match self.encode(&envelope) {
            Ok(bytes) => {
                if !self.send_best_effort(to, &bytes).await {
                    debug!(%to, "no path for mesh message");
                }
            }
            Err(error) => warn!(%error, "mesh message encode failed"),
        }
    }

    /// Send a mesh protocol message straight to a known address (reply path).
    async fn send_message_to_addr(
        &mut self,
        to: &PeerId,
        message: ProtocolMessage,
        addr: SocketAddr,
    ) {
        let envelope = Envelope::new_signed(
            &self.identity,
            self.machine_id.clone(),
            Some(to.clone()),
            ChannelHash::MESH,
            message.to_payload(),
        );
        match self.encode(&envelope) {
            Ok(bytes) => {
                if let Err(error) = self.transport.send_to_addr(&bytes, addr).await {
                    debug!(%error, "reply send failed");
                }
            }
            Err(error) => warn!(%error, "reply encode failed"),
        }
    }
}

/// How `send` picks a path.
#[derive(Clone, Debug)]
pub enum SendStrategy {
    /// Use this exact endpoint.
    Direct(Endpoint),
    /// Best known path: live endpoints, then cached announcements, then an
    /// established relay session.
    Auto,
    /// Use the established relay session through this relay.
    Relay(PeerId),
}
