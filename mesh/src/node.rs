// Copyright (c) 2026 The Omerta Project

//! Node lifecycle and the command surface.
//!
//! `MeshNode::start` binds the transport, spawns the receive loop and the
//! dispatch task, and hands back a cloneable `NodeHandle` plus the event
//! stream. All state lives inside the dispatch task; the handle talks to it
//! exclusively through the command channel, so there is exactly one writer.

use crate::{
    config::MeshConfig,
    dispatcher::{ChannelMessage, Deadline, Dispatcher, DispatcherCounters, SendStrategy},
    error::{MeshError, MeshResult},
    events::MeshEvent,
    messages::PeerAnnouncement,
    peer_cache::PeerCacheStats,
    relay::ClientSession,
    transport::Transport,
};
use om_common::{
    Capabilities, Endpoint, MachineId, NatType, NodeIdentity, PeerId, ReachabilityPath,
};
use om_envelope::{ChannelHash, NetworkKey};
use om_stun::NatClassifier;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const DATAGRAM_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 256;

/// Sweep cadence for timeouts and expiries.
const CLEANUP_TICK: Duration = Duration::from_millis(500);

/// Commands the handle sends into the dispatch task.
pub enum NodeCommand {
    Send {
        to: PeerId,
        channel: ChannelHash,
        payload: Vec<u8>,
        strategy: SendStrategy,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    Broadcast {
        channel: ChannelHash,
        payload: Vec<u8>,
        reply: oneshot::Sender<MeshResult<usize>>,
    },
    RegisterChannel {
        name: String,
        handler: mpsc::Sender<ChannelMessage>,
        reply: oneshot::Sender<MeshResult<ChannelHash>>,
    },
    SendPing {
        peer_id: PeerId,
        machine_id: MachineId,
        endpoint: Endpoint,
        reply: oneshot::Sender<bool>,
    },
    StartHolePunch {
        target: PeerId,
        reply: oneshot::Sender<Result<Endpoint, MeshError>>,
    },
    OpenRelay {
        via: PeerId,
        target: PeerId,
        reply: oneshot::Sender<MeshResult<ClientSession>>,
    },
    GetEndpoint {
        peer_id: PeerId,
        machine_id: Option<MachineId>,
        reply: oneshot::Sender<Option<Endpoint>>,
    },
    GetNatType {
        peer_id: PeerId,
        reply: oneshot::Sender<NatType>,
    },
    GetCoordinator {
        reply: oneshot::Sender<Option<PeerId>>,
    },
    GetRelay {
        reply: oneshot::Sender<Option<PeerId>>,
    },
    InvalidatePath {
        peer_id: PeerId,
        path: ReachabilityPath,
    },
    AddPeer {
        announcement: PeerAnnouncement,
        reply: oneshot::Sender<bool>,
    },
    Announcement {
        reply: oneshot::Sender<PeerAnnouncement>,
    },
    CacheStats {
        reply: oneshot::Sender<PeerCacheStats>,
    },
    Counters {
        reply: oneshot::Sender<DispatcherCounters>,
    },
    NatClassified {
        nat_type: NatType,
        public_endpoint: Option<Endpoint>,
    },
    Shutdown,
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    peer_id: PeerId,
    machine_id: MachineId,
    local_endpoint: Endpoint,
    command_tx: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// The transport's bound address.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local_endpoint
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> MeshResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| MeshError::NotRunning)?;
        rx.await.map_err(|_| MeshError::NotRunning)
    }

    /// Send a payload to a peer on a channel with the given strategy.
    pub async fn send(
        &self,
        to: PeerId,
        channel: ChannelHash,
        payload: Vec<u8>,
        strategy: SendStrategy,
    ) -> MeshResult<()> {
        self.request(|reply| NodeCommand::Send {
            to,
            channel,
            payload,
            strategy,
            reply,
        })
        .await?
    }

    /// Fan a payload out to up to `gossip.fanout` cached peers. Returns the
    /// number of envelopes that found a path.
    pub async fn broadcast(&self, channel: ChannelHash, payload: Vec<u8>) -> MeshResult<usize> {
        self.request(|reply| NodeCommand::Broadcast {
            channel,
            payload,
            reply,
        })
        .await?
    }

    /// Register an application channel; messages arrive on the returned
    /// receiver's sender side.
    pub async fn register_channel(
        &self,
        name: &str,
        handler: mpsc::Sender<ChannelMessage>,
    ) -> MeshResult<ChannelHash> {
        let name = name.to_string();
        self.request(|reply| NodeCommand::RegisterChannel {
            name,
            handler,
            reply,
        })
        .await?
    }

    /// True iff a matching pong arrives within the response timeout.
    pub async fn send_ping(
        &self,
        peer_id: PeerId,
        machine_id: MachineId,
        endpoint: Endpoint,
    ) -> MeshResult<bool> {
        self.request(|reply| NodeCommand::SendPing {
            peer_id,
            machine_id,
            endpoint,
            reply,
        })
        .await
    }

    /// Coordinate a hole punch to `target`; resolves with the opened
    /// endpoint.
    pub async fn start_hole_punch(&self, target: PeerId) -> MeshResult<Endpoint> {
        self.request(|reply| NodeCommand::StartHolePunch { target, reply })
            .await?
    }

    /// Open a relay session to `target` through `via`.
    pub async fn open_relay(&self, via: PeerId, target: PeerId) -> MeshResult<ClientSession> {
        self.request(|reply| NodeCommand::OpenRelay { via, target, reply })
            .await?
    }

    /// IPv6-preferred best endpoint for a peer (or one machine of it).
    pub async fn get_endpoint(
        &self,
        peer_id: PeerId,
        machine_id: Option<MachineId>,
    ) -> MeshResult<Option<Endpoint>> {
        self.request(|reply| NodeCommand::GetEndpoint {
            peer_id,
            machine_id,
            reply,
        })
        .await
    }

    /// Last known NAT classification for a peer (or self).
    pub async fn get_nat_type(&self, peer_id: PeerId) -> MeshResult<NatType> {
        self.request(|reply| NodeCommand::GetNatType { peer_id, reply })
            .await
    }

    /// Any known coordinator-capable peer.
    pub async fn get_coordinator_peer_id(&self) -> MeshResult<Option<PeerId>> {
        self.request(|reply| NodeCommand::GetCoordinator { reply })
            .await
    }

    /// Best relay candidate by advertised capacity.
    pub async fn get_relay_peer_id(&self) -> MeshResult<Option<PeerId>> {
        self.request(|reply| NodeCommand::GetRelay { reply }).await
    }

    /// Drop one cached path for a peer.
    pub async fn invalidate_cache(&self, peer_id: PeerId, path: ReachabilityPath) -> MeshResult<()> {
        self.command_tx
            .send(NodeCommand::InvalidatePath { peer_id, path })
            .await
            .map_err(|_| MeshError::NotRunning)
    }

    /// Hand the node a peer announcement out of band (bootstrap).
    pub async fn add_peer(&self, announcement: PeerAnnouncement) -> MeshResult<bool> {
        self.request(|reply| NodeCommand::AddPeer { announcement, reply })
            .await
    }

    /// The node's current signed announcement.
    pub async fn announcement(&self) -> MeshResult<PeerAnnouncement> {
        self.request(|reply| NodeCommand::Announcement { reply })
            .await
    }

    pub async fn cache_stats(&self) -> MeshResult<PeerCacheStats> {
        self.request(|reply| NodeCommand::CacheStats { reply }).await
    }

    pub async fn counters(&self) -> MeshResult<DispatcherCounters> {
        self.request(|reply| NodeCommand::Counters { reply }).await
    }

    /// Stop the dispatch loop. Pending request waiters fail.
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.command_tx
            .send(NodeCommand::Shutdown)
            .await
            .map_err(|_| MeshError::NotRunning)
    }
}

/// A mesh node before start: identity, network membership, and tunables.
pub struct MeshNode {
    identity: NodeIdentity,
    machine_id: MachineId,
    network_key: NetworkKey,
    capabilities: Capabilities,
    config: MeshConfig,
}

impl MeshNode {
    pub fn new(
        identity: NodeIdentity,
        machine_id: MachineId,
        network_key: NetworkKey,
        config: MeshConfig,
    ) -> Self {
        Self {
            identity,
            machine_id,
            network_key,
            capabilities: Capabilities::default(),
            config,
        }
    }

    /// Advertise additional capabilities (relay, coordinator).
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Bind the transport and start the dispatch loop. Bind failure is the
    /// only fatal startup error; everything else degrades.
    pub async fn start(self) -> MeshResult<(NodeHandle, mpsc::Receiver<MeshEvent>)> {
        self.config.validate()?;

        let transport = Transport::bind(&self.config.transport)?;
        let local_endpoint = Endpoint::from_socket_addr(transport.local_addr());

        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_QUEUE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (deadline_tx, deadline_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

        let receive_loop = transport.spawn_receive_loop(datagram_tx);

        let dispatcher = Dispatcher::new(
            self.identity.clone(),
            self.machine_id.clone(),
            &self.network_key,
            self.capabilities,
            self.config.clone(),
            transport,
            deadline_tx,
            event_tx.clone(),
        );

        let handle = NodeHandle {
            peer_id: self.identity.peer_id(),
            machine_id: self.machine_id.clone(),
            local_endpoint: local_endpoint.clone(),
            command_tx: command_tx.clone(),
        };

        let _ = event_tx.try_send(MeshEvent::Started {
            local_endpoint: local_endpoint.clone(),
        });
        info!(peer_id = %self.identity.peer_id(), %local_endpoint, "mesh node started");

        spawn_classifier(self.config.clone(), command_tx, event_tx);

        let config = self.config;
        tokio::spawn(async move {
            run_node(dispatcher, config, datagram_rx, command_rx, deadline_rx).await;
            receive_loop.abort();
        });

        Ok((handle, event_rx))
    }
}

/// Classify NAT in the background; the node starts as `Unknown` and upgrades
/// when (if) the classifier reports.
fn spawn_classifier(
    config: MeshConfig,
    command_tx: mpsc::Sender<NodeCommand>,
    event_tx: mpsc::Sender<MeshEvent>,
) {
    if let Some(nat_type) = config.nat_override {
        let _ = command_tx.try_send(NodeCommand::NatClassified {
            nat_type,
            public_endpoint: None,
        });
        return;
    }
    if config.stun.servers.len() < 2 {
        let _ = event_tx.try_send(MeshEvent::ComponentDegraded {
            component: "nat-classifier",
            reason: format!("{} STUN servers configured, need 2", config.stun.servers.len()),
        });
        return;
    }
    tokio::spawn(async move {
        let classifier = NatClassifier::new(config.stun.clone());
        match classifier.classify().await {
            Ok(verdict) => {
                let _ = command_tx
                    .send(NodeCommand::NatClassified {
                        nat_type: verdict.nat_type,
                        public_endpoint: Some(verdict.public_endpoint),
                    })
                    .await;
            }
            Err(error) => {
                warn!(%error, "NAT classification failed, staying unknown");
                let _ = event_tx.try_send(MeshEvent::ComponentDegraded {
                    component: "nat-classifier",
                    reason: error.to_string(),
                });
                let _ = command_tx
                    .send(NodeCommand::NatClassified {
                        nat_type: NatType::Unknown,
                        public_endpoint: None,
                    })
                    .await;
            }
        }
    });
}

async fn run_node(
    mut dispatcher: Dispatcher,
    config: MeshConfig,
    mut datagram_rx: mpsc::Receiver<(Vec<u8>, std::net::SocketAddr)>,
    mut command_rx: mpsc::Receiver<NodeCommand>,
    mut deadline_rx: mpsc::Receiver<Deadline>,
) {
    let mut keepalive_interval = tokio::time::interval(config.keepalive.interval());
    let mut gossip_interval = tokio::time::interval(config.gossip.interval());
    let mut cleanup_interval = tokio::time::interval(CLEANUP_TICK);
    keepalive_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    gossip_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_datagram = datagram_rx.recv() => {
                match maybe_datagram {
                    Some((bytes, source)) => dispatcher.handle_datagram(bytes, source).await,
                    None => break,
                }
            }

            maybe_command = command_rx.recv() => {
                match maybe_command {
                    Some(command) => {
                        if !handle_command(&mut dispatcher, command).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            Some(deadline) = deadline_rx.recv() => {
                dispatcher.on_deadline(deadline).await;
            }

            _ = keepalive_interval.tick() => dispatcher.on_keepalive_tick().await,

            _ = gossip_interval.tick() => dispatcher.on_gossip_tick().await,

            _ = cleanup_interval.tick() => dispatcher.on_cleanup_tick().await,
        }
    }

    debug!("dispatch loop exiting");
    dispatcher.fail_pending();
}

/// Apply one command; false means shutdown.
async fn handle_command(dispatcher: &mut Dispatcher, command: NodeCommand) -> bool {
    match command {
        NodeCommand::Send {
            to,
            channel,
            payload,
            strategy,
            reply,
        } => {
            let result = dispatcher.send(to, channel, payload, strategy).await;
            let _ = reply.send(result);
        }
        NodeCommand::Broadcast {
            channel,
            payload,
            reply,
        } => {
            let result = dispatcher.broadcast(channel, payload).await;
            let _ = reply.send(result);
        }
        NodeCommand::RegisterChannel {
            name,
            handler,
            reply,
        } => {
            let _ = reply.send(dispatcher.register_channel(&name, handler));
        }
        NodeCommand::SendPing {
            peer_id,
            machine_id,
            endpoint,
            reply,
        } => {
            dispatcher.send_ping(peer_id, machine_id, endpoint, reply).await;
        }
        NodeCommand::StartHolePunch { target, reply } => {
            dispatcher.start_hole_punch(target, reply).await;
        }
        NodeCommand::OpenRelay { via, target, reply } => {
            dispatcher.open_relay(via, target, reply).await;
        }
        NodeCommand::GetEndpoint {
            peer_id,
            machine_id,
            reply,
        } => {
            let _ = reply.send(dispatcher.get_endpoint(&peer_id, machine_id.as_ref()));
        }
        NodeCommand::GetNatType { peer_id, reply } => {
            let _ = reply.send(dispatcher.get_nat_type(&peer_id));
        }
        NodeCommand::GetCoordinator { reply } => {
            let peer_id = dispatcher.peer_id();
            let _ = reply.send(dispatcher.pick_coordinator(&peer_id));
        }
        NodeCommand::GetRelay { reply } => {
            let peer_id = dispatcher.peer_id();
            let _ = reply.send(dispatcher.pick_relay(&peer_id));
        }
        NodeCommand::InvalidatePath { peer_id, path } => {
            dispatcher.invalidate_path(&peer_id, &path);
        }
        NodeCommand::AddPeer { announcement, reply } => {
            let _ = reply.send(dispatcher.add_peer(announcement).await);
        }
        NodeCommand::Announcement { reply } => {
            let _ = reply.send(dispatcher.local_announcement().clone());
        }
        NodeCommand::CacheStats { reply } => {
            let _ = reply.send(dispatcher.cache_stats());
        }
        NodeCommand::Counters { reply } => {
            let _ = reply.send(dispatcher.counters.clone());
        }
        NodeCommand::NatClassified {
            nat_type,
            public_endpoint,
        } => {
            dispatcher.set_nat_classification(nat_type, public_endpoint);
        }
        NodeCommand::Shutdown => return false,
    }
    true
}
