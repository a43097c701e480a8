// Copyright (c) 2026 The Omerta Project

//! The datagram plane of an Omerta mesh node.
//!
//! One node is one dual-stack UDP endpoint plus one dispatch task owning all
//! mutable peer state: the endpoint manager, the announcement cache, the
//! replay table, the keepalive scheduler, the gossip engine, and both sides
//! of the hole-punch and relay machinery. Applications interact through a
//! [`node::NodeHandle`] and consume [`events::MeshEvent`]s; payloads arrive
//! on registered channels as opaque bytes.

pub mod config;
pub mod dispatcher;
pub mod endpoint_manager;
pub mod error;
pub mod events;
pub mod gossip;
pub mod holepunch;
pub mod keepalive;
pub mod messages;
pub mod node;
pub mod peer_cache;
pub mod relay;
pub mod seen;
pub mod transport;

pub use config::MeshConfig;
pub use dispatcher::{ChannelMessage, DispatcherCounters, SendStrategy};
pub use error::{MeshError, MeshResult};
pub use events::MeshEvent;
pub use messages::PeerAnnouncement;
pub use node::{MeshNode, NodeHandle};
