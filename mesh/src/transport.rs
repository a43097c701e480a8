// Copyright (c) 2026 The Omerta Project

//! The dual-stack UDP transport.
//!
//! One socket, bound once at startup. A spawned receive loop pushes
//! `(bytes, source)` pairs into the dispatcher's channel; sends go straight
//! out on the shared socket. The receive path never blocks on the dispatcher:
//! if the channel is full the datagram is dropped, which the protocol
//! tolerates by construction.

use crate::{
    config::TransportConfig,
    error::{MeshError, MeshResult},
};
use om_common::Endpoint;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tracing::{debug, trace, warn};

/// Largest datagram the receive loop will accept.
pub const MAX_DATAGRAM: usize = 65_507;

/// A bound UDP endpoint shared between the dispatcher and senders.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl Transport {
    /// Bind the socket described by the config. With the default `::` bind
    /// host the socket accepts IPv4 traffic too (v6-only is cleared before
    /// binding). Bind failure is fatal to node startup.
    pub fn bind(config: &TransportConfig) -> MeshResult<Self> {
        let host =
            IpAddr::from_str(&config.bind_host).map_err(|err| {
                MeshError::BindFailed(std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
            })?;
        let addr = SocketAddr::new(host, config.port);

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(MeshError::BindFailed)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false).map_err(MeshError::BindFailed)?;
        }
        socket.set_nonblocking(true).map_err(MeshError::BindFailed)?;
        socket.bind(&addr.into()).map_err(MeshError::BindFailed)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(MeshError::BindFailed)?;
        let local_addr = socket.local_addr().map_err(MeshError::BindFailed)?;
        debug!(%local_addr, "transport bound");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the receive loop. Runs until the socket errors fatally or the
    /// receiver side of the channel closes.
    pub fn spawn_receive_loop(
        &self,
        datagram_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        trace!(len, %source, "datagram received");
                        // A full dispatcher queue means we shed load here.
                        match datagram_tx.try_send((buf[..len].to_vec(), source)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(%source, "dispatcher queue full, datagram dropped");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                    Err(err) => {
                        warn!(%err, "udp receive error");
                    }
                }
            }
        })
    }

    /// Send one datagram to a textual endpoint.
    pub async fn send_to(&self, bytes: &[u8], endpoint: &Endpoint) -> MeshResult<()> {
        self.send_to_addr(bytes, endpoint.socket_addr()).await
    }

    /// Send one datagram to a resolved address.
    pub async fn send_to_addr(&self, bytes: &[u8], addr: SocketAddr) -> MeshResult<()> {
        // A v4-mapped destination lets the dual-stack socket reach IPv4 hosts.
        let addr = match (self.local_addr.is_ipv6(), addr) {
            (true, SocketAddr::V4(v4)) => SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port()),
            _ => addr,
        };
        self.socket
            .send_to(bytes, addr)
            .await
            .map(|_| ())
            .map_err(|source| MeshError::SendFailed {
                destination: addr.to_string(),
                bytes: bytes.len(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use om_common::ValidationMode;

    fn loopback_config() -> TransportConfig {
        TransportConfig {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            validation_mode: ValidationMode::AllowAll,
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let transport = Transport::bind(&loopback_config()).unwrap();
        assert_ne!(transport.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_send_and_receive_roundtrip() {
        let a = Transport::bind(&loopback_config()).unwrap();
        let b = Transport::bind(&loopback_config()).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let _loop_handle = b.spawn_receive_loop(tx);

        let b_endpoint = Endpoint::from_socket_addr(b.local_addr());
        a.send_to(b"ping over udp", &b_endpoint).await.unwrap();

        let (bytes, source) = rx.recv().await.unwrap();
        assert_eq!(bytes, b"ping over udp");
        assert_eq!(source.port(), a.local_addr().port());
    }

    #[tokio::test]
    async fn test_bind_failure_is_typed() {
        let config = TransportConfig {
            bind_host: "not an ip".to_string(),
            ..loopback_config()
        };
        assert!(matches!(
            Transport::bind(&config),
            Err(MeshError::BindFailed(_))
        ));
    }
}
