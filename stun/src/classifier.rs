// Copyright (c) 2026 The Omerta Project

//! The NAT classifier: two binding requests from one local port.

use crate::{
    error::{StunError, StunResult},
    message::{encode_binding_request, parse_binding_response, TransactionId},
};
use om_common::{Endpoint, NatType};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

/// Classifier configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StunConfig {
    /// STUN servers to query. Classification needs at least two with
    /// distinct external IPs.
    pub servers: Vec<String>,

    /// Local port to probe from; 0 for ephemeral.
    pub local_port: u16,

    /// Per-request response timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            local_port: 0,
            timeout_ms: 3_000,
        }
    }
}

impl StunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The classifier's verdict.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Classification {
    pub nat_type: NatType,
    /// The mapping observed by the first server.
    pub public_endpoint: Endpoint,
}

/// STUN-based NAT classifier. Run at startup and again on network changes.
#[derive(Clone, Debug)]
pub struct NatClassifier {
    config: StunConfig,
}

impl NatClassifier {
    pub fn new(config: StunConfig) -> Self {
        Self { config }
    }

    /// Bind one socket, query the first two servers, compare mappings.
    ///
    /// Identical mappings are the most conservative cone verdict available
    /// without hairpin probing; any difference means a per-destination
    /// allocation, which is symmetric.
    pub async fn classify(&self) -> StunResult<Classification> {
        if self.config.servers.len() < 2 {
            return Err(StunError::InsufficientServers {
                available: self.config.servers.len(),
            });
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.config.local_port))
            .await
            .map_err(StunError::BindFailed)?;

        let first = self.binding_request(&socket, &self.config.servers[0]).await?;
        let second = self.binding_request(&socket, &self.config.servers[1]).await?;

        let nat_type = if first == second {
            NatType::PortRestrictedCone
        } else {
            // Same IP with a different port and a different IP both mean the
            // NAT allocated a fresh mapping for the second destination.
            NatType::Symmetric
        };

        debug!(%first, %second, ?nat_type, "NAT classification complete");

        Ok(Classification {
            nat_type,
            public_endpoint: Endpoint::from_socket_addr(first),
        })
    }

    async fn binding_request(
        &self,
        socket: &UdpSocket,
        server: &str,
    ) -> StunResult<SocketAddr> {
        let server_addr = lookup_host(server)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| StunError::ServerUnresolvable(server.to_string()))?;

        let transaction_id = TransactionId::random();
        let request = encode_binding_request(&transaction_id);
        socket
            .send_to(&request, server_addr)
            .await
            .map_err(StunError::Io)?;

        let deadline = tokio::time::Instant::now() + self.config.timeout();
        let mut buf = [0u8; 576];
        loop {
            let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, source) = match recv {
                Err(_) => {
                    return Err(StunError::Timeout {
                        server: server.to_string(),
                        timeout_ms: self.config.timeout_ms,
                    })
                }
                Ok(Err(err)) => return Err(StunError::Io(err)),
                Ok(Ok(received)) => received,
            };
            if source != server_addr {
                warn!(%source, %server_addr, "dropping datagram from unexpected source");
                continue;
            }
            return parse_binding_response(&buf[..len], &transaction_id);
        }
    }
}
