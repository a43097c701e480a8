// Copyright (c) 2026 The Omerta Project

//! Textual network endpoints.
//!
//! An endpoint is a `host:port` string where the host is an IPv4 dotted quad
//! or a bracketed IPv6 address. Endpoints are stored verbatim; parsing happens
//! on demand. Validation is mode-dependent so test rigs can use loopback and
//! private ranges while production nodes reject them.

use core::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};
use displaydoc::Display;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Potential parse errors
#[derive(Clone, Debug, Display, Eq, PartialEq, thiserror::Error)]
pub enum EndpointParseError {
    /// Not a host:port address: {0}
    InvalidFormat(String),
}

/// How strictly endpoint addresses are screened before being tracked.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Reject loopback, RFC 1918, ULA, and link-local addresses.
    #[default]
    Strict,
    /// Reject only loopback.
    Permissive,
    /// Accept anything that parses.
    AllowAll,
}

/// A `host:port` address where a machine can be reached.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Endpoint(String);

// Deserialization must re-validate: endpoints arrive inside announcements
// from untrusted peers, and everything downstream relies on them parsing.
impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Endpoint::new(raw).map_err(serde::de::Error::custom)
    }
}

impl Endpoint {
    /// Parse and store a textual endpoint.
    pub fn new(src: impl Into<String>) -> Result<Self, EndpointParseError> {
        let src = src.into();
        SocketAddr::from_str(&src).map_err(|_| EndpointParseError::InvalidFormat(src.clone()))?;
        Ok(Self(src))
    }

    /// Render a socket address in endpoint form (IPv6 hosts bracketed).
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The resolved socket address. Construction guarantees this parses.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from_str(&self.0).expect("endpoint was validated at construction")
    }

    pub fn ip(&self) -> IpAddr {
        self.socket_addr().ip()
    }

    pub fn port(&self) -> u16 {
        self.socket_addr().port()
    }

    pub fn is_ipv6(&self) -> bool {
        self.socket_addr().is_ipv6()
    }

    /// Screen the address under the given validation mode.
    pub fn is_valid_under(&self, mode: ValidationMode) -> bool {
        let ip = self.ip();
        match mode {
            ValidationMode::AllowAll => true,
            ValidationMode::Permissive => !ip.is_loopback(),
            ValidationMode::Strict => !ip.is_loopback() && !is_non_routable(&ip),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(src: &str) -> Result<Endpoint, Self::Err> {
        Self::new(src)
    }
}

/// RFC 1918 / ULA / link-local screening, shared by strict validation.
fn is_non_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => is_unique_local(v6) || is_link_local_v6(v6),
    }
}

// fc00::/7
fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parses_ipv4() {
        let ep = Endpoint::new("1.2.3.4:9000").unwrap();
        assert_eq!(ep.port(), 9000);
        assert!(!ep.is_ipv6());
    }

    #[test]
    fn test_endpoint_parses_bracketed_ipv6() {
        let ep = Endpoint::new("[bb05::1]:9999").unwrap();
        assert!(ep.is_ipv6());
        assert_eq!(ep.port(), 9999);
        assert_eq!(ep.as_str(), "[bb05::1]:9999");
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        assert!(Endpoint::new("nonsense").is_err());
        assert!(Endpoint::new("1.2.3.4").is_err());
        assert!(Endpoint::new("bb05::1:9999").is_err());
    }

    #[test]
    fn test_endpoint_stored_verbatim() {
        let ep = Endpoint::new("10.0.0.1:53").unwrap();
        assert_eq!(ep.as_str(), "10.0.0.1:53");
        assert_eq!(ep.to_string(), "10.0.0.1:53");
    }

    #[test]
    fn test_strict_rejects_private_and_loopback() {
        let mode = ValidationMode::Strict;
        assert!(!Endpoint::new("127.0.0.1:80").unwrap().is_valid_under(mode));
        assert!(!Endpoint::new("10.1.2.3:80").unwrap().is_valid_under(mode));
        assert!(!Endpoint::new("192.168.0.1:80").unwrap().is_valid_under(mode));
        assert!(!Endpoint::new("[::1]:80").unwrap().is_valid_under(mode));
        assert!(!Endpoint::new("[fe80::1]:80").unwrap().is_valid_under(mode));
        assert!(!Endpoint::new("[fd00::1]:80").unwrap().is_valid_under(mode));
        assert!(Endpoint::new("1.2.3.4:80").unwrap().is_valid_under(mode));
        assert!(Endpoint::new("[2001:db8::1]:80")
            .unwrap()
            .is_valid_under(mode));
    }

    #[test]
    fn test_permissive_rejects_only_loopback() {
        let mode = ValidationMode::Permissive;
        assert!(!Endpoint::new("127.0.0.1:80").unwrap().is_valid_under(mode));
        assert!(Endpoint::new("10.1.2.3:80").unwrap().is_valid_under(mode));
        assert!(Endpoint::new("[fd00::1]:80").unwrap().is_valid_under(mode));
    }

    #[test]
    fn test_allow_all_accepts_loopback() {
        assert!(Endpoint::new("127.0.0.1:80")
            .unwrap()
            .is_valid_under(ValidationMode::AllowAll));
    }

    #[test]
    fn test_from_socket_addr_brackets_ipv6() {
        let addr: SocketAddr = "[f81f::1]:9999".parse().unwrap();
        let ep = Endpoint::from_socket_addr(addr);
        assert_eq!(ep.as_str(), "[f81f::1]:9999");
    }

    #[test]
    fn test_deserialize_revalidates() {
        let ep: Endpoint = serde_json::from_str("\"1.2.3.4:9000\"").unwrap();
        assert_eq!(ep.port(), 9000);
        assert!(serde_json::from_str::<Endpoint>("\"not an endpoint\"").is_err());
    }
}
