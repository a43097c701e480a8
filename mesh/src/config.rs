// Copyright (c) 2026 The Omerta Project

//! Configuration for a mesh node.
//!
//! Everything here is a tunable with a sensible default. Key material and the
//! node identity are constructor arguments on `MeshNode`, never configuration.

use displaydoc::Display;
use om_common::{NatType, ValidationMode};
use om_stun::StunConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Clone, Debug, Display, Error, PartialEq)]
pub enum ConfigError {
    /// {field} must be greater than zero
    MustBePositive { field: &'static str },
    /// min_sampling_weight must be within (0, 1], got {0}
    BadSamplingWeight(f64),
    /// probes_per_attempt must be within 1..=16, got {0}
    BadProbeCount(u32),
}

/// Top-level node configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MeshConfig {
    pub transport: TransportConfig,
    pub keepalive: KeepaliveConfig,
    pub gossip: GossipConfig,
    pub hole_punch: HolePunchConfig,
    pub relay: RelayConfig,
    pub cache: CacheConfig,
    pub stun: StunConfig,

    /// Operator override for the NAT verdict, for deployments where the
    /// topology is known or STUN is unavailable. Skips classification.
    pub nat_override: Option<NatType>,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.keepalive.validate()?;
        self.gossip.validate()?;
        self.hole_punch.validate()?;
        self.cache.validate()
    }
}

/// UDP transport configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bind host; the default `::` accepts both address families.
    pub bind_host: String,

    /// Bind port; 0 for ephemeral.
    pub port: u16,

    /// Endpoint screening applied to every observed address.
    pub validation_mode: ValidationMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_host: "::".to_string(),
            port: 0,
            validation_mode: ValidationMode::default(),
        }
    }
}

/// Keepalive scheduler configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds between keepalive cycles.
    pub interval_secs: u64,

    /// Consecutive failures before a machine is declared dead.
    pub missed_threshold: u32,

    /// Seconds to wait for a pong.
    pub response_timeout_secs: u64,

    /// Upper bound on pings per cycle.
    pub max_machines_per_cycle: usize,

    /// Sampling weight half-life in seconds: recently-confirmed machines
    /// are pinged less often.
    pub sampling_half_life_secs: u64,

    /// Weight floor so stale machines never starve.
    pub min_sampling_weight: f64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            missed_threshold: 3,
            response_timeout_secs: 5,
            max_machines_per_cycle: 30,
            sampling_half_life_secs: 300,
            min_sampling_weight: 0.05,
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::MustBePositive {
                field: "keepalive.interval_secs",
            });
        }
        if self.missed_threshold == 0 {
            return Err(ConfigError::MustBePositive {
                field: "keepalive.missed_threshold",
            });
        }
        if self.max_machines_per_cycle == 0 {
            return Err(ConfigError::MustBePositive {
                field: "keepalive.max_machines_per_cycle",
            });
        }
        if !(self.min_sampling_weight > 0.0 && self.min_sampling_weight <= 1.0) {
            return Err(ConfigError::BadSamplingWeight(self.min_sampling_weight));
        }
        Ok(())
    }
}

/// Gossip engine configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Peers each announcement batch is pushed to.
    pub fanout: usize,

    /// Seconds between gossip rounds.
    pub interval_secs: u64,

    /// Re-broadcast ceiling for forwarded envelopes and announcements.
    pub max_hops: u8,

    /// Cached announcements piggybacked per round.
    pub sample_size: usize,

    /// Upper bound on announcements in one announce message.
    pub max_announcements_per_message: usize,

    /// Capacity of the recently-gossiped dedup set.
    pub max_recent_gossip: usize,

    /// Lifetime of the local announcement before peers discard it.
    pub announcement_ttl_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 6,
            interval_secs: 30,
            max_hops: 3,
            sample_size: 3,
            max_announcements_per_message: 10,
            max_recent_gossip: 1000,
            announcement_ttl_secs: 120,
        }
    }
}

impl GossipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fanout == 0 {
            return Err(ConfigError::MustBePositive {
                field: "gossip.fanout",
            });
        }
        if self.interval_secs == 0 {
            return Err(ConfigError::MustBePositive {
                field: "gossip.interval_secs",
            });
        }
        if self.max_recent_gossip == 0 {
            return Err(ConfigError::MustBePositive {
                field: "gossip.max_recent_gossip",
            });
        }
        Ok(())
    }
}

/// Hole-punch coordinator configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HolePunchConfig {
    /// Probes fired per attempt.
    pub probes_per_attempt: u32,

    /// Wall-clock window for an attempt in milliseconds.
    pub attempt_window_ms: u64,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            probes_per_attempt: 3,
            attempt_window_ms: 3_000,
        }
    }
}

impl HolePunchConfig {
    pub fn attempt_window(&self) -> Duration {
        Duration::from_millis(self.attempt_window_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=16).contains(&self.probes_per_attempt) {
            return Err(ConfigError::BadProbeCount(self.probes_per_attempt));
        }
        Ok(())
    }
}

/// Relay manager configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Server-side cap on concurrent sessions initiated by one peer.
    pub max_sessions_per_peer: usize,

    /// Server-side cap on total concurrent sessions; also the advertised
    /// slot count when the node carries the relay capability.
    pub max_sessions: usize,

    /// Sessions without traffic for this long are torn down.
    pub idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_peer: 4,
            max_sessions: 64,
            idle_timeout_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Peer announcement cache configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached announcements.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::MustBePositive {
                field: "cache.max_entries",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_values_match_contract() {
        let config = MeshConfig::default();
        assert_eq!(config.transport.bind_host, "::");
        assert_eq!(config.transport.port, 0);
        assert_eq!(config.keepalive.interval_secs, 15);
        assert_eq!(config.keepalive.missed_threshold, 3);
        assert_eq!(config.keepalive.response_timeout_secs, 5);
        assert_eq!(config.keepalive.max_machines_per_cycle, 30);
        assert_eq!(config.keepalive.sampling_half_life_secs, 300);
        assert_eq!(config.keepalive.min_sampling_weight, 0.05);
        assert_eq!(config.gossip.fanout, 6);
        assert_eq!(config.gossip.interval_secs, 30);
        assert_eq!(config.gossip.max_hops, 3);
        assert_eq!(config.gossip.max_announcements_per_message, 10);
        assert_eq!(config.cache.max_entries, 1000);
    }

    #[test]
    fn test_validation_catches_zeroes() {
        let mut config = MeshConfig::default();
        config.gossip.fanout = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::MustBePositive {
                field: "gossip.fanout"
            })
        );

        let mut config = MeshConfig::default();
        config.keepalive.min_sampling_weight = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::BadSamplingWeight(0.0)));

        let mut config = MeshConfig::default();
        config.hole_punch.probes_per_attempt = 0;
        assert_eq!(config.validate(), Err(ConfigError::BadProbeCount(0)));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = MeshConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.gossip.fanout, config.gossip.fanout);
        assert_eq!(back.transport.bind_host, config.transport.bind_host);
    }
}
