//! # Receiver Configuration
//!
//! TOML on disk, parsed into `*Input` structs of optional fields and then
//! resolved against the defaults:
//!
//! ```toml
//! version = 1
//!
//! [receiver]
//! bind = "0.0.0.0:51423"
//! multicast_group = "224.0.0.251"   # "" disables multicast
//! max_datagram_len = 2000
//! poll_interval_ms = 50
//!
//! [keep_alive]
//! peer_port = 13337
//! bind = "0.0.0.0:0"
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::wire::{
    DEFAULT_MAX_PACKET_LEN, KEEP_ALIVE_PORT, MIN_PACKET_LEN, MULTICAST_GROUP, TELEMETRY_PORT,
};

pub const CONFIG_VERSION: u32 = 1;

/// Largest payload a UDP/IPv4 datagram can carry.
const MAX_UDP_PAYLOAD: usize = 65_507;

// ─── File Layer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PulzeConfigInput {
    pub version: u32,
    pub receiver: ReceiverConfigInput,
    pub keep_alive: KeepAliveConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfigInput {
    pub bind: Option<String>,
    /// Empty string disables multicast.
    pub multicast_group: Option<String>,
    pub max_datagram_len: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfigInput {
    pub peer_port: Option<u16>,
    pub bind: Option<String>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub bind: SocketAddr,
    pub multicast_group: Option<Ipv4Addr>,
    /// Longest datagram accepted; also the receive buffer size.
    pub max_datagram_len: usize,
    /// How often a blocked receive wakes up to check for shutdown.
    pub poll_interval: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, TELEMETRY_PORT)),
            multicast_group: Some(MULTICAST_GROUP),
            max_datagram_len: DEFAULT_MAX_PACKET_LEN,
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Port on the sender's host that heartbeats go to.
    pub peer_port: u16,
    /// Local address the heartbeat socket binds.
    pub bind: SocketAddr,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            peer_port: KEEP_ALIVE_PORT,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulzeConfig {
    pub version: u32,
    pub receiver: ReceiverConfig,
    pub keep_alive: KeepAliveConfig,
}

impl Default for PulzeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            receiver: ReceiverConfig::default(),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{field}: invalid address '{value}': {e}")))
}

impl PulzeConfigInput {
    pub fn resolve(self) -> Result<PulzeConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(Error::Config(format!(
                "unsupported config version {version}"
            )));
        }

        let defaults = PulzeConfig::default();

        let rx = self.receiver;
        let bind = match rx.bind {
            Some(ref s) => parse_addr("receiver.bind", s)?,
            None => defaults.receiver.bind,
        };
        let multicast_group = match rx.multicast_group {
            None => defaults.receiver.multicast_group,
            Some(ref s) if s.trim().is_empty() => None,
            Some(ref s) => {
                let group: Ipv4Addr = s.trim().parse().map_err(|e| {
                    Error::Config(format!("receiver.multicast_group: '{s}': {e}"))
                })?;
                if !group.is_multicast() {
                    return Err(Error::Config(format!(
                        "receiver.multicast_group: {group} is not a multicast address"
                    )));
                }
                Some(group)
            }
        };
        let max_datagram_len = rx
            .max_datagram_len
            .unwrap_or(defaults.receiver.max_datagram_len);
        if !(MIN_PACKET_LEN..=MAX_UDP_PAYLOAD).contains(&max_datagram_len) {
            return Err(Error::Config(format!(
                "receiver.max_datagram_len must be within {MIN_PACKET_LEN}..={MAX_UDP_PAYLOAD}, got {max_datagram_len}"
            )));
        }
        let poll_interval = rx
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.receiver.poll_interval)
            .max(Duration::from_millis(1));

        let ka = self.keep_alive;
        let keep_alive = KeepAliveConfig {
            peer_port: ka.peer_port.unwrap_or(defaults.keep_alive.peer_port),
            bind: match ka.bind {
                Some(ref s) => parse_addr("keep_alive.bind", s)?,
                None => defaults.keep_alive.bind,
            },
        };
        if keep_alive.peer_port == 0 {
            return Err(Error::Config("keep_alive.peer_port must be nonzero".into()));
        }

        Ok(PulzeConfig {
            version,
            receiver: ReceiverConfig {
                bind,
                multicast_group,
                max_datagram_len,
                poll_interval,
            },
            keep_alive,
        })
    }
}

impl PulzeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(PulzeConfig::default());
        }
        let parsed: PulzeConfigInput = toml::from_str(input)
            .map_err(|e| Error::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}
