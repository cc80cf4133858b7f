use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures that end a receiver loop or prevent it from starting.
///
/// Decode failures never show up here: they are reported as bogus-packet
/// events and the loop carries on (see [`crate::wire::DecodeError`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind UDP socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to join multicast group {group}")]
    Multicast {
        group: Ipv4Addr,
        #[source]
        source: io::Error,
    },

    #[error("failed to set socket option {option}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("receive failed on {local}")]
    Receive {
        local: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{name} thread panicked")]
    Panicked { name: &'static str },
}
