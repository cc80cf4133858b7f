//! # pulze-core
//!
//! Receiving side of the Pulze link-quality probe.
//!
//! A sender broadcasts (or multicasts) fixed-format telemetry datagrams at a
//! steady cadence. The receiver decodes them, tracks per-sender packet loss,
//! mirrors the device settings the sender asks for, and answers with a
//! low-rate keep-alive heartbeat whose interval is also dictated by the
//! sender.
//!
//! ## Crate structure
//!
//! - [`wire`]: Datagram layout and the packet decoder
//! - [`session`]: Per-sender sequence and loss accounting
//! - [`keepalive`]: Heartbeat session thread and its manager
//! - [`receiver`]: Receive loop tying the pieces together
//! - [`events`]: Display sink / device-control seams and a channel sink
//! - [`net`]: Socket setup (address reuse, broadcast, multicast)
//! - [`config`]: TOML configuration
//! - [`error`]: Error types

pub mod config;
pub mod error;
pub mod events;
pub mod keepalive;
pub mod net;
pub mod receiver;
pub mod session;
pub mod wire;

pub use error::{Error, Result};
