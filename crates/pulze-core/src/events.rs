//! # Receiver Events
//!
//! The receiver does not draw anything or touch platform settings itself.
//! It reports state changes through two seams:
//!
//! - [`DisplaySink`]: what a status screen needs to show
//! - [`DeviceControl`]: device settings the sender asked for
//!
//! Both are called on the receiver thread. Implementations that feed a UI
//! should hand the data off to their own thread; [`ChannelSink`] does that
//! with a crossbeam channel.

use std::time::Duration;

use crossbeam_channel::{Receiver, SendError, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, warn};

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Everything the display shows after a packet is processed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Sequence number of the packet that produced this snapshot.
    pub sequence: i32,
    pub first_sequence: i32,
    pub last_sequence: i32,
    pub packet_count: u64,
    pub lost_count: i64,
    pub loss_percent: f64,
    #[serde(serialize_with = "millis::option")]
    pub keep_alive_interval: Option<Duration>,
    pub sleep_policy: i32,
    pub lock_type: i32,
    /// How long the display should hold its "packet received" state.
    #[serde(serialize_with = "millis::plain")]
    pub display_interval: Duration,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn plain<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn option<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

// ─── Seams ──────────────────────────────────────────────────────────────────

/// Status display fed by the receiver.
pub trait DisplaySink: Send + Sync {
    fn on_stats_updated(&self, snapshot: &StatsSnapshot);

    /// A datagram arrived that could not be decoded.
    fn on_bogus_packet(&self);

    /// `Some(interval)` once heartbeats start, `None` when they stop.
    fn on_keep_alive_state_changed(&self, interval: Option<Duration>);
}

/// Platform hooks for the device settings carried in telemetry.
///
/// Called only when a code differs from the last one applied.
pub trait DeviceControl: Send + Sync {
    fn apply_sleep_policy(&self, code: i32);
    fn apply_lock_type(&self, code: i32);
}

// ─── Channel Sink ───────────────────────────────────────────────────────────

/// Event forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReceiverEvent {
    StatsUpdated(StatsSnapshot),
    BogusPacket,
    KeepAliveChanged {
        #[serde(serialize_with = "millis::option")]
        interval: Option<Duration>,
    },
    ApplySleepPolicy {
        code: i32,
    },
    ApplyLockType {
        code: i32,
    },
}

/// Forwards every callback as a [`ReceiverEvent`] on a bounded channel.
///
/// Stats and bogus-packet events are dropped when the consumer falls
/// behind; the next packet supersedes them. Keep-alive and device-setting
/// changes are sent once and never repeated, so those wait for room in the
/// channel. A consumer must keep draining (or drop its receiver) while the
/// receive loop runs.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<ReceiverEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<ReceiverEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    fn forward_lossy(&self, event: ReceiverEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "event consumer lagging, dropping event");
            }
        }
    }

    fn forward_state_change(&self, event: ReceiverEvent) {
        if let Err(SendError(event)) = self.tx.send(event) {
            debug!(?event, "event consumer gone, discarding state change");
        }
    }
}

impl DisplaySink for ChannelSink {
    fn on_stats_updated(&self, snapshot: &StatsSnapshot) {
        self.forward_lossy(ReceiverEvent::StatsUpdated(*snapshot));
    }

    fn on_bogus_packet(&self) {
        self.forward_lossy(ReceiverEvent::BogusPacket);
    }

    fn on_keep_alive_state_changed(&self, interval: Option<Duration>) {
        self.forward_state_change(ReceiverEvent::KeepAliveChanged { interval });
    }
}

impl DeviceControl for ChannelSink {
    fn apply_sleep_policy(&self, code: i32) {
        self.forward_state_change(ReceiverEvent::ApplySleepPolicy { code });
    }

    fn apply_lock_type(&self, code: i32) {
        self.forward_state_change(ReceiverEvent::ApplyLockType { code });
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DisplaySink for NullSink {
    fn on_stats_updated(&self, _snapshot: &StatsSnapshot) {}
    fn on_bogus_packet(&self) {}
    fn on_keep_alive_state_changed(&self, _interval: Option<Duration>) {}
}

impl DeviceControl for NullSink {
    fn apply_sleep_policy(&self, _code: i32) {}
    fn apply_lock_type(&self, _code: i32) {}
}
