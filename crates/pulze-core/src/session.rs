//! # Session Accounting
//!
//! Loss is measured against the range of sequence numbers seen so far in
//! the current session: with first and last sequence numbers `f` and `l`,
//! the session spans `1 + l - f` slots and every slot not covered by a
//! received packet counts as lost.
//!
//! A session is the run of packets from one sender, where a sender is
//! identified by its **source port only**. Two hosts transmitting from the
//! same port are indistinguishable, and a NAT rewriting the port mid-stream
//! looks like a new sender.

use serde::Serialize;
use tracing::info;

use crate::wire::TelemetryPacket;

// ─── Stats ──────────────────────────────────────────────────────────────────

/// Counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Packets received in this session, duplicates included.
    pub packet_count: u64,
    /// Lowest sequence number seen.
    pub first_seq: i32,
    /// Highest sequence number seen.
    pub last_seq: i32,
}

impl SessionStats {
    /// Number of sequence slots covered, `1 + last - first`.
    pub fn span(&self) -> i64 {
        if self.packet_count == 0 {
            return 0;
        }
        1 + i64::from(self.last_seq) - i64::from(self.first_seq)
    }

    /// Slots with no packet. Negative when duplicates outnumber gaps.
    pub fn lost_count(&self) -> i64 {
        let count = i64::try_from(self.packet_count).unwrap_or(i64::MAX);
        self.span().saturating_sub(count)
    }

    /// Lost slots as a percentage of the span; `0.0` for an empty span.
    pub fn loss_percent(&self) -> f64 {
        let span = self.span();
        if span <= 0 {
            return 0.0;
        }
        self.lost_count() as f64 / span as f64 * 100.0
    }
}

// ─── Tracker ────────────────────────────────────────────────────────────────

/// Tracks sequence numbers of the most recent sender.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sender_port: Option<u16>,
    stats: SessionStats,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one packet into the session, starting a new session first if
    /// `sender_port` differs from the previous packet's port.
    pub fn observe(&mut self, packet: &TelemetryPacket, sender_port: u16) -> SessionStats {
        let seq = packet.sequence();

        if self.sender_port != Some(sender_port) {
            if let Some(previous) = self.sender_port {
                info!(
                    previous_port = previous,
                    port = sender_port,
                    packets = self.stats.packet_count,
                    "sender changed, resetting session"
                );
            }
            self.sender_port = Some(sender_port);
            self.stats = SessionStats::default();
        }

        let stats = &mut self.stats;
        if stats.packet_count == 0 {
            stats.first_seq = seq;
            stats.last_seq = seq;
        }
        if seq < stats.first_seq {
            stats.first_seq = seq;
        }
        if seq > stats.last_seq {
            stats.last_seq = seq;
        }
        stats.packet_count += 1;

        *stats
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Source port of the current session's sender.
    pub fn sender_port(&self) -> Option<u16> {
        self.sender_port
    }
}
