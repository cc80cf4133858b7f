//! # Pulze Wire Format
//!
//! Every telemetry datagram starts with five big-endian 32-bit signed
//! integers. Anything after byte 20 is padding the sender may add to probe
//! larger datagrams; the receiver ignores it.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Sequence Number (32)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Display Interval, ms (32)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Keep-Alive Interval, ms (32, 0 = disabled)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Sleep Policy Code (32)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Lock Type Code (32)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Padding (optional) ...                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Earlier protocol revisions carried the first three fields as
//! comma-separated decimal text (`"%010d,%05d,%05d,<payload>"`). Those
//! revisions are not accepted here.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Buf;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Port the sender transmits telemetry to.
pub const TELEMETRY_PORT: u16 = 51423;

/// Multicast group the receiver joins by default.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Port keep-alive heartbeats are sent to on the sender's host.
pub const KEEP_ALIVE_PORT: u16 = 13337;

/// The single byte carried by every keep-alive datagram.
pub const KEEP_ALIVE_SENTINEL: u8 = 0x66;

/// Five 4-byte fields.
pub const MIN_PACKET_LEN: usize = 20;

/// Default upper bound on accepted datagrams, and the receive buffer size.
pub const DEFAULT_MAX_PACKET_LEN: usize = 2000;

/// Shortest display interval handed to the display sink.
pub const MIN_DISPLAY_INTERVAL: Duration = Duration::from_millis(100);

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram too short: {len} bytes, need at least {}", MIN_PACKET_LEN)]
    TooShort { len: usize },
    #[error("datagram too long: {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// One decoded telemetry datagram.
///
/// There is no public constructor; the only way to obtain one is through
/// [`Decoder::decode`] or [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryPacket {
    sequence: i32,
    display_interval_ms: i32,
    keep_alive_interval_ms: i32,
    sleep_policy: i32,
    lock_type: i32,
}

impl TelemetryPacket {
    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    pub fn display_interval_ms(&self) -> i32 {
        self.display_interval_ms
    }

    /// Raw keep-alive interval as sent. Zero (or anything negative) means
    /// the sender wants no heartbeats.
    pub fn keep_alive_interval_ms(&self) -> i32 {
        self.keep_alive_interval_ms
    }

    pub fn sleep_policy(&self) -> i32 {
        self.sleep_policy
    }

    pub fn lock_type(&self) -> i32 {
        self.lock_type
    }

    /// Requested heartbeat period, `None` when disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        interval_from_ms(self.keep_alive_interval_ms)
    }

    /// Display interval with the [`MIN_DISPLAY_INTERVAL`] floor applied.
    pub fn display_interval(&self) -> Duration {
        let ms = u64::try_from(self.display_interval_ms).unwrap_or(0);
        Duration::from_millis(ms).max(MIN_DISPLAY_INTERVAL)
    }
}

/// Converts a signed millisecond field into a period; non-positive is off.
pub fn interval_from_ms(ms: i32) -> Option<Duration> {
    u64::try_from(ms)
        .ok()
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// Stateless datagram decoder bounded by a maximum accepted length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    max_len: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_PACKET_LEN,
        }
    }
}

impl Decoder {
    /// A `max_len` below [`MIN_PACKET_LEN`] is raised to it.
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(MIN_PACKET_LEN),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn decode(&self, buf: &[u8]) -> Result<TelemetryPacket, DecodeError> {
        let len = buf.len();
        if len < MIN_PACKET_LEN {
            return Err(DecodeError::TooShort { len });
        }
        if len > self.max_len {
            return Err(DecodeError::TooLong {
                len,
                max: self.max_len,
            });
        }

        let mut cursor = &buf[..MIN_PACKET_LEN];
        Ok(TelemetryPacket {
            sequence: cursor.get_i32(),
            display_interval_ms: cursor.get_i32(),
            keep_alive_interval_ms: cursor.get_i32(),
            sleep_policy: cursor.get_i32(),
            lock_type: cursor.get_i32(),
        })
    }
}

/// Decode with the default length limit.
pub fn decode(buf: &[u8]) -> Result<TelemetryPacket, DecodeError> {
    Decoder::default().decode(buf)
}

#[cfg(test)]
pub(crate) fn encode_fields(fields: [i32; 5]) -> Vec<u8> {
    use bytes::BufMut;
    let mut out = Vec::with_capacity(MIN_PACKET_LEN);
    for f in fields {
        out.put_i32(f);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fixed_offsets() {
        let buf = encode_fields([7, 250, 100, 2, 3]);
        let pkt = decode(&buf).unwrap();
        assert_eq!(pkt.sequence(), 7);
        assert_eq!(pkt.display_interval_ms(), 250);
        assert_eq!(pkt.keep_alive_interval_ms(), 100);
        assert_eq!(pkt.sleep_policy(), 2);
        assert_eq!(pkt.lock_type(), 3);
    }

    #[test]
    fn fields_are_big_endian() {
        let mut buf = vec![0u8; MIN_PACKET_LEN];
        buf[0..4].copy_from_slice(&[0x00, 0x00, 0x01, 0x02]);
        buf[16..20].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        let pkt = decode(&buf).unwrap();
        assert_eq!(pkt.sequence(), 0x0102);
        assert_eq!(pkt.lock_type(), -1);
    }

    #[test]
    fn rejects_short_datagram() {
        assert_eq!(decode(&[]), Err(DecodeError::TooShort { len: 0 }));
        assert_eq!(
            decode(&[0u8; MIN_PACKET_LEN - 1]),
            Err(DecodeError::TooShort { len: 19 })
        );
    }

    #[test]
    fn rejects_oversized_datagram() {
        let buf = vec![0u8; DEFAULT_MAX_PACKET_LEN + 1];
        assert_eq!(
            decode(&buf),
            Err(DecodeError::TooLong {
                len: DEFAULT_MAX_PACKET_LEN + 1,
                max: DEFAULT_MAX_PACKET_LEN
            })
        );
        assert!(decode(&buf[..DEFAULT_MAX_PACKET_LEN]).is_ok());
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let mut buf = encode_fields([1, 2, 3, 4, 5]);
        buf.extend_from_slice(&[b'X'; 500]);
        let pkt = decode(&buf).unwrap();
        assert_eq!(pkt, decode(&buf[..MIN_PACKET_LEN]).unwrap());
    }

    #[test]
    fn custom_limit_applies() {
        let decoder = Decoder::new(32);
        assert!(decoder.decode(&[0u8; 32]).is_ok());
        assert!(matches!(
            decoder.decode(&[0u8; 33]),
            Err(DecodeError::TooLong { len: 33, max: 32 })
        ));
    }

    #[test]
    fn limit_never_drops_below_header() {
        assert_eq!(Decoder::new(4).max_len(), MIN_PACKET_LEN);
    }

    #[test]
    fn keep_alive_interval_disabled_for_zero_and_negative() {
        let off = decode(&encode_fields([0, 0, 0, 0, 0])).unwrap();
        assert_eq!(off.keep_alive_interval(), None);
        let neg = decode(&encode_fields([0, 0, -5, 0, 0])).unwrap();
        assert_eq!(neg.keep_alive_interval(), None);
        let on = decode(&encode_fields([0, 0, 75, 0, 0])).unwrap();
        assert_eq!(on.keep_alive_interval(), Some(Duration::from_millis(75)));
    }

    #[test]
    fn display_interval_has_floor() {
        let fast = decode(&encode_fields([0, 20, 0, 0, 0])).unwrap();
        assert_eq!(fast.display_interval(), MIN_DISPLAY_INTERVAL);
        let slow = decode(&encode_fields([0, 1000, 0, 0, 0])).unwrap();
        assert_eq!(slow.display_interval(), Duration::from_secs(1));
        let negative = decode(&encode_fields([0, -1, 0, 0, 0])).unwrap();
        assert_eq!(negative.display_interval(), MIN_DISPLAY_INTERVAL);
    }
}
