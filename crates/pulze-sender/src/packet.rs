//! Outbound telemetry encoding. Layout lives in [`pulze_core::wire`].

use bytes::{BufMut, BytesMut};
use pulze_core::wire::MIN_PACKET_LEN;

/// Filler byte for the optional padding after the header.
const PADDING_BYTE: u8 = b'X';

/// Values carried by one outbound telemetry datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryFrame {
    pub sequence: i32,
    pub display_interval_ms: i32,
    pub keep_alive_interval_ms: i32,
    pub sleep_policy: i32,
    pub lock_type: i32,
}

impl TelemetryFrame {
    /// Total datagram size for a given amount of padding.
    pub fn encoded_len(padding: usize) -> usize {
        MIN_PACKET_LEN + padding
    }

    /// Write the header followed by `padding` filler bytes, replacing
    /// whatever `out` held.
    pub fn encode_into(&self, padding: usize, out: &mut BytesMut) {
        out.clear();
        out.reserve(Self::encoded_len(padding));
        out.put_i32(self.sequence);
        out.put_i32(self.display_interval_ms);
        out.put_i32(self.keep_alive_interval_ms);
        out.put_i32(self.sleep_policy);
        out.put_i32(self.lock_type);
        out.put_bytes(PADDING_BYTE, padding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulze_core::wire::decode;

    #[test]
    fn receiver_decodes_what_sender_encodes() {
        let frame = TelemetryFrame {
            sequence: 1234,
            display_interval_ms: 1000,
            keep_alive_interval_ms: 100,
            sleep_policy: 2,
            lock_type: 3,
        };
        let mut buf = BytesMut::new();
        frame.encode_into(64, &mut buf);
        assert_eq!(buf.len(), TelemetryFrame::encoded_len(64));
        assert!(buf[MIN_PACKET_LEN..].iter().all(|&b| b == PADDING_BYTE));

        let pkt = decode(&buf).unwrap();
        assert_eq!(pkt.sequence(), 1234);
        assert_eq!(pkt.display_interval_ms(), 1000);
        assert_eq!(pkt.keep_alive_interval_ms(), 100);
        assert_eq!(pkt.sleep_policy(), 2);
        assert_eq!(pkt.lock_type(), 3);
    }

    #[test]
    fn buffer_is_reused_without_leftovers() {
        let frame = TelemetryFrame {
            sequence: 1,
            display_interval_ms: 0,
            keep_alive_interval_ms: 0,
            sleep_policy: 0,
            lock_type: 0,
        };
        let mut buf = BytesMut::new();
        frame.encode_into(100, &mut buf);
        frame.encode_into(0, &mut buf);
        assert_eq!(buf.len(), MIN_PACKET_LEN);
    }
}
