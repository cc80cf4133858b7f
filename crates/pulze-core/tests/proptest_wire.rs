//! Property-based tests for the telemetry decoder.

use bytes::BufMut;
use proptest::prelude::*;
use pulze_core::wire::*;

fn encode(fields: [i32; 5], padding: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_PACKET_LEN + padding);
    for f in fields {
        buf.put_i32(f);
    }
    buf.resize(MIN_PACKET_LEN + padding, 0xAA);
    buf
}

proptest! {
    #[test]
    fn fields_survive_decode(
        fields in any::<[i32; 5]>(),
        padding in 0usize..(DEFAULT_MAX_PACKET_LEN - MIN_PACKET_LEN),
    ) {
        let pkt = decode(&encode(fields, padding)).unwrap();
        prop_assert_eq!(
            [
                pkt.sequence(),
                pkt.display_interval_ms(),
                pkt.keep_alive_interval_ms(),
                pkt.sleep_policy(),
                pkt.lock_type(),
            ],
            fields
        );
    }

    #[test]
    fn short_buffers_rejected(buf in proptest::collection::vec(any::<u8>(), 0..MIN_PACKET_LEN)) {
        let len = buf.len();
        prop_assert_eq!(decode(&buf), Err(DecodeError::TooShort { len }));
    }

    #[test]
    fn buffers_over_limit_rejected(max in MIN_PACKET_LEN..256usize, extra in 1usize..64) {
        let decoder = Decoder::new(max);
        let buf = vec![0u8; max + extra];
        prop_assert_eq!(
            decoder.decode(&buf),
            Err(DecodeError::TooLong { len: max + extra, max })
        );
    }

    #[test]
    fn padding_never_changes_result(fields in any::<[i32; 5]>(), padding in 0usize..512) {
        prop_assert_eq!(decode(&encode(fields, padding)), decode(&encode(fields, 0)));
    }

    #[test]
    fn keep_alive_enabled_iff_positive(ms in any::<i32>()) {
        let pkt = decode(&encode([0, 0, ms, 0, 0], 0)).unwrap();
        prop_assert_eq!(pkt.keep_alive_interval().is_some(), ms > 0);
    }
}
