//! Property tests for the frame codec.

use a3ot_modbus_master::codec::{
    append_crc, build_mbap_frame, bytes_to_hex, hex_to_bytes, verify_crc,
};
use a3ot_modbus_master::{MbapHeader, TransactionCounter};

use proptest::prelude::*;

proptest! {
    /// Any frame with its CRC appended verifies.
    #[test]
    fn crc_append_then_verify(frame in proptest::collection::vec(any::<u8>(), 0..=254)) {
        prop_assert!(verify_crc(&append_crc(&frame)));
    }

    /// A single flipped bit anywhere in the framed bytes is always caught.
    #[test]
    fn crc_catches_single_bit_flip(
        frame in proptest::collection::vec(any::<u8>(), 1..=64),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut framed = append_crc(&frame);
        let index = position.index(framed.len());
        framed[index] ^= 1 << bit;
        prop_assert!(!verify_crc(&framed));
    }

    /// Hex text survives a decode/encode cycle modulo case and spacing.
    #[test]
    fn hex_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..=64), upper in any::<bool>()) {
        let text: String = bytes
            .iter()
            .map(|b| if upper { format!("{b:02X}") } else { format!(" {b:02x}") })
            .collect();

        let decoded = hex_to_bytes(&text).unwrap();
        prop_assert_eq!(&decoded, &bytes);
        prop_assert_eq!(hex_to_bytes(&bytes_to_hex(&decoded)).unwrap(), bytes);
    }

    /// The MBAP length field always covers the unit id and the PDU.
    #[test]
    fn mbap_length_matches_pdu(pdu in proptest::collection::vec(any::<u8>(), 0..=252), unit_id in any::<u8>()) {
        let counter = TransactionCounter::new();
        let frame = build_mbap_frame(&counter, unit_id, &pdu).unwrap();

        let mut header = [0u8; 7];
        header.copy_from_slice(&frame[..7]);
        let mbap = MbapHeader::decode(&header);

        prop_assert_eq!(mbap.protocol_id, 0);
        prop_assert_eq!(mbap.length as usize, pdu.len() + 1);
        prop_assert_eq!(mbap.unit_id, unit_id);
        prop_assert_eq!(mbap.remaining(), pdu.len());
        prop_assert_eq!(&frame[7..], &pdu[..]);
    }
}
