//! Property tests: the codec must round-trip every byte sequence, and the
//! checksum identity must hold for every frame the encoder produces.

use exdi_rsp_protocol::{
    checksum, encode_frame, escape, unescape, DeframeEvent, Deframer, FRAME_OVERHEAD,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn escape_round_trips(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        prop_assert_eq!(unescape(&escape(&payload)), Some(payload));
    }

    #[test]
    fn encoded_frames_carry_a_valid_checksum(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let wire = encode_frame(&payload);
        prop_assert_eq!(wire[0], b'$');
        // Body sits between `$` and `#cc`.
        let body = &wire[1..wire.len() - 3];
        let digits = std::str::from_utf8(&wire[wire.len() - 2..]).unwrap();
        prop_assert_eq!(u8::from_str_radix(digits, 16).unwrap(), checksum(body));
    }

    #[test]
    fn deframer_recovers_every_encoded_payload(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let wire = encode_frame(&payload);
        let mut d = Deframer::new(payload.len().max(1));
        let mut got = None;
        for &b in &wire {
            if let Some(event) = d.push(b).expect("well-formed frame") {
                got = Some(event);
            }
        }
        prop_assert_eq!(got, Some(DeframeEvent::Frame(payload)));
    }

    #[test]
    fn frame_growth_is_bounded_by_double(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        // Worst case every byte needs an escape pair.
        let wire = encode_frame(&payload);
        prop_assert!(wire.len() <= payload.len() * 2 + FRAME_OVERHEAD);
    }

    #[test]
    fn deframer_never_panics_on_noise(noise in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let mut d = Deframer::new(256);
        for &b in &noise {
            // Errors are fine; panics or hangs are not.
            let _ = d.push(b);
        }
    }
}
