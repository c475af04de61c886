//! Golden wire-byte checks for the frame codec, pinned against packets
//! captured from real gdbserver sessions.

use exdi_rsp_protocol::{encode_frame, DeframeEvent, Deframer, FrameError};
use pretty_assertions::assert_eq;

fn deframe_all(wire: &[u8], max_payload: usize) -> Vec<DeframeEvent> {
    let mut d = Deframer::new(max_payload);
    let mut events = Vec::new();
    for &b in wire {
        if let Some(event) = d.push(b).expect("deframe") {
            events.push(event);
        }
    }
    events
}

fn frames(wire: &[u8]) -> Vec<Vec<u8>> {
    deframe_all(wire, 16 * 1024)
        .into_iter()
        .map(|e| match e {
            DeframeEvent::Frame(payload) => payload,
            other => panic!("unexpected event: {other:?}"),
        })
        .collect()
}

#[test]
fn golden_outbound_frames() {
    let cases: &[(&[u8], &[u8])] = &[
        (b"qSupported", b"$qSupported#37"),
        (b"OK", b"$OK#9a"),
        (b"?", b"$?#3f"),
        (b"m81dce840,1e", b"$m81dce840,1e#60"),
        (b"QStartNoAckMode", b"$QStartNoAckMode#b0"),
        (b"", b"$#00"),
    ];
    for (payload, wire) in cases {
        assert_eq!(
            encode_frame(payload),
            wire.to_vec(),
            "payload {:?}",
            String::from_utf8_lossy(payload)
        );
    }
}

#[test]
fn inbound_accepts_what_outbound_produces() {
    let payloads: &[&[u8]] = &[
        b"qSupported",
        b"PacketSize=4000;QStartNoAckMode+;qXfer:features:read+",
        b"T05thread:00000001;05:8c3bb082;04:e43ab082;08:7f586281;",
        b"binary $ # { soup",
        b"",
    ];
    for payload in payloads {
        assert_eq!(frames(&encode_frame(payload)), vec![payload.to_vec()]);
    }
}

#[test]
fn back_to_back_frames_are_split() {
    let mut wire = encode_frame(b"first");
    wire.extend_from_slice(&encode_frame(b"second"));
    assert_eq!(frames(&wire), vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test]
fn acks_between_frames_are_ignored() {
    let mut wire = b"+".to_vec();
    wire.extend_from_slice(&encode_frame(b"OK"));
    wire.push(b'+');
    wire.extend_from_slice(&encode_frame(b"E05"));
    assert_eq!(frames(&wire), vec![b"OK".to_vec(), b"E05".to_vec()]);
}

#[test]
fn corrupted_frame_reports_checksum_then_resyncs() {
    let mut wire = b"$OK#99".to_vec();
    wire.extend_from_slice(&encode_frame(b"OK"));
    let events = deframe_all(&wire, 4096);
    assert_eq!(
        events,
        vec![
            DeframeEvent::BadChecksum {
                computed: 0x9a,
                received: 0x99
            },
            DeframeEvent::Frame(b"OK".to_vec()),
        ]
    );
}

#[test]
fn restarted_packet_discards_the_partial_frame() {
    // A `$` inside an unfinished frame starts over; the stray prefix must
    // not leak into the completed payload.
    let mut wire = b"$mFFFF".to_vec();
    wire.extend_from_slice(&encode_frame(b"OK"));
    assert_eq!(frames(&wire), vec![b"OK".to_vec()]);
}

#[test]
fn degenerate_payload_budget_still_parses_the_envelope() {
    // The envelope-only budget (negotiated size 4) admits empty replies
    // and refuses anything longer without wedging the parser.
    let events = deframe_all(b"$#00", 0);
    assert_eq!(events, vec![DeframeEvent::Frame(Vec::new())]);

    let mut d = Deframer::new(0);
    assert_eq!(d.push(b'$'), Ok(None));
    assert_eq!(d.push(b'x'), Err(FrameError::PayloadTooLarge { limit: 0 }));
    let mut tail = Vec::new();
    for &b in b"$#00" {
        if let Some(event) = d.push(b).expect("recover") {
            tail.push(event);
        }
    }
    assert_eq!(tail, vec![DeframeEvent::Frame(Vec::new())]);
}

#[test]
fn run_length_encoded_register_dump_expands() {
    // gdbserver compresses long zero runs in `g` replies.
    let body = b"1122330*&44";
    let mut wire = Vec::new();
    wire.push(b'$');
    wire.extend_from_slice(body);
    wire.push(b'#');
    let sum = exdi_rsp_protocol::checksum(body);
    wire.extend_from_slice(format!("{sum:02x}").as_bytes());

    // '&' is 38: 38 - 29 = 9 extra zeros after the literal one.
    assert_eq!(frames(&wire), vec![b"112233000000000044".to_vec()]);
}
