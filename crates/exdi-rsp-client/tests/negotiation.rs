//! Capability negotiation and client-level transport behaviour against
//! the mock server.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{spawn, ServerAction};
use exdi_rsp_client::{
    Architecture, Capability, NullTraceSink, ReceiveWait, RspClient, SessionStatus, TargetConfig,
};

fn config_for(addr: &str) -> TargetConfig {
    let mut config =
        TargetConfig::for_architecture(Architecture::X86, vec![addr.to_string()]);
    config.send_timeout_ms = 2000;
    config.receive_timeout_ms = 2000;
    config
}

#[test]
fn qsupported_updates_the_table_and_no_ack_goes_quiet() {
    let server = spawn(|command| match command {
        "qSupported" => ServerAction::Reply(
            "PacketSize=4000;QStartNoAckMode+;qXfer:features:read+".to_string(),
        ),
        "QStartNoAckMode" => ServerAction::Reply("OK".to_string()),
        "m0,2" => ServerAction::Reply("abcd".to_string()),
        other => panic!("unexpected command {other:?}"),
    });

    let client = RspClient::connect(config_for(&server.addr), Arc::new(NullTraceSink))
        .expect("connect");
    client.negotiate().expect("negotiate");

    let caps = client.capabilities();
    assert_eq!(caps.value(Capability::PacketSize), 0x4000);
    assert_eq!(caps.packet_size(), 0x4000);
    assert!(caps.is_enabled(Capability::NoAckMode));
    assert!(caps.is_enabled(Capability::TargetFeatures));
    assert!(!caps.is_enabled(Capability::VCont));

    // Traffic continues to flow with acks suppressed, and the client
    // emits no ack bytes once the mode is negotiated.
    let reply = client
        .exchange(0, "m0,2", ReceiveWait::ConfiguredTimeout)
        .expect("exchange")
        .expect("reply");
    assert_eq!(reply, "abcd");
    assert_eq!(server.stats.acks_after_no_ack.load(Ordering::SeqCst), 0);
}

#[test]
fn replies_come_back_in_send_order() {
    let server = spawn(|command| match command {
        "qSupported" => ServerAction::Reply("PacketSize=4000".to_string()),
        other => match other.strip_prefix('m') {
            Some(rest) => {
                let (addr, _) = rest.split_once(',').expect("read shape");
                // Echo the address back so each exchange has a unique reply.
                ServerAction::Reply(format!("aa{addr}"))
            }
            None => panic!("unexpected command {other:?}"),
        },
    });

    let client = RspClient::connect(config_for(&server.addr), Arc::new(NullTraceSink))
        .expect("connect");
    client.negotiate().expect("negotiate");

    for i in 0..16u32 {
        let reply = client
            .exchange(0, &format!("m{i:x},1"), ReceiveWait::ConfiguredTimeout)
            .expect("exchange")
            .expect("reply");
        assert_eq!(reply, format!("aa{i:x}"));
    }
}

#[test]
fn target_description_reassembles_across_many_chunks() {
    const MAIN_DOC: &str = r#"<?xml version="1.0"?>
<target>
  <architecture>i386</architecture>
  <xi:include href="system-registers.xml"/>
  <feature name="org.gnu.gdb.i386.core">
    <reg name="eax" bitsize="32" regnum="0"/>
    <reg name="eip" bitsize="32" regnum="8"/>
  </feature>
</target>"#;
    const SYSTEM_DOC: &str = r#"<feature name="system">
  <reg name="apic_base" bitsize="64" regnum="40"/>
</feature>"#;

    // A tiny packet size forces the documents through many m-chunks.
    let server = spawn(|command| match command {
        "qSupported" => {
            ServerAction::Reply("PacketSize=18;qXfer:features:read+".to_string())
        }
        other => match other.strip_prefix("qXfer:features:read:") {
            Some(rest) => {
                let (name, window) = rest.split_once(':').expect("annex");
                let (offset, length) = window.split_once(',').expect("window");
                let offset = usize::from_str_radix(offset, 16).expect("offset");
                let length = usize::from_str_radix(length, 16).expect("length");
                let doc = match name {
                    "target.xml" => MAIN_DOC,
                    "system-registers.xml" => SYSTEM_DOC,
                    _ => panic!("unexpected annex {name:?}"),
                };
                let end = (offset + length).min(doc.len());
                let chunk = &doc[offset.min(doc.len())..end];
                let prefix = if end >= doc.len() { 'l' } else { 'm' };
                ServerAction::Reply(format!("{prefix}{chunk}"))
            }
            None => panic!("unexpected command {other:?}"),
        },
    });

    let client = RspClient::connect(config_for(&server.addr), Arc::new(NullTraceSink))
        .expect("connect");
    client.negotiate().expect("negotiate");

    let docs = client.fetch_target_description().expect("fetch");
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].0, "target.xml");
    assert_eq!(docs[0].1.architecture.as_deref(), Some("i386"));
    assert_eq!(docs[0].1.registers.len(), 2);
    assert_eq!(docs[1].0, "system-registers.xml");
    assert_eq!(docs[1].1.registers[0].name, "apic_base");
}

#[test]
fn a_closed_peer_surfaces_as_connection_loss() {
    let server = spawn(|command| match command {
        "qSupported" => ServerAction::Reply("PacketSize=4000".to_string()),
        "m0,1" => ServerAction::Quit,
        other => panic!("unexpected command {other:?}"),
    });

    let client = RspClient::connect(config_for(&server.addr), Arc::new(NullTraceSink))
        .expect("connect");
    client.negotiate().expect("negotiate");

    let err = client
        .exchange(0, "m0,1", ReceiveWait::ConfiguredTimeout)
        .expect_err("server hung up");
    assert!(matches!(
        err,
        exdi_rsp_client::RspError::ConnectionLost | exdi_rsp_client::RspError::Timeout
    ));
    assert_eq!(client.session_status(0), SessionStatus::ConnectionLost);
}
