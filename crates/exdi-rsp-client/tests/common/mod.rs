//! In-process mock GDB server.
//!
//! Listens on a loopback port, speaks real RSP framing over the socket,
//! and delegates every decoded command to a test-supplied handler. The
//! interrupt byte is surfaced to the handler as the pseudo-command
//! `"\x03"`. Acknowledgement handling follows the protocol: the server
//! acks inbound frames until it has answered `QStartNoAckMode` with
//! `OK`, after which both directions go quiet.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use exdi_rsp_protocol::{encode_frame, DeframeEvent, Deframer, INTERRUPT_BYTE};

/// What the handler wants sent back for one command.
#[allow(dead_code)]
pub enum ServerAction {
    /// One framed reply.
    Reply(String),
    /// Several framed replies in sequence (console chunks, then `OK`).
    Replies(Vec<String>),
    /// Say nothing; the client is expected to wait (run control).
    NoReply,
    /// Close the connection.
    Quit,
}

/// Counters the tests assert on. Not every test binary reads every
/// counter.
#[derive(Default)]
#[allow(dead_code)]
pub struct ServerStats {
    /// Frames received from the client.
    pub frames: AtomicUsize,
    /// Interrupt bytes received.
    pub interrupts: AtomicUsize,
    /// `+`/`-` bytes seen after no-ack mode was negotiated.
    pub acks_after_no_ack: AtomicUsize,
}

pub struct MockServer {
    pub addr: String,
    pub stats: Arc<ServerStats>,
}

/// Spawns a single-connection server driving `handler`.
pub fn spawn<F>(mut handler: F) -> MockServer
where
    F: FnMut(&str) -> ServerAction + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("local addr").to_string();
    let stats = Arc::new(ServerStats::default());
    let thread_stats = stats.clone();

    std::thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .ok();
        let mut deframer = Deframer::new(1 << 20);
        let mut acking = true;
        // The ack for the `QStartNoAckMode` reply itself is still legal.
        let mut grace_acks = 0usize;
        let mut buf = [0u8; 4096];

        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if !deframer.mid_frame() {
                    if byte == INTERRUPT_BYTE {
                        thread_stats.interrupts.fetch_add(1, Ordering::SeqCst);
                        if !dispatch(&mut stream, handler("\x03")) {
                            return;
                        }
                        continue;
                    }
                    if byte == b'+' || byte == b'-' {
                        if !acking {
                            if grace_acks > 0 {
                                grace_acks -= 1;
                            } else {
                                thread_stats
                                    .acks_after_no_ack
                                    .fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        continue;
                    }
                }
                let event = match deframer.push(byte) {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                if let Some(DeframeEvent::Frame(payload)) = event {
                    thread_stats.frames.fetch_add(1, Ordering::SeqCst);
                    let command = String::from_utf8_lossy(&payload).into_owned();
                    if acking && stream.write_all(b"+").is_err() {
                        return;
                    }
                    let action = handler(&command);
                    let went_quiet = command == "QStartNoAckMode"
                        && matches!(&action, ServerAction::Reply(reply) if reply == "OK");
                    if !dispatch(&mut stream, action) {
                        return;
                    }
                    if went_quiet {
                        acking = false;
                        grace_acks = 1;
                    }
                }
            }
        }
    });

    MockServer { addr, stats }
}

fn dispatch(stream: &mut TcpStream, action: ServerAction) -> bool {
    let replies = match action {
        ServerAction::Reply(reply) => vec![reply],
        ServerAction::Replies(replies) => replies,
        ServerAction::NoReply => return true,
        ServerAction::Quit => return false,
    };
    for reply in replies {
        if stream.write_all(&encode_frame(reply.as_bytes())).is_err() {
            return false;
        }
    }
    true
}

/// Answers the handshake traffic `Controller::connect` generates, so
/// tests only script the commands they care about. `PacketSize=4000`,
/// no optional features.
#[allow(dead_code)]
pub fn handshake(command: &str) -> Option<ServerAction> {
    match command {
        "qSupported" => Some(ServerAction::Reply("PacketSize=4000".to_string())),
        "qfThreadInfo" => Some(ServerAction::Reply("m1".to_string())),
        "qsThreadInfo" => Some(ServerAction::Reply("l".to_string())),
        "?" => Some(ServerAction::Reply("S05".to_string())),
        _ if command.starts_with('H') => Some(ServerAction::Reply("OK".to_string())),
        _ => None,
    }
}
