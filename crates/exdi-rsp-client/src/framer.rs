//! Per-channel framing over a byte stream.
//!
//! Owns the single-read-ahead receive buffer and the acknowledgement
//! discipline. Inbound waits are sliced so the session interrupt event is
//! observed between refills: data that has already arrived always wins
//! over a pending cancellation, which is what lets an interrupt's stop
//! reply flow back through the normal receive path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use exdi_rsp_protocol::{encode_frame, DeframeEvent, Deframer, ACK_BYTE, NAK_BYTE, PACKET_START};

use crate::error::{Result, RspError};
use crate::stream::ByteStream;

/// How long a receive may wait for the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveWait {
    /// Block until a frame, cancellation, or connection loss.
    Forever,
    /// Honour the configured receive timeout.
    ConfiguredTimeout,
    /// One short slice, then report "nothing yet". Used to rotate across
    /// channels.
    Poll,
}

/// Ceiling on a decoded reply payload. Replies are bounded by the
/// negotiated packet size; this guard only exists to stop a misbehaving
/// server from growing the accumulation buffer without limit.
const REPLY_GUARD: usize = 1 << 20;

const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct Framer {
    stream: ByteStream,
    rx: Vec<u8>,
    rx_start: usize,
    rx_end: usize,
    deframer: Deframer,
    no_ack_mode: bool,
    max_packet_len: usize,
    max_attempts: u32,
    receive_timeout: Duration,
    cancel: Arc<AtomicBool>,
}

impl Framer {
    pub fn new(
        stream: ByteStream,
        max_packet_len: usize,
        max_attempts: u32,
        receive_timeout: Duration,
        cancel: Arc<AtomicBool>,
    ) -> Framer {
        Framer {
            stream,
            rx: vec![0; max_packet_len.max(64)],
            rx_start: 0,
            rx_end: 0,
            deframer: Deframer::new(REPLY_GUARD),
            no_ack_mode: false,
            max_packet_len,
            max_attempts: max_attempts.max(1),
            receive_timeout,
            cancel,
        }
    }

    pub fn no_ack_mode(&self) -> bool {
        self.no_ack_mode
    }

    pub fn set_no_ack_mode(&mut self, enabled: bool) {
        self.no_ack_mode = enabled;
    }

    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }

    /// Adopts the negotiated packet length for future reads.
    pub fn set_max_packet_len(&mut self, len: usize) {
        self.max_packet_len = len.max(4);
        let wanted = self.max_packet_len.max(64);
        if self.rx.len() < wanted {
            // Preserve any buffered bytes across the resize.
            let pending = self.rx[self.rx_start..self.rx_end].to_vec();
            self.rx = vec![0; wanted];
            self.rx[..pending.len()].copy_from_slice(&pending);
            self.rx_start = 0;
            self.rx_end = pending.len();
        }
    }

    /// Drops buffered bytes and any partially assembled frame. Called
    /// before a fresh command round.
    pub fn reset(&mut self) {
        self.rx_start = 0;
        self.rx_end = 0;
        self.deframer.reset();
    }

    pub fn stream(&mut self) -> &mut ByteStream {
        &mut self.stream
    }

    /// Frames and sends `payload`. Unless no-ack mode applies (or the
    /// packet is fire-and-forget), waits for the acknowledgement byte,
    /// resending on NAK and on timeout up to the attempt budget. A `$`
    /// in ack position means the server skipped the ack and started its
    /// reply; the byte is left buffered for the next receive.
    pub fn send_packet(&mut self, payload: &[u8], await_ack: bool) -> Result<()> {
        let wire = encode_frame(payload);
        let attempts = self.max_attempts;
        for _ in 0..attempts {
            if self.cancel.load(Ordering::Acquire) {
                return Err(RspError::Cancelled);
            }
            self.stream.send(&wire)?;
            if self.no_ack_mode || !await_ack {
                return Ok(());
            }
            match self.read_ack_byte() {
                Ok(ACK_BYTE) => return Ok(()),
                Ok(NAK_BYTE) => continue,
                Ok(PACKET_START) => {
                    self.unconsume_byte();
                    return Ok(());
                }
                Ok(other) => {
                    return Err(RspError::Protocol(format!(
                        "unexpected byte {other:#04x} in acknowledgement position"
                    )))
                }
                Err(RspError::Timeout) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(RspError::Protocol(format!(
            "no acknowledgement after {attempts} attempts"
        )))
    }

    /// Sends the bare interrupt byte. No frame, no ack, and the server
    /// owes no direct reply; whatever stop notification follows arrives
    /// through the normal receive path.
    pub fn send_interrupt(&mut self) -> Result<()> {
        self.stream.send_interrupt_byte()
    }

    /// Receives the next frame according to `wait`. `Ok(None)` is only
    /// returned in [`ReceiveWait::Poll`] mode.
    pub fn receive_packet(&mut self, wait: ReceiveWait) -> Result<Option<Vec<u8>>> {
        let deadline = match wait {
            ReceiveWait::ConfiguredTimeout => Some(Instant::now() + self.receive_timeout),
            _ => None,
        };
        let mut bad_checksums = 0u32;
        loop {
            while self.rx_start < self.rx_end {
                let byte = self.rx[self.rx_start];
                self.rx_start += 1;
                match self.deframer.push(byte)? {
                    Some(DeframeEvent::Frame(payload)) => {
                        if !self.no_ack_mode {
                            self.stream.send(&[ACK_BYTE])?;
                        }
                        return Ok(Some(payload));
                    }
                    Some(DeframeEvent::BadChecksum { computed, received }) => {
                        bad_checksums += 1;
                        tracing::warn!(
                            computed,
                            received,
                            bad_checksums,
                            "discarding frame with bad checksum"
                        );
                        if bad_checksums >= self.max_attempts {
                            return Err(RspError::Protocol(format!(
                                "checksum still bad after {bad_checksums} frames"
                            )));
                        }
                        if !self.no_ack_mode {
                            self.stream.send(&[NAK_BYTE])?;
                        }
                    }
                    None => {}
                }
            }

            let slice = match (wait, deadline) {
                (ReceiveWait::Poll, _) => POLL_SLICE,
                (_, Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RspError::Timeout);
                    }
                    POLL_SLICE.min(deadline - now)
                }
                (_, None) => POLL_SLICE,
            };
            match self.refill(slice) {
                Ok(()) => {}
                Err(RspError::Timeout) => {
                    if self.cancel.load(Ordering::Acquire) {
                        return Err(RspError::Cancelled);
                    }
                    match wait {
                        ReceiveWait::Poll => return Ok(None),
                        ReceiveWait::Forever => {}
                        ReceiveWait::ConfiguredTimeout => {
                            if Instant::now() >= deadline.unwrap_or_else(Instant::now) {
                                return Err(RspError::Timeout);
                            }
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pulls at most one raw byte off the wire with a short wait,
    /// without involving the deframer. Used to drain channels whose
    /// pending output is being discarded.
    pub fn discard_one_byte(&mut self) -> Result<bool> {
        if self.rx_start < self.rx_end {
            self.rx_start += 1;
            return Ok(true);
        }
        let mut probe = [0u8; 1];
        match self.stream.recv(&mut probe, Some(POLL_SLICE)) {
            Ok(_) => Ok(true),
            Err(RspError::Timeout) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn read_ack_byte(&mut self) -> Result<u8> {
        if self.rx_start >= self.rx_end {
            self.refill(self.receive_timeout)?;
        }
        let byte = self.rx[self.rx_start];
        self.rx_start += 1;
        Ok(byte)
    }

    fn unconsume_byte(&mut self) {
        debug_assert!(self.rx_start > 0);
        self.rx_start = self.rx_start.saturating_sub(1);
    }

    fn refill(&mut self, timeout: Duration) -> Result<()> {
        self.rx_start = 0;
        self.rx_end = 0;
        let len = self.max_packet_len.max(64).min(self.rx.len());
        let got = self.stream.recv(&mut self.rx[..len], Some(timeout))?;
        self.rx_end = got;
        Ok(())
    }
}
