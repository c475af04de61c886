//! The per-channel byte transport.
//!
//! One TCP stream per channel, blocking, with distinct send and receive
//! timeouts. Readiness is probed with a bounded one-byte peek, which is
//! also how a silently dropped connection is detected: a readable socket
//! that peeks zero bytes is gone. A cloned handle allows the interrupt
//! byte to be written while another thread is blocked reading.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Result, RspError};

bitflags! {
    /// Outcome of a readiness probe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadyFlags: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERROR = 1 << 2;
    }
}

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct ByteStream {
    stream: TcpStream,
    /// Write-side clone used for the out-of-band interrupt byte.
    oob: TcpStream,
    peer: String,
    receive_timeout: Duration,
}

impl ByteStream {
    /// Connects to `peer` (`host:port`), retrying transient failures up
    /// to `attempts` times with a short delay between tries.
    pub fn connect(
        peer: &str,
        attempts: u32,
        send_timeout: Duration,
        receive_timeout: Duration,
    ) -> Result<ByteStream> {
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            match TcpStream::connect(peer) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(Some(send_timeout))?;
                    stream.set_read_timeout(Some(receive_timeout))?;
                    let oob = stream.try_clone()?;
                    tracing::debug!(peer, attempt, "channel connected");
                    return Ok(ByteStream {
                        stream,
                        oob,
                        peer: peer.to_string(),
                        receive_timeout,
                    });
                }
                Err(err) => {
                    tracing::debug!(peer, attempt, %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => RspError::Io(err),
            None => RspError::InvalidArgument(format!("no connect attempts for {peer}")),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Writes the whole buffer or fails.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match self.stream.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(err) => Err(map_io(err)),
        }
    }

    /// Reads into `buf`, honouring the given timeout (or the configured
    /// receive timeout when `None`). Zero bytes means the peer closed.
    pub fn recv(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if let Some(timeout) = timeout {
            self.stream.set_read_timeout(Some(timeout))?;
        }
        let outcome = self.stream.read(buf);
        if timeout.is_some() {
            self.stream.set_read_timeout(Some(self.receive_timeout))?;
        }
        match outcome {
            Ok(0) => Err(RspError::ConnectionLost),
            Ok(n) => Ok(n),
            Err(err) => Err(map_io(err)),
        }
    }

    /// Non-destructive readiness probe with a bounded wait.
    pub fn ready(&mut self, timeout: Duration) -> Result<ReadyFlags> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut probe = [0u8; 1];
        let outcome = self.stream.peek(&mut probe);
        self.stream.set_read_timeout(Some(self.receive_timeout))?;
        match outcome {
            Ok(0) => Err(RspError::ConnectionLost),
            Ok(_) => Ok(ReadyFlags::READABLE),
            Err(err) if is_timeout(&err) => Ok(ReadyFlags::empty()),
            Err(err) if is_disconnect(&err) => Err(RspError::ConnectionLost),
            Err(err) => Err(RspError::Io(err)),
        }
    }

    /// Writes the single interrupt byte through the out-of-band handle.
    /// Safe to call while another thread is blocked in [`recv`].
    pub fn send_interrupt_byte(&self) -> Result<()> {
        (&self.oob).write_all(&[exdi_rsp_protocol::INTERRUPT_BYTE])?;
        Ok(())
    }

    /// A second out-of-band write handle for callers that must interrupt
    /// without reaching the stream itself.
    pub fn interrupt_handle(&self) -> Result<TcpStream> {
        Ok(self.oob.try_clone()?)
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

fn map_io(err: std::io::Error) -> RspError {
    if is_timeout(&err) {
        RspError::Timeout
    } else if is_disconnect(&err) {
        RspError::ConnectionLost
    } else {
        RspError::Io(err)
    }
}
