//! Diagnostic sink for packet traffic and target console output.
//!
//! The façade usually routes this into the debugger's own output window;
//! the default implementation forwards to `tracing` so standalone use
//! still produces something observable.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Sent,
    Received,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Sent => write!(f, "->"),
            PacketDirection::Received => write!(f, "<-"),
        }
    }
}

/// Borrowed interface between the session and its diagnostics consumer.
/// Implementations must tolerate calls from the orchestrator worker as
/// well as the caller thread.
pub trait TraceSink: Send + Sync {
    /// One framed payload crossing a channel, already decoded.
    fn packet(&self, _channel: usize, _direction: PacketDirection, _payload: &str) {}

    /// Console text the target pushed through an `O` packet.
    fn console(&self, _text: &str) {}

    /// Session-level diagnostics (negotiation milestones, policy hits).
    fn diagnostic(&self, _text: &str) {}
}

/// Forwards everything to `tracing` at debug/trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn packet(&self, channel: usize, direction: PacketDirection, payload: &str) {
        tracing::trace!(channel, %direction, payload, "rsp packet");
    }

    fn console(&self, text: &str) {
        tracing::debug!(text, "target console");
    }

    fn diagnostic(&self, text: &str) {
        tracing::debug!(text, "session");
    }
}

/// Discards everything. Useful for tests that assert on behaviour, not
/// on diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {}
