//! Session-level error type.
//!
//! Lower layers surface transport and framing failures; the controller
//! adds target-reported errors and policy decisions on top. Which
//! variants a given operation can produce is part of that operation's
//! contract, not of this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RspError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed or reset the connection.
    #[error("connection to the target was lost")]
    ConnectionLost,

    #[error("timed out waiting for the target")]
    Timeout,

    /// Malformed framing, or a checksum that stayed bad through every
    /// resend attempt.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The target answered `E nn`.
    #[error("target reported error {code:#04x}")]
    Server { code: u8 },

    /// The target answered with an empty packet: the command is not
    /// implemented on that server.
    #[error("packet not supported by the target")]
    Unsupported,

    /// The session interrupt event fired while the operation was waiting.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A reply outgrew the negotiated packet budget.
    #[error("reply exceeds the {limit}-byte packet budget")]
    ReplyTooLarge { limit: usize },
}

impl RspError {
    /// True for failures worth one more attempt: transient transport
    /// conditions, not target verdicts.
    pub fn is_transient(&self) -> bool {
        matches!(self, RspError::Timeout | RspError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, RspError>;

impl From<exdi_rsp_protocol::FrameError> for RspError {
    fn from(err: exdi_rsp_protocol::FrameError) -> Self {
        match err {
            exdi_rsp_protocol::FrameError::PayloadTooLarge { limit } => {
                RspError::ReplyTooLarge { limit }
            }
            other => RspError::Protocol(other.to_string()),
        }
    }
}
