//! Client-side primitives for the GDB Remote Serial Protocol.
//!
//! Everything in this crate is sans-I/O: bytes go in, frames and parsed
//! structures come out. Socket handling, acknowledgement timing, and
//! session state live in `exdi-rsp-client`, which drives these types.
//!
//! The wire format is the classic `$<payload>#<2-hex-checksum>` envelope
//! with `{`-escaping for the reserved bytes, an additive 8-bit checksum,
//! and optional inbound run-length compression. See [`frame`] for the
//! codec, [`features`] for `qSupported` reply tokenisation, [`stop_reply`]
//! for halt notifications, [`xfer`] for chunked `qXfer` transfers, and
//! [`target_desc`] for the register-layout document.

pub mod features;
pub mod frame;
pub mod hex;
pub mod stop_reply;
pub mod target_desc;
pub mod xfer;

pub use frame::{
    checksum, encode_frame, escape, unescape, DeframeEvent, Deframer, FrameError, ACK_BYTE,
    ESCAPE_BYTE, FRAME_OVERHEAD, INTERRUPT_BYTE, NAK_BYTE, PACKET_END, PACKET_START,
};
