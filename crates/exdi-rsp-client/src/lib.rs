//! GDB Remote Serial Protocol client for driving kernel-level targets.
//!
//! The entry point is [`Controller::connect`]: it dials every configured
//! channel, runs the capability handshake, builds the register model
//! (amending it from the server's target description when one is
//! offered), and leaves the session halted and ready for commands.
//! Memory, register, thread, breakpoint, and monitor operations are
//! synchronous; step and continue run on a background worker and are
//! collected with [`Controller::wait_for_stop`].
//!
//! The crate deliberately has no opinion about the debugger on top: the
//! façade supplies a [`TargetConfig`] snapshot and a [`TraceSink`], and
//! consumes the structured results.

pub mod arch;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod framer;
pub mod orchestrator;
pub mod registers;
pub mod stream;
pub mod trace;

pub use arch::Architecture;
pub use capabilities::{Capability, CapabilityTable};
pub use client::{InterruptScope, RspClient, SessionStatus};
pub use config::{AccessCodeSeed, CapabilityOverride, RegisterSeed, TargetConfig};
pub use controller::{
    AddressClass, CommandOutcome, Controller, Reply, SessionState, StopKind, StopReply,
};
pub use error::{Result, RspError};
pub use framer::ReceiveWait;
pub use registers::{RegisterDescriptor, RegisterGroup, RegisterModel, RegisterValue};
pub use trace::{LogTraceSink, NullTraceSink, PacketDirection, TraceSink};
