//! The per-target client: channel ownership, negotiation, and the
//! send/receive primitives everything else is built on.
//!
//! One channel per core in multi-core sessions, a single shared channel
//! otherwise. All channel state lives behind one session mutex; a framed
//! exchange holds the lock end to end, which is what gives each channel
//! FIFO reply ordering. The interrupt path deliberately bypasses the
//! mutex: it only touches the out-of-band stream handles and the shared
//! interrupt event, so it can fire while a receive is parked.

use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use exdi_rsp_protocol::target_desc::{self, TargetDescription};
use exdi_rsp_protocol::xfer;

use crate::capabilities::{Capability, CapabilityTable};
use crate::config::TargetConfig;
use crate::error::{Result, RspError};
use crate::framer::{Framer, ReceiveWait};
use crate::stream::ByteStream;
use crate::trace::{PacketDirection, TraceSink};

/// Which channels an interrupt is fanned out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptScope {
    All,
    AllExcept(usize),
}

/// Health probe verdict for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ok,
    ConnectionLost,
    IoError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Connected,
    Lost,
}

/// Pause after fanning out interrupt bytes, giving the server room to
/// emit its stop reply through the normal receive path.
const INTERRUPT_SETTLE: Duration = Duration::from_millis(200);

/// Upper bound on a reassembled target-description document.
const MAX_FEATURES_DOCUMENT: usize = 1 << 20;

struct Channel {
    framer: Framer,
    state: ChannelState,
}

struct ClientInner {
    channels: Vec<Channel>,
    capabilities: CapabilityTable,
    last_active_core: usize,
}

pub struct RspClient {
    inner: Mutex<ClientInner>,
    /// Out-of-band write handles, index-aligned with the channels.
    oob: Vec<TcpStream>,
    interrupt_event: Arc<AtomicBool>,
    config: TargetConfig,
    trace: Arc<dyn TraceSink>,
}

impl RspClient {
    /// Connects every configured channel. Fails if any connection cannot
    /// be established within its retry budget.
    pub fn connect(config: TargetConfig, trace: Arc<dyn TraceSink>) -> Result<RspClient> {
        if config.core_connections.is_empty() {
            return Err(RspError::InvalidArgument(
                "configuration names no core connections".to_string(),
            ));
        }
        let interrupt_event = Arc::new(AtomicBool::new(false));
        let send_timeout = Duration::from_millis(config.send_timeout_ms);
        let receive_timeout = Duration::from_millis(config.receive_timeout_ms);

        let mut channels = Vec::with_capacity(config.core_connections.len());
        let mut oob = Vec::with_capacity(config.core_connections.len());
        for peer in &config.core_connections {
            let stream =
                ByteStream::connect(peer, config.connect_attempts, send_timeout, receive_timeout)?;
            oob.push(stream.interrupt_handle()?);
            channels.push(Channel {
                framer: Framer::new(
                    stream,
                    config.max_packet_length,
                    config.connect_attempts,
                    receive_timeout,
                    interrupt_event.clone(),
                ),
                state: ChannelState::Connected,
            });
        }

        Ok(RspClient {
            inner: Mutex::new(ClientInner {
                channels,
                capabilities: CapabilityTable::default(),
                last_active_core: 0,
            }),
            oob,
            interrupt_event,
            config,
            trace,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn is_multi_channel(&self) -> bool {
        self.config.multi_core_sessions && self.channel_count() > 1
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn capabilities(&self) -> CapabilityTable {
        self.lock().capabilities.clone()
    }

    pub fn last_active_core(&self) -> usize {
        self.lock().last_active_core
    }

    /// Runs the capability handshake on every channel: optional agent
    /// hello, `qSupported`, ack-mode negotiation, packet-size adoption,
    /// and configuration overrides. Any failure is fatal for the session.
    pub fn negotiate(&self) -> Result<()> {
        let channel_count = self.channel_count();
        for channel in 0..channel_count {
            if let Some(hello) = self.config.agent_name_packet.clone() {
                match self.exchange(channel, &hello, ReceiveWait::ConfiguredTimeout)? {
                    Some(reply) if reply.starts_with('E') => {
                        return Err(RspError::Protocol(format!(
                            "agent hello rejected with {reply:?}"
                        )))
                    }
                    _ => {}
                }
            }

            let packet = self
                .config
                .q_supported_packet
                .clone()
                .unwrap_or_else(|| "qSupported".to_string());
            let reply = self
                .exchange(channel, &packet, ReceiveWait::ConfiguredTimeout)?
                .ok_or(RspError::Timeout)?;
            {
                let mut inner = self.lock();
                inner.capabilities.update_from_qsupported(&reply);
            }
        }

        let want_no_ack = {
            let inner = self.lock();
            inner.capabilities.is_enabled(Capability::NoAckMode)
        } || self.config.no_ack_enabled_by_config;
        if want_no_ack {
            for channel in 0..channel_count {
                let reply = self.exchange(channel, "QStartNoAckMode", ReceiveWait::ConfiguredTimeout)?;
                if reply.as_deref() == Some("OK") {
                    self.lock().channels[channel].framer.set_no_ack_mode(true);
                } else {
                    tracing::warn!(channel, ?reply, "server declined QStartNoAckMode");
                }
            }
        }

        {
            let mut inner = self.lock();
            for seed in &self.config.capability_overrides {
                match Capability::from_wire_name(&seed.name) {
                    Some(capability) => inner.capabilities.set_enabled(capability, seed.enabled),
                    None => tracing::warn!(name = %seed.name, "unknown capability override"),
                }
            }
            if self.config.pa_memory_required {
                inner
                    .capabilities
                    .set_enabled(Capability::PhysicalMemoryMode, true);
            }
            let packet_size = inner.capabilities.packet_size();
            for channel in inner.channels.iter_mut() {
                channel.framer.set_max_packet_len(packet_size);
            }
        }

        self.trace.diagnostic("capability negotiation complete");
        Ok(())
    }

    /// Sends one command and returns its reply, atomically with respect
    /// to other exchanges on the session.
    pub fn exchange(
        &self,
        channel: usize,
        payload: &str,
        wait: ReceiveWait,
    ) -> Result<Option<String>> {
        let mut inner = self.lock();
        self.send_locked(&mut inner, channel, payload, true)?;
        self.receive_locked(&mut inner, channel, wait)
    }

    /// Sends without waiting for the reply. `await_ack` is false only
    /// for fire-and-forget packets.
    pub fn send(&self, channel: usize, payload: &str, await_ack: bool) -> Result<()> {
        let mut inner = self.lock();
        self.send_locked(&mut inner, channel, payload, await_ack)
    }

    /// Broadcasts one command to every connected channel, in order.
    pub fn send_all(&self, payload: &str) -> Result<()> {
        let mut inner = self.lock();
        let channels = inner.channels.len();
        for channel in 0..channels {
            self.send_locked(&mut inner, channel, payload, true)?;
        }
        Ok(())
    }

    /// Receives the next frame from one channel.
    pub fn receive(&self, channel: usize, wait: ReceiveWait) -> Result<Option<String>> {
        let mut inner = self.lock();
        self.receive_locked(&mut inner, channel, wait)
    }

    /// Polls all channels round-robin, starting after the last known
    /// active core, until any of them produces a frame. The winning
    /// channel becomes the new last active core. With `forever` unset the
    /// configured receive timeout bounds the whole poll.
    ///
    /// The session lock is taken per poll slice, not across the whole
    /// wait, so interrupts and health probes stay responsive.
    pub fn receive_any(&self, forever: bool) -> Result<(usize, String)> {
        let deadline = if forever {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(self.config.receive_timeout_ms))
        };
        let channel_count = self.channel_count();
        let mut rotation = self.lock().last_active_core;
        loop {
            let mut alive = 0;
            for step in 0..channel_count {
                let channel = (rotation + step) % channel_count;
                let mut inner = self.lock();
                if inner.channels[channel].state != ChannelState::Connected {
                    continue;
                }
                alive += 1;
                match self.receive_locked(&mut inner, channel, ReceiveWait::Poll)? {
                    Some(payload) => {
                        inner.last_active_core = channel;
                        return Ok((channel, payload));
                    }
                    None => {}
                }
            }
            if alive == 0 {
                return Err(RspError::ConnectionLost);
            }
            rotation = (rotation + 1) % channel_count;
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(RspError::Timeout);
                }
            }
        }
    }

    /// Quiesces every channel except `winner` after a broadcast: any
    /// pending byte is drained and an interrupt byte is sent so the core
    /// parks in a known state, then the framer is reset.
    pub fn discard_pending_except(&self, winner: usize) {
        let mut inner = self.lock();
        let channels = inner.channels.len();
        for channel in 0..channels {
            if channel == winner || inner.channels[channel].state != ChannelState::Connected {
                continue;
            }
            let framer = &mut inner.channels[channel].framer;
            if let Err(err) = framer.discard_one_byte() {
                tracing::debug!(channel, %err, "discard probe failed");
            }
            if let Err(err) = framer.send_interrupt() {
                tracing::debug!(channel, %err, "quiesce interrupt failed");
            }
            framer.reset();
        }
    }

    /// Sends the interrupt byte to the selected channels and raises the
    /// session interrupt event. Failures are logged, never fatal: an
    /// interrupt that cannot be delivered is indistinguishable from one
    /// the server ignored.
    pub fn interrupt(&self, scope: InterruptScope) {
        self.interrupt_event.store(true, Ordering::Release);
        for (channel, handle) in self.oob.iter().enumerate() {
            if let InterruptScope::AllExcept(excluded) = scope {
                if channel == excluded {
                    continue;
                }
            }
            if let Err(err) = (&*handle).write_all(&[exdi_rsp_protocol::INTERRUPT_BYTE]) {
                tracing::warn!(channel, %err, "failed to deliver interrupt byte");
            }
        }
        std::thread::sleep(INTERRUPT_SETTLE);
    }

    /// True while the session interrupt event is raised.
    pub fn interrupt_pending(&self) -> bool {
        self.interrupt_event.load(Ordering::Acquire)
    }

    /// Lowers the interrupt event once its consequences are handled.
    pub fn clear_interrupt(&self) {
        self.interrupt_event.store(false, Ordering::Release);
    }

    /// Health probe between commands: detects silent disconnects without
    /// consuming pending data.
    pub fn session_status(&self, channel: usize) -> SessionStatus {
        let mut inner = self.lock();
        let Some(entry) = inner.channels.get_mut(channel) else {
            return SessionStatus::IoError;
        };
        if entry.state != ChannelState::Connected {
            return SessionStatus::ConnectionLost;
        }
        match entry.framer.stream().ready(Duration::from_millis(1)) {
            Ok(_) => SessionStatus::Ok,
            Err(RspError::ConnectionLost) => {
                entry.state = ChannelState::Lost;
                SessionStatus::ConnectionLost
            }
            Err(_) => SessionStatus::IoError,
        }
    }

    /// Fetches and parses the target description advertised through
    /// `qXfer:features:read`, following includes breadth-first. Returns
    /// `(file name, parsed document)` pairs, root document first.
    pub fn fetch_target_description(&self) -> Result<Vec<(String, TargetDescription)>> {
        let root = self.config.target_description_file.clone();
        let mut pending: VecDeque<String> = VecDeque::from([root]);
        let mut fetched: Vec<(String, TargetDescription)> = Vec::new();
        while let Some(name) = pending.pop_front() {
            if fetched.iter().any(|(seen, _)| *seen == name) {
                continue;
            }
            let text = self.read_features_document(&name)?;
            let parsed = target_desc::parse(&text);
            for include in &parsed.includes {
                pending.push_back(include.clone());
            }
            fetched.push((name, parsed));
        }
        Ok(fetched)
    }

    fn read_features_document(&self, name: &str) -> Result<String> {
        let window = {
            let inner = self.lock();
            (inner.capabilities.packet_size().saturating_sub(4)).max(1)
        };
        let mut document = String::new();
        let mut offset = 0usize;
        loop {
            let command = format!("qXfer:features:read:{name}:{offset:x},{window:x}");
            let reply = self
                .exchange(0, &command, ReceiveWait::ConfiguredTimeout)?
                .ok_or(RspError::Timeout)?;
            if reply.is_empty() {
                return Err(RspError::Unsupported);
            }
            if let Some(code) = reply.strip_prefix('E') {
                let code = u8::from_str_radix(code.trim(), 16).unwrap_or(0xff);
                return Err(RspError::Server { code });
            }
            let chunk = xfer::parse_chunk(&reply).ok_or_else(|| {
                RspError::Protocol(format!("unexpected qXfer reply {reply:?}"))
            })?;
            document.push_str(chunk.data());
            if document.len() > MAX_FEATURES_DOCUMENT {
                return Err(RspError::ReplyTooLarge {
                    limit: MAX_FEATURES_DOCUMENT,
                });
            }
            offset += chunk.data().len();
            if chunk.is_last() {
                return Ok(document);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn send_locked(
        &self,
        inner: &mut ClientInner,
        channel: usize,
        payload: &str,
        await_ack: bool,
    ) -> Result<()> {
        let entry = inner.channels.get_mut(channel).ok_or_else(|| {
            RspError::InvalidArgument(format!("channel {channel} does not exist"))
        })?;
        if entry.state != ChannelState::Connected {
            return Err(RspError::ConnectionLost);
        }
        if self.config.display_comm_packets {
            self.trace.packet(channel, PacketDirection::Sent, payload);
        }
        match entry.framer.send_packet(payload.as_bytes(), await_ack) {
            Ok(()) => Ok(()),
            Err(RspError::ConnectionLost) => {
                entry.state = ChannelState::Lost;
                Err(RspError::ConnectionLost)
            }
            Err(err) => Err(err),
        }
    }

    fn receive_locked(
        &self,
        inner: &mut ClientInner,
        channel: usize,
        wait: ReceiveWait,
    ) -> Result<Option<String>> {
        let entry = inner.channels.get_mut(channel).ok_or_else(|| {
            RspError::InvalidArgument(format!("channel {channel} does not exist"))
        })?;
        if entry.state != ChannelState::Connected {
            return Err(RspError::ConnectionLost);
        }
        match entry.framer.receive_packet(wait) {
            Ok(Some(payload)) => {
                let text = String::from_utf8_lossy(&payload).into_owned();
                if self.config.display_comm_packets {
                    self.trace.packet(channel, PacketDirection::Received, &text);
                }
                Ok(Some(text))
            }
            Ok(None) => Ok(None),
            Err(RspError::ConnectionLost) => {
                entry.state = ChannelState::Lost;
                Err(RspError::ConnectionLost)
            }
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for RspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RspClient")
            .field("channels", &self.oob.len())
            .field("interrupt_pending", &self.interrupt_pending())
            .finish()
    }
}
