//! The session controller: command construction, reply policy, and the
//! operations the debugger façade calls.
//!
//! Everything below sits on top of the client's framed exchanges. The
//! controller is where policy lives: partial memory transfers are
//! success, register transfers are all-or-nothing, thread selection
//! retries transient failures, and run control moves the session state
//! machine.

use std::sync::Arc;
use std::time::Duration;

use exdi_rsp_protocol::hex;
use exdi_rsp_protocol::stop_reply::{self, StopPacket};

use crate::arch::{self, Architecture};
use crate::capabilities::Capability;
use crate::client::{InterruptScope, RspClient, SessionStatus};
use crate::config::TargetConfig;
use crate::error::{Result, RspError};
use crate::framer::ReceiveWait;
use crate::orchestrator::{AsyncOrchestrator, AsyncOutcome, CommandScope};
use crate::registers::{RegisterModel, RegisterValue};
use crate::trace::TraceSink;

/// Classified command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    /// `E nn`.
    Error(u8),
    /// A stop notification carrying thread and program-counter detail.
    Stop(StopReply),
    /// Decoded `O` console text.
    Console(String),
    /// `W nn`.
    ProcessExit(u8),
    /// The empty packet: command unsupported by this server.
    Empty,
    Raw(String),
}

/// Which packet shape a stop reply arrived as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// `S nn`.
    Signal,
    /// `T nn ...` with detail fields.
    Detailed,
    /// `W nn`.
    Exited,
    /// A bare `OK` accepted in place of a stop reply.
    Synthetic,
}

/// A fully interpreted stop notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReply {
    pub kind: StopKind,
    pub signal: u8,
    /// Logical core index, resolved through the thread table.
    pub thread_index: Option<u32>,
    pub pc: Option<u64>,
}

impl StopReply {
    /// `S00` is the idiom for target power-down.
    pub fn is_power_down(&self) -> bool {
        self.kind == StopKind::Signal && self.signal == 0
    }
}

/// Memory access class. The wire verb depends on the class and on which
/// server extensions were negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Virtual,
    Physical,
    Supervisor,
    Hypervisor,
    /// SPR/CP15-style register space addressed as memory.
    SpecialRegister,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Negotiated,
    Halted,
    Running,
}

/// Result of one command exchange. An interrupted command is not an
/// error: the caller sees an empty reply and the flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub text: String,
    pub interrupted: bool,
}

/// Internal monitor commands handled without the server (or with a
/// translated packet), recognised by prefix of the monitor text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalCommand {
    /// Telemetry probe: reports the configured server identity.
    ServerIdentity,
    /// `info registers system [-v]`.
    SystemRegisters { verbose: bool },
    /// `SetPAMemoryMode`: switches the server to physical addressing.
    SetPaMemoryMode,
}

impl InternalCommand {
    fn parse(text: &str) -> Option<InternalCommand> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("serveridentity") {
            return Some(InternalCommand::ServerIdentity);
        }
        if trimmed.eq_ignore_ascii_case("SetPAMemoryMode") {
            return Some(InternalCommand::SetPaMemoryMode);
        }
        if let Some(rest) = trimmed.strip_prefix("info registers system") {
            let rest = rest.trim();
            let verbose = rest == "-v";
            if rest.is_empty() || verbose {
                return Some(InternalCommand::SystemRegisters { verbose });
            }
        }
        None
    }
}

pub struct Controller {
    client: Arc<RspClient>,
    orchestrator: AsyncOrchestrator,
    registers: RegisterModel,
    /// Server-side thread id strings; index = logical core number.
    threads: Vec<String>,
    state: SessionState,
    pa_memory_mode: bool,
    trace: Arc<dyn TraceSink>,
}

impl Controller {
    /// Connects, negotiates, builds the register model (amended from the
    /// target description when available), discovers threads, and reads
    /// the initial halt reason. Most servers start halted; when this one
    /// does, the session comes up in [`SessionState::Halted`].
    pub fn connect(config: TargetConfig, trace: Arc<dyn TraceSink>) -> Result<Controller> {
        let client = Arc::new(RspClient::connect(config, trace.clone())?);
        client.negotiate()?;

        let mut registers = RegisterModel::from_config(client.config())?;
        if client.capabilities().is_enabled(Capability::TargetFeatures) {
            match client.fetch_target_description() {
                Ok(docs) => registers.amend_from_description(&docs)?,
                Err(RspError::Unsupported) => {
                    tracing::debug!("server advertises qXfer but answered empty");
                }
                Err(err) => return Err(err),
            }
        }

        let orchestrator = AsyncOrchestrator::new(client.clone())?;
        let mut controller = Controller {
            client,
            orchestrator,
            registers,
            threads: Vec::new(),
            state: SessionState::Negotiated,
            pa_memory_mode: false,
            trace,
        };

        if controller.client.config().pa_memory_required {
            controller.ensure_pa_memory_mode()?;
        }
        controller.enumerate_threads()?;
        match controller.halt_reason() {
            Ok(_) => {}
            Err(RspError::Unsupported) | Err(RspError::Timeout) => {
                tracing::debug!("server did not report an initial halt reason");
            }
            Err(err) => return Err(err),
        }
        Ok(controller)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capabilities(&self) -> crate::capabilities::CapabilityTable {
        self.client.capabilities()
    }

    pub fn registers(&self) -> &RegisterModel {
        &self.registers
    }

    pub fn architecture(&self) -> Architecture {
        self.registers.architecture()
    }

    /// Discovered processor count: thread-table cardinality.
    pub fn processor_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_ids(&self) -> &[String] {
        &self.threads
    }

    pub fn session_status(&self, core: usize) -> SessionStatus {
        self.client.session_status(self.channel_for_core(core))
    }

    /// Sends one command and returns the raw reply. A user interrupt
    /// during the wait yields an empty, `interrupted` outcome instead of
    /// an error.
    pub fn execute(&mut self, command: &str, channel: usize) -> Result<CommandOutcome> {
        match self
            .client
            .exchange(channel, command, ReceiveWait::ConfiguredTimeout)
        {
            Ok(Some(text)) => Ok(CommandOutcome {
                text,
                interrupted: false,
            }),
            Ok(None) => Err(RspError::Timeout),
            Err(RspError::Cancelled) => {
                self.client.clear_interrupt();
                Ok(CommandOutcome {
                    text: String::new(),
                    interrupted: true,
                })
            }
            Err(RspError::ConnectionLost) => {
                self.state = SessionState::Disconnected;
                Err(RspError::ConnectionLost)
            }
            Err(err) => Err(err),
        }
    }

    /// Classifies a raw reply payload. Stop classification requires both
    /// the `thread:` field and the current architecture's program-counter
    /// order, so hex blobs that merely begin with `T` stay raw.
    pub fn classify(&self, reply: &str) -> Reply {
        if reply.is_empty() {
            return Reply::Empty;
        }
        if reply == "OK" {
            return Reply::Ok;
        }
        if let Some(code) = parse_error_reply(reply) {
            return Reply::Error(code);
        }
        if let Some(status) = reply
            .strip_prefix('W')
            .and_then(|rest| u8::from_str_radix(rest, 16).ok())
        {
            return Reply::ProcessExit(status);
        }
        if reply.starts_with('O') {
            if let Some(StopPacket::Console { hex: text }) = stop_reply::parse(reply) {
                if let Some(bytes) = stop_reply::decode_console(text) {
                    return Reply::Console(String::from_utf8_lossy(&bytes).into_owned());
                }
            }
        }
        if reply.starts_with('T') || reply.starts_with('S') {
            let pc_marker = format!("{}:", self.registers.pc().order);
            if reply.contains("thread:") && reply.contains(&pc_marker) {
                if let Some(stop) = self.interpret_stop(reply) {
                    return Reply::Stop(stop);
                }
            }
        }
        Reply::Raw(reply.to_string())
    }

    // ---- memory ---------------------------------------------------------

    /// Reads `size` bytes from `address`, issuing as many packets as the
    /// negotiated packet size requires. Partial data is returned as-is;
    /// an immediate failure only raises when configuration demands it.
    pub fn read_memory(
        &mut self,
        address: u64,
        size: usize,
        class: AddressClass,
    ) -> Result<Vec<u8>> {
        let budget = self.read_chunk_budget();
        let channel = self.command_channel();
        let mut out = Vec::with_capacity(size);
        let mut address = address;
        let mut failure: Option<RspError> = None;

        while out.len() < size {
            let request = (size - out.len()).min(budget);
            let command = self.memory_read_command(class, address, request)?;
            let outcome = self.execute(&command, channel)?;
            if outcome.interrupted {
                break;
            }
            match self.classify(&outcome.text) {
                Reply::Error(code) => {
                    failure = Some(RspError::Server { code });
                    break;
                }
                Reply::Empty => {
                    failure = Some(RspError::Unsupported);
                    break;
                }
                Reply::Raw(data) => {
                    let bytes = hex::decode_prefix(&data);
                    if bytes.is_empty() {
                        failure = Some(RspError::Protocol(format!(
                            "memory reply carries no data: {data:?}"
                        )));
                        break;
                    }
                    address += bytes.len() as u64;
                    out.extend_from_slice(&bytes);
                }
                other => {
                    failure = Some(RspError::Protocol(format!(
                        "unexpected memory reply {other:?}"
                    )));
                    break;
                }
            }
        }

        if out.is_empty() {
            if let Some(err) = failure {
                if self.client.config().throw_on_memory_error {
                    return Err(err);
                }
                self.trace
                    .diagnostic(&format!("memory read at {address:#x} failed: {err}"));
            }
        }
        Ok(out)
    }

    /// Writes `data` to `address` in packet-size-bounded chunks. Stops at
    /// the first error; whether that error is reported is a
    /// configuration decision.
    pub fn write_memory(&mut self, address: u64, data: &[u8], class: AddressClass) -> Result<()> {
        let budget = self.write_chunk_budget();
        let channel = self.command_channel();
        let mut offset = 0usize;

        while offset < data.len() {
            let chunk = &data[offset..(offset + budget).min(data.len())];
            let command =
                self.memory_write_command(class, address + offset as u64, chunk)?;
            let outcome = self.execute(&command, channel)?;
            if outcome.interrupted {
                return Ok(());
            }
            match self.classify(&outcome.text) {
                Reply::Ok => offset += chunk.len(),
                Reply::Error(code) => {
                    let err = RspError::Server { code };
                    if self.client.config().report_write_errors {
                        return Err(err);
                    }
                    self.trace
                        .diagnostic(&format!("memory write at {address:#x} failed: {err}"));
                    return Ok(());
                }
                Reply::Empty => return Err(RspError::Unsupported),
                other => {
                    return Err(RspError::Protocol(format!(
                        "unexpected memory-write reply {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    // ---- registers ------------------------------------------------------

    /// Reads the whole core group with one `g` packet. Register state is
    /// all-or-nothing: any failure raises.
    pub fn read_register_group(&mut self, core: usize) -> Result<Vec<RegisterValue>> {
        self.select_thread('g', core)?;
        let channel = self.channel_for_core(core);
        let outcome = self.execute("g", channel)?;
        if outcome.interrupted {
            return Err(RspError::Cancelled);
        }
        match self.classify(&outcome.text) {
            Reply::Error(code) => Err(RspError::Server { code }),
            Reply::Empty => Err(RspError::Unsupported),
            Reply::Raw(dump) => self.registers.split_core_dump(&dump),
            other => Err(RspError::Protocol(format!(
                "unexpected register dump {other:?}"
            ))),
        }
    }

    /// Writes the whole core group with one `G` packet.
    pub fn write_register_group(&mut self, core: usize, values: &[RegisterValue]) -> Result<()> {
        self.select_thread('g', core)?;
        let dump = self.registers.build_core_dump(values)?;
        let channel = self.channel_for_core(core);
        let outcome = self.execute(&format!("G{dump}"), channel)?;
        self.expect_ok(&outcome, "G")
    }

    /// Reads one register by name via `p<order>`.
    pub fn read_register(&mut self, name: &str, core: usize) -> Result<RegisterValue> {
        let (order, size) = {
            let reg = self.registers.find(name).ok_or_else(|| {
                RspError::InvalidArgument(format!("unknown register {name}"))
            })?;
            (reg.order.clone(), reg.size_bytes)
        };
        self.select_thread('g', core)?;
        let channel = self.channel_for_core(core);
        let outcome = self.execute(&format!("p{order}"), channel)?;
        if outcome.interrupted {
            return Err(RspError::Cancelled);
        }
        match self.classify(&outcome.text) {
            Reply::Error(code) => Err(RspError::Server { code }),
            Reply::Empty => Err(RspError::Unsupported),
            Reply::Raw(data) => {
                let mut value = hex::decode(&data).ok_or_else(|| {
                    RspError::Protocol(format!("register reply is not hex: {data:?}"))
                })?;
                value.truncate(size);
                value.reverse();
                Ok(RegisterValue {
                    name: name.to_string(),
                    value,
                })
            }
            other => Err(RspError::Protocol(format!(
                "unexpected register reply {other:?}"
            ))),
        }
    }

    /// Writes one register by name via `P<order>=<hex>`.
    pub fn write_register(&mut self, name: &str, core: usize, value: &[u8]) -> Result<()> {
        let order = {
            let reg = self.registers.find(name).ok_or_else(|| {
                RspError::InvalidArgument(format!("unknown register {name}"))
            })?;
            if value.len() != reg.size_bytes {
                return Err(RspError::InvalidArgument(format!(
                    "{name} takes {} bytes, got {}",
                    reg.size_bytes,
                    value.len()
                )));
            }
            reg.order.clone()
        };
        self.select_thread('g', core)?;
        let mut wire = value.to_vec();
        wire.reverse();
        let channel = self.channel_for_core(core);
        let outcome = self.execute(&format!("P{order}={}", hex::encode(&wire)), channel)?;
        self.expect_ok(&outcome, "P")
    }

    /// Reads a system register through whichever mechanism the session
    /// negotiated: OpenOCD monitor access, Trace32 register space, or a
    /// plain `p` when the target description mapped the register.
    pub fn read_system_register(&mut self, code: u32, core: usize) -> Result<u64> {
        let caps = self.client.capabilities();
        if caps.is_enabled(Capability::OpenOcdSystemRegisters)
            && self.architecture() == Architecture::Arm64
        {
            let (op0, op1, crn, crm, op2) = arch::decode_system_coordinates(code);
            let text = self.monitor(&format!("aarch64 mrs nsec {op0} {op1} {crn} {crm} {op2}"))?;
            return first_number(&text).ok_or_else(|| {
                RspError::Protocol(format!("no value in monitor reply {text:?}"))
            });
        }
        if caps.is_enabled(Capability::Trace32Memory) {
            let width = self.architecture().pointer_bytes();
            let bytes =
                self.read_memory(u64::from(code), width, AddressClass::SpecialRegister)?;
            if bytes.is_empty() {
                return Err(RspError::Unsupported);
            }
            return Ok(le_bytes_to_u64(&bytes));
        }
        let name = {
            let reg = self.registers.by_access_code(code).ok_or_else(|| {
                RspError::InvalidArgument(format!("no register mapped to access code {code:#x}"))
            })?;
            reg.name.clone()
        };
        let value = self.read_register(&name, core)?;
        Ok(be_bytes_to_u64(&value.value))
    }

    /// Writes a system register; mechanisms mirror
    /// [`read_system_register`].
    pub fn write_system_register(&mut self, code: u32, core: usize, value: u64) -> Result<()> {
        let caps = self.client.capabilities();
        if caps.is_enabled(Capability::OpenOcdSystemRegisters)
            && self.architecture() == Architecture::Arm64
        {
            let (op0, op1, crn, crm, op2) = arch::decode_system_coordinates(code);
            self.monitor(&format!(
                "aarch64 msr nsec {op0} {op1} {crn} {crm} {op2} {value:#x}"
            ))?;
            return Ok(());
        }
        if caps.is_enabled(Capability::Trace32Memory) {
            let width = self.architecture().pointer_bytes();
            let bytes = value.to_le_bytes();
            return self.write_memory(
                u64::from(code),
                &bytes[..width],
                AddressClass::SpecialRegister,
            );
        }
        let (name, size) = {
            let reg = self.registers.by_access_code(code).ok_or_else(|| {
                RspError::InvalidArgument(format!("no register mapped to access code {code:#x}"))
            })?;
            (reg.name.clone(), reg.size_bytes)
        };
        let host = value.to_be_bytes();
        let host = &host[host.len() - size.min(8)..];
        self.write_register(&name, core, host)
    }

    // ---- threads and run control ---------------------------------------

    /// Populates the thread table via `qfThreadInfo`/`qsThreadInfo`.
    /// Multi-channel sessions skip the query (each per-core server only
    /// knows itself), and servers without thread info fall back to one
    /// thread per channel.
    pub fn enumerate_threads(&mut self) -> Result<usize> {
        if self.client.is_multi_channel() {
            let count = self.client.channel_count();
            self.threads = (1..=count).map(|id| format!("{id:x}")).collect();
            return Ok(count);
        }
        let mut ids: Vec<String> = Vec::new();
        let mut command = "qfThreadInfo";
        loop {
            let outcome = self.execute(command, 0)?;
            if outcome.interrupted {
                return Err(RspError::Cancelled);
            }
            let text = outcome.text;
            if let Some(list) = text.strip_prefix('m') {
                ids.extend(list.split(',').filter(|id| !id.is_empty()).map(String::from));
                command = "qsThreadInfo";
                continue;
            }
            if text.starts_with('l') {
                break;
            }
            if text.is_empty() {
                break;
            }
            if let Some(code) = parse_error_reply(&text) {
                return Err(RspError::Server { code });
            }
            return Err(RspError::Protocol(format!(
                "unexpected thread-info reply {text:?}"
            )));
        }
        if ids.is_empty() {
            let fallback = self.client.channel_count();
            ids = (1..=fallback).map(|id| format!("{id:x}")).collect();
        }
        self.threads = ids;
        Ok(self.threads.len())
    }

    /// `qGetTIBAddr`: the per-thread information block address.
    pub fn thread_information_block(&mut self, core: usize) -> Result<u64> {
        let tid = self.thread_id(core)?;
        let outcome = self.execute(&format!("qGetTIBAddr:{tid}"), self.channel_for_core(core))?;
        if outcome.interrupted {
            return Err(RspError::Cancelled);
        }
        match self.classify(&outcome.text) {
            Reply::Error(code) => Err(RspError::Server { code }),
            Reply::Empty => Err(RspError::Unsupported),
            Reply::Raw(value) => hex::parse_u64(&value).ok_or_else(|| {
                RspError::Protocol(format!("TIB reply is not a hex address: {value:?}"))
            }),
            other => Err(RspError::Protocol(format!("unexpected TIB reply {other:?}"))),
        }
    }

    /// Inserts a breakpoint. A software request becomes a hardware one
    /// when configuration asks for that mapping.
    pub fn insert_breakpoint(&mut self, address: u64, hardware: bool, kind: u32) -> Result<()> {
        let packet = self.breakpoint_packet(true, address, hardware, kind);
        let channel = self.command_channel();
        let outcome = self.execute(&packet, channel)?;
        self.expect_ok(&outcome, "Z")
    }

    pub fn remove_breakpoint(&mut self, address: u64, hardware: bool, kind: u32) -> Result<()> {
        let packet = self.breakpoint_packet(false, address, hardware, kind);
        let channel = self.command_channel();
        let outcome = self.execute(&packet, channel)?;
        self.expect_ok(&outcome, "z")
    }

    /// Asks the server why it is stopped (`?`) and reconciles the state
    /// machine with the answer.
    pub fn halt_reason(&mut self) -> Result<StopReply> {
        let channel = self.command_channel();
        let outcome = self.execute("?", channel)?;
        if outcome.interrupted {
            return Err(RspError::Cancelled);
        }
        if outcome.text.is_empty() {
            return Err(RspError::Unsupported);
        }
        let stop = self.interpret_stop(&outcome.text).ok_or_else(|| {
            RspError::Protocol(format!("unexpected halt reason {:?}", outcome.text))
        })?;
        self.state = SessionState::Halted;
        Ok(stop)
    }

    /// Resumes every core. The stop reply is consumed asynchronously via
    /// [`wait_for_stop`].
    pub fn continue_execution(&mut self) -> Result<()> {
        self.ensure_halted("continue")?;
        self.orchestrator
            .start("c", CommandScope::Broadcast, true, true)?;
        self.state = SessionState::Running;
        Ok(())
    }

    /// Single-steps one core; other cores stay halted.
    pub fn step(&mut self, core: usize) -> Result<()> {
        self.ensure_halted("step")?;
        self.select_thread('c', core)?;
        self.orchestrator.start(
            "s",
            CommandScope::Single(self.channel_for_core(core)),
            true,
            true,
        )?;
        self.state = SessionState::Running;
        Ok(())
    }

    /// Keeps waiting for a stop reply without issuing a new request, for
    /// servers that halt silently.
    pub fn resume_waiting_for_stop(&mut self) -> Result<()> {
        if self.state != SessionState::Running {
            return Err(RspError::InvalidArgument(
                "no command is running".to_string(),
            ));
        }
        self.orchestrator
            .start("", CommandScope::Broadcast, false, true)
    }

    pub fn is_command_running(&self) -> bool {
        self.orchestrator.is_in_progress()
    }

    /// Polls the outstanding step/continue for its stop reply. An
    /// interrupted wait is reconciled by re-asking `?`.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<Option<StopReply>> {
        let Some(outcome) = self.orchestrator.result(timeout) else {
            return Ok(None);
        };
        match outcome {
            Ok(AsyncOutcome {
                interrupted: true, ..
            }) => {
                let stop = self.halt_reason()?;
                Ok(Some(stop))
            }
            Ok(AsyncOutcome { text, .. }) => {
                // The stop reply may have been provoked by an interrupt
                // whose event nobody consumed; it is handled now.
                self.client.clear_interrupt();
                if let Some(console) = self.forwarded_console(&text) {
                    self.trace.console(&console);
                    // Console output is not the reply; keep waiting.
                    self.resume_waiting_for_stop()?;
                    return Ok(None);
                }
                let stop = self.interpret_stop(&text).ok_or_else(|| {
                    RspError::Protocol(format!("unexpected run-control reply {text:?}"))
                })?;
                self.state = SessionState::Halted;
                Ok(Some(stop))
            }
            Err(RspError::ConnectionLost) => {
                self.state = SessionState::Disconnected;
                Err(RspError::ConnectionLost)
            }
            Err(err) => Err(err),
        }
    }

    /// Breaks into a running command on every channel. Idempotent: with
    /// nothing outstanding this is a no-op.
    pub fn interrupt_target(&mut self) {
        if !self.orchestrator.is_in_progress() {
            return;
        }
        self.orchestrator.interrupt();
    }

    /// Interrupts every core except the one that already stopped.
    pub fn interrupt_other_cores(&mut self, stopped_core: usize) {
        self.client
            .interrupt(InterruptScope::AllExcept(self.channel_for_core(stopped_core)));
        self.client.clear_interrupt();
    }

    /// Soft-restarts the target. The server sends no reply; the next
    /// stop reply arrives through the usual wait.
    pub fn restart(&mut self) -> Result<()> {
        let channel = self.command_channel();
        self.client.send(channel, "R00", true)?;
        self.state = SessionState::Running;
        Ok(())
    }

    // ---- monitor --------------------------------------------------------

    /// Forwards a free-form command to the server via `qRcmd`, or
    /// handles it internally when it names one of the recognised
    /// pseudo-commands. Returns the decoded reply text.
    pub fn monitor(&mut self, text: &str) -> Result<String> {
        if let Some(internal) = InternalCommand::parse(text) {
            return self.run_internal(internal);
        }
        let command = format!("qRcmd,{}", hex::encode(text.as_bytes()));
        let channel = self.command_channel();
        let outcome = self.execute(&command, channel)?;
        if outcome.interrupted {
            return Err(RspError::Cancelled);
        }

        let mut collected = String::new();
        let mut reply = outcome.text;
        loop {
            match self.classify(&reply) {
                Reply::Ok => break,
                Reply::Error(code) => return Err(RspError::Server { code }),
                Reply::Empty => return Err(RspError::Unsupported),
                Reply::Console(chunk) => {
                    self.trace.console(&chunk);
                    collected.push_str(&chunk);
                    if self.client.config().gdb_monitor_do_not_wait_on_ok {
                        break;
                    }
                    reply = self
                        .client
                        .receive(channel, ReceiveWait::ConfiguredTimeout)?
                        .ok_or(RspError::Timeout)?;
                }
                Reply::Raw(blob) => {
                    // Single-blob servers answer with one hex string.
                    match hex::decode(&blob) {
                        Some(bytes) => {
                            collected.push_str(&String::from_utf8_lossy(&bytes))
                        }
                        None => collected.push_str(&blob),
                    }
                    break;
                }
                other => {
                    return Err(RspError::Protocol(format!(
                        "unexpected monitor reply {other:?}"
                    )))
                }
            }
        }
        Ok(collected)
    }

    // ---- internals ------------------------------------------------------

    fn run_internal(&mut self, command: InternalCommand) -> Result<String> {
        match command {
            InternalCommand::ServerIdentity => {
                Ok(self.client.config().server_identity.clone())
            }
            InternalCommand::SetPaMemoryMode => {
                self.ensure_pa_memory_mode()?;
                Ok("OK".to_string())
            }
            InternalCommand::SystemRegisters { verbose } => {
                let core = self.client.last_active_core();
                let mut lines = Vec::new();
                let described: Vec<(u32, String)> = self
                    .registers
                    .access_codes()
                    .map(|(code, name)| (code, name.to_string()))
                    .collect();
                for (code, name) in described {
                    let value = match self.read_system_register(code, core) {
                        Ok(value) => format!("{value:#018x}"),
                        Err(_) => "<unavailable>".to_string(),
                    };
                    if verbose {
                        lines.push(format!("{name:<16} {value}  access={code:#010x}"));
                    } else {
                        lines.push(format!("{name:<16} {value}"));
                    }
                }
                lines.sort();
                Ok(lines.join("\n"))
            }
        }
    }

    fn ensure_pa_memory_mode(&mut self) -> Result<()> {
        if self.pa_memory_mode {
            return Ok(());
        }
        let channel = self.command_channel();
        let outcome = self.execute("Qqemu.PhyMemMode:1", channel)?;
        self.expect_ok(&outcome, "Qqemu.PhyMemMode")?;
        self.pa_memory_mode = true;
        Ok(())
    }

    /// Selects the server-side thread for the next operation. Multi-core
    /// sessions skip this: the channel itself names the CPU.
    fn select_thread(&mut self, op: char, core: usize) -> Result<()> {
        if self.client.is_multi_channel() {
            return Ok(());
        }
        let tid = self.thread_id(core)?;
        let command = format!("H{op}{tid}");
        let attempts = self.client.config().connect_attempts.max(1);
        let mut last = None;
        for _ in 0..attempts {
            match self.execute(&command, 0) {
                Ok(outcome) => {
                    return match self.classify(&outcome.text) {
                        Reply::Ok | Reply::Empty => Ok(()),
                        Reply::Error(code) => Err(RspError::Server { code }),
                        other => Err(RspError::Protocol(format!(
                            "unexpected thread-select reply {other:?}"
                        ))),
                    }
                }
                Err(err) if err.is_transient() => last = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or(RspError::Timeout))
    }

    fn thread_id(&self, core: usize) -> Result<String> {
        if self.threads.is_empty() {
            return Ok(format!("{:x}", core + 1));
        }
        self.threads
            .get(core)
            .cloned()
            .ok_or_else(|| RspError::InvalidArgument(format!("no thread for core {core}")))
    }

    /// Resolves a stop payload into a [`StopReply`], translating the
    /// thread id through the thread table and byte-reversing the
    /// program-counter field.
    fn interpret_stop(&self, payload: &str) -> Option<StopReply> {
        match stop_reply::parse(payload)? {
            StopPacket::Signal { signal } => Some(StopReply {
                kind: StopKind::Signal,
                signal,
                thread_index: None,
                pc: None,
            }),
            StopPacket::Detailed { signal, fields } => {
                // Register keys come zero-padded (`08:`) while orders are
                // minimal hex, so the match is numeric.
                let pc_order = hex::parse_u64(&self.registers.pc().order);
                let thread_index = fields
                    .iter()
                    .find(|(key, _)| *key == "thread")
                    .and_then(|(_, tid)| self.logical_core(tid));
                let pc = fields
                    .iter()
                    .find(|(key, _)| pc_order.is_some() && hex::parse_u64(key) == pc_order)
                    .and_then(|(_, value)| hex::parse_le_value(value));
                Some(StopReply {
                    kind: StopKind::Detailed,
                    signal,
                    thread_index,
                    pc,
                })
            }
            StopPacket::Exited { status } => Some(StopReply {
                kind: StopKind::Exited,
                signal: status,
                thread_index: None,
                pc: None,
            }),
            StopPacket::Ok => Some(StopReply {
                kind: StopKind::Synthetic,
                signal: 0,
                thread_index: None,
                pc: None,
            }),
            StopPacket::Console { .. } => None,
        }
    }

    /// Translates a server thread id to a logical core index, comparing
    /// parsed values so `thread:00000001` matches table entry `1`.
    fn logical_core(&self, tid: &str) -> Option<u32> {
        let wanted = hex::parse_u64(tid)?;
        self.threads
            .iter()
            .position(|known| hex::parse_u64(known) == Some(wanted))
            .and_then(|idx| u32::try_from(idx).ok())
    }

    fn forwarded_console(&self, payload: &str) -> Option<String> {
        match stop_reply::parse(payload)? {
            StopPacket::Console { hex: text } => {
                let bytes = stop_reply::decode_console(text)?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => None,
        }
    }

    fn ensure_halted(&self, what: &str) -> Result<()> {
        match self.state {
            SessionState::Halted | SessionState::Negotiated => Ok(()),
            state => Err(RspError::InvalidArgument(format!(
                "cannot {what} while {state:?}"
            ))),
        }
    }

    fn expect_ok(&mut self, outcome: &CommandOutcome, what: &str) -> Result<()> {
        if outcome.interrupted {
            return Err(RspError::Cancelled);
        }
        match self.classify(&outcome.text) {
            Reply::Ok => Ok(()),
            Reply::Error(code) => Err(RspError::Server { code }),
            Reply::Empty => Err(RspError::Unsupported),
            other => Err(RspError::Protocol(format!(
                "unexpected {what} reply {other:?}"
            ))),
        }
    }

    /// Channel used for operations that are not per-CPU.
    fn command_channel(&self) -> usize {
        if self.client.is_multi_channel() {
            self.client.last_active_core()
        } else {
            0
        }
    }

    fn channel_for_core(&self, core: usize) -> usize {
        if self.client.is_multi_channel() {
            core.min(self.client.channel_count().saturating_sub(1))
        } else {
            0
        }
    }

    /// Bytes a single `m` reply can carry: two hex digits per byte inside
    /// the envelope.
    fn read_chunk_budget(&self) -> usize {
        let packet = self.client.capabilities().packet_size();
        (packet.saturating_sub(4) / 2).max(1)
    }

    /// Bytes a single `M` request can carry once the verb, address, and
    /// length fields are paid for.
    fn write_chunk_budget(&self) -> usize {
        let packet = self.client.capabilities().packet_size();
        (packet.saturating_sub(4).saturating_sub(40) / 2).max(1)
    }

    fn memory_read_command(
        &mut self,
        class: AddressClass,
        address: u64,
        length: usize,
    ) -> Result<String> {
        let caps = self.client.capabilities();
        let trace32 = caps.is_enabled(Capability::Trace32Memory);
        match class {
            AddressClass::Virtual => Ok(format!("m{address:x},{length:x}")),
            AddressClass::Physical => {
                if trace32 {
                    Ok(format!("qtrace32.memory:a,{address:x},{length:x}"))
                } else if caps.is_enabled(Capability::PhysicalMemoryMode) {
                    self.ensure_pa_memory_mode()?;
                    Ok(format!("m{address:x},{length:x}"))
                } else {
                    Err(RspError::Unsupported)
                }
            }
            AddressClass::Supervisor => {
                if trace32 {
                    Ok(format!("qtrace32.memory:s,{address:x},{length:x}"))
                } else {
                    Ok(format!("m{address:x},{length:x}"))
                }
            }
            AddressClass::Hypervisor => {
                if trace32 {
                    Ok(format!("qtrace32.memory:h,{address:x},{length:x}"))
                } else {
                    Err(RspError::Unsupported)
                }
            }
            AddressClass::SpecialRegister => {
                if trace32 {
                    Ok(format!("qtrace32.memory:r,{address:x},{length:x}"))
                } else {
                    Err(RspError::Unsupported)
                }
            }
        }
    }

    fn memory_write_command(
        &mut self,
        class: AddressClass,
        address: u64,
        data: &[u8],
    ) -> Result<String> {
        let caps = self.client.capabilities();
        let trace32 = caps.is_enabled(Capability::Trace32Memory);
        let length = data.len();
        let payload = hex::encode(data);
        match class {
            AddressClass::Virtual => Ok(format!("M{address:x},{length:x}:{payload}")),
            AddressClass::Physical => {
                if trace32 {
                    Ok(format!("Qtrace32.memory:a,{address:x},{length:x},{payload}"))
                } else if caps.is_enabled(Capability::PhysicalMemoryMode) {
                    self.ensure_pa_memory_mode()?;
                    Ok(format!("M{address:x},{length:x}:{payload}"))
                } else {
                    Err(RspError::Unsupported)
                }
            }
            AddressClass::Supervisor => {
                if trace32 {
                    Ok(format!("Qtrace32.memory:s,{address:x},{length:x},{payload}"))
                } else {
                    Ok(format!("M{address:x},{length:x}:{payload}"))
                }
            }
            AddressClass::Hypervisor => {
                if trace32 {
                    Ok(format!("Qtrace32.memory:h,{address:x},{length:x},{payload}"))
                } else {
                    Err(RspError::Unsupported)
                }
            }
            AddressClass::SpecialRegister => {
                if trace32 {
                    Ok(format!("Qtrace32.memory:r,{address:x},{length:x},{payload}"))
                } else {
                    Err(RspError::Unsupported)
                }
            }
        }
    }

    fn breakpoint_packet(
        &self,
        insert: bool,
        address: u64,
        hardware: bool,
        kind: u32,
    ) -> String {
        let hardware = hardware || self.client.config().treat_sw_bp_as_hw_bp;
        let verb = match (insert, hardware) {
            (true, false) => "Z0",
            (true, true) => "Z1",
            (false, false) => "z0",
            (false, true) => "z1",
        };
        format!("{verb},{address:x},{kind:x}")
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state)
            .field("threads", &self.threads)
            .field("pa_memory_mode", &self.pa_memory_mode)
            .finish()
    }
}

fn parse_error_reply(reply: &str) -> Option<u8> {
    let rest = reply.strip_prefix('E')?;
    let rest = rest.trim_start();
    if rest.len() != 2 {
        return None;
    }
    u8::from_str_radix(rest, 16).ok()
}

fn be_bytes_to_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .fold(0u64, |acc, b| acc << 8 | u64::from(*b))
}

fn le_bytes_to_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .rev()
        .fold(0u64, |acc, b| acc << 8 | u64::from(*b))
}

fn first_number(text: &str) -> Option<u64> {
    for token in text.split_whitespace() {
        let token = token.trim_end_matches([',', ';', ':']);
        let token = token.strip_prefix("0x").unwrap_or(token);
        if let Some(value) = hex::parse_u64(token) {
            return Some(value);
        }
    }
    None
}
