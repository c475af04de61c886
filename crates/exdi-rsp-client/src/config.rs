//! The immutable configuration snapshot a session is built from.
//!
//! The debugger-facing façade assembles one of these from its own
//! configuration store and hands it over at construction; nothing here is
//! re-read afterwards. Serde derives exist so the façade can persist or
//! ship snapshots in whatever format it prefers.

use serde::{Deserialize, Serialize};

use crate::arch::{self, Architecture};

/// One register the session should model, in group order. `order` is the
/// textual identifier used in `p`/`P` packets; when absent the position
/// within the combined core+system layout is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSeed {
    pub name: String,
    pub size_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

/// Binds an encoded system-register access code to a register name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCodeSeed {
    pub code: u32,
    pub name: String,
}

/// Forces a capability on or off after negotiation, for servers that
/// implement an extension without advertising it (Trace32, OpenOCD).
/// `name` uses the wire spelling, e.g. `qtrace32.memory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityOverride {
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Selects register vectors and access-code encodings.
    pub target_architecture: Architecture,

    /// One channel per core when set; otherwise a single channel shared
    /// by all cores and selected with `H` packets.
    pub multi_core_sessions: bool,

    /// `host:port` per channel. Single-channel sessions provide one entry.
    pub core_connections: Vec<String>,

    /// Initial packet budget; replaced by the server's `PacketSize` once
    /// negotiated.
    pub max_packet_length: usize,

    pub connect_attempts: u32,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,

    /// Server-specific hello packet sent before `qSupported`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name_packet: Option<String>,

    /// Replacement for the stock `qSupported` packet, if the server wants
    /// a specific feature list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q_supported_packet: Option<String>,

    /// Forces no-ack operation even if the server does not advertise
    /// `QStartNoAckMode`.
    pub no_ack_enabled_by_config: bool,

    /// Mirrors every frame to the trace sink.
    pub display_comm_packets: bool,

    pub core_registers: Vec<RegisterSeed>,
    pub system_registers: Vec<RegisterSeed>,
    pub access_code_map: Vec<AccessCodeSeed>,

    /// Post-negotiation capability adjustments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_overrides: Vec<CapabilityOverride>,

    /// Fail a memory read outright when nothing could be transferred;
    /// otherwise an empty result is returned.
    pub throw_on_memory_error: bool,

    /// Report memory-write failures to the caller instead of stopping
    /// silently after partial progress.
    pub report_write_errors: bool,

    /// Treat `qRcmd` replies as a single hex blob instead of waiting for
    /// the `O`-chunks-then-`OK` sequence.
    pub gdb_monitor_do_not_wait_on_ok: bool,

    /// Request hardware breakpoints when the caller asks for software
    /// ones (for flash or ROM targets).
    pub treat_sw_bp_as_hw_bp: bool,

    /// Address memory physically by default (SMM-style targets).
    pub pa_memory_required: bool,

    /// Root document name for `qXfer:features:read`.
    pub target_description_file: String,

    /// Identity string reported by the internal telemetry probe.
    pub server_identity: String,
}

impl TargetConfig {
    /// A snapshot with stock settings and the built-in register model
    /// for `architecture`, connecting to `core_connections`.
    pub fn for_architecture(
        architecture: Architecture,
        core_connections: Vec<String>,
    ) -> TargetConfig {
        TargetConfig {
            target_architecture: architecture,
            multi_core_sessions: core_connections.len() > 1,
            core_connections,
            max_packet_length: 2048,
            connect_attempts: 3,
            send_timeout_ms: 4000,
            receive_timeout_ms: 4000,
            agent_name_packet: None,
            q_supported_packet: None,
            no_ack_enabled_by_config: false,
            display_comm_packets: false,
            core_registers: arch::default_core_registers(architecture),
            system_registers: arch::default_system_registers(architecture),
            access_code_map: arch::default_access_codes(architecture),
            capability_overrides: Vec::new(),
            throw_on_memory_error: false,
            report_write_errors: true,
            gdb_monitor_do_not_wait_on_ok: false,
            treat_sw_bp_as_hw_bp: false,
            pa_memory_required: false,
            target_description_file: "target.xml".to_string(),
            server_identity: "gdbserver".to_string(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.core_connections.len().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_snapshot_is_single_channel() {
        let config = TargetConfig::for_architecture(
            Architecture::X86_64,
            vec!["localhost:1234".to_string()],
        );
        assert!(!config.multi_core_sessions);
        assert_eq!(config.channel_count(), 1);
        assert_eq!(config.max_packet_length, 2048);
        assert!(!config.core_registers.is_empty());
    }

    #[test]
    fn multiple_connections_imply_multi_core() {
        let config = TargetConfig::for_architecture(
            Architecture::Arm64,
            vec!["host:2331".to_string(), "host:2332".to_string()],
        );
        assert!(config.multi_core_sessions);
        assert_eq!(config.channel_count(), 2);
    }

    #[test]
    fn snapshot_survives_serde() {
        let config =
            TargetConfig::for_architecture(Architecture::Arm64, vec!["host:3333".to_string()]);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: TargetConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
