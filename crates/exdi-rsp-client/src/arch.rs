//! Architecture selection and system-register coordinates.
//!
//! System registers are addressed by an encoded access code: on ARM the
//! packed `(op0, op1, CRn, CRm, op2)` tuple of the MRS/MSR instruction
//! (coprocessor form on 32-bit), on x86 the raw MSR index. The encodings
//! are pure functions so the same code travels through configuration,
//! the access map, and the wire verbs unchanged.

use serde::{Deserialize, Serialize};

use crate::config::{AccessCodeSeed, RegisterSeed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    X86,
    X86_64,
    Arm32,
    Arm64,
}

impl Architecture {
    pub fn pointer_bytes(self) -> usize {
        match self {
            Architecture::X86 | Architecture::Arm32 => 4,
            Architecture::X86_64 | Architecture::Arm64 => 8,
        }
    }

    /// Name of the program-counter register in this architecture's core
    /// group.
    pub fn pc_register_name(self) -> &'static str {
        match self {
            Architecture::X86 => "eip",
            Architecture::X86_64 => "rip",
            Architecture::Arm32 | Architecture::Arm64 => "pc",
        }
    }

    /// Maps the `<architecture>` element of a target description onto a
    /// supported architecture.
    pub fn from_description(text: &str) -> Option<Architecture> {
        match text {
            "aarch64" | "aarch64:ilp32" => Some(Architecture::Arm64),
            "arm" => Some(Architecture::Arm32),
            "i386:x86-64" | "x86-64" => Some(Architecture::X86_64),
            "i386" | "i8086" => Some(Architecture::X86),
            other if other.starts_with("arm") => Some(Architecture::Arm32),
            _ => None,
        }
    }
}

/// Packs ARM system-register coordinates into one 32-bit access code.
/// On 32-bit targets pass the coprocessor number as `op0` (e.g. 15 for
/// CP15); the field is wide enough for both conventions.
pub fn encode_system_coordinates(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> u32 {
    (u32::from(op0) & 0x1f) << 14
        | (u32::from(op1) & 0x7) << 11
        | (u32::from(crn) & 0xf) << 7
        | (u32::from(crm) & 0xf) << 3
        | (u32::from(op2) & 0x7)
}

/// Inverse of [`encode_system_coordinates`].
pub fn decode_system_coordinates(code: u32) -> (u8, u8, u8, u8, u8) {
    (
        (code >> 14 & 0x1f) as u8,
        (code >> 11 & 0x7) as u8,
        (code >> 7 & 0xf) as u8,
        (code >> 3 & 0xf) as u8,
        (code & 0x7) as u8,
    )
}

fn seeds(table: &[(&str, usize)]) -> Vec<RegisterSeed> {
    table
        .iter()
        .map(|&(name, size_bytes)| RegisterSeed {
            name: name.to_string(),
            size_bytes,
            order: None,
        })
        .collect()
}

/// The core register group in server order, as negotiated with stock
/// gdbserver/QEMU builds when no target description overrides it.
pub fn default_core_registers(arch: Architecture) -> Vec<RegisterSeed> {
    match arch {
        Architecture::X86 => seeds(&[
            ("eax", 4),
            ("ecx", 4),
            ("edx", 4),
            ("ebx", 4),
            ("esp", 4),
            ("ebp", 4),
            ("esi", 4),
            ("edi", 4),
            ("eip", 4),
            ("eflags", 4),
            ("cs", 4),
            ("ss", 4),
            ("ds", 4),
            ("es", 4),
            ("fs", 4),
            ("gs", 4),
        ]),
        Architecture::X86_64 => seeds(&[
            ("rax", 8),
            ("rbx", 8),
            ("rcx", 8),
            ("rdx", 8),
            ("rsi", 8),
            ("rdi", 8),
            ("rbp", 8),
            ("rsp", 8),
            ("r8", 8),
            ("r9", 8),
            ("r10", 8),
            ("r11", 8),
            ("r12", 8),
            ("r13", 8),
            ("r14", 8),
            ("r15", 8),
            ("rip", 8),
            ("eflags", 4),
            ("cs", 4),
            ("ss", 4),
            ("ds", 4),
            ("es", 4),
            ("fs", 4),
            ("gs", 4),
        ]),
        Architecture::Arm32 => {
            let mut table: Vec<(String, usize)> =
                (0..13).map(|i| (format!("r{i}"), 4)).collect();
            table.push(("sp".to_string(), 4));
            table.push(("lr".to_string(), 4));
            table.push(("pc".to_string(), 4));
            table.push(("cpsr".to_string(), 4));
            table
                .into_iter()
                .map(|(name, size_bytes)| RegisterSeed {
                    name,
                    size_bytes,
                    order: None,
                })
                .collect()
        }
        Architecture::Arm64 => {
            let mut table: Vec<(String, usize)> =
                (0..31).map(|i| (format!("x{i}"), 8)).collect();
            table.push(("sp".to_string(), 8));
            table.push(("pc".to_string(), 8));
            table.push(("cpsr".to_string(), 4));
            table
                .into_iter()
                .map(|(name, size_bytes)| RegisterSeed {
                    name,
                    size_bytes,
                    order: None,
                })
                .collect()
        }
    }
}

/// The system register group: control and status registers reachable via
/// the access-code map rather than the `g` packet.
pub fn default_system_registers(arch: Architecture) -> Vec<RegisterSeed> {
    match arch {
        Architecture::X86 => seeds(&[
            ("apic_base", 8),
            ("sysenter_cs", 8),
            ("sysenter_esp", 8),
            ("sysenter_eip", 8),
        ]),
        Architecture::X86_64 => seeds(&[
            ("efer", 8),
            ("star", 8),
            ("lstar", 8),
            ("cstar", 8),
            ("sfmask", 8),
            ("fs_base", 8),
            ("gs_base", 8),
            ("kernel_gs_base", 8),
            ("apic_base", 8),
            ("sysenter_cs", 8),
            ("sysenter_esp", 8),
            ("sysenter_eip", 8),
        ]),
        Architecture::Arm32 => seeds(&[
            ("sctlr", 4),
            ("ttbr0", 4),
            ("ttbcr", 4),
            ("dfsr", 4),
            ("dfar", 4),
            ("vbar", 4),
        ]),
        Architecture::Arm64 => seeds(&[
            ("spsr_el1", 8),
            ("elr_el1", 8),
            ("sctlr_el1", 8),
            ("ttbr0_el1", 8),
            ("ttbr1_el1", 8),
            ("tcr_el1", 8),
            ("esr_el1", 8),
            ("far_el1", 8),
            ("vbar_el1", 8),
            ("mair_el1", 8),
            ("tpidr_el1", 8),
        ]),
    }
}

/// Access codes for [`default_system_registers`], keyed the way the wire
/// verbs expect them: packed coordinates on ARM, MSR indexes on x86.
pub fn default_access_codes(arch: Architecture) -> Vec<AccessCodeSeed> {
    fn entry(code: u32, name: &str) -> AccessCodeSeed {
        AccessCodeSeed {
            code,
            name: name.to_string(),
        }
    }
    match arch {
        Architecture::X86 => vec![
            entry(0x0000_001b, "apic_base"),
            entry(0x0000_0174, "sysenter_cs"),
            entry(0x0000_0175, "sysenter_esp"),
            entry(0x0000_0176, "sysenter_eip"),
        ],
        Architecture::X86_64 => vec![
            entry(0xc000_0080, "efer"),
            entry(0xc000_0081, "star"),
            entry(0xc000_0082, "lstar"),
            entry(0xc000_0083, "cstar"),
            entry(0xc000_0084, "sfmask"),
            entry(0xc000_0100, "fs_base"),
            entry(0xc000_0101, "gs_base"),
            entry(0xc000_0102, "kernel_gs_base"),
            entry(0x0000_001b, "apic_base"),
            entry(0x0000_0174, "sysenter_cs"),
            entry(0x0000_0175, "sysenter_esp"),
            entry(0x0000_0176, "sysenter_eip"),
        ],
        Architecture::Arm32 => vec![
            entry(encode_system_coordinates(15, 0, 1, 0, 0), "sctlr"),
            entry(encode_system_coordinates(15, 0, 2, 0, 0), "ttbr0"),
            entry(encode_system_coordinates(15, 0, 2, 0, 2), "ttbcr"),
            entry(encode_system_coordinates(15, 0, 5, 0, 0), "dfsr"),
            entry(encode_system_coordinates(15, 0, 6, 0, 0), "dfar"),
            entry(encode_system_coordinates(15, 0, 12, 0, 0), "vbar"),
        ],
        Architecture::Arm64 => vec![
            entry(encode_system_coordinates(3, 0, 4, 0, 0), "spsr_el1"),
            entry(encode_system_coordinates(3, 0, 4, 0, 1), "elr_el1"),
            entry(encode_system_coordinates(3, 0, 1, 0, 0), "sctlr_el1"),
            entry(encode_system_coordinates(3, 0, 2, 0, 0), "ttbr0_el1"),
            entry(encode_system_coordinates(3, 0, 2, 0, 1), "ttbr1_el1"),
            entry(encode_system_coordinates(3, 0, 2, 0, 2), "tcr_el1"),
            entry(encode_system_coordinates(3, 0, 5, 2, 0), "esr_el1"),
            entry(encode_system_coordinates(3, 0, 6, 0, 0), "far_el1"),
            entry(encode_system_coordinates(3, 0, 12, 0, 0), "vbar_el1"),
            entry(encode_system_coordinates(3, 0, 10, 2, 0), "mair_el1"),
            entry(encode_system_coordinates(3, 0, 13, 0, 4), "tpidr_el1"),
        ],
    }
}
