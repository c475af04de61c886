//! Register layout for the active architecture.
//!
//! Two ordered groups: the core group travels in `g`/`G` packets in
//! server order, the system group is reached through access codes and
//! server-specific verbs. The model is seeded from configuration and may
//! be amended once from the server's target description, after which it
//! is read-only.

use std::collections::HashMap;

use exdi_rsp_protocol::target_desc::TargetDescription;
use exdi_rsp_protocol::hex;

use crate::arch::Architecture;
use crate::config::TargetConfig;
use crate::error::{Result, RspError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterGroup {
    Core,
    System,
}

/// One register as addressed on the wire: `order` is the text used in
/// `p<order>`/`P<order>=...` packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub name: String,
    pub order: String,
    pub size_bytes: usize,
    pub group: RegisterGroup,
}

/// A register paired with its value in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RegisterModel {
    architecture: Architecture,
    core: Vec<RegisterDescriptor>,
    system: Vec<RegisterDescriptor>,
    access_codes: HashMap<u32, String>,
    pc_index: usize,
}

impl RegisterModel {
    pub fn from_config(config: &TargetConfig) -> Result<RegisterModel> {
        let architecture = config.target_architecture;
        let mut next_order = 0u32;
        let core = seeded_group(
            &config.core_registers,
            RegisterGroup::Core,
            &mut next_order,
        );
        let system = seeded_group(
            &config.system_registers,
            RegisterGroup::System,
            &mut next_order,
        );
        let access_codes = config
            .access_code_map
            .iter()
            .map(|seed| (seed.code, seed.name.clone()))
            .collect();
        let pc_index = find_pc(&core, architecture)?;
        Ok(RegisterModel {
            architecture,
            core,
            system,
            access_codes,
            pc_index,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn core(&self) -> &[RegisterDescriptor] {
        &self.core
    }

    pub fn system(&self) -> &[RegisterDescriptor] {
        &self.system
    }

    /// The program-counter descriptor for the active architecture.
    pub fn pc(&self) -> &RegisterDescriptor {
        &self.core[self.pc_index]
    }

    pub fn find(&self, name: &str) -> Option<&RegisterDescriptor> {
        self.core
            .iter()
            .chain(self.system.iter())
            .find(|reg| reg.name == name)
    }

    /// Resolves an encoded access code to its register, when the model
    /// knows one by that code.
    pub fn by_access_code(&self, code: u32) -> Option<&RegisterDescriptor> {
        self.access_codes
            .get(&code)
            .and_then(|name| self.find(name))
    }

    pub fn access_codes(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.access_codes
            .iter()
            .map(|(code, name)| (*code, name.as_str()))
    }

    /// Total byte length of a `g` reply for the core group.
    pub fn core_dump_bytes(&self) -> usize {
        self.core.iter().map(|reg| reg.size_bytes).sum()
    }

    /// Applies the target description fetched from the server. `docs`
    /// holds `(file name, parsed document)` pairs, main document first.
    /// Documents whose name mentions `system` or `banked` feed the system
    /// group; the main document's registers replace the core group when
    /// it defines any.
    pub fn amend_from_description(&mut self, docs: &[(String, TargetDescription)]) -> Result<()> {
        if let Some((_, main)) = docs.first() {
            if let Some(text) = main.architecture.as_deref() {
                match Architecture::from_description(text) {
                    Some(described) if described != self.architecture => {
                        tracing::debug!(
                            configured = ?self.architecture,
                            ?described,
                            "target description overrides the configured architecture"
                        );
                        self.architecture = described;
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!(text, "unrecognised architecture in target description");
                    }
                }
            }
        }

        let mut new_core = Vec::new();
        let mut next_regnum = 0u32;
        for (name, doc) in docs {
            let system_file = is_system_source(name);
            for entry in &doc.registers {
                let regnum = entry.regnum.unwrap_or(next_regnum);
                next_regnum = regnum + 1;
                let descriptor = RegisterDescriptor {
                    name: entry.name.clone(),
                    order: format!("{regnum:x}"),
                    size_bytes: entry.size_bytes(),
                    group: if system_file || is_system_reg_group(entry.group.as_deref()) {
                        RegisterGroup::System
                    } else {
                        RegisterGroup::Core
                    },
                };
                match descriptor.group {
                    RegisterGroup::Core => new_core.push(descriptor),
                    RegisterGroup::System => merge_system(&mut self.system, descriptor),
                }
            }
        }

        if !new_core.is_empty() {
            self.pc_index = find_pc(&new_core, self.architecture)?;
            self.core = new_core;
        }
        Ok(())
    }

    /// Splits a `g` reply (concatenated target-order hex) into host-order
    /// values, one per core register.
    pub fn split_core_dump(&self, reply: &str) -> Result<Vec<RegisterValue>> {
        let bytes = hex::decode(reply).ok_or_else(|| {
            RspError::Protocol("register dump is not a hex string".to_string())
        })?;
        if bytes.len() < self.core_dump_bytes() {
            return Err(RspError::Protocol(format!(
                "register dump holds {} bytes, layout needs {}",
                bytes.len(),
                self.core_dump_bytes()
            )));
        }
        let mut values = Vec::with_capacity(self.core.len());
        let mut offset = 0;
        for reg in &self.core {
            let mut value = bytes[offset..offset + reg.size_bytes].to_vec();
            value.reverse();
            offset += reg.size_bytes;
            values.push(RegisterValue {
                name: reg.name.clone(),
                value,
            });
        }
        Ok(values)
    }

    /// Builds the payload body of a `G` packet from host-order values in
    /// core-group order.
    pub fn build_core_dump(&self, values: &[RegisterValue]) -> Result<String> {
        if values.len() != self.core.len() {
            return Err(RspError::InvalidArgument(format!(
                "expected {} register values, got {}",
                self.core.len(),
                values.len()
            )));
        }
        let mut dump = String::with_capacity(self.core_dump_bytes() * 2);
        for (reg, value) in self.core.iter().zip(values) {
            if reg.name != value.name || value.value.len() != reg.size_bytes {
                return Err(RspError::InvalidArgument(format!(
                    "value for {} does not match the layout",
                    reg.name
                )));
            }
            let mut wire = value.value.clone();
            wire.reverse();
            dump.push_str(&hex::encode(&wire));
        }
        Ok(dump)
    }
}

fn seeded_group(
    seeds: &[crate::config::RegisterSeed],
    group: RegisterGroup,
    next_order: &mut u32,
) -> Vec<RegisterDescriptor> {
    seeds
        .iter()
        .map(|seed| {
            let order = match &seed.order {
                Some(order) => order.clone(),
                None => format!("{:x}", *next_order),
            };
            *next_order += 1;
            RegisterDescriptor {
                name: seed.name.clone(),
                order,
                size_bytes: seed.size_bytes,
                group,
            }
        })
        .collect()
}

fn find_pc(core: &[RegisterDescriptor], architecture: Architecture) -> Result<usize> {
    let pc_name = architecture.pc_register_name();
    core.iter()
        .position(|reg| reg.name == pc_name)
        .ok_or_else(|| {
            RspError::InvalidArgument(format!(
                "core register group does not define {pc_name}"
            ))
        })
}

fn is_system_source(file_name: &str) -> bool {
    let lowered = file_name.to_ascii_lowercase();
    lowered.contains("system") || lowered.contains("banked")
}

fn is_system_reg_group(group: Option<&str>) -> bool {
    matches!(group, Some(g) if g.eq_ignore_ascii_case("system"))
}

fn merge_system(system: &mut Vec<RegisterDescriptor>, descriptor: RegisterDescriptor) {
    match system.iter_mut().find(|reg| reg.name == descriptor.name) {
        Some(existing) => *existing = descriptor,
        None => system.push(descriptor),
    }
}
