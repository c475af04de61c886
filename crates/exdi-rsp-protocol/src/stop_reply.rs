//! Parsing of stop notifications and their relatives.
//!
//! The interesting shape is `T<sig><key>:<value>;...`, which carries the
//! halt signal plus a bag of register/thread fields. `S<sig>` is the bare
//! form, `W<code>` reports process exit, `O<hex>` is console output
//! emitted mid-command, and a handful of servers answer a continue with a
//! plain `OK` when they have nothing better to say.

use crate::hex;

/// A structurally parsed stop-class packet. Field interpretation (thread
/// lookup, program-counter extraction) happens upstream where the
/// register layout is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopPacket<'a> {
    /// `S nn`: signal only. `S00` is the power-down idiom.
    Signal { signal: u8 },
    /// `T nn key:value;...`: signal plus detail fields, in wire order.
    Detailed {
        signal: u8,
        fields: Vec<(&'a str, &'a str)>,
    },
    /// `W nn`: the process exited with the given status.
    Exited { status: u8 },
    /// `O <hex>`: console output; not a command reply.
    Console { hex: &'a str },
    /// A bare `OK` standing in for a stop reply.
    Ok,
}

impl<'a> StopPacket<'a> {
    /// Looks up a detail field by key (`thread`, a register order, ...).
    pub fn field(&self, key: &str) -> Option<&'a str> {
        match self {
            StopPacket::Detailed { fields, .. } => fields
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<u8> {
        match self {
            StopPacket::Signal { signal } | StopPacket::Detailed { signal, .. } => Some(*signal),
            _ => None,
        }
    }
}

/// Parses a stop-class payload. Returns `None` when the payload is not
/// one of the five recognised shapes; such packets go back to the caller
/// raw.
pub fn parse(payload: &str) -> Option<StopPacket<'_>> {
    if payload == "OK" {
        return Some(StopPacket::Ok);
    }
    let head = payload.get(..1)?;
    let rest = &payload[1..];
    match head {
        "S" => {
            let signal = parse_u8_prefix(rest)?;
            Some(StopPacket::Signal { signal })
        }
        "T" => {
            let signal = parse_u8_prefix(rest.get(..2)?)?;
            let mut fields = Vec::new();
            for item in rest.get(2..)?.split(';') {
                if item.is_empty() {
                    continue;
                }
                let (key, value) = item.split_once(':')?;
                fields.push((key, value));
            }
            Some(StopPacket::Detailed { signal, fields })
        }
        "W" => {
            let status = parse_u8_prefix(rest)?;
            Some(StopPacket::Exited { status })
        }
        "O" => {
            if rest.is_empty() || hex::decode(rest).is_none() {
                return None;
            }
            Some(StopPacket::Console { hex: rest })
        }
        _ => None,
    }
}

/// Decodes the console text of an `O` packet.
pub fn decode_console(hex_text: &str) -> Option<Vec<u8>> {
    hex::decode(hex_text)
}

fn parse_u8_prefix(text: &str) -> Option<u8> {
    let digits = text.get(..text.len().min(2)).filter(|d| !d.is_empty())?;
    let value = hex::parse_u64(digits)?;
    u8::try_from(value).ok()
}
