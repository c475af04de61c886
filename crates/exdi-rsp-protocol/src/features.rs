//! Tokeniser for `qSupported` replies.
//!
//! A reply is a `;`-separated list of feature stanzas: `name+` (supported),
//! `name-` (unsupported), or `name=value` with a hex value. Feature names
//! may themselves contain `:` (`qXfer:features:read+`), so only the
//! trailing sigil or the first `=` is structural.

use crate::hex;

/// The advertised setting of one feature stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSetting {
    Enabled,
    Disabled,
    Value(u32),
}

/// One parsed stanza of a `qSupported` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureToken<'a> {
    pub name: &'a str,
    pub setting: FeatureSetting,
}

/// Parses a `qSupported` reply into feature tokens. Stanzas that fit none
/// of the three shapes (or carry a non-hex value) are skipped; unknown
/// names are the caller's concern.
pub fn parse_reply(reply: &str) -> impl Iterator<Item = FeatureToken<'_>> {
    reply.split(';').filter_map(|stanza| {
        let stanza = stanza.trim();
        if stanza.is_empty() {
            return None;
        }
        if let Some((name, value)) = stanza.split_once('=') {
            let value = hex::parse_u64(value)?;
            let value = u32::try_from(value).ok()?;
            return Some(FeatureToken {
                name,
                setting: FeatureSetting::Value(value),
            });
        }
        if let Some(name) = stanza.strip_suffix('+') {
            return Some(FeatureToken {
                name,
                setting: FeatureSetting::Enabled,
            });
        }
        if let Some(name) = stanza.strip_suffix('-') {
            return Some(FeatureToken {
                name,
                setting: FeatureSetting::Disabled,
            });
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_stanza_shapes() {
        let tokens: Vec<_> =
            parse_reply("PacketSize=4000;QStartNoAckMode+;qXfer:features:read+;multiprocess-")
                .collect();
        assert_eq!(
            tokens,
            vec![
                FeatureToken {
                    name: "PacketSize",
                    setting: FeatureSetting::Value(0x4000)
                },
                FeatureToken {
                    name: "QStartNoAckMode",
                    setting: FeatureSetting::Enabled
                },
                FeatureToken {
                    name: "qXfer:features:read",
                    setting: FeatureSetting::Enabled
                },
                FeatureToken {
                    name: "multiprocess",
                    setting: FeatureSetting::Disabled
                },
            ]
        );
    }

    #[test]
    fn skips_malformed_stanzas() {
        let tokens: Vec<_> = parse_reply("PacketSize=zz;;bare;ok+").collect();
        assert_eq!(
            tokens,
            vec![FeatureToken {
                name: "ok",
                setting: FeatureSetting::Enabled
            }]
        );
    }

    #[test]
    fn empty_reply_yields_nothing() {
        assert_eq!(parse_reply("").count(), 0);
    }
}
