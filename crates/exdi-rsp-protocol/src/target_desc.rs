//! Permissive scanner for target-description documents.
//!
//! Servers publish their register layout as an XML document over
//! `qXfer:features:read`. We only consume four element kinds
//! (`<architecture>`, `<xi:include href=.../>`, `<feature name=...>`, and
//! `<reg .../>`) and tolerate everything else: processing instructions,
//! comments, doctypes, unknown elements, and the namespaced or plain
//! spelling of the include tag. Pulling in an XML dependency for this
//! subset would cost more than the ~150 lines below.

/// One `<reg/>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterEntry {
    pub name: String,
    pub bitsize: u32,
    /// Explicit `regnum`, when the document provides one. Registers
    /// without it are numbered sequentially by the consumer.
    pub regnum: Option<u32>,
    pub group: Option<String>,
}

impl RegisterEntry {
    /// Register width in bytes, rounding partial bytes up.
    pub fn size_bytes(&self) -> usize {
        (self.bitsize as usize).div_ceil(8)
    }
}

/// The parts of a target description this client consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDescription {
    /// Text of the `<architecture>` element, e.g. `aarch64` or `i386:x86-64`.
    pub architecture: Option<String>,
    /// `href` values of include elements, in document order.
    pub includes: Vec<String>,
    /// `name` attributes of `<feature>` elements, in document order.
    pub features: Vec<String>,
    /// All `<reg/>` elements, in document order.
    pub registers: Vec<RegisterEntry>,
}

/// Scans `text` for the recognised elements. Never fails: unparseable
/// regions are skipped, and a document with nothing we recognise simply
/// produces an empty description.
pub fn parse(text: &str) -> TargetDescription {
    let mut desc = TargetDescription::default();
    let bytes = text.as_bytes();
    let mut pos = 0;

    while let Some(open) = find(bytes, b'<', pos) {
        let rest = &text[open..];
        if rest.starts_with("<!--") {
            pos = match text[open..].find("-->") {
                Some(end) => open + end + 3,
                None => break,
            };
            continue;
        }
        if rest.starts_with("<?") || rest.starts_with("<!") || rest.starts_with("</") {
            pos = match find(bytes, b'>', open) {
                Some(end) => end + 1,
                None => break,
            };
            continue;
        }
        let Some(close) = find(bytes, b'>', open) else {
            break;
        };
        let element = &text[open + 1..close];
        let element = element.strip_suffix('/').unwrap_or(element);
        let (tag, attrs) = split_tag(element);
        match tag {
            "architecture" => {
                let content_start = close + 1;
                let content_end =
                    find(bytes, b'<', content_start).unwrap_or(text.len());
                let arch = text[content_start..content_end].trim();
                if !arch.is_empty() {
                    desc.architecture = Some(arch.to_string());
                }
            }
            "xi:include" | "include" => {
                if let Some(href) = attribute(attrs, "href") {
                    desc.includes.push(href.to_string());
                }
            }
            "feature" => {
                if let Some(name) = attribute(attrs, "name") {
                    desc.features.push(name.to_string());
                }
            }
            "reg" => {
                let name = attribute(attrs, "name");
                let bitsize = attribute(attrs, "bitsize").and_then(|v| v.parse::<u32>().ok());
                if let (Some(name), Some(bitsize)) = (name, bitsize) {
                    desc.registers.push(RegisterEntry {
                        name: name.to_string(),
                        bitsize,
                        regnum: attribute(attrs, "regnum").and_then(|v| v.parse::<u32>().ok()),
                        group: attribute(attrs, "group").map(str::to_string),
                    });
                }
            }
            _ => {}
        }
        pos = close + 1;
    }

    desc
}

fn find(bytes: &[u8], needle: u8, from: usize) -> Option<usize> {
    bytes
        .iter()
        .skip(from)
        .position(|&b| b == needle)
        .map(|i| i + from)
}

fn split_tag(element: &str) -> (&str, &str) {
    match element.find(|c: char| c.is_ascii_whitespace()) {
        Some(idx) => (&element[..idx], &element[idx..]),
        None => (element, ""),
    }
}

/// Finds `name="value"` (or single-quoted) in an attribute list.
fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = attrs;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        let eq = rest.find('=')?;
        let key = rest[..eq].trim_end();
        let after = rest[eq + 1..].trim_start();
        let quote = after.chars().next()?;
        if quote != '"' && quote != '\'' {
            // Unquoted value: skip to the next whitespace and continue.
            let end = after
                .find(|c: char| c.is_ascii_whitespace())
                .unwrap_or(after.len());
            if key == name {
                return Some(&after[..end]);
            }
            rest = &after[end..];
            continue;
        }
        let body = &after[1..];
        let end = body.find(quote)?;
        if key == name {
            return Some(&body[..end]);
        }
        rest = &body[end + 1..];
    }
}
