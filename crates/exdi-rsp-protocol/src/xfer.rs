//! Chunk classification for `qXfer:...:read` replies.
//!
//! The server answers each windowed read with `m<data>` (more follows) or
//! `l<data>` (final chunk, possibly empty). Anything else is a protocol
//! deviation the caller must handle.

/// One reply to a `qXfer` windowed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferChunk<'a> {
    /// `m`-prefixed: more data remains after this chunk.
    More(&'a str),
    /// `l`-prefixed: this is the final chunk.
    Last(&'a str),
}

impl<'a> XferChunk<'a> {
    pub fn data(&self) -> &'a str {
        match self {
            XferChunk::More(data) | XferChunk::Last(data) => data,
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self, XferChunk::Last(_))
    }
}

/// Classifies a `qXfer` reply payload. Returns `None` for payloads that
/// carry neither continuation prefix (e.g. `E 00` errors or empty
/// replies from servers without the feature).
pub fn parse_chunk(payload: &str) -> Option<XferChunk<'_>> {
    if let Some(rest) = payload.strip_prefix('m') {
        Some(XferChunk::More(rest))
    } else {
        payload.strip_prefix('l').map(XferChunk::Last)
    }
}
