//! Incremental decoder for the MCS byte stream.
//!
//! Feed bytes via [`McsDecoder::feed`] and collect complete frame events.
//! The decoder buffers internally and never blocks the producing
//! transport; partial reads are reassembled across calls.
//!
//! Recoverable anomalies (an unknown tag, a payload that fails to decode)
//! are reported as events and the decoder resynchronizes at the next
//! record boundary. A bad version byte or an oversized length varint is
//! fatal: the stream has no recoverable framing after either.

use crate::constants::{MCS_LEGACY_VERSION, MCS_VERSION};
use crate::push::mcs::{read_varint, McsMessage, McsTag, Varint};

/// Where the decoder stands between the bytes it has and the bytes a
/// record still needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Expecting version byte, tag byte and at least one size byte.
    VersionTagAndSize,
    /// Expecting tag byte and at least one size byte.
    TagAndSize,
    /// Expecting the remainder of a length varint.
    Size { tag: u8 },
    /// Expecting `size` payload bytes for `tag`.
    ProtoBytes { tag: u8, size: usize },
}

/// A complete frame event produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// A decoded record of a known tag.
    Message(McsMessage),
    /// A record of an unknown tag; its payload was skipped.
    UnknownTag { tag: u8, len: usize },
    /// A record of a known tag whose payload failed to decode.
    Malformed { tag: McsTag, error: String },
}

/// Fatal framing errors. The connection must be torn down.
#[derive(Debug)]
pub enum FrameError {
    /// The stream opened with an unsupported version byte.
    UnsupportedVersion(u8),
    /// A length varint did not terminate within 5 bytes or exceeds 32 bits.
    LengthOverflow,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "unsupported stream version: {v}"),
            Self::LengthOverflow => write!(f, "length varint exceeds 32-bit range"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Incremental MCS frame decoder.
#[derive(Debug)]
pub struct McsDecoder {
    state: DecodeState,
    buf: Vec<u8>,
}

impl McsDecoder {
    /// Decoder for a fresh connection, expecting the version byte first.
    pub fn new() -> Self {
        Self {
            state: DecodeState::VersionTagAndSize,
            buf: Vec::new(),
        }
    }

    /// Feed bytes and extract all complete frame events.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on unrecoverable framing damage; the
    /// decoder must be discarded along with its connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<FrameEvent>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            match self.state {
                DecodeState::VersionTagAndSize => {
                    // Version, tag and a minimum-length size packet.
                    if self.buf.len() < 3 {
                        break;
                    }
                    let version = self.buf[0];
                    if version != MCS_VERSION && version != MCS_LEGACY_VERSION {
                        return Err(FrameError::UnsupportedVersion(version));
                    }
                    self.buf.drain(..1);
                    self.state = DecodeState::TagAndSize;
                }
                DecodeState::TagAndSize => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    let tag = self.buf[0];
                    self.buf.drain(..1);
                    self.state = DecodeState::Size { tag };
                }
                DecodeState::Size { tag } => match read_varint(&self.buf) {
                    Varint::Complete { value, consumed } => {
                        self.buf.drain(..consumed);
                        self.state = DecodeState::ProtoBytes {
                            tag,
                            size: value as usize,
                        };
                    }
                    Varint::Incomplete => break,
                    Varint::Overflow => return Err(FrameError::LengthOverflow),
                },
                DecodeState::ProtoBytes { tag, size } => {
                    if self.buf.len() < size {
                        break;
                    }
                    let payload: Vec<u8> = self.buf.drain(..size).collect();
                    self.state = DecodeState::TagAndSize;

                    match McsTag::from_u8(tag) {
                        None => events.push(FrameEvent::UnknownTag { tag, len: size }),
                        Some(known) => match McsMessage::decode(known, &payload) {
                            Ok(message) => events.push(FrameEvent::Message(message)),
                            Err(error) => events.push(FrameEvent::Malformed {
                                tag: known,
                                error: error.to_string(),
                            }),
                        },
                    }
                }
            }
        }

        Ok(events)
    }

    /// Returns true if partial frame data is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
            || matches!(
                self.state,
                DecodeState::Size { .. } | DecodeState::ProtoBytes { .. }
            )
    }
}

impl Default for McsDecoder {
    fn default() -> Self {
        Self::new()
    }
}
