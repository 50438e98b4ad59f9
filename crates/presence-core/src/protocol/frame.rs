//! Framing codec for the wearable radio link.
//!
//! The link carries fixed 20-byte transport units.  Byte 0 is a one-character
//! tag; the remaining bytes are payload:
//!
//! ```text
//! ['1'][up to 19 payload bytes]   start of message (reassembly buffer cleared)
//! ['2'][up to 19 payload bytes]   continuation
//! ['3']                           end of message (buffer delivered if non-empty)
//! ```
//!
//! The protocol assumes in-order, lossless delivery from the transport: there
//! are no sequence numbers and no per-chunk acknowledgements.  Payloads are
//! upper-case ASCII (hex blocks and the `LOGIN` / `HEARTBEAT` / `OK`
//! keywords), so the send side upper-cases before chunking.

use thiserror::Error;

/// Size of one transport unit in bytes, including the tag byte.
pub const FRAME_SIZE: usize = 20;

/// Maximum payload bytes carried by one frame.
pub const FRAME_PAYLOAD: usize = FRAME_SIZE - 1;

/// Tag byte marking the first frame of a message.
const TAG_START: u8 = b'1';
/// Tag byte marking a continuation frame.
const TAG_CONTINUE: u8 = b'2';
/// Tag byte marking end-of-message.
const TAG_END: u8 = b'3';

/// Errors that can occur while reassembling inbound frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A zero-length frame carries no tag byte and cannot be interpreted.
    #[error("empty frame")]
    EmptyFrame,

    /// The frame exceeds the fixed transport unit size.
    #[error("oversized frame: {len} bytes, transport unit is {FRAME_SIZE}")]
    Oversized { len: usize },

    /// The tag byte is not `'1'`, `'2'`, or `'3'`.
    #[error("unknown frame tag: 0x{0:02X}")]
    UnknownTag(u8),

    /// The reassembled message is not valid UTF-8.
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
}

// ── Send side ─────────────────────────────────────────────────────────────────

/// Fragments `message` into transport units ready to be written in order.
///
/// The message is upper-cased, split into chunks of [`FRAME_PAYLOAD`] bytes
/// tagged `'1'` (first) and `'2'` (subsequent), and terminated with a bare
/// `'3'` frame.  An empty message still produces the start and end frames.
pub fn encode_frames(message: &str) -> Vec<Vec<u8>> {
    let message = message.to_ascii_uppercase();
    let bytes = message.as_bytes();

    let chunk_count = bytes.len().div_ceil(FRAME_PAYLOAD).max(1);
    let mut frames = Vec::with_capacity(chunk_count + 1);

    for (i, chunk) in bytes.chunks(FRAME_PAYLOAD).enumerate() {
        let tag = if i == 0 { TAG_START } else { TAG_CONTINUE };
        let mut frame = Vec::with_capacity(1 + chunk.len());
        frame.push(tag);
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }

    // `chunks()` yields nothing for an empty message, but the wire protocol
    // still requires the start frame.
    if frames.is_empty() {
        frames.push(vec![TAG_START]);
    }

    frames.push(vec![TAG_END]);
    frames
}

// ── Receive side ──────────────────────────────────────────────────────────────

/// Reassembly buffer for inbound fragments, scoped to one logical message.
///
/// Feed each received transport unit to [`FrameBuffer::accept`]; when an
/// end-of-message frame closes a non-empty message, the full message is
/// returned and the buffer is cleared for the next one.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one inbound frame.
    ///
    /// Returns `Ok(Some(message))` when an end-of-message frame completes a
    /// non-empty message, `Ok(None)` otherwise.  A start frame discards any
    /// partially reassembled message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] for empty, oversized, or untagged frames, and
    /// when the completed message is not valid UTF-8.
    pub fn accept(&mut self, frame: &[u8]) -> Result<Option<String>, FrameError> {
        if frame.is_empty() {
            return Err(FrameError::EmptyFrame);
        }
        if frame.len() > FRAME_SIZE {
            return Err(FrameError::Oversized { len: frame.len() });
        }

        match frame[0] {
            TAG_START => {
                self.buf.clear();
                self.buf.extend_from_slice(&frame[1..]);
                Ok(None)
            }
            TAG_CONTINUE => {
                self.buf.extend_from_slice(&frame[1..]);
                Ok(None)
            }
            TAG_END => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let message = String::from_utf8(std::mem::take(&mut self.buf))
                    .map_err(|_| FrameError::InvalidUtf8)?;
                Ok(Some(message))
            }
            tag => Err(FrameError::UnknownTag(tag)),
        }
    }

    /// Discards any partially reassembled message.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns `true` when no fragment bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
