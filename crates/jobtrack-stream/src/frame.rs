//! Blank-line delimited frame decoding.
//!
//! The core is the pure [`decode`] function: it takes the residual bytes held
//! back from the previous chunk plus a new chunk, and returns the completed
//! frames together with the new residual. [`FrameDecoder`] wraps it for callers
//! that pump a byte stream.

use tracing::debug;

/// Literal prefix of a payload line.
pub const DATA_PREFIX: &str = "data: ";

/// Terminal token of chat streams.
pub const CHAT_DONE_SENTINEL: &str = "[DONE]";

/// Payload semantics of a stream, which decide how the terminal frame looks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Payloads are JSON. An object carrying `"done": true` ends the stream and
    /// payloads that are not JSON are skipped.
    Structured,
    /// Payloads are raw text used verbatim. A payload equal to `sentinel` ends
    /// the stream.
    Text { sentinel: String },
}

impl Framing {
    /// Text framing with the `[DONE]` sentinel used by chat replies.
    pub fn chat() -> Self {
        Self::Text {
            sentinel: CHAT_DONE_SENTINEL.to_string(),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    pub is_terminal: bool,
}

/// Result of decoding one chunk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Completed frames in arrival order. A terminal frame, when present, is last.
    pub frames: Vec<Frame>,
    /// Trailing incomplete segment to prepend to the next chunk.
    pub residual: Vec<u8>,
    /// Number of malformed frames dropped.
    pub skipped: usize,
    /// True once a terminal frame was decoded.
    pub terminated: bool,
}

/// Decodes `chunk` appended to `residual`.
///
/// Decoding stops at the first terminal frame; anything buffered after it is
/// discarded and the returned residual is empty.
pub fn decode(mut residual: Vec<u8>, chunk: &[u8], framing: &Framing) -> Decoded {
    residual.extend_from_slice(chunk);
    let mut out = Decoded::default();
    let mut start = 0;
    while let Some((idx, delim_len)) = find_frame_delimiter(&residual[start..]) {
        let segment = &residual[start..start + idx];
        start += idx + delim_len;
        match classify(segment, framing) {
            Some(frame) => {
                let terminal = frame.is_terminal;
                out.frames.push(frame);
                if terminal {
                    out.terminated = true;
                    return out;
                }
            }
            None => {
                if !segment.is_empty() {
                    out.skipped += 1;
                }
            }
        }
    }
    residual.drain(..start);
    out.residual = residual;
    out
}

/// Stateful wrapper around [`decode`] holding the residual buffer across chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    residual: Vec<u8>,
    skipped: usize,
    finished: bool,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            residual: Vec::new(),
            skipped: 0,
            finished: false,
        }
    }

    /// Feeds one chunk and returns the frames it completed.
    ///
    /// Returns nothing once a terminal frame has been seen.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        let decoded = decode(std::mem::take(&mut self.residual), chunk, &self.framing);
        self.residual = decoded.residual;
        self.skipped += decoded.skipped;
        self.finished = decoded.terminated;
        decoded.frames
    }

    /// True after the terminal frame was decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Total malformed frames dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Bytes currently held back waiting for a frame delimiter.
    pub fn pending_bytes(&self) -> usize {
        self.residual.len()
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn extract_payload(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            data_lines.push(rest);
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let payload = data_lines.join("\n");
    if payload.is_empty() {
        return None;
    }
    Some(payload)
}

fn classify(segment: &[u8], framing: &Framing) -> Option<Frame> {
    let Some(payload) = extract_payload(segment) else {
        if !segment.is_empty() {
            debug!(bytes = segment.len(), "skipping frame without data line");
        }
        return None;
    };
    match framing {
        Framing::Structured => {
            let value: serde_json::Value = match serde_json::from_str(&payload) {
                Ok(value) => value,
                Err(e) => {
                    debug!(error = %e, "skipping frame with non-JSON payload");
                    return None;
                }
            };
            let is_terminal = value.get("done").and_then(|v| v.as_bool()) == Some(true);
            Some(Frame {
                payload,
                is_terminal,
            })
        }
        Framing::Text { sentinel } => {
            let is_terminal = payload == *sentinel;
            Some(Frame {
                payload,
                is_terminal,
            })
        }
    }
}
