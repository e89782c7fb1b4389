//! Incremental server-sent-event framing.
//!
//! [`FrameSplitter`] accumulates decoded text, splits it on the blank-line
//! event boundary, and keeps the trailing partial frame for the next chunk.
//! [`Utf8Decoder`] turns byte chunks into text without corrupting multi-byte
//! characters that straddle a chunk boundary.

/// SSE data field marker.
pub const DATA_FIELD: &str = "data:";

/// Terminator payload sent by OpenAI-compatible streams.
pub const DONE_TOKEN: &str = "[DONE]";

const EVENT_BOUNDARY: &str = "\n\n";

/// Splits decoded SSE text into `data` payloads.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: String,
    frames: usize,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append decoded text and return the payloads of every completed frame.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find(EVENT_BOUNDARY) {
            let frame: String = self.buffer.drain(..pos + EVENT_BOUNDARY.len()).collect();
            self.frames += 1;
            payloads.extend(frame_payloads(&frame));
        }
        payloads
    }

    /// Flush a trailing frame that never received its blank-line terminator.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return Vec::new();
        }
        self.frames += 1;
        frame_payloads(&rest)
    }

    /// Number of frames split so far.
    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// Extract the data payloads of one complete frame.
///
/// Every line starting with `data:` contributes its payload (one optional
/// leading space stripped); the stream terminator token is skipped.
pub fn frame_payloads(frame: &str) -> Vec<String> {
    frame
        .lines()
        .filter_map(|line| line.strip_prefix(DATA_FIELD))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .filter(|data| !data.is_empty() && data.trim() != DONE_TOKEN)
        .map(str::to_string)
        .collect()
}

/// Streaming UTF-8 decoder that carries incomplete sequences across chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, holding back a trailing incomplete character.
    ///
    /// Each genuinely invalid sequence becomes one U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid + invalid;
                        }
                        None => {
                            // Incomplete character at the end; keep it for the next chunk
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left, lossily.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
