//! Wire-level pieces of the netplot protocol: greeting, acknowledgements and line framing.

pub const NETPLOT_VERSION_MAJOR: u16 = 2;
pub const NETPLOT_VERSION_MINOR: u16 = 5;
/// Legacy receive buffer size; also the longest line kept pending without a newline.
pub const DEFAULT_MAX_LINE_BYTES: usize = 65535;
pub const ACK: &[u8] = b"OK\n";

pub fn greeting() -> String {
    format!("netplot_version={NETPLOT_VERSION_MAJOR}.{NETPLOT_VERSION_MINOR}\n")
}

/// Reserved by the protocol; the persistence path never emits it.
pub fn error_reply(message: &str) -> String {
    format!("ERROR: {message}\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// One `OK` per received chunk, as the legacy server did.
    #[default]
    PerChunk,
    /// One `OK` per processed line, for clients that count acknowledgements.
    PerLine,
}

/// Splits a byte stream into text lines, carrying partial lines across chunks.
pub struct LineDecoder {
    max_line_bytes: usize,
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            pending: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let frame = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            lines.push(decode_line(&frame));
        }

        // A client that never sends a newline still gets processed, one buffer at a time.
        if self.pending.len() > self.max_line_bytes {
            let frame = std::mem::take(&mut self.pending);
            lines.push(decode_line(&frame));
        }

        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let frame = std::mem::take(&mut self.pending);
        Some(decode_line(&frame))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

fn decode_line(frame: &[u8]) -> String {
    let mut raw = frame;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    String::from_utf8_lossy(raw).into_owned()
}
