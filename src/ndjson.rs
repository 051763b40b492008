//! Line framing for newline-delimited JSON bodies that arrive in arbitrary
//! chunks.

/// Accumulates bytes and hands out complete lines.
///
/// Bytes are buffered rather than decoded per chunk, so a chunk boundary that
/// splits a multi-byte UTF-8 sequence is harmless.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed. Blank lines are
    /// dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = Self::decode(&line[..line.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Returns the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        Self::decode(&rest)
    }

    fn decode(bytes: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(bytes);
        let line = line.trim();
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}
