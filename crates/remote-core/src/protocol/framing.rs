//! Receive-side line framing.
//!
//! TCP delivers an arbitrary byte stream: a single read may contain half a
//! record, exactly one, or several.  [`LineFramer`] accumulates bytes and
//! yields every complete `\n`-terminated line, keeping the unterminated
//! remainder until the rest of it arrives.

use tracing::warn;

/// Upper bound on a single buffered line.
///
/// A peer that never sends a newline would otherwise grow the buffer without
/// limit.  When exceeded, the whole line is discarded: what is buffered now
/// and everything that follows up to its terminator.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024;

/// Splits an incoming byte stream into newline-terminated records.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_len: usize,
    /// Set while skipping the tail of an oversized line.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_len,
            discarding: false,
        }
    }

    /// Appends `data` and returns every line it completed, in order, without
    /// their terminators.  Empty lines are skipped.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Vec<u8>> {
        if self.discarding {
            match data.iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    data = &data[offset + 1..];
                    self.discarding = false;
                }
                None => return Vec::new(),
            }
        }
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if end > start {
                lines.push(self.buffer[start..end].to_vec());
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > self.max_line_len {
            warn!(
                "discarding {} buffered bytes: line exceeds {} bytes without a terminator",
                self.buffer.len(),
                self.max_line_len
            );
            self.buffer.clear();
            self.discarding = true;
        }

        lines
    }

    /// Number of bytes held for an unterminated line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any partial line, e.g. when a connection is torn down.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}
