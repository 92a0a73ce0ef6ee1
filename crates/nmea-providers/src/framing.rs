//! Newline framing for byte streams.

/// Bytes held without a newline before the buffer is discarded.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Accumulates stream bytes and yields complete lines.
///
/// Lines are returned without the trailing `\n`; a `\r` is left for the
/// cleaner to strip. If more than the limit accumulates without a newline
/// the partial line is dropped.
#[derive(Debug, Clone)]
pub struct LineFramer {
    buf: Vec<u8>,
    limit: usize,
    overflows: u64,
}

impl LineFramer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            overflows: 0,
        }
    }

    /// Append bytes and drain every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }

        if self.buf.len() > self.limit {
            self.buf.clear();
            self.overflows += 1;
        }
        lines
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Times the buffer was discarded for exceeding the limit.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

/// Split one datagram into candidate lines, skipping blank ones.
pub fn split_datagram(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
}
