//! Per-connection line framing.
//!
//! Socket reads arrive in arbitrary chunks. A [`LineBuffer`] keeps whatever
//! follows the last separator and prepends it to the next read, so a
//! command split across reads is assembled before it is dispatched.

use bytes::BytesMut;
use stockd_core::protocol::LINE_SEPARATOR;

/// Complete lines extracted from one read.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Framed {
    /// Non-blank lines, separator and trailing `\r` removed.
    pub lines: Vec<String>,
    /// Bytes dropped because the pending partial line grew past the limit.
    pub discarded: usize,
}

#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them.
    ///
    /// If no separator is buffered and the pending bytes exceed
    /// `max_line_bytes`, they are discarded; the stream resynchronizes at
    /// the next separator.
    pub fn push(&mut self, bytes: &[u8], max_line_bytes: usize) -> Framed {
        self.buf.extend_from_slice(bytes);

        let mut framed = Framed::default();
        match self.buf.iter().rposition(|b| *b == LINE_SEPARATOR) {
            Some(last) => {
                let complete = self.buf.split_to(last + 1);
                framed.lines = complete[..]
                    .split(|b| *b == LINE_SEPARATOR)
                    .filter_map(decode_line)
                    .collect();
            }
            None if self.buf.len() > max_line_bytes => {
                framed.discarded = self.buf.len();
                self.buf.clear();
            }
            None => {}
        }
        framed
    }

    /// Bytes held back waiting for a separator.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.into_owned())
    }
}
