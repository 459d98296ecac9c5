use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("line of {len} bytes is not valid UTF-8")]
pub struct InvalidLine {
    pub len: usize,
}

fn decode(bytes: Vec<u8>) -> Result<String, InvalidLine> {
    let len = bytes.len();
    String::from_utf8(bytes).map_err(|_| InvalidLine { len })
}

/// Reassembles newline-terminated records from arbitrarily split reads.
///
/// Bytes are held until a `\n` arrives, so a read boundary that lands in the
/// middle of a UTF-8 sequence or a JSON escape never reaches a parser. A
/// trailing `\r` is stripped from each line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete line, without its terminator. A complete line
    /// that is not UTF-8 is removed and reported as an error.
    pub fn next_line(&mut self) -> Option<Result<String, InvalidLine>> {
        let offset = self.buf[self.scanned..].iter().position(|b| *b == b'\n');
        match offset {
            Some(pos) => {
                let end = self.scanned + pos;
                let mut line: Vec<u8> = self.buf.drain(..=end).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.scanned = 0;
                Some(decode(line))
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// Takes whatever is left after the last newline.
    pub fn take_remainder(&mut self) -> Option<Result<String, InvalidLine>> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(decode(rest))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}
