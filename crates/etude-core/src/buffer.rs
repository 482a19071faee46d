// src/buffer.rs
use arrayvec::ArrayVec;
use std::fmt::{self, Write as _};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 2048;

/// Fixed inbound buffer.
///
/// `filled` is how many bytes the socket has delivered, `consumed` is how far the line
/// scanner has looked, and `line_start` marks the beginning of the line being parsed.
pub struct ReadBuf {
    data: Box<[u8; READ_BUF_SIZE]>,
    filled: usize,
    consumed: usize,
    line_start: usize,
}

impl ReadBuf {
    pub fn new() -> Self {
        Self {
            data: Box::new([0; READ_BUF_SIZE]),
            filled: 0,
            consumed: 0,
            line_start: 0,
        }
    }

    pub fn clear(&mut self) {
        self.filled = 0;
        self.consumed = 0;
        self.line_start = 0;
    }

    #[inline]
    pub fn filled(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    #[inline]
    pub fn line_start(&self) -> usize {
        self.line_start
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == READ_BUF_SIZE
    }

    /// Unused tail the socket may read into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Record `n` freshly received bytes.
    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(READ_BUF_SIZE);
    }

    pub fn set_consumed(&mut self, pos: usize) {
        self.consumed = pos.min(self.filled);
    }

    /// Start the next line at the current scan position.
    pub fn mark_line(&mut self) {
        self.line_start = self.consumed;
    }

    /// Bytes received so far.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Mutable view over received bytes, for in-place terminator rewriting.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.filled]
    }

    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        let end = end.min(self.filled);
        &self.data[start.min(end)..end]
    }
}

impl Default for ReadBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed outbound header buffer. Appends are all-or-nothing.
#[derive(Default)]
pub struct WriteBuf {
    data: ArrayVec<u8, WRITE_BUF_SIZE>,
}

struct Appender<'a>(&'a mut ArrayVec<u8, WRITE_BUF_SIZE>);

impl fmt::Write for Appender<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0
            .try_extend_from_slice(s.as_bytes())
            .map_err(|_| fmt::Error)
    }
}

impl WriteBuf {
    pub fn new() -> Self {
        Self {
            data: ArrayVec::new(),
        }
    }

    /// Append formatted text. On overflow the buffer is rolled back and `false` returned.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mark = self.data.len();
        if Appender(&mut self.data).write_fmt(args).is_err() {
            self.data.truncate(mark);
            return false;
        }
        true
    }

    pub fn append(&mut self, bytes: &[u8]) -> bool {
        self.data.try_extend_from_slice(bytes).is_ok()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_buf_tracks_cursors() {
        let mut buf = ReadBuf::new();
        buf.spare_mut()[..4].copy_from_slice(b"GET ");
        buf.advance(4);
        assert_eq!(buf.bytes(), b"GET ");
        assert_eq!(buf.spare_mut().len(), READ_BUF_SIZE - 4);

        buf.set_consumed(10);
        assert_eq!(buf.consumed(), 4);
        buf.mark_line();
        assert_eq!(buf.line_start(), 4);

        buf.advance(READ_BUF_SIZE);
        assert!(buf.is_full());
        buf.clear();
        assert_eq!(buf.filled(), 0);
        assert_eq!(buf.line_start(), 0);
    }

    #[test]
    fn append_fmt_rolls_back_on_overflow() {
        let mut buf = WriteBuf::new();
        assert!(buf.append_fmt(format_args!("HTTP/1.1 {} {}\r\n", 200, "OK")));
        let before = buf.len();

        let huge = "x".repeat(WRITE_BUF_SIZE);
        assert!(!buf.append_fmt(format_args!("X-Filler: {}\r\n", huge)));
        assert_eq!(buf.len(), before);
        assert_eq!(buf.as_slice(), b"HTTP/1.1 200 OK\r\n");
    }

    #[test]
    fn append_fills_to_exact_capacity() {
        let mut buf = WriteBuf::new();
        assert!(buf.append(&[b'a'; WRITE_BUF_SIZE]));
        assert!(!buf.append(b"b"));
        assert_eq!(buf.len(), WRITE_BUF_SIZE);
    }
}
