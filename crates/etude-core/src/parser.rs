// src/parser.rs
use std::ops::Range;

use memchr::memchr2;
use tracing::{debug, trace};

use crate::buffer::ReadBuf;
use crate::http::{Method, RangeSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line ended at `consumed`; its terminator is now NUL bytes.
    Ok,
    /// A terminator was malformed.
    Bad,
    /// No terminator yet.
    Open,
}

/// Scan from the buffer's `consumed` cursor for a CRLF terminator.
///
/// A matched CRLF is overwritten with two NUL bytes and `consumed` moves past it.
/// A CR at the very end of the received data leaves the cursor on the CR so the
/// next call re-examines it once more bytes arrive. A LF without a preceding CR is
/// rejected.
pub fn scan_line(buf: &mut ReadBuf) -> LineStatus {
    let start = buf.consumed();
    let filled = buf.filled();
    let Some(offset) = memchr2(b'\r', b'\n', &buf.bytes()[start..]) else {
        buf.set_consumed(filled);
        return LineStatus::Open;
    };
    let idx = start + offset;
    let bytes = buf.bytes_mut();
    match bytes[idx] {
        b'\r' if idx + 1 == filled => {
            buf.set_consumed(idx);
            LineStatus::Open
        }
        b'\r' if bytes[idx + 1] == b'\n' => {
            bytes[idx] = 0;
            bytes[idx + 1] = 0;
            buf.set_consumed(idx + 2);
            LineStatus::Ok
        }
        _ => LineStatus::Bad,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Header,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Wait for more bytes.
    Incomplete,
    /// Headers (and body, if any) are all in the buffer.
    Complete,
    Bad,
}

/// Incremental request parser over a connection's [`ReadBuf`].
///
/// Targets and header values are kept as offsets into the read buffer, so the
/// parser never copies request bytes.
#[derive(Debug)]
pub struct RequestParser {
    state: CheckState,
    pub method: Method,
    target: Range<usize>,
    host: Option<Range<usize>>,
    pub content_length: usize,
    pub keep_alive: bool,
    pub range: Option<RangeSpec>,
    body_start: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Next whitespace-delimited token of `line` at or after `from`.
fn next_token(line: &[u8], from: usize) -> Option<Range<usize>> {
    let start = from + line.get(from..)?.iter().position(|b| !is_blank(*b))?;
    let len = line[start..]
        .iter()
        .position(|b| is_blank(*b))
        .unwrap_or(line.len() - start);
    Some(start..start + len)
}

fn trim_range(line: &[u8], mut r: Range<usize>) -> Range<usize> {
    while r.start < r.end && is_blank(line[r.start]) {
        r.start += 1;
    }
    while r.end > r.start && is_blank(line[r.end - 1]) {
        r.end -= 1;
    }
    r
}

fn shift(r: Range<usize>, by: usize) -> Range<usize> {
    r.start + by..r.end + by
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: CheckState::RequestLine,
            method: Method::Get,
            target: 0..0,
            host: None,
            content_length: 0,
            keep_alive: false,
            range: None,
            body_start: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    /// Request target, still percent-encoded, with any scheme and authority removed.
    pub fn target<'a>(&self, buf: &'a ReadBuf) -> &'a [u8] {
        buf.slice(self.target.start, self.target.end)
    }

    pub fn host<'a>(&self, buf: &'a ReadBuf) -> Option<&'a [u8]> {
        self.host.clone().map(|r| buf.slice(r.start, r.end))
    }

    pub fn body<'a>(&self, buf: &'a ReadBuf) -> &'a [u8] {
        buf.slice(self.body_start, self.body_start + self.content_length)
    }

    /// Advance over whatever the buffer holds now.
    pub fn parse(&mut self, buf: &mut ReadBuf) -> ParseOutcome {
        loop {
            if self.state == CheckState::Body {
                return match self.body_start.checked_add(self.content_length) {
                    Some(end) if buf.filled() >= end => ParseOutcome::Complete,
                    Some(_) => ParseOutcome::Incomplete,
                    None => ParseOutcome::Bad,
                };
            }

            match scan_line(buf) {
                LineStatus::Open => return ParseOutcome::Incomplete,
                LineStatus::Bad => return ParseOutcome::Bad,
                LineStatus::Ok => {}
            }
            let line = buf.line_start()..buf.consumed() - 2;
            buf.mark_line();
            trace!(line = %String::from_utf8_lossy(buf.slice(line.start, line.end)), "request line");

            let outcome = match self.state {
                CheckState::RequestLine => self.parse_request_line(buf, line),
                CheckState::Header => self.parse_header(buf, line),
                CheckState::Body => None,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    fn parse_request_line(&mut self, buf: &ReadBuf, line: Range<usize>) -> Option<ParseOutcome> {
        let base = line.start;
        let text = buf.slice(line.start, line.end);
        let bad = Some(ParseOutcome::Bad);

        let Some(method) = next_token(text, 0) else {
            return bad;
        };
        let Some(target) = next_token(text, method.end) else {
            return bad;
        };
        let Some(version) = next_token(text, target.end) else {
            return bad;
        };
        if next_token(text, version.end).is_some() {
            return bad;
        }

        let Some(m) = Method::from_bytes(&text[method]) else {
            return bad;
        };
        if &text[version] != b"HTTP/1.1" {
            return bad;
        }

        let mut target = target;
        let raw = &text[target.clone()];
        for scheme in [&b"http://"[..], &b"https://"[..]] {
            if raw.len() >= scheme.len() && raw[..scheme.len()].eq_ignore_ascii_case(scheme) {
                let rest = target.start + scheme.len();
                // Keep only the path after the authority.
                match text[rest..target.end].iter().position(|b| *b == b'/') {
                    Some(p) => target.start = rest + p,
                    None => return bad,
                }
                break;
            }
        }
        if text.get(target.start) != Some(&b'/') {
            return bad;
        }

        self.method = m;
        self.target = shift(target, base);
        self.state = CheckState::Header;
        None
    }

    fn parse_header(&mut self, buf: &ReadBuf, line: Range<usize>) -> Option<ParseOutcome> {
        if line.is_empty() {
            if self.content_length == 0 {
                return Some(ParseOutcome::Complete);
            }
            self.body_start = buf.consumed();
            let room = crate::buffer::READ_BUF_SIZE.saturating_sub(self.body_start);
            if self.content_length > room {
                debug!(
                    content_length = self.content_length,
                    "request body does not fit the read buffer"
                );
                return Some(ParseOutcome::Bad);
            }
            self.state = CheckState::Body;
            return None;
        }

        let base = line.start;
        let text = buf.slice(line.start, line.end);
        let Some(colon) = text.iter().position(|b| *b == b':') else {
            debug!(header = %String::from_utf8_lossy(text), "malformed header ignored");
            return None;
        };
        let name = &text[trim_range(text, 0..colon)];
        let value_range = trim_range(text, colon + 1..text.len());
        let value = &text[value_range.clone()];

        if name.eq_ignore_ascii_case(b"connection") {
            self.keep_alive = value
                .split(|b| *b == b',')
                .any(|token| token.trim_ascii().eq_ignore_ascii_case(b"keep-alive"));
        } else if name.eq_ignore_ascii_case(b"content-length") {
            match std::str::from_utf8(value).ok().and_then(|v| v.parse().ok()) {
                Some(n) => self.content_length = n,
                None => return Some(ParseOutcome::Bad),
            }
        } else if name.eq_ignore_ascii_case(b"host") {
            self.host = Some(shift(value_range, base));
        } else if name.eq_ignore_ascii_case(b"range") {
            self.range = RangeSpec::parse(value);
        } else {
            debug!(header = %String::from_utf8_lossy(text), "unknown header");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut ReadBuf, bytes: &[u8]) {
        buf.spare_mut()[..bytes.len()].copy_from_slice(bytes);
        buf.advance(bytes.len());
    }

    fn parse_all(raw: &[u8]) -> (RequestParser, ReadBuf, ParseOutcome) {
        let mut buf = ReadBuf::new();
        fill(&mut buf, raw);
        let mut parser = RequestParser::new();
        let outcome = parser.parse(&mut buf);
        (parser, buf, outcome)
    }

    #[test]
    fn scan_line_rewrites_crlf() {
        let mut buf = ReadBuf::new();
        fill(&mut buf, b"GET / HTTP/1.1\r\nHost");
        assert_eq!(scan_line(&mut buf), LineStatus::Ok);
        assert_eq!(buf.consumed(), 16);
        assert_eq!(&buf.bytes()[14..16], &[0, 0]);
        assert_eq!(scan_line(&mut buf), LineStatus::Open);
    }

    #[test]
    fn scan_line_waits_on_trailing_cr() {
        let mut buf = ReadBuf::new();
        fill(&mut buf, b"abc\r");
        assert_eq!(scan_line(&mut buf), LineStatus::Open);
        assert_eq!(buf.consumed(), 3);
        fill(&mut buf, b"\n");
        assert_eq!(scan_line(&mut buf), LineStatus::Ok);
    }

    #[test]
    fn scan_line_rejects_bare_lf_and_lone_cr() {
        let mut buf = ReadBuf::new();
        fill(&mut buf, b"abc\nxyz");
        assert_eq!(scan_line(&mut buf), LineStatus::Bad);

        let mut buf = ReadBuf::new();
        fill(&mut buf, b"abc\rxyz");
        assert_eq!(scan_line(&mut buf), LineStatus::Bad);
    }

    #[test]
    fn never_completes_before_blank_line_byte_by_byte() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n";
        let mut buf = ReadBuf::new();
        let mut parser = RequestParser::new();
        for (i, byte) in raw.iter().enumerate() {
            fill(&mut buf, &[*byte]);
            let outcome = parser.parse(&mut buf);
            if i + 1 < raw.len() {
                assert_eq!(outcome, ParseOutcome::Incomplete, "completed early at byte {}", i);
            } else {
                assert_eq!(outcome, ParseOutcome::Complete);
            }
        }
        assert!(parser.keep_alive);
        assert_eq!(parser.target(&buf), b"/index.html");
        assert_eq!(parser.host(&buf), Some(&b"localhost"[..]));
    }

    #[test]
    fn parses_post_with_body() {
        let (parser, buf, outcome) = parse_all(
            b"post /check-login HTTP/1.1\r\nContent-Length: 25\r\n\r\nuser=alice&password=hunte",
        );
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.method, Method::Post);
        assert_eq!(parser.body(&buf), b"user=alice&password=hunte");
        assert!(!parser.keep_alive);
    }

    #[test]
    fn body_waits_for_content_length() {
        let mut buf = ReadBuf::new();
        let mut parser = RequestParser::new();
        fill(&mut buf, b"POST /x HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");
        assert_eq!(parser.parse(&mut buf), ParseOutcome::Incomplete);
        assert_eq!(parser.state(), CheckState::Body);
        fill(&mut buf, b"cd");
        assert_eq!(parser.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(parser.body(&buf), b"abcd");
    }

    #[test]
    fn rejects_bad_request_lines() {
        for raw in [
            &b"PUT / HTTP/1.1\r\n\r\n"[..],
            b"GET / HTTP/1.0\r\n\r\n",
            b"GET index.html HTTP/1.1\r\n\r\n",
            b"GET / HTTP/1.1 extra\r\n\r\n",
            b"GET\r\n\r\n",
            b"GET http://example.com HTTP/1.1\r\n\r\n",
        ] {
            let (_, _, outcome) = parse_all(raw);
            assert_eq!(outcome, ParseOutcome::Bad, "{:?}", String::from_utf8_lossy(raw));
        }
    }

    #[test]
    fn strips_absolute_form_and_tabs() {
        let (parser, buf, outcome) =
            parse_all(b"GET\thttp://example.com/a/b.html  HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.target(&buf), b"/a/b.html");
    }

    #[test]
    fn invalid_content_length_is_bad() {
        let (_, _, outcome) = parse_all(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Bad);
    }

    #[test]
    fn oversized_body_is_bad() {
        let (_, _, outcome) = parse_all(b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Bad);
    }

    #[test]
    fn huge_content_length_is_bad() {
        let raw = format!(
            "POST /check-login HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            u64::MAX
        );
        let (_, _, outcome) = parse_all(raw.as_bytes());
        assert_eq!(outcome, ParseOutcome::Bad);

        let raw = format!(
            "POST /check-login HTTP/1.1\r\nContent-Length: {}\r\n\r\nuser=a",
            usize::MAX - 10
        );
        let (_, _, outcome) = parse_all(raw.as_bytes());
        assert_eq!(outcome, ParseOutcome::Bad);
    }

    #[test]
    fn records_range_and_ignores_unknown_headers() {
        let (parser, _, outcome) = parse_all(
            b"GET /f HTTP/1.1\r\nX-Custom: 1\r\nRange: bytes=-3\r\nConnection: close\r\n\r\n",
        );
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.range, Some(RangeSpec::Suffix(3)));
        assert!(!parser.keep_alive);
    }
}
