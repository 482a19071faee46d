// src/http.rs

/// Largest body a single response will carry; longer ranges are truncated.
pub const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Method names are matched case-insensitively; anything else is unsupported.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if b.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    PartialContent,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::PartialContent => 206,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::PartialContent => "Partial Content",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Body sent with an error status.
    pub fn form(self) -> &'static str {
        match self {
            Status::Ok | Status::PartialContent => "",
            Status::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => "You do not have permission to get this file from this server.\n",
            Status::NotFound => "The requested file was not found on this server.\n",
            Status::InternalError => "There was an unusual problem serving the requested file.\n",
        }
    }

    /// Protocol and internal failures end the connection regardless of keep-alive.
    pub fn forces_close(self) -> bool {
        matches!(self, Status::BadRequest | Status::InternalError)
    }
}

/// A parsed `Range: bytes=...` header, before it is applied to a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b` or `bytes=a-`
    From { start: u64, end: Option<u64> },
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

impl RangeSpec {
    /// Parse a header value. Malformed or multi-range values yield `None`.
    pub fn parse(value: &[u8]) -> Option<Self> {
        let value = std::str::from_utf8(value).ok()?.trim();
        let prefix = value.get(..6)?;
        if !prefix.eq_ignore_ascii_case("bytes=") {
            return None;
        }
        let spec = value[6..].trim();
        if spec.contains(',') {
            return None;
        }
        let (first, last) = spec.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());
        match (first.is_empty(), last.is_empty()) {
            (true, true) => None,
            (true, false) => last.parse().ok().map(RangeSpec::Suffix),
            (false, true) => Some(RangeSpec::From {
                start: first.parse().ok()?,
                end: None,
            }),
            (false, false) => Some(RangeSpec::From {
                start: first.parse().ok()?,
                end: Some(last.parse().ok()?),
            }),
        }
    }
}

/// Inclusive byte span of a file that will be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub start: u64,
    pub end: u64,
    /// Send as 206 with `Content-Range`.
    pub partial: bool,
}

impl ByteSpan {
    /// Never zero: a span always covers at least one byte.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Apply an optional range to a file of `size` bytes, then cap the body at
/// [`MAX_BODY_BYTES`]. Empty files have no span at all.
pub fn resolve_range(spec: Option<RangeSpec>, size: u64) -> Option<ByteSpan> {
    if size == 0 {
        return None;
    }
    let last = size - 1;
    let full = ByteSpan {
        start: 0,
        end: last,
        partial: false,
    };

    let mut span = match spec {
        None => full,
        Some(RangeSpec::From { start, end }) => {
            let end = end.unwrap_or(last).min(last);
            if start > end {
                full
            } else {
                ByteSpan {
                    start,
                    end,
                    partial: true,
                }
            }
        }
        Some(RangeSpec::Suffix(0)) => full,
        Some(RangeSpec::Suffix(n)) => ByteSpan {
            start: size.saturating_sub(n),
            end: last,
            partial: true,
        },
    };

    if span.len() > MAX_BODY_BYTES {
        // A suffix request keeps its tail; everything else keeps its head.
        if matches!(spec, Some(RangeSpec::Suffix(_))) {
            span.start = span.end + 1 - MAX_BODY_BYTES;
        } else {
            span.end = span.start + MAX_BODY_BYTES - 1;
        }
        span.partial = true;
    }
    Some(span)
}
