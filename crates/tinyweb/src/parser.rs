// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Bytes are appended to a fixed read buffer as they arrive; the line
//! scanner NUL-terminates each CRLF line in place and the state handlers
//! consume the lines until a full request (head plus body) is present.
//! Parsing never blocks and never rescans a line it has already accepted.

use crate::http::{CheckState, HttpCode, LineStatus, Method};
use std::ops::Range;
use tracing::debug;

pub const READ_BUF_SIZE: usize = 2048;

/// Fields collected from the request line and headers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
    /// POST bodies are handed to the form endpoints.
    pub cgi: bool,
    /// Span of the message body inside the read buffer.
    pub body: Option<Range<usize>>,
}

enum HeaderOutcome {
    Continue,
    EndOfHeaders,
    Malformed,
}

pub struct RequestParser {
    buf: [u8; READ_BUF_SIZE],
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
    state: CheckState,
    request: Request,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: [0; READ_BUF_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            state: CheckState::RequestLine,
            request: Request::default(),
        }
    }

    /// Forget the previous request; used between keep-alive cycles.
    pub fn reset(&mut self) {
        self.buf.fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.state = CheckState::RequestLine;
        self.request = Request::default();
    }

    pub fn is_full(&self) -> bool {
        self.read_idx >= READ_BUF_SIZE
    }

    /// Unused tail of the read buffer, where the next `recv` lands.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_idx..]
    }

    /// Account for `n` bytes written into [`spare_mut`](Self::spare_mut).
    pub fn commit(&mut self, n: usize) {
        self.read_idx = (self.read_idx + n).min(READ_BUF_SIZE);
    }

    /// Copy as much of `data` as fits. Returns the number of bytes taken.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = spare.len().min(data.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf[..self.read_idx]
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.request.body.clone().map(|span| &self.buf[span])
    }

    /// Scan forward from the checked index for the next CRLF.
    pub fn parse_line(&mut self) -> LineStatus {
        while self.checked_idx < self.read_idx {
            let window = &self.buf[self.checked_idx..self.read_idx];
            let Some(offset) = memchr::memchr2(b'\r', b'\n', window) else {
                self.checked_idx = self.read_idx;
                return LineStatus::Open;
            };
            let pos = self.checked_idx + offset;

            if self.buf[pos] == b'\r' {
                if pos + 1 == self.read_idx {
                    // CR is the last byte we have; rescan it next time.
                    self.checked_idx = pos;
                    return LineStatus::Open;
                }
                if self.buf[pos + 1] == b'\n' {
                    self.buf[pos] = 0;
                    self.buf[pos + 1] = 0;
                    self.checked_idx = pos + 2;
                    return LineStatus::Ok;
                }
                self.checked_idx = pos;
                return LineStatus::Bad;
            }

            // A trailing CR is rescanned, so any LF found here is bare.
            self.checked_idx = pos;
            return LineStatus::Bad;
        }
        LineStatus::Open
    }

    /// Drive the state machine over everything buffered so far.
    ///
    /// Returns `NoRequest` while more bytes are needed, `GetRequest` once the
    /// request is complete and `BadRequest` for malformed input.
    pub fn process(&mut self, default_page: &str) -> HttpCode {
        loop {
            if self.state == CheckState::Content {
                return self.parse_content();
            }

            match self.parse_line() {
                LineStatus::Ok => {}
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
            }

            let start = self.start_line;
            self.start_line = self.checked_idx;
            let text = line_of(&self.buf, start);
            debug!(line = %String::from_utf8_lossy(text), "parsed line");

            match self.state {
                CheckState::RequestLine => {
                    if let Err(code) = parse_request_line(text, &mut self.request, default_page) {
                        return code;
                    }
                    self.state = CheckState::Headers;
                }
                CheckState::Headers => match parse_header(text, &mut self.request) {
                    HeaderOutcome::Continue => {}
                    HeaderOutcome::Malformed => return HttpCode::BadRequest,
                    HeaderOutcome::EndOfHeaders => {
                        if self.request.content_length == 0 {
                            return HttpCode::GetRequest;
                        }
                        if self.request.content_length > READ_BUF_SIZE - self.checked_idx {
                            // The body could never fit in the read buffer.
                            return HttpCode::BadRequest;
                        }
                        self.state = CheckState::Content;
                    }
                },
                CheckState::Content => return HttpCode::InternalError,
            }
        }
    }

    fn parse_content(&mut self) -> HttpCode {
        let start = self.checked_idx;
        let end = start + self.request.content_length;
        if self.read_idx >= end {
            self.request.body = Some(start..end);
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// The NUL-terminated line starting at `start`.
fn line_of(buf: &[u8], start: usize) -> &[u8] {
    let tail = &buf[start..];
    match memchr::memchr(0, tail) {
        Some(end) => &tail[..end],
        None => tail,
    }
}

fn is_blank(b: &u8) -> bool {
    *b == b' ' || *b == b'\t'
}

fn trim_start(text: &[u8]) -> &[u8] {
    let skip = text.iter().take_while(|b| is_blank(b)).count();
    &text[skip..]
}

fn parse_request_line(text: &[u8], req: &mut Request, default_page: &str) -> Result<(), HttpCode> {
    let split = text.iter().position(is_blank).ok_or(HttpCode::BadRequest)?;
    let method = Method::from_token(&text[..split]).ok_or(HttpCode::BadRequest)?;

    let rest = trim_start(&text[split..]);
    let split = rest.iter().position(is_blank).ok_or(HttpCode::BadRequest)?;
    let url = &rest[..split];
    let version = trim_start(&rest[split..]);
    if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
        return Err(HttpCode::BadRequest);
    }

    let url = normalize_url(url).ok_or(HttpCode::BadRequest)?;
    let url = std::str::from_utf8(url).map_err(|_| HttpCode::BadRequest)?;

    req.method = method;
    req.cgi = method == Method::Post;
    req.url = if url == "/" {
        default_page.to_string()
    } else {
        url.to_string()
    };
    Ok(())
}

/// Strip an absolute-form `http://host` / `https://host` prefix down to the
/// path. The result must start with `/`.
pub fn normalize_url(url: &[u8]) -> Option<&[u8]> {
    let mut url = url;
    for scheme in [&b"http://"[..], &b"https://"[..]] {
        if url.len() >= scheme.len() && url[..scheme.len()].eq_ignore_ascii_case(scheme) {
            let rest = &url[scheme.len()..];
            let slash = memchr::memchr(b'/', rest)?;
            url = &rest[slash..];
            break;
        }
    }
    if url.first() == Some(&b'/') {
        Some(url)
    } else {
        None
    }
}

fn header_value<'a>(text: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if text.len() >= name.len() && text[..name.len()].eq_ignore_ascii_case(name) {
        Some(trim_start(&text[name.len()..]))
    } else {
        None
    }
}

fn parse_header(text: &[u8], req: &mut Request) -> HeaderOutcome {
    if text.is_empty() {
        return HeaderOutcome::EndOfHeaders;
    }

    if let Some(value) = header_value(text, b"Connection:") {
        if value.eq_ignore_ascii_case(b"keep-alive") {
            req.keep_alive = true;
        }
    } else if let Some(value) = header_value(text, b"Content-Length:") {
        match std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim_end().parse::<usize>().ok())
        {
            Some(len) => req.content_length = len,
            None => return HeaderOutcome::Malformed,
        }
    } else if let Some(value) = header_value(text, b"Host:") {
        req.host = Some(String::from_utf8_lossy(value).into_owned());
    } else {
        debug!(header = %String::from_utf8_lossy(text), "ignoring unknown header");
    }
    HeaderOutcome::Continue
}
