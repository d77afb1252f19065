// src/response.rs
//! Response head composition into a capped buffer, and the two-segment
//! send plan that pairs that head with a mapped file body.

use crate::http::{EMPTY_PAGE, ERROR_403, ERROR_404, ERROR_500, HttpCode, OK_200, Status};
use arrayvec::ArrayVec;
use std::fmt;

pub const WRITE_BUF_SIZE: usize = 1024;

/// Fixed-capacity response buffer. Appends that would overflow fail and
/// leave the buffer as it was.
pub struct WriteBuffer {
    buf: ArrayVec<u8, WRITE_BUF_SIZE>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            buf: ArrayVec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Format `args` onto the end of the buffer.
    pub fn append(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mark = self.buf.len();
        if fmt::Write::write_fmt(self, args).is_err() {
            self.buf.truncate(mark);
            return false;
        }
        true
    }

    pub fn add_status_line(&mut self, status: &Status) -> bool {
        self.append(format_args!("HTTP/1.1 {} {}\r\n", status.code, status.title))
    }

    pub fn add_headers(&mut self, content_len: usize, keep_alive: bool) -> bool {
        let connection = if keep_alive { "keep-alive" } else { "close" };
        self.append(format_args!("Content-Length: {content_len}\r\n"))
            && self.append(format_args!("Connection: {connection}\r\n"))
            && self.append(format_args!("\r\n"))
    }

    pub fn add_content(&mut self, text: &str) -> bool {
        self.append(format_args!("{text}"))
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for WriteBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf
            .try_extend_from_slice(s.as_bytes())
            .map_err(|_| fmt::Error)
    }
}

/// What follows the composed head on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// Everything is already in the write buffer.
    Inline,
    /// The mapped file goes out as the second segment.
    File,
}

fn inline_response(buf: &mut WriteBuffer, status: &Status, keep_alive: bool) -> bool {
    buf.add_status_line(status)
        && buf.add_headers(status.body.len(), keep_alive)
        && buf.add_content(status.body)
}

/// Compose the response head for `code`. `file_len` is the size of the
/// resolved file for a `FileRequest`. Returns `None` when the code has no
/// response or the head does not fit.
pub fn compose(buf: &mut WriteBuffer, code: HttpCode, keep_alive: bool, file_len: usize) -> Option<Body> {
    let ok = match code {
        HttpCode::InternalError => inline_response(buf, &ERROR_500, keep_alive),
        HttpCode::BadRequest | HttpCode::NoResource => inline_response(buf, &ERROR_404, keep_alive),
        HttpCode::ForbiddenRequest => inline_response(buf, &ERROR_403, keep_alive),
        HttpCode::FileRequest if file_len > 0 => {
            let done = buf.add_status_line(&OK_200) && buf.add_headers(file_len, keep_alive);
            return done.then_some(Body::File);
        }
        HttpCode::FileRequest => {
            buf.add_status_line(&OK_200)
                && buf.add_headers(EMPTY_PAGE.len(), keep_alive)
                && buf.add_content(EMPTY_PAGE)
        }
        _ => false,
    };
    ok.then_some(Body::Inline)
}

/// Progress through a head segment followed by an optional file segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendPlan {
    header_len: usize,
    file_len: usize,
    bytes_sent: usize,
}

impl SendPlan {
    pub fn new(header_len: usize, file_len: usize) -> Self {
        Self {
            header_len,
            file_len,
            bytes_sent: 0,
        }
    }

    pub fn bytes_to_send(&self) -> usize {
        self.header_len + self.file_len - self.bytes_sent
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn is_done(&self) -> bool {
        self.bytes_to_send() == 0
    }

    pub fn advance(&mut self, n: usize) {
        self.bytes_sent = (self.bytes_sent + n).min(self.header_len + self.file_len);
    }

    /// The unsent parts of `header` and `file`, in wire order.
    pub fn segments<'a>(&self, header: &'a [u8], file: &'a [u8]) -> [&'a [u8]; 2] {
        let header = &header[..self.header_len.min(header.len())];
        let file = &file[..self.file_len.min(file.len())];
        if self.bytes_sent >= header.len() {
            let offset = (self.bytes_sent - header.len()).min(file.len());
            [&[], &file[offset..]]
        } else {
            [&header[self.bytes_sent..], file]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(buf: &WriteBuffer) -> &str {
        std::str::from_utf8(buf.as_slice()).unwrap()
    }

    #[test]
    fn append_rolls_back_on_overflow() {
        let mut buf = WriteBuffer::new();
        assert!(buf.append(format_args!("{}", "a".repeat(1000))));
        let before = buf.len();
        assert!(!buf.append(format_args!("{}", "b".repeat(100))));
        assert_eq!(buf.len(), before);
        assert!(buf.append(format_args!("{}", "c".repeat(WRITE_BUF_SIZE - before))));
        assert_eq!(buf.len(), WRITE_BUF_SIZE);
        assert!(!buf.append(format_args!("x")));
    }

    #[test]
    fn not_found_response_is_complete() {
        let mut buf = WriteBuffer::new();
        assert_eq!(compose(&mut buf, HttpCode::NoResource, false, 0), Some(Body::Inline));
        let expected = format!(
            "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            ERROR_404.body.len(),
            ERROR_404.body
        );
        assert_eq!(text(&buf), expected);
    }

    #[test]
    fn bad_request_shares_the_404_page() {
        let mut a = WriteBuffer::new();
        let mut b = WriteBuffer::new();
        compose(&mut a, HttpCode::BadRequest, true, 0);
        compose(&mut b, HttpCode::NoResource, true, 0);
        assert_eq!(a.as_slice(), b.as_slice());
        assert!(text(&a).contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn forbidden_and_internal_error() {
        let mut buf = WriteBuffer::new();
        compose(&mut buf, HttpCode::ForbiddenRequest, false, 0);
        assert!(text(&buf).starts_with("HTTP/1.1 403 Forbidden\r\n"));
        buf.clear();
        compose(&mut buf, HttpCode::InternalError, false, 0);
        assert!(text(&buf).starts_with("HTTP/1.1 500 Internal Error\r\n"));
        assert!(text(&buf).ends_with(ERROR_500.body));
    }

    #[test]
    fn file_request_leaves_body_to_second_segment() {
        let mut buf = WriteBuffer::new();
        assert_eq!(compose(&mut buf, HttpCode::FileRequest, true, 5), Some(Body::File));
        assert_eq!(
            text(&buf),
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn empty_file_gets_placeholder_body() {
        let mut buf = WriteBuffer::new();
        assert_eq!(compose(&mut buf, HttpCode::FileRequest, false, 0), Some(Body::Inline));
        assert!(text(&buf).ends_with(&format!("Content-Length: 26\r\nConnection: close\r\n\r\n{EMPTY_PAGE}")));
    }

    #[test]
    fn codes_without_a_response_fail() {
        let mut buf = WriteBuffer::new();
        assert_eq!(compose(&mut buf, HttpCode::NoRequest, false, 0), None);
        assert_eq!(compose(&mut buf, HttpCode::GetRequest, false, 0), None);
    }

    #[test]
    fn send_plan_walks_both_segments() {
        let header = b"HEAD";
        let file = b"0123456789";
        let mut plan = SendPlan::new(header.len(), file.len());
        assert_eq!(plan.bytes_to_send(), 14);
        assert_eq!(plan.segments(header, file), [&header[..], &file[..]]);

        plan.advance(2);
        assert_eq!(plan.segments(header, file), [&b"AD"[..], &file[..]]);

        plan.advance(5);
        let [first, second] = plan.segments(header, file);
        assert!(first.is_empty());
        assert_eq!(second, b"3456789");

        plan.advance(7);
        assert!(plan.is_done());
    }
}
