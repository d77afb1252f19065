// src/conn.rs
//! Per-connection state: read buffer and parser, response buffer, the
//! mapped file being served and the progress of sending it.

use crate::http::HttpCode;
use crate::parser::RequestParser;
use crate::resolve::Resolver;
use crate::response::{self, Body, SendPlan, WriteBuffer};
use crate::syscalls::{self, Epoll, FileMapping, Interest, TriggerMode};
use libc::c_int;
use std::io;
use std::net::SocketAddr;
use tracing::debug;

pub struct Conn {
    fd: c_int,
    peer: SocketAddr,
    generation: u64,
    trigger: TriggerMode,
    parser: RequestParser,
    write_buf: WriteBuffer,
    plan: SendPlan,
    real_file: String,
    file_len: usize,
    mapping: Option<FileMapping>,
    /// Set by a worker whose step failed; the event loop closes the socket.
    close_requested: bool,
}

impl Conn {
    pub fn new(fd: c_int, peer: SocketAddr, generation: u64, trigger: TriggerMode) -> Self {
        Self {
            fd,
            peer,
            generation,
            trigger,
            parser: RequestParser::new(),
            write_buf: WriteBuffer::new(),
            plan: SendPlan::default(),
            real_file: String::new(),
            file_len: 0,
            mapping: None,
            close_requested: false,
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    /// Filesystem path of the last resolved request.
    pub fn real_file(&self) -> &str {
        &self.real_file
    }

    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Pull bytes from the socket into the read buffer.
    ///
    /// Returns false when the peer closed, the read failed, or the buffer
    /// has no room left.
    pub fn read_once(&mut self) -> bool {
        if self.parser.is_full() {
            return false;
        }
        match self.trigger {
            TriggerMode::Level => match syscalls::recv_into(self.fd, self.parser.spare_mut()) {
                Ok(0) => false,
                Ok(n) => {
                    self.parser.commit(n);
                    true
                }
                Err(_) => false,
            },
            TriggerMode::Edge => loop {
                if self.parser.is_full() {
                    return true;
                }
                match syscalls::recv_into(self.fd, self.parser.spare_mut()) {
                    Ok(0) => return false,
                    Ok(n) => self.parser.commit(n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return would_block(&e),
                }
            },
        }
    }

    /// Parse what has arrived; once a request is complete, resolve it and
    /// compose the response, then re-arm for the next direction.
    pub fn process(&mut self, epoll: &Epoll, resolver: &Resolver) -> bool {
        let code = self.process_read(resolver);
        if code == HttpCode::NoRequest {
            return self.rearm(epoll, Interest::Readable);
        }
        if !self.process_write(code) {
            return false;
        }
        self.rearm(epoll, Interest::Writable)
    }

    fn process_read(&mut self, resolver: &Resolver) -> HttpCode {
        let code = self.parser.process(resolver.default_page());
        if code != HttpCode::GetRequest {
            return code;
        }
        let resolution = resolver.resolve(self.parser.request(), self.parser.body());
        debug!(
            peer = %self.peer,
            method = self.parser.request().method.as_str(),
            url = %self.parser.request().url,
            code = ?resolution.code,
            "request resolved"
        );
        self.real_file = resolution.path;
        self.file_len = resolution.file_len;
        self.mapping = resolution.mapping;
        resolution.code
    }

    fn process_write(&mut self, code: HttpCode) -> bool {
        self.write_buf.clear();
        let keep_alive = self.parser.request().keep_alive;
        match response::compose(&mut self.write_buf, code, keep_alive, self.file_len) {
            Some(Body::File) => {
                self.plan = SendPlan::new(self.write_buf.len(), self.file_len);
                true
            }
            Some(Body::Inline) => {
                self.unmap();
                self.plan = SendPlan::new(self.write_buf.len(), 0);
                true
            }
            None => false,
        }
    }

    /// Flush the pending response.
    ///
    /// Returns false when the connection should be closed: a send failed or
    /// a non-keep-alive response went out completely.
    pub fn write(&mut self, epoll: &Epoll) -> bool {
        if self.plan.is_done() {
            self.reinit();
            return self.rearm(epoll, Interest::Readable);
        }

        loop {
            let file = self.mapping.as_ref().map(FileMapping::as_slice).unwrap_or(&[]);
            let segments = self.plan.segments(self.write_buf.as_slice(), file);
            match syscalls::send_vectored(self.fd, &segments) {
                Ok(0) => return self.rearm(epoll, Interest::Writable),
                Ok(n) => self.plan.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.rearm(epoll, Interest::Writable);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "send failed");
                    self.unmap();
                    return false;
                }
            }

            if self.plan.is_done() {
                self.unmap();
                if !self.parser.request().keep_alive {
                    return false;
                }
                self.reinit();
                return self.rearm(epoll, Interest::Readable);
            }
        }
    }

    /// Reset for the next request on a kept-alive socket.
    pub fn reinit(&mut self) {
        self.unmap();
        self.parser.reset();
        self.write_buf.clear();
        self.plan = SendPlan::default();
        self.real_file.clear();
        self.file_len = 0;
    }

    /// Deregister and close the socket. Returns false if it was already
    /// closed.
    pub fn close(&mut self, epoll: &Epoll) -> bool {
        if !self.is_open() {
            return false;
        }
        if let Err(e) = epoll.delete(self.fd) {
            debug!(fd = self.fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(self.fd);
        self.fd = -1;
        self.unmap();
        true
    }

    fn unmap(&mut self) {
        self.mapping = None;
    }

    fn rearm(&self, epoll: &Epoll, interest: Interest) -> bool {
        match epoll.modify(self.fd, interest, self.trigger) {
            Ok(()) => true,
            Err(e) => {
                debug!(fd = self.fd, error = %e, "re-arm failed");
                false
            }
        }
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}
