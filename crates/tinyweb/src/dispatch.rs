// src/dispatch.rs
//! Glue between the event loop and the worker pool.
//!
//! Workers never close sockets. A failed step marks the connection and
//! hands `{fd, generation}` back through a lock-free queue, then pokes the
//! loop's wake pipe; the loop closes the connection if it is still the same
//! one.

use crate::conn::Conn;
use crate::pool::Task;
use crate::resolve::Resolver;
use crate::sync::Mutex;
use crate::syscalls::{Epoll, Pipe};
use crossbeam_queue::SegQueue;
use libc::c_int;
use std::sync::Arc;

pub type SharedConn = Arc<Mutex<Conn>>;

/// Connection a worker gave up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub fd: c_int,
    pub generation: u64,
}

/// State shared by the loop and every worker.
pub struct Context {
    pub epoll: Epoll,
    pub resolver: Resolver,
    pub completions: SegQueue<Completion>,
    pub wake: Pipe,
}

impl Context {
    pub fn new(epoll: Epoll, resolver: Resolver, wake: Pipe) -> Self {
        Self {
            epoll,
            resolver,
            completions: SegQueue::new(),
            wake,
        }
    }
}

pub struct ConnTask {
    conn: SharedConn,
    fd: c_int,
    generation: u64,
    ctx: Arc<Context>,
}

impl ConnTask {
    pub fn new(conn: SharedConn, fd: c_int, generation: u64, ctx: Arc<Context>) -> Self {
        Self {
            conn,
            fd,
            generation,
            ctx,
        }
    }
}

// A connection the loop already closed has nothing left to do, so each
// step reports success for it.
impl Task for ConnTask {
    fn read_step(&self) -> bool {
        let mut conn = self.conn.lock();
        !conn.is_open() || conn.read_once()
    }

    fn write_step(&self) -> bool {
        let mut conn = self.conn.lock();
        !conn.is_open() || conn.write(&self.ctx.epoll)
    }

    fn process(&self) -> bool {
        let mut conn = self.conn.lock();
        !conn.is_open() || conn.process(&self.ctx.epoll, &self.ctx.resolver)
    }

    fn abandon(&self) {
        self.conn.lock().request_close();
        self.ctx.completions.push(Completion {
            fd: self.fd,
            generation: self.generation,
        });
        self.ctx.wake.notify(1);
    }
}
