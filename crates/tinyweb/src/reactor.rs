// src/reactor.rs
//! The event loop: accepts connections, routes readiness events to the
//! worker pool, and owns the idle-timer list.

use crate::config::Config;
use crate::conn::Conn;
use crate::dispatch::{ConnTask, Context, SharedConn};
use crate::error::ServerResult;
use crate::metrics::ServerMetrics;
use crate::pool::{ActorModel, Phase, ThreadPool};
use crate::sync::Mutex;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Interest, Pipe, TriggerMode, epoll_event,
};
use crate::timer::{TimerId, TimerList};
use libc::c_int;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Signal-pipe byte: run the timer sweep.
pub const SIG_ALARM: u8 = 1;
/// Signal-pipe byte: leave the loop.
pub const SIG_TERMINATE: u8 = 2;

const MAX_EVENTS: usize = 1024;
const BUSY_REPLY: &[u8] = b"Internal server busy";

/// Weak reference from a timer back to its connection.
#[derive(Debug, Clone, Copy)]
struct TimerTarget {
    fd: c_int,
    generation: u64,
    peer: SocketAddr,
}

struct Slot {
    conn: SharedConn,
    generation: u64,
    timer: Option<TimerId>,
}

pub struct EventLoop {
    listen_fd: c_int,
    listen_trigger: TriggerMode,
    conn_trigger: TriggerMode,
    model: ActorModel,
    idle_timeout: Duration,
    max_connections: usize,
    signals: Arc<Pipe>,
    ctx: Arc<Context>,
    pool: ThreadPool<ConnTask>,
    conns: HashMap<c_int, Slot>,
    timers: TimerList<TimerTarget>,
    next_generation: u64,
    metrics: Arc<ServerMetrics>,
}

impl EventLoop {
    /// Takes ownership of `listen_fd` and registers it together with both
    /// notification pipes.
    pub fn new(
        config: &Config,
        listen_fd: c_int,
        ctx: Arc<Context>,
        signals: Arc<Pipe>,
        metrics: Arc<ServerMetrics>,
    ) -> ServerResult<Self> {
        let pool = match ThreadPool::new(config.workers, config.max_requests, config.actor_model) {
            Ok(pool) => pool,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e);
            }
        };
        let ev = Self {
            listen_fd,
            listen_trigger: config.listen_trigger,
            conn_trigger: config.conn_trigger,
            model: config.actor_model,
            idle_timeout: config.timeslot() * 3,
            max_connections: config.max_connections,
            signals,
            ctx,
            pool,
            conns: HashMap::new(),
            timers: TimerList::new(),
            next_generation: 0,
            metrics,
        };

        let epoll = &ev.ctx.epoll;
        epoll.add(ev.listen_fd, Interest::Readable, ev.listen_trigger, false)?;
        epoll.add(ev.signals.read_fd(), Interest::Readable, TriggerMode::Level, false)?;
        epoll.add(ev.ctx.wake.read_fd(), Interest::Readable, TriggerMode::Level, false)?;
        Ok(ev)
    }

    /// Run until a terminate byte arrives on the signal pipe.
    pub fn run(&mut self) -> ServerResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut signals = Vec::new();
        info!(
            model = ?self.model,
            workers = self.pool.workers(),
            queue = self.pool.capacity(),
            "event loop running"
        );

        loop {
            let n = self.ctx.epoll.wait(&mut events, -1)?;
            let mut timeout = false;
            let mut stop = false;

            for ev in &events[..n] {
                let (bits, token) = (ev.events, ev.u64);
                let fd = token as c_int;

                if fd == self.listen_fd {
                    self.accept();
                } else if fd == self.signals.read_fd() {
                    signals.clear();
                    if let Err(e) = self.signals.drain(&mut signals) {
                        error!(error = %e, "signal pipe read failed");
                        continue;
                    }
                    for byte in &signals {
                        match *byte {
                            SIG_ALARM => timeout = true,
                            SIG_TERMINATE => stop = true,
                            _ => {}
                        }
                    }
                } else if fd == self.ctx.wake.read_fd() {
                    signals.clear();
                    if let Err(e) = self.ctx.wake.drain(&mut signals) {
                        error!(error = %e, "wake pipe read failed");
                    }
                    self.reap_completions();
                } else if bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                    self.close(fd, "peer hang-up");
                } else if bits & EPOLLIN != 0 {
                    self.on_readable(fd);
                } else if bits & EPOLLOUT != 0 {
                    self.on_writable(fd);
                }
            }

            self.reap_completions();
            if timeout {
                self.sweep(Instant::now());
            }
            if stop {
                info!(live = self.conns.len(), "event loop stopping");
                return Ok(());
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
            if self.listen_trigger == TriggerMode::Level {
                break;
            }
        }
    }

    fn admit(&mut self, fd: c_int, peer: SocketAddr) {
        if self.metrics.live() >= self.max_connections {
            warn!(%peer, "connection limit reached");
            self.metrics.inc_busy();
            syscalls::send_best_effort(fd, BUSY_REPLY);
            syscalls::close_fd(fd);
            return;
        }
        if let Err(e) = self.ctx.epoll.add(fd, Interest::Readable, self.conn_trigger, true) {
            error!(%peer, error = %e, "failed to register connection");
            syscalls::close_fd(fd);
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let conn = Arc::new(Mutex::new(Conn::new(fd, peer, generation, self.conn_trigger)));
        let timer = self.timers.add(
            Instant::now() + self.idle_timeout,
            TimerTarget {
                fd,
                generation,
                peer,
            },
        );
        self.conns.insert(
            fd,
            Slot {
                conn,
                generation,
                timer: Some(timer),
            },
        );
        self.metrics.inc_conn();
        info!(%peer, fd, live = self.metrics.live(), "connection accepted");
    }

    fn task_for(&self, fd: c_int) -> Option<ConnTask> {
        let slot = self.conns.get(&fd)?;
        Some(ConnTask::new(
            Arc::clone(&slot.conn),
            fd,
            slot.generation,
            Arc::clone(&self.ctx),
        ))
    }

    fn on_readable(&mut self, fd: c_int) {
        let Some(task) = self.task_for(fd) else {
            return;
        };
        match self.model {
            ActorModel::Reactor => {
                self.touch(fd);
                if let Err(e) = self.pool.submit(task, Phase::Read) {
                    self.reject(fd, e);
                }
            }
            ActorModel::Proactor => {
                let read = match self.conns.get(&fd) {
                    Some(slot) => slot.conn.lock().read_once(),
                    None => return,
                };
                if !read {
                    self.close(fd, "read failed");
                    return;
                }
                self.touch(fd);
                if let Err(e) = self.pool.submit_untagged(task) {
                    self.reject(fd, e);
                }
            }
        }
    }

    fn on_writable(&mut self, fd: c_int) {
        match self.model {
            ActorModel::Reactor => {
                let Some(task) = self.task_for(fd) else {
                    return;
                };
                self.touch(fd);
                if let Err(e) = self.pool.submit(task, Phase::Write) {
                    self.reject(fd, e);
                }
            }
            ActorModel::Proactor => {
                let written = match self.conns.get(&fd) {
                    Some(slot) => slot.conn.lock().write(&self.ctx.epoll),
                    None => return,
                };
                if written {
                    self.touch(fd);
                } else {
                    self.close(fd, "response complete");
                }
            }
        }
    }

    fn reject(&mut self, fd: c_int, err: crate::error::ServerError) {
        warn!(fd, error = %err, "dropping connection");
        self.metrics.inc_queue_full();
        self.close(fd, "work queue full");
    }

    /// Push the connection's idle deadline out by three ticks.
    fn touch(&mut self, fd: c_int) {
        if let Some(id) = self.conns.get(&fd).and_then(|slot| slot.timer) {
            self.timers.adjust(id, Instant::now() + self.idle_timeout);
        }
    }

    fn close(&mut self, fd: c_int, reason: &str) {
        let Some(slot) = self.conns.remove(&fd) else {
            return;
        };
        let mut conn = slot.conn.lock();
        let peer = conn.peer();
        if conn.close(&self.ctx.epoll) {
            self.metrics.dec_conn();
        }
        drop(conn);
        if let Some(id) = slot.timer {
            self.timers.remove(id);
        }
        info!(%peer, fd, reason, live = self.metrics.live(), "connection closed");
    }

    fn reap_completions(&mut self) {
        while let Some(done) = self.ctx.completions.pop() {
            let flagged = self
                .conns
                .get(&done.fd)
                .filter(|slot| slot.generation == done.generation)
                .is_some_and(|slot| slot.conn.lock().close_requested());
            if flagged {
                self.close(done.fd, "worker gave up");
            } else {
                debug!(fd = done.fd, "stale completion ignored");
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        let mut expired = Vec::new();
        self.timers.sweep(now, |target| expired.push(target));
        for target in expired {
            let current = self.conns.get(&target.fd).map(|slot| slot.generation);
            if current != Some(target.generation) {
                debug!(fd = target.fd, "stale timer ignored");
                continue;
            }
            info!(peer = %target.peer, fd = target.fd, "idle connection expired");
            self.metrics.inc_expired();
            self.close(target.fd, "idle timeout");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let fds: Vec<c_int> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close(fd, "shutdown");
        }
        if let Err(e) = self.ctx.epoll.delete(self.listen_fd) {
            debug!(error = %e, "listener deregister failed");
        }
        syscalls::close_fd(self.listen_fd);
    }
}
