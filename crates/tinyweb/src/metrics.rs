// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Connection counters shared between the event loop and the server handle.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub live_conns: AtomicUsize,
    pub accepted: AtomicUsize,
    pub rejected_busy: AtomicUsize,
    pub expired: AtomicUsize,
    pub queue_full: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            live_conns: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            rejected_busy: AtomicUsize::new(0),
            expired: AtomicUsize::new(0),
            queue_full: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.live_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn live(&self) -> usize {
        self.live_conns.load(Ordering::Relaxed)
    }

    pub fn inc_busy(&self) {
        self.rejected_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
