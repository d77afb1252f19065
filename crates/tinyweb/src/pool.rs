// src/pool.rs
//! Fixed-size worker pool fed by a bounded FIFO.
//!
//! The queue is a `VecDeque` under a mutex; a counting semaphore tracks its
//! depth so idle workers sleep until there is something to pop. Submitting
//! to a full queue fails instead of blocking the event loop.

use crate::error::{ServerError, ServerResult};
use crate::sync::{Mutex, Semaphore};
use serde::Deserialize;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// Which side performs socket I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorModel {
    /// The event loop reads and writes; workers only parse and compose.
    #[default]
    Proactor,
    /// Workers do the reads and writes themselves.
    Reactor,
}

impl FromStr for ActorModel {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "proactor" | "0" => Ok(ActorModel::Proactor),
            "reactor" | "1" => Ok(ActorModel::Reactor),
            other => Err(ServerError::Config(format!("unknown actor model `{other}`"))),
        }
    }
}

/// Direction tag carried by reactor-mode work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Write,
}

/// What a worker can do with a queued item.
pub trait Task: Send + 'static {
    fn read_step(&self) -> bool;
    fn write_step(&self) -> bool;
    fn process(&self) -> bool;
    /// Called after a failed step; the owner decides how to tear down.
    fn abandon(&self);
}

pub struct WorkItem<T> {
    pub task: T,
    pub phase: Option<Phase>,
}

struct Shared<T> {
    queue: Mutex<VecDeque<WorkItem<T>>>,
    pending: Semaphore,
    capacity: usize,
    model: ActorModel,
    shutdown: AtomicBool,
}

pub struct ThreadPool<T: Task> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Task> ThreadPool<T> {
    pub fn new(workers: usize, capacity: usize, model: ActorModel) -> ServerResult<Self> {
        if workers == 0 {
            return Err(ServerError::Pool("worker count must be positive".into()));
        }
        if capacity == 0 {
            return Err(ServerError::Pool("queue capacity must be positive".into()));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            pending: Semaphore::new(0),
            capacity,
            model,
            shutdown: AtomicBool::new(false),
        });
        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(workers),
        };

        for id in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("tinyweb-worker-{id}"))
                .spawn(move || worker_loop(id, shared))
                .map_err(|e| ServerError::Pool(format!("failed to spawn worker {id}: {e}")))?;
            pool.workers.push(handle);
        }
        info!(workers, capacity, ?model, "worker pool started");
        Ok(pool)
    }

    /// Queue a reactor-mode item tagged with the direction to handle.
    pub fn submit(&self, task: T, phase: Phase) -> ServerResult<()> {
        self.push(WorkItem {
            task,
            phase: Some(phase),
        })
    }

    /// Queue a proactor-mode item; the loop already did the I/O.
    pub fn submit_untagged(&self, task: T) -> ServerResult<()> {
        self.push(WorkItem { task, phase: None })
    }

    fn push(&self, item: WorkItem<T>) -> ServerResult<()> {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.capacity {
            return Err(ServerError::QueueFull);
        }
        queue.push_back(item);
        drop(queue);
        self.shared.pending.post();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl<T: Task> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            self.shared.pending.post();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T: Task>(id: usize, shared: Arc<Shared<T>>) {
    debug!(worker = id, "worker ready");
    loop {
        shared.pending.wait();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let Some(item) = shared.queue.lock().pop_front() else {
            continue;
        };
        run(shared.model, item);
    }
    debug!(worker = id, "worker exiting");
}

fn run<T: Task>(model: ActorModel, item: WorkItem<T>) {
    let task = item.task;
    let ok = match (model, item.phase) {
        (ActorModel::Reactor, Some(Phase::Read)) => task.read_step() && task.process(),
        (ActorModel::Reactor, Some(Phase::Write)) => task.write_step(),
        (ActorModel::Proactor, _) | (ActorModel::Reactor, None) => task.process(),
    };
    if !ok {
        task.abandon();
    }
}
