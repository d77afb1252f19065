// src/server.rs
use crate::config::Config;
use crate::credentials::{CredentialTable, MemoryStore, StorePool};
use crate::dispatch::Context;
use crate::error::{ServerError, ServerResult};
use crate::metrics::ServerMetrics;
use crate::reactor::{EventLoop, SIG_ALARM, SIG_TERMINATE};
use crate::resolve::Resolver;
use crate::syscalls::{self, Epoll, Pipe};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::info;

/// Builder for a tinyweb server.
pub struct Server {
    config: Config,
    store: Option<StorePool>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Use these credential store handles instead of the configured ones.
    pub fn store_pool(mut self, store: StorePool) -> Self {
        self.store = Some(store);
        self
    }

    /// Start and block until shutdown.
    pub fn serve(self) -> ServerResult<()> {
        self.start()?.join()
    }

    /// Bind, spawn the event loop and the ticker, and return immediately.
    pub fn start(self) -> ServerResult<ServerHandle> {
        let config = self.config;
        config.validate()?;

        let addr: SocketAddr = config.server_addr().parse()?;
        let listen_fd = syscalls::create_listen_socket(&addr, config.opt_linger)?;
        let local_addr = match syscalls::local_addr(listen_fd) {
            Ok(addr) => addr,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e);
            }
        };

        let prepared = prepare(&config, self.store);
        let (ctx, signals, metrics) = match prepared {
            Ok(parts) => parts,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e);
            }
        };
        let mut event_loop = EventLoop::new(
            &config,
            listen_fd,
            ctx,
            Arc::clone(&signals),
            Arc::clone(&metrics),
        )?;

        let loop_thread = thread::Builder::new()
            .name("tinyweb-loop".into())
            .spawn(move || event_loop.run())?;

        let ticking = Arc::new(AtomicBool::new(true));
        let spawned = {
            let signals = Arc::clone(&signals);
            let ticking = Arc::clone(&ticking);
            let timeslot = config.timeslot();
            thread::Builder::new()
                .name("tinyweb-ticker".into())
                .spawn(move || tick(&signals, &ticking, timeslot))
        };
        let ticker = match spawned {
            Ok(ticker) => ticker,
            Err(e) => {
                signals.notify(SIG_TERMINATE);
                let _ = loop_thread.join();
                return Err(e.into());
            }
        };

        info!(
            addr = %local_addr,
            root = %config.doc_root.display(),
            "tinyweb listening"
        );
        Ok(ServerHandle {
            local_addr,
            shutdown: ShutdownTrigger { signals },
            ticking,
            metrics,
            loop_thread: Some(loop_thread),
            ticker: Some(ticker),
        })
    }
}

fn prepare(
    config: &Config,
    store: Option<StorePool>,
) -> ServerResult<(Arc<Context>, Arc<Pipe>, Arc<ServerMetrics>)> {
    let store = match (store, &config.credentials_path) {
        (Some(store), _) => store,
        (None, Some(path)) => StorePool::file(path, config.store_pool_size)?,
        (None, None) => StorePool::memory(MemoryStore::new(), config.store_pool_size)?,
    };
    let credentials = CredentialTable::load(&store)?;
    let resolver = Resolver::new(&config.doc_root, config.default_page.clone(), credentials, store);

    let ctx = Context::new(Epoll::new()?, resolver, Pipe::new()?);
    Ok((Arc::new(ctx), Arc::new(Pipe::new()?), Arc::new(ServerMetrics::new())))
}

/// Write an alarm byte every `timeslot` until told to stop.
fn tick(signals: &Pipe, ticking: &AtomicBool, timeslot: Duration) {
    let step = Duration::from_millis(50).min(timeslot);
    let mut next = Instant::now() + timeslot;
    while ticking.load(Ordering::Acquire) {
        thread::sleep(step);
        if Instant::now() >= next {
            signals.notify(SIG_ALARM);
            next += timeslot;
        }
    }
}

/// Cloneable handle that stops the event loop; safe to call from a signal
/// handler thread.
#[derive(Clone)]
pub struct ShutdownTrigger {
    signals: Arc<Pipe>,
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.signals.notify(SIG_TERMINATE);
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: ShutdownTrigger,
    ticking: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
    loop_thread: Option<JoinHandle<ServerResult<()>>>,
    ticker: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.fire();
    }

    /// Wait for the event loop to exit, then stop the ticker.
    pub fn join(mut self) -> ServerResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> ServerResult<()> {
        let result = match self.loop_thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(ServerError::Pool("event loop panicked".into()))),
            None => Ok(()),
        };
        self.ticking.store(false, Ordering::Release);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        result
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.loop_thread.is_some() {
            self.shutdown();
            let _ = self.finish();
        }
    }
}
