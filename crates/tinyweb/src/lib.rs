//! tinyweb: an epoll-driven HTTP/1.1 server core.
//!
//! One event-loop thread accepts connections and waits for readiness; a
//! fixed pool of workers parses requests and composes responses; an
//! ascending timer list closes connections that sit idle for three ticks.
//!
//! ```rust,no_run
//! use tinyweb::{Config, Server};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     tinyweb::init_logging(&config);
//!     Server::new(config).serve()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conn;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod resolve;
pub mod response;
pub mod server;
pub mod sync;
pub mod syscalls;
pub mod timer;

pub use config::Config;
pub use credentials::{CredentialStore, CredentialTable, FileStore, MemoryStore, StorePool};
pub use error::{ServerError, ServerResult};
pub use http::{HttpCode, Method};
pub use logging::init_logging;
pub use pool::{ActorModel, Phase, Task, ThreadPool};
pub use server::{Server, ServerHandle, ShutdownTrigger};
pub use syscalls::TriggerMode;
pub use timer::{TimerId, TimerList};
