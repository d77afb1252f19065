use std::io;

/// Central error type for server setup and socket plumbing.
///
/// Request-level failures never surface here: the parser and resolver
/// report them as [`HttpCode`](crate::http::HttpCode) values that turn
/// into an HTTP response on the same worker.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
    /// The worker queue is at capacity.
    #[error("worker queue is full")]
    QueueFull,
    /// The worker pool could not be built.
    #[error("worker pool error: {0}")]
    Pool(String),
    /// The credential store rejected an operation.
    #[error("credential store error: {0}")]
    Store(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
