//! Structured error kinds shared by every layer of the engine.
//!
//! Every fallible call inside the core returns [`FluxError`] and is
//! propagated with `?`; per the engine's error-handling design there is no
//! local recovery path. The outermost worker binary is the only place that
//! catches a `FluxError`, logs it, and exits the process.

use std::path::PathBuf;

/// Result alias used throughout the core crates.
pub type Result<T> = std::result::Result<T, FluxError>;

/// The fatal error kinds a worker process can encounter.
///
/// Every variant is fail-fast: there is no partial-success state once one
/// of these is raised out of the block pool, a stream, a reduce table, or
/// the stage builder.
#[derive(Debug, thiserror::Error)]
pub enum FluxError {
    /// Both the RAM budget and disk scratch space are exhausted.
    #[error("resource exhausted: requested {requested} bytes, budget {budget} bytes")]
    ResourceExhausted { requested: usize, budget: usize },

    /// A read or write on a spill file, scratch file, or persisted file failed.
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A group-transport channel dropped a connection or returned a short read.
    #[error("transport failure talking to peer {peer}: {detail}")]
    Transport { peer: u32, detail: String },

    /// An invariant of the wire protocol or a single-writer/single-reader
    /// contract was violated: double-open writer, double-close stream, an
    /// unexpected block header.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A user-supplied callback (map function, reduce function, key
    /// extractor, …) returned an error.
    #[error("user callback failed: {0}")]
    Callback(#[source] anyhow::Error),

    /// The caller misused an API: reading a file before its writer closed,
    /// mutating a node already marked `CACHED`, registering a child on a
    /// disposed node, and so on.
    #[error("misuse: {0}")]
    Misuse(String),
}

impl FluxError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FluxError::Io { path: path.into(), source }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        FluxError::ProtocolViolation(msg.into())
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        FluxError::Misuse(msg.into())
    }

    pub fn callback(err: impl Into<anyhow::Error>) -> Self {
        FluxError::Callback(err.into())
    }
}
