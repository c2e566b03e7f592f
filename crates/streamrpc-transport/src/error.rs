use std::io;
use std::path::PathBuf;

/// Failures opening, accepting or driving a call's byte stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot listen on {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error("cannot reach {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error("accept failed: {0}")]
    Accept(io::Error),

    #[error("stream I/O failed: {0}")]
    Io(#[from] io::Error),

    /// `sun_path` holds at most `max` bytes including the trailing NUL.
    #[error("socket path is {len} bytes, limit is {max}: {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The stream source no longer hands out streams, e.g. a loopback whose
    /// server was destroyed.
    #[error("stream source is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
