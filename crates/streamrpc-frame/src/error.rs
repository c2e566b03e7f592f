/// Errors that can occur while framing or parsing JSON-RPC messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The bytes or the decoded value are not a valid JSON-RPC message.
    #[error("parse error: {0}")]
    Parse(String),

    /// A single message grew past the configured byte budget.
    #[error("message too large ({size} bytes, max {max})")]
    MessageLength { size: usize, max: usize },

    /// Malformed JSON inside an object boundary.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O error occurred while reading or writing messages.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
