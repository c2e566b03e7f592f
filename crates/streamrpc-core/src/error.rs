use std::time::Duration;

use serde_json::{json, Value};
use streamrpc_frame::FrameError;
use streamrpc_transport::TransportError;

/// JSON-RPC error codes written into `error.code`.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const STOPPING: i64 = -32001;
    pub const MESSAGE_LENGTH: i64 = -32003;
    pub const MISSING_RESPONSE: i64 = -32004;
    pub const APPLICATION: i64 = -32005;
    pub const REMOTE: i64 = -32006;
    pub const STREAM_ENDED: i64 = -32007;
    pub const TIMED_OUT: i64 = -32008;
    pub const CONNECTION: i64 = -32013;
    pub const HANDLER_ABORTED: i64 = -32015;
}

/// Category of an [`RpcError`], used for retry and exit-code decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing JSON-RPC fields, including invalid params.
    Parse,
    /// A deadline elapsed.
    Timeout,
    /// The handler failed, was missing, or the stream ended before a result.
    HandlerFailed,
    /// The stream closed while data was still expected.
    StreamEnded,
    /// The byte budget for one message was exceeded.
    MessageLength,
    /// The call was cancelled through its abort signal.
    Cancelled,
    /// The server was destroyed while the call was running.
    Destroyed,
    /// The server is no longer accepting calls.
    NotRunning,
    /// Local misconfiguration, such as a manifest mismatch.
    Config,
    /// The raw stream could not be established or broke.
    Transport,
    /// A domain error raised by a handler.
    Application,
    /// A remote error whose kind is not registered locally.
    Unknown,
}

/// Domain error raised by a handler and carried across the wire.
///
/// `kind` names the error on the wire; register the same kind in the calling
/// side's `ErrorRegistry` to get it back as an `ApplicationError`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ApplicationError {
    pub kind: String,
    pub message: String,
    pub exit_code: Option<i32>,
    pub data: Option<Value>,
}

impl ApplicationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            exit_code: None,
            data: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Errors produced by RPC calls on either side of a stream.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("message too large ({size} bytes, max {max})")]
    MessageLength { size: usize, max: usize },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no handler registered for method `{0}`")]
    HandlerMissing(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("stream ended without a response")]
    MissingResponse,

    #[error("stream ended: {0}")]
    StreamEnded(String),

    #[error("call aborted: {0}")]
    Aborted(String),

    #[error("server destroyed: {0}")]
    Destroyed(String),

    #[error("server is not running")]
    NotRunning,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error response received from the other end of the call.
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        #[source]
        cause: Box<RpcError>,
    },

    #[error(transparent)]
    Application(#[from] ApplicationError),

    #[error("unknown remote error `{kind}`: {message}")]
    Unknown {
        kind: String,
        message: String,
        data: Option<Value>,
        #[source]
        cause: Option<Box<RpcError>>,
    },
}

pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// The category of this error. Remote errors report their cause's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) | Self::InvalidParams(_) => ErrorKind::Parse,
            Self::MessageLength { .. } => ErrorKind::MessageLength,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::HandlerMissing(_) | Self::HandlerFailed(_) | Self::MissingResponse => {
                ErrorKind::HandlerFailed
            }
            Self::StreamEnded(_) => ErrorKind::StreamEnded,
            Self::Aborted(_) => ErrorKind::Cancelled,
            Self::Destroyed(_) => ErrorKind::Destroyed,
            Self::NotRunning => ErrorKind::NotRunning,
            Self::Config(_) => ErrorKind::Config,
            Self::Transport(_) | Self::Io(_) => ErrorKind::Transport,
            Self::Remote { cause, .. } => cause.kind(),
            Self::Application(_) => ErrorKind::Application,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// The JSON-RPC `error.code` used when this error is sent to a peer.
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => codes::PARSE_ERROR,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::MessageLength { .. } => codes::MESSAGE_LENGTH,
            Self::Timeout(_) => codes::TIMED_OUT,
            Self::HandlerMissing(_) => codes::METHOD_NOT_FOUND,
            Self::HandlerFailed(_) | Self::Config(_) => codes::INTERNAL_ERROR,
            Self::MissingResponse => codes::MISSING_RESPONSE,
            Self::StreamEnded(_) => codes::STREAM_ENDED,
            Self::Aborted(_) => codes::HANDLER_ABORTED,
            Self::Destroyed(_) | Self::NotRunning => codes::STOPPING,
            Self::Transport(_) | Self::Io(_) => codes::CONNECTION,
            Self::Remote { .. } | Self::Unknown { .. } => codes::REMOTE,
            Self::Application(_) => codes::APPLICATION,
        }
    }

    /// The kind name written into the wire error record.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Parse(_) => "Parse",
            Self::InvalidParams(_) => "InvalidParams",
            Self::MessageLength { .. } => "MessageLength",
            Self::Timeout(_) => "Timeout",
            Self::HandlerMissing(_) => "HandlerMissing",
            Self::HandlerFailed(_) => "HandlerFailed",
            Self::MissingResponse => "MissingResponse",
            Self::StreamEnded(_) => "StreamEnded",
            Self::Aborted(_) => "Aborted",
            Self::Destroyed(_) => "Destroyed",
            Self::NotRunning => "NotRunning",
            Self::Config(_) => "Config",
            Self::Transport(_) | Self::Io(_) => "Transport",
            Self::Remote { .. } => "Remote",
            Self::Application(err) => &err.kind,
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// The message carried by this error without its display prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::Parse(msg)
            | Self::InvalidParams(msg)
            | Self::HandlerMissing(msg)
            | Self::HandlerFailed(msg)
            | Self::StreamEnded(msg)
            | Self::Aborted(msg)
            | Self::Destroyed(msg)
            | Self::Config(msg) => msg.clone(),
            Self::Remote { message, .. } | Self::Unknown { message, .. } => message.clone(),
            Self::Application(err) => err.message.clone(),
            other => other.to_string(),
        }
    }

    /// Structured data needed to rebuild this error on the other side.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::MessageLength { size, max } => Some(json!({ "size": size, "max": max })),
            Self::Timeout(after) => Some(json!({ "timeout_ms": after.as_millis() as u64 })),
            Self::Remote { code, .. } => Some(json!({ "code": code })),
            Self::Application(err) => err.data.clone(),
            Self::Unknown { data, .. } => data.clone(),
            _ => None,
        }
    }

    /// Process exit code requested by the origin error, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Application(err) => err.exit_code,
            Self::Remote { cause, .. } => cause.exit_code(),
            _ => None,
        }
    }

    /// True for errors caused by timeouts, aborts or server teardown rather
    /// than by the protocol or the handler.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Aborted(_) | Self::Destroyed(_) => true,
            Self::Remote { cause, .. } => cause.is_cancellation(),
            _ => false,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// The reconstructed origin error of a remote failure.
    pub fn remote_cause(&self) -> Option<&RpcError> {
        match self {
            Self::Remote { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Parse(msg) => Self::Parse(msg),
            FrameError::Json(err) => Self::Parse(err.to_string()),
            FrameError::MessageLength { size, max } => Self::MessageLength { size, max },
            FrameError::Io(err) => Self::Io(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}
