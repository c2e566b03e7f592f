use std::fmt;
use std::io;

use streamrpc_core::{ErrorKind, RpcError};
use streamrpc_transport::TransportError;

// Exit codes follow sysexits where one applies. 124 matches timeout(1).
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

/// Map a call failure onto an exit code. Application errors that carry their
/// own exit code keep it, local or remote.
pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    if let Some(code) = err.exit_code() {
        return CliError::new(code, format!("{context}: {err}"));
    }
    let code = match err.kind() {
        ErrorKind::Timeout => TIMEOUT,
        ErrorKind::Parse | ErrorKind::MessageLength => DATA_INVALID,
        ErrorKind::Config => USAGE,
        ErrorKind::Transport | ErrorKind::NotRunning => {
            return match err {
                RpcError::Transport(err) => transport_error(context, err),
                RpcError::Io(err) => io_error(context, err),
                other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
            };
        }
        ErrorKind::HandlerFailed
        | ErrorKind::StreamEnded
        | ErrorKind::Cancelled
        | ErrorKind::Destroyed
        | ErrorKind::Application
        | ErrorKind::Unknown => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}
