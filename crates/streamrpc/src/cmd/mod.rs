use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use streamrpc_core::HandlerType;
use streamrpc_frame::DEFAULT_MAX_MESSAGE_BYTES;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demo methods on a Unix socket.
    Serve(ServeArgs),
    /// Run one call against a server and print its outputs.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args).await,
        Command::Call(args) => call::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Inactivity deadline per call (e.g. 60s, 500ms).
    #[arg(long, default_value = "60s", env = "STREAMRPC_HANDLER_TIMEOUT")]
    pub handler_timeout: String,
    /// Time an aborted call gets before its stream is cut.
    #[arg(long, default_value = "2s", env = "STREAMRPC_GRACE_PERIOD")]
    pub grace_period: String,
    /// Largest accepted message, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,
    /// Leave debug stacks out of error responses.
    #[arg(long)]
    pub sensitive: bool,
    /// Schema directory for params validation.
    #[arg(long, value_name = "DIR")]
    pub validate: Option<PathBuf>,
}

/// Call shape requested on the command line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Shape {
    Unary,
    Server,
    Client,
    Duplex,
    Raw,
}

impl From<Shape> for HandlerType {
    fn from(shape: Shape) -> Self {
        match shape {
            Shape::Unary => HandlerType::Unary,
            Shape::Server => HandlerType::Server,
            Shape::Client => HandlerType::Client,
            Shape::Duplex => HandlerType::Duplex,
            Shape::Raw => HandlerType::Raw,
        }
    }
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Method to call.
    pub method: String,
    /// Call shape.
    #[arg(long, value_enum, default_value = "unary")]
    pub shape: Shape,
    /// JSON input. Repeat for client-stream and duplex calls. For raw calls
    /// this is the header params.
    #[arg(long = "json", value_name = "JSON")]
    pub inputs: Vec<String>,
    /// Payload bytes for a raw call.
    #[arg(long)]
    pub data: Option<String>,
    /// Call deadline, refreshed by every received message (e.g. 5s, 500ms).
    #[arg(long, default_value = "60s", env = "STREAMRPC_CALL_TIMEOUT")]
    pub timeout: String,
    /// Manifest file mapping methods to shapes, checked before calling.
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
