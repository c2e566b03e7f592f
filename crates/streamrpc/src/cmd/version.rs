use streamrpc_core::{DEFAULT_GRACE_PERIOD, DEFAULT_HANDLER_TIMEOUT};
use streamrpc_frame::DEFAULT_MAX_MESSAGE_BYTES;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("streamrpc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: streamrpc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target: {}", env!("STREAMRPC_BUILD_TARGET"));
    println!(
        "rustc: {}",
        option_env!("STREAMRPC_RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("features: schema={}, cli=true", cfg!(feature = "schema"));
    println!("handler_timeout: {DEFAULT_HANDLER_TIMEOUT:?}");
    println!("grace_period: {DEFAULT_GRACE_PERIOD:?}");
    println!("max_message_bytes: {DEFAULT_MAX_MESSAGE_BYTES}");

    Ok(SUCCESS)
}
