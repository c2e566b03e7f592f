use std::sync::Arc;

use futures::future;
use futures::stream::{self, TryStreamExt};
use serde_json::{json, Value};
use streamrpc_core::{
    decode_input, schema_validation, CallContext, DestroyOptions, Handler, RpcError, RpcServer,
    RpcServerBuilder, ServerConfig, ValueStream,
};
use streamrpc_frame::JsonRpcRequest;
use streamrpc_schema::{RegistryConfig, SchemaRegistry};
use streamrpc_transport::{BoxedReader, UnixSocketListener};
use tracing::{debug, info, warn};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{rpc_error, transport_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS};

pub async fn run(args: ServeArgs) -> CliResult<i32> {
    let config = ServerConfig {
        handler_timeout: parse_duration(&args.handler_timeout)?,
        grace_period: parse_duration(&args.grace_period)?,
        max_message_bytes: args.max_message_bytes,
        sensitive: args.sensitive,
        ..ServerConfig::default()
    };

    let mut builder = demo_server().with_config(config);
    if let Some(dir) = &args.validate {
        let registry = SchemaRegistry::from_directory_with_config(dir, RegistryConfig::strict())
            .map_err(|err| CliError::new(DATA_INVALID, format!("schema load failed: {err}")))?;
        info!(methods = ?registry.methods(), "validating params");
        builder = builder.with_middleware(schema_validation(Arc::new(registry)));
    }
    let server = builder
        .build()
        .map_err(|err| rpc_error("server setup failed", err))?;

    let listener =
        UnixSocketListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    let served = accept_until_interrupted(&server, &listener).await;

    let reason = if served.is_ok() { "interrupted" } else { "listener failed" };
    server.destroy(DestroyOptions::force(reason)).await;
    served.map(|()| SUCCESS)
}

async fn accept_until_interrupted(
    server: &RpcServer,
    listener: &UnixSocketListener,
) -> CliResult<()> {
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            result = &mut interrupted => {
                result.map_err(|err| {
                    CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
                })?;
                info!(active_calls = server.active_calls(), "interrupted, shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let stream = accepted.map_err(|err| transport_error("accept failed", err))?;
                match server.handle_stream(stream) {
                    Ok(handle) => debug!(call_id = handle.id(), "call accepted"),
                    Err(err) => warn!(error = %err, "call refused"),
                }
            }
        }
    }
}

/// The demo methods, one per handler shape.
pub fn demo_server() -> RpcServerBuilder {
    RpcServer::builder()
        .handler(
            "echo",
            Handler::unary(|input: Value, _ctx: CallContext| async move { Ok(input) }),
        )
        .handler(
            "countTo",
            Handler::server(|input: Value, _ctx: CallContext| {
                stream::once(future::ready(decode_input::<u64>(input)))
                    .map_ok(|n| stream::iter((1..=n).map(|i| Ok::<_, RpcError>(json!(i)))))
                    .try_flatten()
            }),
        )
        .handler(
            "sum",
            Handler::client(|input: ValueStream, _ctx: CallContext| async move {
                let total = input
                    .and_then(|value| future::ready(decode_input::<i64>(value)))
                    .try_fold(0i64, |acc, n| future::ready(Ok(acc.saturating_add(n))))
                    .await?;
                Ok(json!(total))
            }),
        )
        .handler(
            "chat",
            Handler::duplex(|input: ValueStream, _ctx: CallContext| {
                input.map_ok(|value| json!({ "echo": value }))
            }),
        )
        .handler(
            "cat",
            Handler::raw(
                |header: JsonRpcRequest, input: BoxedReader, _ctx: CallContext| async move {
                    Ok((json!({ "method": header.method, "params": header.params }), input))
                },
            ),
        )
}
