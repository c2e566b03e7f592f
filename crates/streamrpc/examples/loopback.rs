//! Serve and call every handler shape in one process.
//!
//! ```sh
//! cargo run -p streamrpc --example loopback
//! ```

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use streamrpc::rpc::{decode_input, DestroyOptions, ValueStream};
use streamrpc::{CallContext, CallOptions, Handler, RpcClient, RpcError, RpcServer};

#[tokio::main]
async fn main() -> Result<(), RpcError> {
    let server = RpcServer::builder()
        .handler(
            "greet",
            Handler::unary(|input: Value, _ctx: CallContext| async move {
                let name: String = decode_input(input)?;
                Ok(json!(format!("hello, {name}")))
            }),
        )
        .handler(
            "letters",
            Handler::server(|input: Value, _ctx: CallContext| {
                let word = input.as_str().unwrap_or_default().to_string();
                stream::iter(
                    word.chars()
                        .map(|c| Ok::<_, RpcError>(json!(c.to_string())))
                        .collect::<Vec<_>>(),
                )
            }),
        )
        .handler(
            "count",
            Handler::client(|input: ValueStream, _ctx: CallContext| async move {
                Ok(json!(input.count().await))
            }),
        )
        .handler(
            "double",
            Handler::duplex(|input: ValueStream, _ctx: CallContext| {
                input.and_then(|value| async move {
                    let n: i64 = decode_input(value)?;
                    Ok(json!(n * 2))
                })
            }),
        )
        .build()?;

    let client = RpcClient::new(server.loopback());

    let greeting: String = client
        .unary_caller("greet", &"loopback", CallOptions::new())
        .await?;
    println!("greet    -> {greeting}");

    let letters: Vec<Value> = client
        .server_stream_caller("letters", &"abc", CallOptions::new())
        .await?
        .try_collect()
        .await?;
    println!("letters  -> {letters:?}");

    let mut call = client
        .client_stream_caller::<usize>("count", CallOptions::new())
        .await?;
    for value in ["x", "y", "z"] {
        call.writer.write(&value).await?;
    }
    println!("count    -> {}", call.finish().await?);

    let (mut writer, mut reader) = client
        .duplex_stream_caller("double", CallOptions::new())
        .await?
        .split();
    for n in 1..=3 {
        writer.write(&n).await?;
        if let Some(doubled) = reader.read::<i64>().await? {
            println!("double   -> {n} * 2 = {doubled}");
        }
    }
    writer.close();

    server.destroy(DestroyOptions::graceful()).await;
    Ok(())
}
