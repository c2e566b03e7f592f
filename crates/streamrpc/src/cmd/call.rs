use std::fs;

use futures::TryStreamExt;
use serde_json::Value;
use streamrpc_core::{CallOptions, HandlerType, Manifest, Result as RpcResult, RpcClient, RpcError};
use streamrpc_transport::UnixSocketFactory;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::cmd::{parse_duration, CallArgs, Shape};
use crate::exit::{io_error, rpc_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_outputs, print_raw_call, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let inputs = parse_inputs(&args.inputs)?;

    let mut builder = RpcClient::builder(UnixSocketFactory::new(&args.path));
    if let Some(path) = &args.manifest {
        let text = fs::read_to_string(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        let manifest = Manifest::from_json(&text).map_err(|err| rpc_error("manifest", err))?;
        builder = builder.with_manifest(manifest);
    }
    let client = builder.build();
    let options = CallOptions::new().with_timeout(timeout);
    let method = args.method.as_str();
    debug!(method, shape = %HandlerType::from(args.shape), inputs = inputs.len(), "calling");

    if args.data.is_some() && args.shape != Shape::Raw {
        return Err(CliError::new(USAGE, "--data is only valid with --shape raw"));
    }

    let outputs = match args.shape {
        Shape::Unary => {
            let input = single_input(inputs)?;
            let output: Value = client
                .unary_caller(method, &input, options)
                .await
                .map_err(|err| rpc_error("call failed", err))?;
            vec![output]
        }
        Shape::Server => {
            let input = single_input(inputs)?;
            let reader = client
                .server_stream_caller(method, &input, options)
                .await
                .map_err(|err| rpc_error("call failed", err))?;
            reader
                .try_collect::<Vec<Value>>()
                .await
                .map_err(|err| rpc_error("call failed", err))?
        }
        Shape::Client => {
            let mut call = client
                .client_stream_caller::<Value>(method, options)
                .await
                .map_err(|err| rpc_error("call failed", err))?;
            for input in inputs {
                call.writer
                    .write_value(input)
                    .await
                    .map_err(|err| rpc_error("write failed", err))?;
            }
            let output = call
                .finish()
                .await
                .map_err(|err| rpc_error("call failed", err))?;
            vec![output]
        }
        Shape::Duplex => duplex(&client, method, inputs, options)
            .await
            .map_err(|err| rpc_error("call failed", err))?,
        Shape::Raw => {
            let params = match inputs.len() {
                0 => None,
                1 => inputs.into_iter().next(),
                _ => return Err(CliError::new(USAGE, "a raw call takes at most one --json")),
            };
            let payload = args.data.unwrap_or_default();
            return raw(&client, method, params, payload.as_bytes(), options, format).await;
        }
    };

    print_outputs(method, &outputs, format);
    Ok(SUCCESS)
}

/// Write every input while collecting outputs, so neither side stalls on a
/// full buffer.
async fn duplex(
    client: &RpcClient,
    method: &str,
    inputs: Vec<Value>,
    options: CallOptions,
) -> RpcResult<Vec<Value>> {
    let (mut writer, reader) = client.duplex_stream_caller(method, options).await?.split();
    let write = async move {
        for input in inputs {
            writer.write_value(input).await?;
        }
        writer.close();
        Ok::<_, RpcError>(())
    };
    let (written, outputs) = tokio::join!(write, reader.try_collect::<Vec<Value>>());
    let outputs = outputs?;
    written?;
    Ok(outputs)
}

async fn raw(
    client: &RpcClient,
    method: &str,
    params: Option<Value>,
    payload: &[u8],
    options: CallOptions,
    format: OutputFormat,
) -> CliResult<i32> {
    let call = client
        .raw_stream_caller(method, params, options)
        .await
        .map_err(|err| rpc_error("call failed", err))?;
    let (result, stream) = call.into_parts();
    let (mut reader, mut writer) = stream.split();

    let write = async move {
        writer.write_all(payload).await?;
        writer.shutdown().await
    };
    let mut received = Vec::new();
    let (written, read) = tokio::join!(write, reader.read_to_end(&mut received));
    read.map_err(|err| io_error("raw read failed", err))?;
    written.map_err(|err| io_error("raw write failed", err))?;

    print_raw_call(method, &result, &received, format);
    Ok(SUCCESS)
}

fn parse_inputs(raw: &[String]) -> CliResult<Vec<Value>> {
    raw.iter()
        .map(|text| {
            serde_json::from_str(text)
                .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))
        })
        .collect()
}

/// Unary and server-stream calls take exactly one input; none means `null`.
fn single_input(inputs: Vec<Value>) -> CliResult<Value> {
    let mut inputs = inputs.into_iter();
    let input = inputs.next().unwrap_or(Value::Null);
    if inputs.next().is_some() {
        return Err(CliError::new(USAGE, "this shape takes a single --json input"));
    }
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inputs_must_be_json() {
        let inputs = parse_inputs(&["1".to_string(), r#"{"v":1}"#.to_string()])
            .expect("inputs should parse");
        assert_eq!(inputs, vec![json!(1), json!({"v": 1})]);

        let err = parse_inputs(&["{nope".to_string()]).unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn single_input_defaults_to_null() {
        assert_eq!(single_input(vec![]).expect("empty is null"), Value::Null);
        assert_eq!(single_input(vec![json!(3)]).expect("one input"), json!(3));
        assert_eq!(single_input(vec![json!(1), json!(2)]).unwrap_err().code, USAGE);
    }
}
