//! Calling side: one fresh raw stream per call.
//!
//! Every caller goes through [`RpcClient::duplex_stream_caller`]'s machinery:
//! link the caller's signal, start or adopt a deadline, obtain a stream from
//! the factory, then pump encoded requests out and decoded responses in.
//! The raw caller skips the JSON pipeline after the header.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures::future::{self, BoxFuture};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use futures::{FutureExt, SinkExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use streamrpc_frame::{
    read_head, JsonRpcCodec, JsonRpcInput, JsonRpcRequest, JsonRpcResponse,
    DEFAULT_MAX_MESSAGE_BYTES,
};
use streamrpc_transport::{
    BoxedWriter, Metadata, RpcStream, StreamCanceller, StreamFactory, StreamParts,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};
use tracing::{debug, trace, Instrument};

use crate::context::CallContext;
use crate::error::{Result, RpcError};
use crate::manifest::{HandlerType, Manifest};
use crate::middleware::{compose, MessageStream, MiddlewareFactory};
use crate::signal::{AbortSignal, CancelReason};
use crate::timer::DeadlineTimer;
use crate::wire::ErrorRegistry;

/// Default deadline for a call without inbound traffic: 60 s.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for locally owned timers. Refreshed by every inbound message.
    pub call_timeout: Duration,
    pub max_message_bytes: usize,
    /// Outputs buffered between the decoder and a slow reader.
    pub output_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            output_buffer: 16,
        }
    }
}

/// Per-call cancellation and deadline options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Aborting this signal aborts the call. The call never aborts it back.
    pub signal: Option<AbortSignal>,
    /// Adopt this timer instead of starting one. An adopted timer is never
    /// refreshed or released by the call.
    pub timer: Option<DeadlineTimer>,
    /// Overrides [`ClientConfig::call_timeout`] for an owned timer.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_timer(mut self, timer: DeadlineTimer) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct RpcClientBuilder {
    factory: Arc<dyn StreamFactory>,
    manifest: Option<Manifest>,
    middleware: Vec<Arc<dyn MiddlewareFactory>>,
    errors: ErrorRegistry,
    config: ClientConfig,
}

impl RpcClientBuilder {
    /// Check every call against `manifest` before opening a stream.
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Append a middleware factory. Factories stack in registration order.
    pub fn with_middleware(mut self, factory: impl MiddlewareFactory) -> Self {
        self.middleware.push(Arc::new(factory));
        self
    }

    /// Replace the registry used to rebuild remote errors.
    pub fn with_error_registry(mut self, errors: ErrorRegistry) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> RpcClient {
        RpcClient {
            inner: Arc::new(ClientInner {
                factory: self.factory,
                manifest: self.manifest,
                middleware: self.middleware,
                errors: self.errors,
                config: self.config,
            }),
        }
    }
}

/// Opens calls against a remote [`RpcServer`](crate::RpcServer).
///
/// Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    factory: Arc<dyn StreamFactory>,
    manifest: Option<Manifest>,
    middleware: Vec<Arc<dyn MiddlewareFactory>>,
    errors: ErrorRegistry,
    config: ClientConfig,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("manifest", &self.inner.manifest)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn builder(factory: impl StreamFactory) -> RpcClientBuilder {
        RpcClientBuilder {
            factory: Arc::new(factory),
            manifest: None,
            middleware: Vec::new(),
            errors: ErrorRegistry::new(),
            config: ClientConfig::default(),
        }
    }

    pub fn new(factory: impl StreamFactory) -> Self {
        Self::builder(factory).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.inner.manifest.as_ref()
    }

    /// One input, one output.
    pub async fn unary_caller<I, O>(&self, method: &str, input: &I, options: CallOptions) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.check_manifest(method, HandlerType::Unary)?;
        let params = serde_json::to_value(input)?;
        let mut call = self.open(method, Some(params), options).await?;
        call.writer.close();
        call.reader.read::<O>().await?.ok_or(RpcError::MissingResponse)
    }

    /// One input, then a sequence of outputs. The write side is closed
    /// before this returns.
    pub async fn server_stream_caller<I>(
        &self,
        method: &str,
        input: &I,
        options: CallOptions,
    ) -> Result<CallReader>
    where
        I: Serialize + ?Sized,
    {
        self.check_manifest(method, HandlerType::Server)?;
        let params = serde_json::to_value(input)?;
        let mut call = self.open(method, Some(params), options).await?;
        call.writer.close();
        Ok(call.reader)
    }

    /// A sequence of inputs, then one output.
    pub async fn client_stream_caller<O>(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<ClientStreamCall<O>>
    where
        O: DeserializeOwned + Send + 'static,
    {
        self.check_manifest(method, HandlerType::Client)?;
        let call = self.open(method, None, options).await?;
        let DuplexCall { writer, mut reader, signal, meta } = call;
        let output = async move { reader.read::<O>().await?.ok_or(RpcError::MissingResponse) }.boxed();
        Ok(ClientStreamCall {
            writer,
            output,
            signal,
            meta,
        })
    }

    /// Independent sequences in both directions.
    pub async fn duplex_stream_caller(&self, method: &str, options: CallOptions) -> Result<DuplexCall> {
        self.check_manifest(method, HandlerType::Duplex)?;
        self.open(method, None, options).await
    }

    /// Send the header, read the leading result, then hand over the raw
    /// byte stream.
    ///
    /// An owned timer only covers the exchange of header and leading result.
    /// An adopted timer keeps governing the returned stream.
    pub async fn raw_stream_caller(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<RawCall> {
        self.check_manifest(method, HandlerType::Raw)?;
        let inner = &self.inner;
        let (signal, timer, owned) = inner.prepare(options);
        let span = tracing::debug_span!("rpc_client_call", method, shape = "raw");

        let result = async {
            let stream = inner.connect(&signal, &timer).await?;
            let ctx = CallContext::new(method, signal.clone(), timer.clone()).with_meta(stream.meta().clone());
            let (forward, reverse) = compose(&inner.middleware, &ctx).into_stages();
            let StreamParts {
                reader,
                mut writer,
                meta,
                canceller,
            } = stream.into_parts();

            let exchange = async {
                let header = JsonRpcRequest::new(method, params);
                let header = match forward(stream::once(future::ready(Ok(header))).boxed()).next().await {
                    Some(header) => header?,
                    None => return Err(RpcError::Config("middleware dropped the call header".to_string())),
                };
                let mut bytes = BytesMut::new();
                JsonRpcCodec::<JsonRpcRequest>::new().encode(header, &mut bytes)?;
                writer.write_all(&bytes).await?;
                writer.flush().await?;

                let (leading, rest) =
                    read_head::<JsonRpcResponse, _>(reader, inner.config.max_message_bytes).await?;
                let leading = leading.ok_or(RpcError::MissingResponse)?;
                let leading = match reverse(stream::once(future::ready(Ok(leading))).boxed()).next().await {
                    Some(leading) => leading?,
                    None => return Err(RpcError::MissingResponse),
                };
                match leading {
                    JsonRpcResponse::Result(response) => Ok((response.result, rest)),
                    JsonRpcResponse::Error(response) => Err(inner.errors.decode(response.error)),
                }
            };

            let outcome = tokio::select! {
                outcome = exchange => outcome,
                () = timer.expired() => Err(expire(&signal, &timer).to_error()),
                reason = signal.aborted() => Err(reason.to_error()),
            };
            let (result, rest) = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    canceller.cancel(err.to_string());
                    return Err(err);
                }
            };

            if !owned && spawn_deadline_watch(signal.clone(), timer.clone()).is_none() {
                trace!("adopted timer is unbounded, not watching it");
            }
            let stream = RpcStream::from_parts(StreamParts {
                reader: Box::pin(rest),
                writer,
                meta,
                canceller: StreamCanceller::from_token(signal.child_token()),
            });
            Ok(RawCall {
                result,
                stream,
                signal: signal.clone(),
                timer: timer.clone(),
            })
        }
        .instrument(span)
        .await;

        if owned {
            timer.cancel();
        }
        result
    }

    /// A stub for `method`, shaped by the configured manifest.
    pub fn caller(&self, method: &str) -> Result<Caller> {
        let kind = self
            .inner
            .manifest
            .as_ref()
            .and_then(|manifest| manifest.get(method))
            .ok_or_else(|| RpcError::Config(format!("missing caller for method `{method}`")))?;
        let stub = CallerStub {
            client: self.clone(),
            method: method.to_string(),
        };
        Ok(match kind {
            HandlerType::Raw => Caller::Raw(RawCaller(stub)),
            HandlerType::Unary => Caller::Unary(UnaryCaller(stub)),
            HandlerType::Server => Caller::Server(ServerCaller(stub)),
            HandlerType::Client => Caller::Client(ClientCaller(stub)),
            HandlerType::Duplex => Caller::Duplex(DuplexCaller(stub)),
        })
    }

    fn check_manifest(&self, method: &str, expected: HandlerType) -> Result<()> {
        let Some(manifest) = &self.inner.manifest else {
            return Ok(());
        };
        match manifest.get(method) {
            None => Err(RpcError::Config(format!("missing caller for method `{method}`"))),
            Some(declared) if declared != expected => Err(RpcError::Config(format!(
                "method `{method}` is declared {declared}, not {expected}"
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Open a JSON call. `header` becomes the params of the header request.
    async fn open(&self, method: &str, header: Option<Value>, options: CallOptions) -> Result<DuplexCall> {
        let inner = &self.inner;
        let (signal, timer, owned) = inner.prepare(options);
        let span = tracing::debug_span!("rpc_client_call", method);

        let stream = match inner.connect(&signal, &timer).instrument(span.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                if owned {
                    timer.cancel();
                }
                return Err(err);
            }
        };
        let meta = stream.meta().clone();
        let ctx = CallContext::new(method, signal.clone(), timer.clone()).with_meta(meta.clone());
        let (forward, reverse) = compose(&inner.middleware, &ctx).into_stages();
        let StreamParts {
            reader,
            writer,
            canceller,
            ..
        } = stream.into_parts();

        let (input_tx, mut input_rx) = mpsc::channel::<Value>(inner.config.output_buffer.max(1));
        let input_method = method.to_string();
        let inputs = stream::poll_fn(move |cx| input_rx.poll_recv(cx))
            .map(move |value| Ok::<_, RpcError>(JsonRpcRequest::new(input_method.clone(), Some(value))));
        let requests = forward(
            stream::once(future::ready(Ok(JsonRpcRequest::new(method, header))))
                .chain(inputs)
                .boxed(),
        );

        let refresh = owned.then(|| timer.clone());
        let responses = FramedRead::new(
            reader,
            JsonRpcCodec::<JsonRpcResponse>::with_max_message_bytes(inner.config.max_message_bytes),
        )
        .map_err(RpcError::from)
        .inspect_ok(move |_| {
            if let Some(timer) = &refresh {
                timer.refresh();
            }
        })
        .boxed();
        let responses = reverse(responses);

        let (output_tx, output_rx) = mpsc::channel(inner.config.output_buffer.max(1));
        let abort_tx = output_tx.clone();
        let codec = JsonRpcCodec::<Outbound>::with_max_message_bytes(inner.config.max_message_bytes);
        let errors = inner.errors.clone();
        let driver_signal = signal.clone();
        let driver = async move {
            let signal = driver_signal;
            let pipes = async {
                tokio::join!(
                    write_requests(requests, writer, codec),
                    read_responses(responses, output_tx, errors)
                )
            };
            tokio::pin!(pipes);

            let reason = tokio::select! {
                biased;
                (sent, ()) = &mut pipes => {
                    match sent {
                        Err(RpcError::Io(err)) => debug!(error = %err, "write side closed early"),
                        Err(err) => {
                            let _ = abort_tx.try_send(Err(err));
                        }
                        Ok(()) => {}
                    }
                    None
                }
                () = timer.expired() => Some(expire(&signal, &timer)),
                reason = signal.aborted() => Some(reason),
            };

            if let Some(reason) = reason {
                debug!(%reason, "call aborted");
                canceller.cancel(reason.to_string());
                let _ = abort_tx.send(Err(reason.to_error())).await;
            }
            if owned {
                timer.cancel();
            }
            debug!("call settled");
        };
        tokio::spawn(driver.instrument(span));

        Ok(DuplexCall {
            writer: CallWriter { tx: Some(input_tx) },
            reader: CallReader { rx: output_rx },
            signal,
            meta,
        })
    }
}

impl ClientInner {
    /// Link the caller's signal and start or adopt a timer. The flag is
    /// `true` when the timer is owned by the call.
    fn prepare(&self, options: CallOptions) -> (AbortSignal, DeadlineTimer, bool) {
        let signal = options
            .signal
            .as_ref()
            .map(AbortSignal::child)
            .unwrap_or_default();
        match options.timer {
            Some(timer) => (signal, timer, false),
            None => {
                let timeout = options.timeout.unwrap_or(self.config.call_timeout);
                (signal, DeadlineTimer::new(timeout), true)
            }
        }
    }

    /// Ask the factory for a stream without outliving the deadline or an abort.
    async fn connect(&self, signal: &AbortSignal, timer: &DeadlineTimer) -> Result<RpcStream> {
        tokio::select! {
            stream = self.factory.create() => Ok(stream?),
            () = timer.expired() => Err(expire(signal, timer).to_error()),
            reason = signal.aborted() => Err(reason.to_error()),
        }
    }
}

/// Abort `signal` for an expired `timer` and return the winning reason.
fn expire(signal: &AbortSignal, timer: &DeadlineTimer) -> CancelReason {
    let reason = CancelReason::Timeout(timer.delay().unwrap_or_default());
    signal.abort(reason.clone());
    signal.reason().unwrap_or(reason)
}

/// Turn an adopted timer's expiry into an abort of a raw call.
///
/// An unbounded timer never expires, so nothing is spawned for it.
fn spawn_deadline_watch(signal: AbortSignal, timer: DeadlineTimer) -> Option<JoinHandle<()>> {
    timer.delay()?;
    Some(tokio::spawn(async move {
        tokio::select! {
            () = timer.expired() => {
                expire(&signal, &timer);
            }
            _ = signal.aborted() => {}
            () = timer.released() => {}
        }
    }))
}

/// The header goes out as a request, later inputs without their method.
#[derive(Serialize)]
#[serde(untagged)]
enum Outbound {
    Header(JsonRpcRequest),
    Input(JsonRpcInput),
}

async fn write_requests(
    mut requests: MessageStream<JsonRpcRequest>,
    writer: BoxedWriter,
    codec: JsonRpcCodec<Outbound>,
) -> Result<()> {
    let mut sink = FramedWrite::new(writer, codec);
    let mut header = true;
    while let Some(request) = requests.next().await {
        let request = request?;
        let message = if std::mem::replace(&mut header, false) {
            Outbound::Header(request)
        } else {
            Outbound::Input(request.into_input())
        };
        sink.send(message).await?;
    }
    sink.close().await?;
    trace!("write side closed");
    Ok(())
}

/// Forward decoded responses to the reader. A stream that ends before its
/// first response yields [`RpcError::MissingResponse`].
async fn read_responses(
    mut responses: MessageStream<JsonRpcResponse>,
    output_tx: mpsc::Sender<Result<Value>>,
    errors: ErrorRegistry,
) {
    let mut received = false;
    while let Some(item) = responses.next().await {
        received = true;
        let item = match item {
            Ok(JsonRpcResponse::Result(response)) => Ok(response.result),
            Ok(JsonRpcResponse::Error(response)) => Err(errors.decode(response.error)),
            Err(err) => Err(err),
        };
        let failed = item.is_err();
        if output_tx.send(item).await.is_err() {
            trace!("reader dropped, stopping");
            return;
        }
        if failed {
            return;
        }
    }
    if !received {
        debug!("stream ended before any response");
        let _ = output_tx.send(Err(RpcError::MissingResponse)).await;
    }
}

/// Write side of a call. Dropping it closes the write side too.
#[derive(Debug)]
pub struct CallWriter {
    tx: Option<mpsc::Sender<Value>>,
}

impl CallWriter {
    pub async fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write_value(value).await
    }

    pub async fn write_value(&mut self, value: Value) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RpcError::StreamEnded("write side already closed".to_string()))?;
        tx.send(value)
            .await
            .map_err(|_| RpcError::StreamEnded("call no longer accepts input".to_string()))
    }

    /// Close the write side. The server sees the end of its input.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, mpsc::Sender::is_closed)
    }
}

/// Read side of a call: a stream of decoded outputs.
///
/// A remote error arrives as the last item, as [`RpcError::Remote`].
#[derive(Debug)]
pub struct CallReader {
    rx: mpsc::Receiver<Result<Value>>,
}

impl CallReader {
    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        self.rx.recv().await.transpose()
    }

    /// Read the next output as `T`. `None` means the stream ended.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_value().await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| RpcError::Parse(format!("unexpected output shape: {err}"))),
            None => Ok(None),
        }
    }
}

impl Stream for CallReader {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Both sides of an open call.
#[derive(Debug)]
pub struct DuplexCall {
    pub writer: CallWriter,
    pub reader: CallReader,
    signal: AbortSignal,
    meta: Metadata,
}

impl DuplexCall {
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Transport metadata of the call's stream.
    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    /// Abort the call and cancel its stream.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.signal.abort(CancelReason::Aborted(reason.into()))
    }

    pub fn split(self) -> (CallWriter, CallReader) {
        (self.writer, self.reader)
    }
}

/// A client-stream call: write inputs, close, then await `output`.
pub struct ClientStreamCall<O> {
    pub writer: CallWriter,
    pub output: BoxFuture<'static, Result<O>>,
    signal: AbortSignal,
    meta: Metadata,
}

impl<O> ClientStreamCall<O> {
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    /// Close the write side and wait for the single output.
    pub async fn finish(mut self) -> Result<O> {
        self.writer.close();
        self.output.await
    }
}

/// A raw call after its leading result has been read.
#[derive(Debug)]
pub struct RawCall {
    pub result: Value,
    /// Payload bytes in both directions. Reading starts right after the
    /// leading result.
    pub stream: RpcStream,
    signal: AbortSignal,
    timer: DeadlineTimer,
}

impl RawCall {
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn timer(&self) -> &DeadlineTimer {
        &self.timer
    }

    pub fn into_parts(self) -> (Value, RpcStream) {
        (self.result, self.stream)
    }
}

/// A manifest-shaped call stub.
#[derive(Debug, Clone)]
pub enum Caller {
    Raw(RawCaller),
    Unary(UnaryCaller),
    Server(ServerCaller),
    Client(ClientCaller),
    Duplex(DuplexCaller),
}

impl Caller {
    pub fn handler_type(&self) -> HandlerType {
        match self {
            Self::Raw(_) => HandlerType::Raw,
            Self::Unary(_) => HandlerType::Unary,
            Self::Server(_) => HandlerType::Server,
            Self::Client(_) => HandlerType::Client,
            Self::Duplex(_) => HandlerType::Duplex,
        }
    }

    pub fn method(&self) -> &str {
        let stub = match self {
            Self::Raw(RawCaller(stub))
            | Self::Unary(UnaryCaller(stub))
            | Self::Server(ServerCaller(stub))
            | Self::Client(ClientCaller(stub))
            | Self::Duplex(DuplexCaller(stub)) => stub,
        };
        &stub.method
    }
}

#[derive(Debug, Clone)]
struct CallerStub {
    client: RpcClient,
    method: String,
}

#[derive(Debug, Clone)]
pub struct RawCaller(CallerStub);

impl RawCaller {
    pub async fn call(&self, params: Option<Value>, options: CallOptions) -> Result<RawCall> {
        self.0.client.raw_stream_caller(&self.0.method, params, options).await
    }
}

#[derive(Debug, Clone)]
pub struct UnaryCaller(CallerStub);

impl UnaryCaller {
    pub async fn call<I, O>(&self, input: &I, options: CallOptions) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.0.client.unary_caller(&self.0.method, input, options).await
    }
}

#[derive(Debug, Clone)]
pub struct ServerCaller(CallerStub);

impl ServerCaller {
    pub async fn call<I: Serialize + ?Sized>(&self, input: &I, options: CallOptions) -> Result<CallReader> {
        self.0.client.server_stream_caller(&self.0.method, input, options).await
    }
}

#[derive(Debug, Clone)]
pub struct ClientCaller(CallerStub);

impl ClientCaller {
    pub async fn call<O>(&self, options: CallOptions) -> Result<ClientStreamCall<O>>
    where
        O: DeserializeOwned + Send + 'static,
    {
        self.0.client.client_stream_caller(&self.0.method, options).await
    }
}

#[derive(Debug, Clone)]
pub struct DuplexCaller(CallerStub);

impl DuplexCaller {
    pub async fn call(&self, options: CallOptions) -> Result<DuplexCall> {
        self.0.client.duplex_stream_caller(&self.0.method, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responses(items: Vec<Result<JsonRpcResponse>>) -> MessageStream<JsonRpcResponse> {
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_empty_response_stream_is_a_missing_response() {
        let (tx, mut rx) = mpsc::channel(4);
        read_responses(responses(vec![]), tx, ErrorRegistry::new()).await;
        assert!(matches!(rx.recv().await, Some(Err(RpcError::MissingResponse))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_responses_end_normally_after_a_result() {
        let (tx, mut rx) = mpsc::channel(4);
        let result = JsonRpcResponse::from(streamrpc_frame::JsonRpcResponseResult::new(Value::from(1)));
        read_responses(responses(vec![Ok(result)]), tx, ErrorRegistry::new()).await;
        assert_eq!(rx.recv().await.expect("one item").expect("a result"), Value::from(1));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_adopted_timer_is_not_watched() {
        let signal = AbortSignal::new();
        assert!(spawn_deadline_watch(signal.clone(), DeadlineTimer::unbounded()).is_none());

        let timer = DeadlineTimer::new(Duration::from_secs(1));
        let watch = spawn_deadline_watch(signal.clone(), timer.clone()).expect("bounded timer is watched");
        timer.cancel();
        watch.await.expect("watch should end once the timer is released");
        assert!(!signal.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopted_timer_expiry_aborts_the_call() {
        let signal = AbortSignal::new();
        let timer = DeadlineTimer::new(Duration::from_secs(1));
        let watch = spawn_deadline_watch(signal.clone(), timer).expect("bounded timer is watched");
        watch.await.expect("watch should end at the deadline");
        assert_eq!(signal.reason(), Some(CancelReason::Timeout(Duration::from_secs(1))));
    }
}
