//! Serving side: one call per raw stream.
//!
//! Every stream handed to [`RpcServer::handle_stream`] goes through the same
//! lifecycle:
//!
//! 1. read the header request, racing the handler deadline
//! 2. look the method up and build the call's middleware
//! 3. run the handler while draining the inbound side
//! 4. release the timer and leave the active set, exactly once
//!
//! An abort from any step (timeout, [`CallHandle::cancel`], or a forced
//! [`RpcServer::destroy`]) fires the call's signal first. If the call has
//! not finished after the grace period, the handler's output is dropped and
//! the abort reason goes out as the call's last response. A stream that does
//! not take that response within [`CUT_FLUSH_TIMEOUT`] is hard-cancelled.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use futures::future::{self, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::SinkExt;
use serde_json::Value;
use streamrpc_frame::{
    read_head, FrameError, JsonRpcCodec, JsonRpcInput, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResponseResult, Remainder, DEFAULT_MAX_MESSAGE_BYTES,
};
use streamrpc_transport::{BoxedReader, BoxedWriter, RpcStream, StreamParts};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, field, info, trace, warn, Instrument, Span};

use crate::context::CallContext;
use crate::error::{Result, RpcError};
use crate::handler::{Dispatch, DuplexHandler, Handler, RawHandler, ValueStream};
use crate::loopback::LoopbackFactory;
use crate::manifest::Manifest;
use crate::middleware::{compose, MessageStream, Middleware, MiddlewareFactory};
use crate::signal::{AbortSignal, CancelReason};
use crate::timer::DeadlineTimer;
use crate::wire::to_response_error;

/// Default handler keep-alive: 60 s.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between the soft abort and the hard stream cancel: 2 s.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Time a cut call gets to write its final error before the stream is
/// cancelled outright.
pub const CUT_FLUSH_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Inactivity deadline. Refreshed by every inbound message.
    pub handler_timeout: Duration,
    /// How long an aborted call may keep running before its stream is cut.
    pub grace_period: Duration,
    pub max_message_bytes: usize,
    /// Omit `stack` from error records sent to callers.
    pub sensitive: bool,
    /// Inputs buffered between the decoder and a slow handler.
    pub input_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            sensitive: false,
            input_buffer: 16,
        }
    }
}

/// Options for [`RpcServer::destroy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Abort every in-flight call before waiting for them.
    pub force: bool,
    pub reason: String,
}

impl DestroyOptions {
    /// Stop accepting calls and wait for in-flight calls to finish.
    pub fn graceful() -> Self {
        Self {
            force: false,
            reason: "server destroyed".to_string(),
        }
    }

    /// Abort in-flight calls with `reason`, then wait for them to drain.
    pub fn force(reason: impl Into<String>) -> Self {
        Self {
            force: true,
            reason: reason.into(),
        }
    }
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self::graceful()
    }
}

#[derive(Default)]
pub struct RpcServerBuilder {
    handlers: Vec<(String, Handler)>,
    manifest: Option<Manifest>,
    middleware: Vec<Arc<dyn MiddlewareFactory>>,
    config: ServerConfig,
}

impl RpcServerBuilder {
    pub fn handler(mut self, method: impl Into<String>, handler: Handler) -> Self {
        self.handlers.push((method.into(), handler));
        self
    }

    /// Require the registered handlers to match `manifest` exactly.
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Append a middleware factory. Factories stack in registration order.
    pub fn with_middleware(mut self, factory: impl MiddlewareFactory) -> Self {
        self.middleware.push(Arc::new(factory));
        self
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<RpcServer> {
        let mut manifest = Manifest::new();
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (method, handler) in self.handlers {
            if handlers.contains_key(&method) {
                return Err(RpcError::Config(format!(
                    "method `{method}` registered more than once"
                )));
            }
            let kind = handler.handler_type();
            if let Some(expected) = self.manifest.as_ref().map(|m| m.get(&method)) {
                match expected {
                    Some(expected) if expected != kind => {
                        return Err(RpcError::Config(format!(
                            "method `{method}` is declared {expected} but its handler is {kind}"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        return Err(RpcError::Config(format!(
                            "method `{method}` is missing from the manifest"
                        )));
                    }
                }
            }
            manifest.insert(method.clone(), kind)?;
            handlers.insert(method, handler.into_dispatch());
        }
        if let Some(declared) = &self.manifest {
            if let Some((method, _)) = declared.iter().find(|(m, _)| !handlers.contains_key(*m)) {
                return Err(RpcError::Config(format!(
                    "method `{method}` is declared but has no handler"
                )));
            }
        }

        debug!(methods = handlers.len(), "rpc server built");
        Ok(RpcServer {
            inner: Arc::new(Inner {
                handlers,
                manifest,
                middleware: self.middleware,
                config: self.config,
                tracker: TaskTracker::new(),
                active: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(true),
            }),
        })
    }
}

/// Dispatches calls arriving on raw streams to registered handlers.
///
/// Cheap to clone. All clones share handlers and the active-call set.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    handlers: HashMap<String, Dispatch>,
    manifest: Manifest,
    middleware: Vec<Arc<dyn MiddlewareFactory>>,
    config: ServerConfig,
    tracker: TaskTracker,
    active: Mutex<HashMap<u64, AbortSignal>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

/// Handle to one in-flight call.
#[derive(Debug, Clone)]
pub struct CallHandle {
    id: u64,
    signal: AbortSignal,
}

impl CallHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Abort the call. Returns `false` if it was already aborted. Cancelling
    /// a call that has already completed is a no-op.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.signal.abort(CancelReason::Aborted(reason.into()))
    }
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::default()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Method name to handler shape, derived from the registered handlers.
    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of calls that have started and not yet cleaned up.
    pub fn active_calls(&self) -> usize {
        self.inner.lock_active().len()
    }

    /// A stream factory that serves calls from this server in-process.
    pub fn loopback(&self) -> LoopbackFactory {
        LoopbackFactory::new(self.clone())
    }

    /// Take ownership of `stream` and serve the one call it carries.
    ///
    /// The call runs on its own task. Fails with [`RpcError::NotRunning`]
    /// after [`destroy`](Self::destroy), in which case the stream is cancelled.
    pub fn handle_stream(&self, stream: RpcStream) -> Result<CallHandle> {
        if !self.is_running() {
            stream.cancel("server is not running");
            return Err(RpcError::NotRunning);
        }

        // Holding a token keeps `destroy` from seeing an empty tracker before
        // this call is spawned.
        let token = self.inner.tracker.token();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let signal = AbortSignal::new();
        self.inner.lock_active().insert(id, signal.clone());
        if !self.is_running() {
            self.inner.lock_active().remove(&id);
            stream.cancel("server is not running");
            return Err(RpcError::NotRunning);
        }

        let timer = DeadlineTimer::new(self.inner.config.handler_timeout);
        let span = tracing::debug_span!("rpc_call", call_id = id, method = field::Empty);
        let inner = Arc::clone(&self.inner);
        let call_signal = signal.clone();
        self.inner.tracker.spawn(
            async move {
                let _guard = CallGuard {
                    inner: Arc::clone(&inner),
                    id,
                    timer: timer.clone(),
                };
                debug!("call started");
                inner.supervise(stream, call_signal, timer).await;
            }
            .instrument(span),
        );
        drop(token);

        Ok(CallHandle { id, signal })
    }

    /// Stop accepting calls and wait until every in-flight call has drained.
    ///
    /// With `force`, every in-flight call is aborted with `reason` first.
    /// Calling it again is harmless.
    pub async fn destroy(&self, options: DestroyOptions) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!(force = options.force, reason = %options.reason, "destroying rpc server");
        }
        if options.force {
            let signals: Vec<AbortSignal> = self.inner.lock_active().values().cloned().collect();
            for signal in signals {
                signal.abort(CancelReason::Destroyed(options.reason.clone()));
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("rpc server drained");
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("manifest", &self.inner.manifest)
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .field("active_calls", &self.active_calls())
            .finish()
    }
}

/// Releases a call's resources when its task ends, however it ends.
struct CallGuard {
    inner: Arc<Inner>,
    id: u64,
    timer: DeadlineTimer,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.timer.cancel();
        self.inner.lock_active().remove(&self.id);
        debug!("call closed");
    }
}

impl Inner {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<u64, AbortSignal>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the call, turning a timeout into an abort and an ignored abort
    /// into a hard stream cancel.
    async fn supervise(&self, stream: RpcStream, signal: AbortSignal, timer: DeadlineTimer) {
        let canceller = stream.canceller();
        let cut = CancellationToken::new();
        let work = self.run_call(stream, signal.clone(), timer.clone(), cut.clone());
        tokio::pin!(work);

        let reason = tokio::select! {
            biased;
            () = &mut work => return,
            () = timer.expired() => {
                let reason = CancelReason::Timeout(self.config.handler_timeout);
                signal.abort(reason.clone());
                signal.reason().unwrap_or(reason)
            }
            reason = signal.aborted() => reason,
        };

        debug!(%reason, grace = ?self.config.grace_period, "call aborted");
        if tokio::time::timeout(self.config.grace_period, &mut work)
            .await
            .is_ok()
        {
            return;
        }

        warn!(%reason, "call ignored abort, cutting it");
        cut.cancel();
        if tokio::time::timeout(CUT_FLUSH_TIMEOUT, &mut work).await.is_err() {
            warn!(%reason, "cut call did not flush, cancelling stream");
            canceller.cancel(reason.to_string());
        }
    }

    async fn run_call(
        &self,
        stream: RpcStream,
        signal: AbortSignal,
        timer: DeadlineTimer,
        cut: CancellationToken,
    ) {
        let StreamParts {
            reader,
            writer,
            meta,
            canceller,
        } = stream.into_parts();

        let head = tokio::select! {
            head = read_head::<JsonRpcRequest, _>(reader, self.config.max_message_bytes) => head,
            reason = signal.aborted() => {
                debug!(%reason, "no header received");
                canceller.cancel(reason.to_string());
                return;
            }
        };
        let (head, rest) = match head {
            Ok((Some(head), rest)) => (head, rest),
            Ok((None, _)) => {
                debug!("stream ended before a header");
                canceller.cancel("stream ended before a header");
                return;
            }
            Err(err) => {
                let err = RpcError::from(err);
                warn!(error = %err, "unreadable call header");
                self.write_error(writer, &err).await;
                return;
            }
        };

        timer.refresh();
        Span::current().record("method", head.method.as_str());
        trace!(params = ?head.params, "header received");

        let Some(dispatch) = self.handlers.get(&head.method).cloned() else {
            let err = RpcError::HandlerMissing(head.method.clone());
            warn!(error = %err, "rejecting call");
            self.write_error(writer, &err).await;
            return;
        };

        let ctx = CallContext::new(head.method.clone(), signal, timer).with_meta(meta);
        let middleware = compose(&self.middleware, &ctx);
        match dispatch {
            Dispatch::Duplex(handler) => {
                self.run_duplex(handler, head, rest, writer, ctx, middleware, cut)
                    .await
            }
            Dispatch::Raw(handler) => {
                self.run_raw(handler, head, rest, writer, ctx, middleware, cut)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_duplex(
        &self,
        handler: Arc<dyn DuplexHandler>,
        head: JsonRpcRequest,
        rest: Remainder<BoxedReader>,
        writer: BoxedWriter,
        ctx: CallContext,
        middleware: Middleware,
        cut: CancellationToken,
    ) {
        let (forward, reverse) = middleware.into_stages();

        let method = head.method.clone();
        let refresh = ctx.timer.clone();
        let inbound = FramedRead::new(
            rest,
            JsonRpcCodec::<JsonRpcInput>::with_max_message_bytes(self.config.max_message_bytes),
        )
        .map_err(RpcError::from)
        .map_ok(move |input| input.into_request(method.clone()))
        .inspect_ok(move |request| {
            refresh.refresh();
            trace!(params = ?request.params, "input received");
        });
        let requests = forward(stream::once(future::ready(Ok(head))).chain(inbound).boxed());

        let (input_tx, mut input_rx) = mpsc::channel(self.config.input_buffer.max(1));
        let input: ValueStream = stream::poll_fn(move |cx| input_rx.poll_recv(cx)).boxed();

        // Stops the inbound drain once the call has answered with an error.
        let failed = CancellationToken::new();
        let signal = ctx.signal.clone();
        let pump = {
            let failed = failed.clone();
            async move {
                tokio::select! {
                    () = pump_inputs(requests, &input_tx, &signal) => {}
                    reason = signal.aborted() => {
                        let _ = input_tx.try_send(Err(reason.to_error()));
                    }
                    () = failed.cancelled() => trace!("call failed, inbound side dropped"),
                }
            }
        };

        let sensitive = self.config.sensitive;
        let signal = ctx.signal.clone();
        let output = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(input, ctx))) {
            Ok(output) => output,
            Err(panic) => stream::once(future::ready(Err(panicked(panic)))).boxed(),
        };
        let output = AssertUnwindSafe(output)
            .catch_unwind()
            .map(|item| item.unwrap_or_else(|panic| Err(panicked(panic))))
            .boxed();
        let responses = until_cut(output, cut, signal)
            .scan(false, |errored, item| {
                if *errored {
                    return future::ready(None);
                }
                *errored = item.is_err();
                future::ready(Some(item))
            })
            .map(move |item| {
                Ok(match item {
                    Ok(value) => JsonRpcResponse::from(JsonRpcResponseResult::new(value)),
                    Err(err) => {
                        warn!(error = %err, "handler failed");
                        JsonRpcResponse::from(to_response_error(&err, sensitive))
                    }
                })
            })
            .boxed();
        let responses = reverse(responses);

        let codec = JsonRpcCodec::<JsonRpcResponse>::with_max_message_bytes(self.config.max_message_bytes);
        let write = async move {
            match write_responses(responses, writer, codec, sensitive).await {
                Ok(Completion::Finished) => {}
                Ok(Completion::Failed) => failed.cancel(),
                Err(err) => {
                    debug!(error = %err, "failed writing responses");
                    failed.cancel();
                }
            }
        };

        // A successful call keeps draining the inbound side. A failed one is
        // closed as soon as its error is written.
        tokio::join!(pump, write);
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_raw(
        &self,
        handler: Arc<dyn RawHandler>,
        head: JsonRpcRequest,
        rest: Remainder<BoxedReader>,
        mut writer: BoxedWriter,
        ctx: CallContext,
        middleware: Middleware,
        cut: CancellationToken,
    ) {
        let (forward, reverse) = middleware.into_stages();
        let signal = ctx.signal.clone();
        let head = match forward(stream::once(future::ready(Ok(head))).boxed()).next().await {
            Some(Ok(head)) => head,
            Some(Err(err)) => {
                self.write_error(writer, &err).await;
                return;
            }
            None => {
                let err = RpcError::HandlerFailed("middleware dropped the call header".to_string());
                self.write_error(writer, &err).await;
                return;
            }
        };

        let input: BoxedReader = Box::pin(rest);
        let call = AssertUnwindSafe(async move { handler.call(head, input, ctx).await }).catch_unwind();
        let outcome = tokio::select! {
            outcome = call => outcome.unwrap_or_else(|panic| Err(panicked(panic))),
            () = cut.cancelled() => Err(cut_error(&signal)),
        };
        let (leading, mut output) = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "raw handler failed");
                self.write_error(writer, &err).await;
                return;
            }
        };

        let leading = JsonRpcResponse::from(JsonRpcResponseResult::new(leading));
        let leading = match reverse(stream::once(future::ready(Ok(leading))).boxed()).next().await {
            Some(Ok(leading)) => leading,
            Some(Err(err)) => {
                self.write_error(writer, &err).await;
                return;
            }
            None => {
                let err = RpcError::HandlerFailed("middleware dropped the leading result".to_string());
                self.write_error(writer, &err).await;
                return;
            }
        };

        let result = async {
            let mut head = BytesMut::new();
            JsonRpcCodec::<JsonRpcResponse>::new().encode(leading, &mut head)?;
            writer.write_all(&head).await?;
            // Payload bytes cannot carry an error, so a cut just stops copying.
            let copied = tokio::select! {
                copied = tokio::io::copy(&mut output, &mut writer) => copied?,
                () = cut.cancelled() => return Err(cut_error(&signal)),
            };
            writer.shutdown().await?;
            trace!(bytes = copied, "raw output finished");
            Ok::<_, RpcError>(())
        }
        .await;
        if let Err(err) = result {
            debug!(error = %err, "raw stream ended early");
        }
    }

    /// Answer the call with a single error and close the writable side.
    async fn write_error(&self, writer: BoxedWriter, err: &RpcError) {
        let response = JsonRpcResponse::from(to_response_error(err, self.config.sensitive));
        let mut sink = FramedWrite::new(writer, JsonRpcCodec::<JsonRpcResponse>::new());
        let result = async {
            sink.send(response).await?;
            sink.close().await
        }
        .await;
        if let Err(err) = result {
            debug!(error = %err, "failed writing error response");
        }
    }
}

/// Feed decoded requests into the handler's input channel.
///
/// A header without params carries no input. Once the handler drops its
/// input, the rest of the inbound side is still drained so the peer never
/// blocks on a full pipe. A decode or middleware error is passed to the
/// handler and aborts the call.
async fn pump_inputs(
    mut requests: MessageStream<JsonRpcRequest>,
    input_tx: &mpsc::Sender<Result<Value>>,
    signal: &AbortSignal,
) {
    let mut header = true;
    let mut forwarding = true;
    while let Some(item) = requests.next().await {
        let is_header = std::mem::replace(&mut header, false);
        let item = match item {
            Ok(request) if is_header && request.params.is_none() => continue,
            Ok(request) => Ok(request.params.unwrap_or(Value::Null)),
            Err(err) => Err(err),
        };
        let failure = item.as_ref().err().map(ToString::to_string);
        if forwarding && input_tx.send(item).await.is_err() {
            trace!("handler dropped its input, draining");
            forwarding = false;
        }
        if let Some(failure) = failure {
            debug!(error = %failure, "inbound side failed");
            signal.abort(CancelReason::Aborted(failure));
            return;
        }
    }
}

/// How the outbound side of a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Finished,
    /// The last response written was an error.
    Failed,
}

async fn write_responses(
    mut responses: MessageStream<JsonRpcResponse>,
    writer: BoxedWriter,
    codec: JsonRpcCodec<JsonRpcResponse>,
    sensitive: bool,
) -> std::result::Result<Completion, FrameError> {
    let mut sink = FramedWrite::new(writer, codec);
    let mut completion = Completion::Finished;
    while let Some(item) = responses.next().await {
        let response = match item {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "reverse middleware failed");
                JsonRpcResponse::from(to_response_error(&err, sensitive))
            }
        };
        let is_error = matches!(response, JsonRpcResponse::Error(_));
        sink.send(response).await?;
        if is_error {
            completion = Completion::Failed;
            break;
        }
    }
    sink.close().await?;
    Ok(completion)
}

/// Pass `output` through until the call is cut, then end it with the
/// abort reason instead of pulling more from the handler.
fn until_cut(output: ValueStream, cut: CancellationToken, signal: AbortSignal) -> ValueStream {
    stream::unfold(Some(output), move |state| {
        let cut = cut.clone();
        let signal = signal.clone();
        async move {
            let mut output = state?;
            tokio::select! {
                biased;
                () = cut.cancelled() => Some((Err(cut_error(&signal)), None)),
                item = output.next() => item.map(|item| (item, Some(output))),
            }
        }
    })
    .boxed()
}

fn cut_error(signal: &AbortSignal) -> RpcError {
    signal
        .error()
        .unwrap_or_else(|| RpcError::Aborted("call cut".to_string()))
}

fn panicked(panic: Box<dyn std::any::Any + Send>) -> RpcError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    RpcError::HandlerFailed(format!("handler panicked: {message}"))
}
