//! The five handler shapes and their normalization onto one code path.
//!
//! Unary, Server and Client handlers are wrapped into Duplex handlers when the
//! server is built. The server itself only ever drives a Duplex handler or a
//! Raw handler.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use streamrpc_frame::JsonRpcRequest;
use streamrpc_transport::BoxedReader;

use crate::context::CallContext;
use crate::error::{Result, RpcError};
use crate::manifest::HandlerType;

/// A sequence of JSON values going into or out of a handler.
pub type ValueStream = BoxStream<'static, Result<Value>>;

pub type HandlerFuture<T> = BoxFuture<'static, Result<T>>;

/// `(input) -> output`
pub trait UnaryHandler: Send + Sync + 'static {
    fn call(&self, input: Value, ctx: CallContext) -> HandlerFuture<Value>;
}

impl<F, Fut> UnaryHandler for F
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn call(&self, input: Value, ctx: CallContext) -> HandlerFuture<Value> {
        Box::pin(self(input, ctx))
    }
}

/// `(input) -> sequence<output>`
pub trait ServerHandler: Send + Sync + 'static {
    fn call(&self, input: Value, ctx: CallContext) -> ValueStream;
}

impl<F, S> ServerHandler for F
where
    F: Fn(Value, CallContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Value>> + Send + 'static,
{
    fn call(&self, input: Value, ctx: CallContext) -> ValueStream {
        self(input, ctx).boxed()
    }
}

/// `(sequence<input>) -> output`
pub trait ClientHandler: Send + Sync + 'static {
    fn call(&self, input: ValueStream, ctx: CallContext) -> HandlerFuture<Value>;
}

impl<F, Fut> ClientHandler for F
where
    F: Fn(ValueStream, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn call(&self, input: ValueStream, ctx: CallContext) -> HandlerFuture<Value> {
        Box::pin(self(input, ctx))
    }
}

/// `(sequence<input>) -> sequence<output>`
pub trait DuplexHandler: Send + Sync + 'static {
    fn call(&self, input: ValueStream, ctx: CallContext) -> ValueStream;
}

impl<F, S> DuplexHandler for F
where
    F: Fn(ValueStream, CallContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Value>> + Send + 'static,
{
    fn call(&self, input: ValueStream, ctx: CallContext) -> ValueStream {
        self(input, ctx).boxed()
    }
}

/// `(header, input bytes) -> (leading result, output bytes)`
///
/// The payload bypasses the JSON codec in both directions. The header is
/// handed over as decoded, after forward middleware.
pub trait RawHandler: Send + Sync + 'static {
    fn call(
        &self,
        header: JsonRpcRequest,
        input: BoxedReader,
        ctx: CallContext,
    ) -> HandlerFuture<(Value, BoxedReader)>;
}

impl<F, Fut> RawHandler for F
where
    F: Fn(JsonRpcRequest, BoxedReader, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Value, BoxedReader)>> + Send + 'static,
{
    fn call(
        &self,
        header: JsonRpcRequest,
        input: BoxedReader,
        ctx: CallContext,
    ) -> HandlerFuture<(Value, BoxedReader)> {
        Box::pin(self(header, input, ctx))
    }
}

/// A registered handler, tagged with its shape.
#[derive(Clone)]
pub enum Handler {
    Raw(Arc<dyn RawHandler>),
    Unary(Arc<dyn UnaryHandler>),
    Server(Arc<dyn ServerHandler>),
    Client(Arc<dyn ClientHandler>),
    Duplex(Arc<dyn DuplexHandler>),
}

impl Handler {
    /// Wrap a raw closure. Custom [`RawHandler`] types go through the
    /// variant directly: `Handler::Raw(Arc::new(handler))`.
    pub fn raw<F, Fut>(handler: F) -> Self
    where
        F: Fn(JsonRpcRequest, BoxedReader, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(Value, BoxedReader)>> + Send + 'static,
    {
        Self::Raw(Arc::new(handler))
    }

    pub fn unary<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::Unary(Arc::new(handler))
    }

    pub fn server<F, S>(handler: F) -> Self
    where
        F: Fn(Value, CallContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self::Server(Arc::new(handler))
    }

    pub fn client<F, Fut>(handler: F) -> Self
    where
        F: Fn(ValueStream, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::Client(Arc::new(handler))
    }

    pub fn duplex<F, S>(handler: F) -> Self
    where
        F: Fn(ValueStream, CallContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self::Duplex(Arc::new(handler))
    }

    pub fn handler_type(&self) -> HandlerType {
        match self {
            Self::Raw(_) => HandlerType::Raw,
            Self::Unary(_) => HandlerType::Unary,
            Self::Server(_) => HandlerType::Server,
            Self::Client(_) => HandlerType::Client,
            Self::Duplex(_) => HandlerType::Duplex,
        }
    }

    /// Normalize onto the two shapes the server drives.
    pub(crate) fn into_dispatch(self) -> Dispatch {
        match self {
            Self::Raw(handler) => Dispatch::Raw(handler),
            Self::Duplex(handler) => Dispatch::Duplex(handler),
            Self::Unary(handler) => Dispatch::Duplex(unary_to_duplex(handler)),
            Self::Server(handler) => Dispatch::Duplex(server_to_duplex(handler)),
            Self::Client(handler) => Dispatch::Duplex(client_to_duplex(handler)),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handler").field(&self.handler_type()).finish()
    }
}

#[derive(Clone)]
pub(crate) enum Dispatch {
    Raw(Arc<dyn RawHandler>),
    Duplex(Arc<dyn DuplexHandler>),
}

/// Takes the first input, yields exactly one output, then stops.
fn unary_to_duplex(handler: Arc<dyn UnaryHandler>) -> Arc<dyn DuplexHandler> {
    Arc::new(move |input: ValueStream, ctx: CallContext| -> ValueStream {
        let handler = Arc::clone(&handler);
        stream::once(async move {
            let value = first_input(input).await?;
            handler.call(value, ctx).await
        })
        .boxed()
    })
}

/// Takes the first input and forwards the handler's whole output sequence.
fn server_to_duplex(handler: Arc<dyn ServerHandler>) -> Arc<dyn DuplexHandler> {
    Arc::new(move |input: ValueStream, ctx: CallContext| -> ValueStream {
        let handler = Arc::clone(&handler);
        stream::once(async move {
            let value = first_input(input).await?;
            Ok::<_, RpcError>(handler.call(value, ctx))
        })
        .try_flatten()
        .boxed()
    })
}

/// Hands over the whole input sequence and yields the single result.
fn client_to_duplex(handler: Arc<dyn ClientHandler>) -> Arc<dyn DuplexHandler> {
    Arc::new(move |input: ValueStream, ctx: CallContext| -> ValueStream {
        stream::once(handler.call(input, ctx)).boxed()
    })
}

async fn first_input(mut input: ValueStream) -> Result<Value> {
    match input.next().await {
        Some(item) => item,
        None => Err(RpcError::HandlerFailed(
            "input ended before a value was received".to_string(),
        )),
    }
}

/// Deserialize a handler input into a typed value.
pub fn decode_input<I: DeserializeOwned>(value: Value) -> Result<I> {
    serde_json::from_value(value).map_err(|err| RpcError::InvalidParams(err.to_string()))
}

/// Serialize a typed handler output.
pub fn encode_output<O: Serialize>(output: &O) -> Result<Value> {
    serde_json::to_value(output)
        .map_err(|err| RpcError::HandlerFailed(format!("output is not serializable: {err}")))
}
