//! Stage pairs inserted between the codec and the application layer.
//!
//! A [`Middleware`] holds two independent stages:
//! - `forward` sees requests travelling client to server
//! - `reverse` sees responses travelling server to client
//!
//! Both operate on decoded messages only. Raw bytes never reach middleware.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use streamrpc_frame::{JsonRpcRequest, JsonRpcResponse};

use crate::context::CallContext;
use crate::error::RpcError;

/// A decoded message sequence flowing through one direction of a call.
pub type MessageStream<T> = BoxStream<'static, Result<T, RpcError>>;

/// One direction of a middleware: a transformation over a message stream.
pub type Stage<T> = Box<dyn FnOnce(MessageStream<T>) -> MessageStream<T> + Send>;

pub struct Middleware {
    forward: Stage<JsonRpcRequest>,
    reverse: Stage<JsonRpcResponse>,
}

impl Middleware {
    /// Pass-through in both directions.
    pub fn identity() -> Self {
        Self {
            forward: Box::new(|stream| stream),
            reverse: Box::new(|stream| stream),
        }
    }

    pub fn new<F, R>(forward: F, reverse: R) -> Self
    where
        F: FnOnce(MessageStream<JsonRpcRequest>) -> MessageStream<JsonRpcRequest> + Send + 'static,
        R: FnOnce(MessageStream<JsonRpcResponse>) -> MessageStream<JsonRpcResponse> + Send + 'static,
    {
        Self {
            forward: Box::new(forward),
            reverse: Box::new(reverse),
        }
    }

    /// Apply `f` to every forward request. An `Err` is passed on in place of
    /// the request.
    pub fn map_forward<F>(f: F) -> Self
    where
        F: FnMut(JsonRpcRequest) -> Result<JsonRpcRequest, RpcError> + Send + 'static,
    {
        Self::new(
            move |stream| {
                let mut f = f;
                stream
                    .map(move |item| item.and_then(&mut f))
                    .boxed()
            },
            |stream| stream,
        )
    }

    /// Apply `f` to every reverse response.
    pub fn map_reverse<F>(f: F) -> Self
    where
        F: FnMut(JsonRpcResponse) -> Result<JsonRpcResponse, RpcError> + Send + 'static,
    {
        Self::new(
            |stream| stream,
            move |stream| {
                let mut f = f;
                stream
                    .map(move |item| item.and_then(&mut f))
                    .boxed()
            },
        )
    }

    /// Stack `next` inside `self`.
    ///
    /// Forward messages pass `self` first, then `next`. Reverse messages pass
    /// `next` first, then `self`, so `self` stays outermost in both directions.
    pub fn then(self, next: Middleware) -> Self {
        let Self { forward, reverse } = self;
        let Self {
            forward: next_forward,
            reverse: next_reverse,
        } = next;
        Self {
            forward: Box::new(move |stream| next_forward(forward(stream))),
            reverse: Box::new(move |stream| reverse(next_reverse(stream))),
        }
    }

    pub fn into_stages(self) -> (Stage<JsonRpcRequest>, Stage<JsonRpcResponse>) {
        (self.forward, self.reverse)
    }
}

impl Default for Middleware {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware").finish_non_exhaustive()
    }
}

/// Builds a fresh [`Middleware`] for every call.
pub trait MiddlewareFactory: Send + Sync + 'static {
    fn create(&self, ctx: &CallContext) -> Middleware;
}

impl<F> MiddlewareFactory for F
where
    F: Fn(&CallContext) -> Middleware + Send + Sync + 'static,
{
    fn create(&self, ctx: &CallContext) -> Middleware {
        self(ctx)
    }
}

/// Build every factory for `ctx` and stack the results in order.
pub(crate) fn compose(factories: &[Arc<dyn MiddlewareFactory>], ctx: &CallContext) -> Middleware {
    factories
        .iter()
        .fold(Middleware::identity(), |acc, factory| acc.then(factory.create(ctx)))
}

/// Validate each forward request's params against its method's schema.
///
/// A header without params carries no input and is not validated. Failures
/// replace the request with [`RpcError::InvalidParams`], so the handler's
/// input sequence ends with that error.
#[cfg(feature = "schema")]
pub fn schema_validation(
    registry: Arc<streamrpc_schema::SchemaRegistry>,
) -> impl MiddlewareFactory {
    move |_: &CallContext| {
        let registry = Arc::clone(&registry);
        Middleware::map_forward(move |request| {
            if let Some(params) = &request.params {
                registry
                    .validate(&request.method, Some(params))
                    .map_err(|err| RpcError::InvalidParams(err.to_string()))?;
            }
            Ok(request)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::AbortSignal;
    use crate::timer::DeadlineTimer;
    use futures::stream;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use streamrpc_frame::JsonRpcResponseResult;

    fn tagging(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Middleware {
        let forward_log = Arc::clone(&log);
        Middleware::map_forward(move |request| {
            forward_log.lock().unwrap().push(format!("fwd:{name}"));
            Ok(request)
        })
        .then(Middleware::map_reverse(move |response| {
            log.lock().unwrap().push(format!("rev:{name}"));
            Ok(response)
        }))
    }

    fn ctx() -> CallContext {
        CallContext::new("echo", AbortSignal::new(), DeadlineTimer::unbounded())
    }

    #[tokio::test]
    async fn test_identity_passes_messages_through() {
        let (forward, _) = Middleware::identity().into_stages();
        let input = stream::iter(vec![Ok(JsonRpcRequest::new("echo", Some(json!(1))))]).boxed();
        let out: Vec<_> = forward(input).collect().await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().params, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_then_orders_forward_and_reverse_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stacked = tagging(Arc::clone(&log), "outer").then(tagging(Arc::clone(&log), "inner"));
        let (forward, reverse) = stacked.into_stages();

        let requests = stream::iter(vec![Ok(JsonRpcRequest::new("echo", None))]).boxed();
        let _: Vec<_> = forward(requests).collect().await;
        let responses =
            stream::iter(vec![Ok(JsonRpcResponseResult::new(Value::Null).into())]).boxed();
        let _: Vec<_> = reverse(responses).collect().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["fwd:outer", "fwd:inner", "rev:inner", "rev:outer"]
        );
    }

    #[tokio::test]
    async fn test_factories_see_call_context() {
        let factory = |ctx: &CallContext| {
            let method = ctx.method.clone();
            Middleware::map_forward(move |mut request| {
                request.params = Some(json!({ "via": method.clone() }));
                Ok(request)
            })
        };
        let factories: Vec<Arc<dyn MiddlewareFactory>> = vec![Arc::new(factory)];
        let (forward, _) = compose(&factories, &ctx()).into_stages();
        let input = stream::iter(vec![Ok(JsonRpcRequest::new("echo", None))]).boxed();
        let out: Vec<_> = forward(input).collect().await;
        assert_eq!(out[0].as_ref().unwrap().params, Some(json!({"via": "echo"})));
    }

    #[cfg(feature = "schema")]
    #[tokio::test]
    async fn test_schema_validation_rejects_bad_params() {
        let mut registry = streamrpc_schema::SchemaRegistry::new();
        registry
            .register("echo", r#"{"type":"object","required":["v"]}"#)
            .expect("schema should register");
        let factory = schema_validation(Arc::new(registry));
        let (forward, _) = factory.create(&ctx()).into_stages();
        let input = stream::iter(vec![
            Ok(JsonRpcRequest::new("echo", Some(json!({"v": 1})))),
            Ok(JsonRpcRequest::new("echo", Some(json!({"w": 1})))),
        ])
        .boxed();
        let out: Vec<_> = forward(input).collect().await;
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(RpcError::InvalidParams(_))));
    }
}
