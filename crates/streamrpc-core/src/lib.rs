//! Call dispatch for streamrpc.
//!
//! Each call owns one raw duplex stream. The first message on the stream is a
//! JSON-RPC request naming the method. What follows depends on the method's
//! [`HandlerType`]:
//!
//! | Shape | Client sends | Server sends |
//! |---|---|---|
//! | `raw` | header | one result, then raw bytes |
//! | `unary` | one input | one output |
//! | `server` | one input | outputs until done |
//! | `client` | inputs until closed | one output |
//! | `duplex` | inputs until closed | outputs until done |
//!
//! - [`RpcServer`] reads headers, dispatches to handlers, and owns the
//!   timeout, grace period and teardown of every call
//! - [`RpcClient`] opens a stream per call through a [`StreamFactory`]
//! - [`Middleware`] observes and rewrites decoded messages in both directions
//! - [`ErrorRegistry`] rebuilds typed errors from error responses
//!
//! ```no_run
//! use serde_json::{json, Value};
//! use streamrpc_core::{CallContext, CallOptions, Handler, RpcClient, RpcServer};
//!
//! # async fn demo() -> streamrpc_core::Result<()> {
//! let server = RpcServer::builder()
//!     .handler("echo", Handler::unary(|input: Value, _ctx: CallContext| async move { Ok(input) }))
//!     .build()?;
//! let client = RpcClient::new(server.loopback());
//! let out: Value = client.unary_caller("echo", &json!({"v": 1}), CallOptions::new()).await?;
//! assert_eq!(out, json!({"v": 1}));
//! # Ok(())
//! # }
//! ```
//!
//! [`StreamFactory`]: streamrpc_transport::StreamFactory

pub mod client;
pub mod context;
pub mod error;
pub mod handler;
pub mod loopback;
pub mod manifest;
pub mod middleware;
pub mod server;
pub mod signal;
pub mod timer;
pub mod wire;

pub use client::{
    CallOptions, CallReader, CallWriter, Caller, ClientCaller, ClientConfig, ClientStreamCall,
    DuplexCall, DuplexCaller, RawCall, RawCaller, RpcClient, RpcClientBuilder, ServerCaller,
    UnaryCaller, DEFAULT_CALL_TIMEOUT,
};
pub use context::CallContext;
pub use error::{codes, ApplicationError, ErrorKind, Result, RpcError};
pub use handler::{
    decode_input, encode_output, ClientHandler, DuplexHandler, Handler, HandlerFuture,
    RawHandler, ServerHandler, UnaryHandler, ValueStream,
};
pub use loopback::LoopbackFactory;
pub use manifest::{HandlerType, Manifest};
pub use middleware::{MessageStream, Middleware, MiddlewareFactory, Stage};
pub use server::{
    CallHandle, DestroyOptions, RpcServer, RpcServerBuilder, ServerConfig,
    CUT_FLUSH_TIMEOUT, DEFAULT_GRACE_PERIOD, DEFAULT_HANDLER_TIMEOUT,
};
pub use signal::{AbortSignal, CancelReason};
pub use timer::DeadlineTimer;
pub use wire::{to_response_error, DecodedError, ErrorRecord, ErrorRecordData, ErrorRegistry};

#[cfg(feature = "schema")]
pub use middleware::schema_validation;
