//! Streaming JSON-RPC over raw duplex byte streams.
//!
//! Every call owns one byte stream. The client sends a header naming the
//! method, then both sides exchange concatenated JSON-RPC messages shaped by
//! the method's handler type: raw, unary, server stream, client stream or
//! duplex.
//!
//! # Crate Structure
//!
//! - [`transport`]: raw streams, stream factories, Unix sockets, in-memory pairs
//! - [`frame`]: JSON-RPC messages and the concatenated-JSON codec
//! - [`rpc`]: server, client, middleware, handler shapes and wire errors
//! - [`schema`]: per-method params validation (behind the `schema` feature)

/// Re-export transport types.
pub mod transport {
    pub use streamrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use streamrpc_frame::*;
}

/// Re-export call dispatch types.
pub mod rpc {
    pub use streamrpc_core::*;
}

/// Re-export schema types (requires `schema` feature).
#[cfg(feature = "schema")]
pub mod schema {
    pub use streamrpc_schema::*;
}

pub use streamrpc_core::{
    CallContext, CallOptions, Handler, HandlerType, Manifest, RpcClient, RpcError, RpcServer,
};
