//! Raw duplex byte streams for streamrpc.
//!
//! Every RPC call owns exactly one [`RpcStream`]: a readable half, a writable
//! half, a hard-cancel handle and transport metadata. Streams come from a
//! [`StreamFactory`] on the calling side and from a listener on the serving
//! side.
//!
//! This is the lowest layer of streamrpc. Framing and dispatch build on top of
//! the types provided here.

pub mod error;
pub mod factory;
pub mod memory;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use factory::StreamFactory;
pub use stream::{BoxedReader, BoxedWriter, Metadata, RpcStream, StreamCanceller, StreamParts};

#[cfg(unix)]
pub use uds::{UnixSocketFactory, UnixSocketListener};
