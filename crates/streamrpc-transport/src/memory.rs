//! In-process stream pairs backed by [`tokio::io::duplex`].

use crate::stream::{Metadata, RpcStream};

/// Default per-direction buffer capacity of an in-memory pair: 64 KiB.
pub const DEFAULT_PAIR_CAPACITY: usize = 64 * 1024;

/// Create two connected [`RpcStream`]s.
///
/// Bytes written to one end are read from the other. Each end has its own
/// canceller; shutting down one end's writer is observed as EOF by the peer.
pub fn pair(capacity: usize) -> (RpcStream, RpcStream) {
    let (near, far) = tokio::io::duplex(capacity.max(1));
    (wrap(near), wrap(far))
}

fn wrap(stream: tokio::io::DuplexStream) -> RpcStream {
    let (reader, writer) = tokio::io::split(stream);
    let mut meta = Metadata::new();
    meta.insert("transport".into(), "memory".into());
    RpcStream::new(reader, writer).with_meta(meta)
}
