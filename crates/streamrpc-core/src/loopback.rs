use futures::future::BoxFuture;
use streamrpc_transport::memory::{self, DEFAULT_PAIR_CAPACITY};
use streamrpc_transport::{RpcStream, StreamFactory, TransportError};
use tracing::debug;

use crate::server::RpcServer;

/// In-process stream factory: every call gets one end of a fresh in-memory
/// pair while the other end is handed to the server.
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    server: RpcServer,
    capacity: usize,
}

impl LoopbackFactory {
    pub fn new(server: RpcServer) -> Self {
        Self {
            server,
            capacity: DEFAULT_PAIR_CAPACITY,
        }
    }

    /// Bytes buffered in each direction before writes wait for the reader.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl StreamFactory for LoopbackFactory {
    fn create(&self) -> BoxFuture<'static, streamrpc_transport::Result<RpcStream>> {
        let (local, remote) = memory::pair(self.capacity);
        let result = self
            .server
            .handle_stream(remote)
            .map(|handle| {
                debug!(call_id = handle.id(), "loopback call opened");
                local
            })
            .map_err(|err| {
                debug!(error = %err, "loopback server refused call");
                TransportError::Closed
            });
        Box::pin(std::future::ready(result))
    }
}
