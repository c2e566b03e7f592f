use std::future::Future;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::stream::RpcStream;

/// Produces a fresh raw stream for every outgoing call.
///
/// Implemented for any `Fn() -> impl Future<Output = Result<RpcStream>>`, so a
/// closure that dials a connection is a valid factory.
pub trait StreamFactory: Send + Sync + 'static {
    fn create(&self) -> BoxFuture<'static, Result<RpcStream>>;
}

impl<F, Fut> StreamFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcStream>> + Send + 'static,
{
    fn create(&self) -> BoxFuture<'static, Result<RpcStream>> {
        Box::pin(self())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[tokio::test]
    async fn test_closure_is_a_factory() {
        let factory = || async { Ok(crate::memory::pair(8).0) };
        let stream = factory.create().await.expect("factory should produce a stream");
        assert_eq!(stream.meta()["transport"], "memory");
    }

    #[tokio::test]
    async fn test_factory_error_is_forwarded() {
        let factory = || async { Err::<RpcStream, _>(TransportError::Closed) };
        let boxed: Box<dyn StreamFactory> = Box::new(factory);
        assert!(matches!(boxed.create().await, Err(TransportError::Closed)));
    }
}
