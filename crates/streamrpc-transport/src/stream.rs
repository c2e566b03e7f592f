use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

/// Readable half of a raw call stream.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Writable half of a raw call stream.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Arbitrary key/value metadata attached to a stream by its transport.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Hard-cancel handle for an [`RpcStream`].
///
/// Cancelling is idempotent: the first reason is kept and later calls are
/// no-ops. Once cancelled, every pending and future read or write on the
/// stream fails with [`io::ErrorKind::ConnectionAborted`].
#[derive(Clone, Default)]
pub struct StreamCanceller {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl StreamCanceller {
    /// Create a canceller that has not fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A canceller driven by `token`: cancelling the token from elsewhere
    /// cancels the stream too. Such a cancel records no reason.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::default(),
        }
    }

    /// Cancel the stream. Returns `true` only for the call that actually
    /// cancelled it.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.reason.set(reason.clone()).is_err() {
            return false;
        }
        debug!(%reason, "cancelling raw stream");
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason passed to the first successful [`cancel`](Self::cancel).
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Resolves once the stream has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn watch(&self) -> Pin<Box<WaitForCancellationFutureOwned>> {
        Box::pin(self.token.clone().cancelled_owned())
    }
}

impl fmt::Debug for StreamCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCanceller")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

/// The pieces an [`RpcStream`] is made of.
pub struct StreamParts {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub meta: Metadata,
    pub canceller: StreamCanceller,
}

/// One raw duplex byte stream carrying exactly one call.
///
/// Owned by a single caller (client side) or a single handler (server side)
/// for its whole lifetime. Dropping both halves closes the underlying
/// transport.
pub struct RpcStream {
    reader: BoxedReader,
    writer: BoxedWriter,
    meta: Metadata,
    canceller: StreamCanceller,
}

impl RpcStream {
    /// Wrap a reader and writer into a stream with a fresh canceller and no
    /// metadata.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::from_parts(StreamParts {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            meta: Metadata::new(),
            canceller: StreamCanceller::new(),
        })
    }

    /// Reassemble a stream. Both halves are bound to `parts.canceller`.
    pub fn from_parts(parts: StreamParts) -> Self {
        let reader: BoxedReader = Box::pin(Abortable::new(parts.reader, &parts.canceller));
        let writer: BoxedWriter = Box::pin(Abortable::new(parts.writer, &parts.canceller));
        Self {
            reader,
            writer,
            meta: parts.meta,
            canceller: parts.canceller,
        }
    }

    pub fn into_parts(self) -> StreamParts {
        StreamParts {
            reader: self.reader,
            writer: self.writer,
            meta: self.meta,
            canceller: self.canceller,
        }
    }

    /// Replace the stream metadata.
    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.meta = meta;
        self
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Metadata {
        &mut self.meta
    }

    /// A handle that can hard-cancel this stream from elsewhere.
    pub fn canceller(&self) -> StreamCanceller {
        self.canceller.clone()
    }

    /// Hard-cancel this stream.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.canceller.cancel(reason)
    }

    /// Split into the readable and writable halves.
    pub fn split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("meta", &self.meta)
            .field("canceller", &self.canceller)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for RpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().writer.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().writer.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().writer.as_mut().poll_shutdown(cx)
    }
}

/// I/O adapter that fails fast once its canceller fires.
struct Abortable<T> {
    inner: T,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    aborted: bool,
}

impl<T> Abortable<T> {
    fn new(inner: T, canceller: &StreamCanceller) -> Self {
        Self {
            inner,
            cancelled: canceller.watch(),
            aborted: false,
        }
    }

    // Registers the waker so a pending read or write is woken on cancel.
    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.aborted && self.cancelled.as_mut().poll(cx).is_ready() {
            self.aborted = true;
        }
        self.aborted
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "stream cancelled")
}

impl<T: AsyncRead + Unpin> AsyncRead for Abortable<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Abortable<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Closing an already cancelled stream is a no-op.
        if this.poll_aborted(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
