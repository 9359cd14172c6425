//! Stream wrappers applied to admitted flows
//!
//! Reads are bytes coming from the client (upload), writes are bytes going
//! back to it (download). Rate limiting charges the bucket after each
//! successful operation and, when the reservation went into deficit, delays
//! the next operation in the same direction until the deficit is repaid.

use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::bucket::Bucket;
use super::connection::FlowGuard;
use super::counter::TrafficStorage;

/// Per-direction pacing state over a shared bucket
#[derive(Debug)]
struct Pacer {
    bucket: Arc<Bucket>,
    pending: Option<Pin<Box<Sleep>>>,
}

impl Pacer {
    fn new(bucket: Arc<Bucket>) -> Self {
        Self {
            bucket,
            pending: None,
        }
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(delay) = self.pending.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.pending = None;
        }
        Poll::Ready(())
    }

    fn charge(&mut self, bytes: usize) {
        let wait = self.bucket.take(bytes as u64);
        if !wait.is_zero() {
            self.pending = Some(Box::pin(sleep(wait)));
        }
    }
}

pin_project! {
    /// Counts bytes through a user's traffic storage
    pub struct CountedStream<S> {
        #[pin]
        inner: S,
        storage: Arc<TrafficStorage>,
    }
}

impl<S> CountedStream<S> {
    pub fn new(inner: S, storage: Arc<TrafficStorage>) -> Self {
        Self { inner, storage }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n > 0 {
            this.storage.add_up(n as u64);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for CountedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        if n > 0 {
            this.storage.add_down(n as u64);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

pin_project! {
    /// Throttles both directions against one token bucket, or passes
    /// through untouched when there is none
    pub struct LimitedStream<S> {
        #[pin]
        inner: S,
        read: Option<Pacer>,
        write: Option<Pacer>,
    }
}

impl<S> LimitedStream<S> {
    pub fn new(inner: S, bucket: Option<Arc<Bucket>>) -> Self {
        Self {
            inner,
            read: bucket.as_ref().map(|b| Pacer::new(Arc::clone(b))),
            write: bucket.map(Pacer::new),
        }
    }

    /// True if a bucket throttles this stream
    pub fn is_limited(&self) -> bool {
        self.read.is_some()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead> AsyncRead for LimitedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let Some(pacer) = this.read.as_mut() else {
            return this.inner.poll_read(cx, buf);
        };
        ready!(pacer.poll_ready(cx));
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n > 0 {
            pacer.charge(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for LimitedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let Some(pacer) = this.write.as_mut() else {
            return this.inner.poll_write(cx, buf);
        };
        ready!(pacer.poll_ready(cx));
        let n = ready!(this.inner.poll_write(cx, buf))?;
        if n > 0 {
            pacer.charge(n);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "flow was kicked")
}

pin_project! {
    /// An admitted stream flow: counted, optionally throttled, and abortable
    /// through its cancellation token
    pub struct HookedStream<S> {
        #[pin]
        inner: LimitedStream<CountedStream<S>>,
        cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
        flow: Option<FlowGuard>,
    }
}

impl<S> HookedStream<S> {
    pub(crate) fn new(
        inner: S,
        storage: Arc<TrafficStorage>,
        bucket: Option<Arc<Bucket>>,
        cancel: CancellationToken,
        flow: Option<FlowGuard>,
    ) -> Self {
        Self {
            inner: LimitedStream::new(CountedStream::new(inner, storage), bucket),
            cancelled: Box::pin(cancel.cancelled_owned()),
            flow,
        }
    }

    /// True if a bucket throttles this flow
    pub fn is_limited(&self) -> bool {
        self.inner.is_limited()
    }

    pub fn get_ref(&self) -> &S {
        self.inner.get_ref().get_ref()
    }
}

impl<S: AsyncRead> AsyncRead for HookedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(aborted()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for HookedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(aborted()));
        }
        this.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
