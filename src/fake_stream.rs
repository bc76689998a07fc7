//! in memory byte streams bridging the connection task and the application task.
//!
//! [FakeStream] looks like one end of a socket but is backed by an unbounded
//! process local buffer. The producer side never blocks; the consumer side
//! suspends until bytes or a fault arrive. Completion is always delivered by
//! waking the consumer's task, never inline under the producer's lock, so the
//! two sides may live on different executors.

use core::{
    future::poll_fn,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use std::{
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use bytes::{Buf, Bytes, BytesMut};
use futures_core::stream::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{aborted, eof};

/// Cloneable handle to an in memory byte channel.
///
/// All clones refer to the same channel. At most one consumer may be waiting
/// at a time.
#[derive(Clone, Default, Debug)]
pub struct FakeStream {
    inner: Arc<Inner>,
}

#[derive(Default, Debug)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default, Debug)]
struct State {
    buf: BytesMut,
    fault: Option<Fault>,
    reader: Option<Waker>,
    // one shot flag consumed by the next read attempt. set by cancel/reset
    // while a consumer is waiting; unlike the fault slot it is not sticky.
    cancelled: bool,
    sync_waiters: u32,
}

// sticky stream fault. io::Error is not Clone so the kind and message are
// kept and a fresh error is materialised on every delivery.
#[derive(Debug)]
struct Fault {
    kind: io::ErrorKind,
    message: String,
}

impl Fault {
    fn from_io(e: &io::Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }

    fn is_eof(&self) -> bool {
        self.kind == io::ErrorKind::UnexpectedEof
    }

    fn to_io(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

impl FakeStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // wake whoever is waiting for the state change. the waker fires after the
    // lock is released so the consumer never runs under it.
    fn wake_consumer(&self, mut state: MutexGuard<'_, State>) {
        let waker = state.reader.take();
        let notify = state.sync_waiters > 0;
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
        if notify {
            self.inner.cond.notify_all();
        }
    }

    /// Append bytes to the channel, waking a pending consumer.
    ///
    /// Fails with the stored fault once one is set; a closed stream reports
    /// [io::ErrorKind::UnexpectedEof].
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if let Some(fault) = state.fault.as_ref() {
            return Err(fault.to_io());
        }
        state.buf.extend_from_slice(data);
        self.wake_consumer(state);
        Ok(data.len())
    }

    /// Store a sticky fault and wake a pending consumer. Buffered bytes stay
    /// readable; the fault is delivered once they are drained.
    pub fn set_error(&self, e: io::Error) {
        let mut state = self.lock();
        state.fault = Some(Fault::from_io(&e));
        self.wake_consumer(state);
    }

    /// Close the channel. Equivalent to storing an end of stream fault.
    pub fn close(&self) {
        self.set_error(eof());
    }

    /// Complete a pending consumer with "operation aborted" without storing a
    /// sticky fault. A channel without a waiting consumer is left untouched.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if state.reader.is_some() || state.sync_waiters > 0 {
            state.cancelled = true;
            self.wake_consumer(state);
        }
    }

    /// Drop buffered bytes and the fault, aborting any pending consumer.
    /// Subsequent writes succeed again.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.fault = None;
        state.buf.clear();
        if state.reader.is_some() || state.sync_waiters > 0 {
            state.cancelled = true;
        }
        self.wake_consumer(state);
    }

    /// Poll for readable bytes. End of stream is reported by leaving `dst`
    /// untouched, io convention.
    pub fn poll_read_ready(&self, cx: &mut Context<'_>, dst: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.lock();
        if state.cancelled {
            state.cancelled = false;
            return Poll::Ready(Err(aborted()));
        }
        if !state.buf.is_empty() {
            let n = usize::min(state.buf.len(), dst.remaining());
            dst.put_slice(&state.buf[..n]);
            state.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        match state.fault.as_ref() {
            Some(fault) if fault.is_eof() => Poll::Ready(Ok(())),
            Some(fault) => Poll::Ready(Err(fault.to_io())),
            None => {
                state.reader = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Read into `dst`, suspending until bytes or a fault are available.
    /// `Ok(0)` marks end of stream.
    pub async fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        poll_fn(|cx| {
            let mut buf = ReadBuf::new(&mut *dst);
            self.poll_read_ready(cx, &mut buf).map_ok(|_| buf.filled().len())
        })
        .await
    }

    /// Blocking variant of [FakeStream::read] for consumers that do not run
    /// on an async executor.
    pub fn read_sync(&self, dst: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                state.cancelled = false;
                return Err(aborted());
            }
            if !state.buf.is_empty() {
                let n = usize::min(state.buf.len(), dst.len());
                dst[..n].copy_from_slice(&state.buf[..n]);
                state.buf.advance(n);
                return Ok(n);
            }
            match state.fault.as_ref() {
                Some(fault) if fault.is_eof() => return Ok(0),
                Some(fault) => return Err(fault.to_io()),
                None => {
                    state.sync_waiters += 1;
                    state = self
                        .inner
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                    state.sync_waiters -= 1;
                }
            }
        }
    }

    // chunk oriented poll used by the Stream view: hand out the whole buffer
    // at once instead of copying into a caller buffer.
    fn poll_next_chunk(&self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut state = self.lock();
        if state.cancelled {
            state.cancelled = false;
            return Poll::Ready(Some(Err(aborted())));
        }
        if !state.buf.is_empty() {
            let chunk = state.buf.split().freeze();
            return Poll::Ready(Some(Ok(chunk)));
        }
        match state.fault.as_ref() {
            Some(fault) if fault.is_eof() => Poll::Ready(None),
            Some(fault) => Poll::Ready(Some(Err(fault.to_io()))),
            None => {
                state.reader = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        // the last handle going away can not be read from anymore.
        if Arc::strong_count(&self.inner) == 1 {
            self.cancel();
        }
    }
}

impl AsyncRead for FakeStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_read_ready(cx, buf)
    }
}

impl AsyncWrite for FakeStream {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(self.get_mut().write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}

/// Read only view of a [FakeStream], handed to the application as a request
/// body. Produces chunks as [Bytes] via the [Stream] impl or plain bytes via
/// [AsyncRead].
#[derive(Clone)]
pub struct ReadStream {
    stream: FakeStream,
}

impl ReadStream {
    pub(crate) fn new(stream: FakeStream) -> Self {
        Self { stream }
    }

    /// see [FakeStream::read].
    pub async fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        self.stream.read(dst).await
    }

    /// see [FakeStream::read_sync].
    pub fn read_sync(&self, dst: &mut [u8]) -> io::Result<usize> {
        self.stream.read_sync(dst)
    }

    /// see [FakeStream::cancel].
    pub fn cancel(&self) {
        self.stream.cancel();
    }
}

impl AsyncRead for ReadStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().stream.poll_read_ready(cx, buf)
    }
}

impl Stream for ReadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.poll_next_chunk(cx)
    }
}

/// Socket like full duplex pipe built from two fake streams. [Duplex::pair]
/// returns the two connected ends; bytes written to one end are read from the
/// other. Dropping an end closes its write direction, as closing a socket
/// would.
pub struct Duplex {
    read: FakeStream,
    write: FakeStream,
}

impl Duplex {
    pub fn pair() -> (Duplex, Duplex) {
        let a = FakeStream::new();
        let b = FakeStream::new();
        (
            Duplex {
                read: a.clone(),
                write: b.clone(),
            },
            Duplex { read: b, write: a },
        )
    }
}

impl Drop for Duplex {
    fn drop(&mut self) {
        self.write.close();
    }
}

impl AsyncRead for Duplex {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().read.poll_read_ready(cx, buf)
    }
}

impl AsyncWrite for Duplex {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(self.get_mut().write.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().write.close();
        Poll::Ready(Ok(()))
    }
}
