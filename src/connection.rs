//! server side of one http/1 connection.
//!
//! [ServerConnection::run] owns the transport: it parses pipelined requests
//! off the read side, hands each one to the application through a
//! [Dispatcher], and forwards the per request response streams back to the
//! write side in arrival order. All connection state is mutated from that
//! single task; the fake streams are the only cross task boundary.

use core::{
    future::{poll_fn, Future},
    pin::pin,
    task::{Context, Poll, Waker},
};

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::mpsc::{unbounded_channel, UnboundedSender},
};
use tracing::{debug, trace};

use crate::{
    dispatch::DispatchContext,
    error::{aborted, eof, Error},
    proto::{Events, Head, Parser},
    request::{ConnectionId, RequestAssembler, RequestContext},
    responder::{Op, Responder},
};

const READ_BUF_SIZE: usize = 4096;

/// An accepted client connection over any byte stream.
pub struct ServerConnection<Io> {
    io: Io,
    shared: Arc<Shared>,
    ops_tx: UnboundedSender<Op>,
    ops_rx: tokio::sync::mpsc::UnboundedReceiver<Op>,
}

impl<Io> ServerConnection<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: Io) -> Self {
        let (ops_tx, ops_rx) = unbounded_channel();
        Self {
            io,
            shared: Arc::new(Shared {
                connection_id: ConnectionId::generate(),
                state: Mutex::new(DispatchState::default()),
            }),
            ops_tx,
            ops_rx,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    /// Handle for the application to receive dispatched requests. May be
    /// cloned and used from any task.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            shared: self.shared.clone(),
        }
    }

    /// Drive the connection until it is finished: ingress exhausted, all
    /// deliverable responses on the wire and every queued request handed to
    /// the application.
    ///
    /// A clean end of stream from the client resolves to `Ok(())`; protocol
    /// and transport faults resolve to the connection's first error. The
    /// same error is observed by a pending or later
    /// [Dispatcher::wait_dispatch] call.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            io,
            shared,
            ops_tx,
            ops_rx,
        } = self;

        let (rd, wr) = tokio::io::split(io);
        let ingress = Ingress {
            io: rd,
            parser: Parser::new(),
            events: ConnectionEvents {
                shared: shared.clone(),
                ops: ops_tx,
                assembler: None,
            },
        };
        let egress = Responder::new(wr, ops_rx);

        let mut ingress = pin!(ingress.run());
        let mut egress = pin!(egress.run());
        let mut ingress_done = false;

        // both sides share this task. egress terminates last on every clean
        // path, so its completion decides the select; a completed egress with
        // ingress still running means the connection is beyond use.
        let responder_error = poll_fn(|cx| {
            if !ingress_done && ingress.as_mut().poll(cx).is_ready() {
                ingress_done = true;
            }
            egress.as_mut().poll(cx)
        })
        .await;

        if !ingress_done {
            if let Some(ctx) = shared.take_receiver() {
                ctx.request_stream().set_error(aborted());
            }
            shared.set_error(Error::aborted());
        }

        if let Some(ref e) = responder_error {
            if !e.is_eof() {
                trace!(target: "h1_dispatcher", connection = %shared.connection_id, error = %e, "egress finished");
            }
        }

        // every request delivered for dispatch must reach the application
        // before the connection reports completion.
        poll_fn(|cx| shared.poll_drained(cx)).await;

        match shared.error() {
            Some(e) if !e.is_eof() => Err(e),
            _ => Ok(()),
        }
    }
}

/// Application handle delivering requests in arrival order.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Resolve with the next request, or with the connection's error once no
    /// request is left. At most one call may be pending at a time.
    pub async fn wait_dispatch(&self) -> Result<DispatchContext, Error> {
        let ctx = poll_fn(|cx| self.shared.poll_dispatch(cx)).await?;
        Ok(DispatchContext::new(ctx))
    }
}

struct Shared {
    connection_id: ConnectionId,
    state: Mutex<DispatchState>,
}

#[derive(Default)]
struct DispatchState {
    /// requests parsed to completion of their head, in arrival order.
    queue: VecDeque<Arc<RequestContext>>,
    /// first error observed on the connection. sticky.
    error: Option<Error>,
    dispatch_waker: Option<Waker>,
    drain_waker: Option<Waker>,
    /// request whose body is still being fed by the parser.
    receiver: Option<Arc<RequestContext>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_ready(&self, ctx: Arc<RequestContext>) {
        let mut state = self.lock();
        state.queue.push_back(ctx);
        let waker = state.dispatch_waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    // first error wins. wakes a pending dispatch so it can observe it.
    fn set_error(&self, e: Error) {
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(e);
        }
        let waker = state.dispatch_waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn error(&self) -> Option<Error> {
        self.lock().error.clone()
    }

    fn errored(&self) -> bool {
        self.lock().error.is_some()
    }

    fn clear_queue(&self) {
        let mut state = self.lock();
        state.queue.clear();
        let waker = state.drain_waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn set_receiver(&self, ctx: Arc<RequestContext>) {
        self.lock().receiver = Some(ctx);
    }

    fn receiver(&self) -> Option<Arc<RequestContext>> {
        self.lock().receiver.clone()
    }

    fn take_receiver(&self) -> Option<Arc<RequestContext>> {
        self.lock().receiver.take()
    }

    fn poll_dispatch(&self, cx: &mut Context<'_>) -> Poll<Result<Arc<RequestContext>, Error>> {
        let mut state = self.lock();
        if let Some(ctx) = state.queue.pop_front() {
            let waker = state.queue.is_empty().then(|| state.drain_waker.take()).flatten();
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
            return Poll::Ready(Ok(ctx));
        }
        if let Some(e) = state.error.clone() {
            return Poll::Ready(Err(e));
        }
        state.dispatch_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_drained(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.lock();
        if state.queue.is_empty() {
            Poll::Ready(())
        } else {
            state.drain_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

// parser event sink wired to the connection state.
struct ConnectionEvents {
    shared: Arc<Shared>,
    ops: UnboundedSender<Op>,
    assembler: Option<RequestAssembler>,
}

impl Events for ConnectionEvents {
    fn on_message_begin(&mut self) -> Result<(), Error> {
        // a receiver still around here never saw its body complete.
        if let Some(stale) = self.shared.take_receiver() {
            stale.request_stream().close();
        }
        self.assembler = Some(RequestAssembler::new(self.shared.connection_id));
        Ok(())
    }

    fn on_url(&mut self, chunk: &str) -> Result<(), Error> {
        self.assembler
            .as_mut()
            .expect("message begin precedes url")
            .append_uri(chunk);
        Ok(())
    }

    fn on_header_field(&mut self, chunk: &str) -> Result<(), Error> {
        self.assembler
            .as_mut()
            .expect("message begin precedes headers")
            .append_header_field(chunk);
        Ok(())
    }

    fn on_header_value(&mut self, chunk: &str) -> Result<(), Error> {
        self.assembler
            .as_mut()
            .expect("message begin precedes headers")
            .append_header_value(chunk);
        Ok(())
    }

    fn on_headers_complete(&mut self, head: &Head<'_>) -> Result<(), Error> {
        let assembler = self.assembler.take().expect("message begin precedes headers complete");
        let ctx = Arc::new(assembler.finalise(head)?);
        trace!(
            target: "h1_dispatcher",
            connection = %self.shared.connection_id,
            request = %ctx.request_id(),
            method = head.method,
            uri = ctx.request_header().uri(),
            "request head complete"
        );
        self.shared.set_receiver(ctx.clone());
        // queueing for dispatch and for egress together is what pins the
        // response order to the arrival order.
        self.shared.push_ready(ctx.clone());
        let _ = self.ops.send(Op::Respond(ctx));
        Ok(())
    }

    fn on_body(&mut self, chunk: Bytes) -> Result<(), Error> {
        if let Some(ctx) = self.shared.receiver() {
            ctx.request_stream().write(&chunk)?;
        }
        Ok(())
    }

    fn on_message_complete(&mut self) -> Result<(), Error> {
        if let Some(ctx) = self.shared.take_receiver() {
            ctx.request_stream().close();
        }
        Ok(())
    }
}

// read loop. terminates on the first transport or protocol fault, after
// recording it and notifying the responder.
struct Ingress<R> {
    io: R,
    parser: Parser,
    events: ConnectionEvents,
}

impl<R> Ingress<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self) {
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        loop {
            if self.events.shared.errored() {
                return;
            }
            match self.io.read_buf(&mut buf).await {
                Ok(0) => return self.transport_error(eof()),
                Ok(_) => {
                    if let Err(e) = self.parser.advance(&mut buf, &mut self.events) {
                        return self.protocol_error(e);
                    }
                }
                Err(e) => return self.transport_error(e),
            }
        }
    }

    fn transport_error(&mut self, e: io::Error) {
        let shared = &self.events.shared;
        if shared.errored() {
            return;
        }
        let stream_error = io::Error::new(e.kind(), e.to_string());
        let error = Error::from(e);
        if error.is_eof() {
            trace!(target: "h1_dispatcher", connection = %shared.connection_id, "client finished sending");
        } else {
            debug!(target: "h1_dispatcher", connection = %shared.connection_id, error = %error, "transport error");
        }
        if let Some(ctx) = shared.take_receiver() {
            ctx.request_stream().set_error(stream_error);
        }
        // a broken transport can not deliver responses for the queued
        // requests either; a clean eof still can.
        if !error.is_eof() {
            shared.clear_queue();
        }
        let _ = self.events.ops.send(Op::Finish(error.clone()));
        shared.set_error(error);
    }

    fn protocol_error(&mut self, e: Error) {
        let shared = &self.events.shared;
        if shared.errored() {
            return;
        }
        debug!(target: "h1_dispatcher", connection = %shared.connection_id, error = %e, "protocol error");
        if let Some(ctx) = shared.take_receiver() {
            ctx.request_stream().set_error(aborted());
        }
        self.events.assembler = None;
        shared.clear_queue();
        let _ = self.events.ops.send(Op::Finish(Error::aborted()));
        shared.set_error(e);
    }
}
