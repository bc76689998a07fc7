//! serial egress pump.
//!
//! Responses may be produced by the application in any order; the responder
//! forwards each request's response stream to the socket strictly in request
//! arrival order, one at a time.

use std::sync::Arc;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc::UnboundedReceiver,
};
use tracing::trace;

use crate::{error::Error, request::RequestContext};

/// one queued unit of egress work.
pub(crate) enum Op {
    /// forward this request's response stream to the socket.
    Respond(Arc<RequestContext>),
    /// ingress has finished; record the error and stop once reached.
    Finish(Error),
}

pub(crate) struct Responder<W> {
    socket: W,
    ops: UnboundedReceiver<Op>,
}

impl<W> Responder<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(socket: W, ops: UnboundedReceiver<Op>) -> Self {
        Self { socket, ops }
    }

    /// Drain queued operations in submission order. Resolves with the first
    /// recorded error once no more work can follow; later responses queued
    /// behind an error are discarded without touching the socket.
    pub(crate) async fn run(mut self) -> Option<Error> {
        let mut last_error: Option<Error> = None;
        while let Some(op) = self.ops.recv().await {
            match op {
                Op::Respond(ctx) => {
                    if last_error.is_some() {
                        continue;
                    }
                    match self.forward(&ctx).await {
                        Ok(()) => {
                            if ctx.must_force_close_on_response() {
                                trace!(
                                    target: "h1_responder",
                                    request = %ctx.request_id(),
                                    "response demands close, discarding queued responses"
                                );
                                last_error = Some(Error::aborted());
                                break;
                            }
                        }
                        Err(e) => last_error = Some(e),
                    }
                }
                Op::Finish(e) => {
                    if last_error.is_none() {
                        last_error = Some(e);
                    }
                    break;
                }
            }
        }
        let _ = self.socket.flush().await;
        last_error
    }

    // copy one response stream to the socket until its clean end.
    async fn forward(&mut self, ctx: &RequestContext) -> Result<(), Error> {
        let stream = ctx.response_stream();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                trace!(target: "h1_responder", request = %ctx.request_id(), "response complete");
                return Ok(());
            }
            self.socket.write_all(&buf[..n]).await?;
        }
    }
}
