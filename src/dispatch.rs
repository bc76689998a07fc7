//! application side of the request handoff.

use std::sync::Arc;

use crate::{
    error::eof,
    fake_stream::ReadStream,
    header::{ContentType, InvalidContentType, RequestHeader},
    request::{ConnectionId, RequestContext, RequestId},
    response::Response,
};

/// One dispatched request: read side and write side of a single http
/// exchange, handed to the application by
/// [Dispatcher::wait_dispatch](crate::Dispatcher::wait_dispatch).
pub struct DispatchContext {
    request: Request,
    response: Response,
}

impl DispatchContext {
    pub(crate) fn new(ctx: Arc<RequestContext>) -> Self {
        Self {
            request: Request { ctx: ctx.clone() },
            response: Response::new(ctx),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Split into independently owned halves, e.g. to read the body while
    /// streaming the response.
    pub fn into_parts(self) -> (Request, Response) {
        (self.request, self.response)
    }
}

/// Read side of a dispatched request.
pub struct Request {
    ctx: Arc<RequestContext>,
}

impl Request {
    pub fn request_id(&self) -> RequestId {
        self.ctx.request_id()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.ctx.connection_id()
    }

    pub fn header(&self) -> &RequestHeader {
        self.ctx.request_header()
    }

    /// see [RequestContext::content_type].
    pub fn content_type(&self) -> Result<&ContentType, InvalidContentType> {
        self.ctx.content_type()
    }

    /// Handle on the request body stream. The body ends when the message is
    /// fully received; it fails when the connection does.
    pub fn body(&self) -> ReadStream {
        ReadStream::new(self.ctx.request_stream().clone())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        // the application is done with this request; anything still unread
        // on the body stream ends here.
        self.ctx.request_stream().set_error(eof());
    }
}
