//! application visible response writer.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::warn;

use crate::{
    api::{Exception, EXCEPTION_MESSAGE_TYPE},
    error::{aborted, eof, Error, ProtoError},
    header::{RequestHeader, ResponseHeader, Version},
    proto::encode::{encode_chunk, encode_head, LAST_CHUNK},
    request::RequestContext,
};

/// How body bytes are framed on the wire. Decided at most once per response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseMode {
    Undecided,
    /// fixed byte budget declared by `Content-Length`.
    ContentLength,
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
    /// unframed bytes, delimited by connection close.
    Raw,
}

/// Argument to [Response::set_content_length].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentLength {
    /// declare an exact body length.
    Fixed(u64),
    /// length unknown up front: chunked when the client supports it,
    /// close delimited otherwise.
    Variable,
}

/// Writer for one response. Bytes end up in the request's response stream,
/// from where the connection forwards them in request arrival order.
///
/// Every operation checks the sticky error slot first: once an operation
/// failed or the response was closed, further calls return that error.
/// Dropping an uncommitted response emits a synthesised `500` so the client
/// always receives an answer.
pub struct Response {
    ctx: Arc<RequestContext>,
    committed: bool,
    mode: ResponseMode,
    remaining: u64,
    last_error: Option<Error>,
}

impl Response {
    pub(crate) fn new(ctx: Arc<RequestContext>) -> Self {
        Self {
            ctx,
            committed: false,
            mode: ResponseMode::Undecided,
            remaining: u64::MAX,
            last_error: None,
        }
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Read access to the response header.
    pub fn header<T>(&self, f: impl FnOnce(&ResponseHeader) -> T) -> T {
        self.ctx.with_response_header(|h| f(h))
    }

    /// Mutate the response header. Only valid before the header is committed.
    pub fn header_mut<T>(&mut self, f: impl FnOnce(&mut ResponseHeader) -> T) -> T {
        debug_assert!(!self.committed, "response header is frozen after commit");
        self.ctx.with_response_header(f)
    }

    /// Serialise the status line and headers into the response stream.
    pub fn commit_header(&mut self) -> Result<usize, Error> {
        if let Some(e) = self.last_error.clone() {
            return Err(e);
        }
        debug_assert!(!self.committed, "header already committed");
        let mut buf = BytesMut::new();
        self.ctx.with_response_header(|h| encode_head(h, &mut buf))?;
        self.committed = true;
        self.write_stream(&buf)
    }

    /// Write body bytes.
    ///
    /// An undecided response switches to variable length framing and a
    /// missing status defaults to `200 OK` before the header is committed.
    /// In fixed length mode at most the remaining budget is written; the
    /// returned count may be short.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if let Some(e) = self.last_error.clone() {
            return Err(e);
        }
        if matches!(self.mode, ResponseMode::Undecided) {
            self.set_content_length(ContentLength::Variable)?;
        }
        if !self.committed {
            self.ctx.with_response_header(|h| {
                if !h.has_status() {
                    h.set_status(200, "OK");
                }
            });
            self.commit_header()?;
        }
        match self.mode {
            ResponseMode::Chunked => {
                // skip framing empty chunks, a zero size line would read as
                // the terminator.
                if data.is_empty() {
                    return Ok(0);
                }
                let mut buf = BytesMut::new();
                encode_chunk(data, &mut buf);
                self.write_stream(&buf)?;
                Ok(data.len())
            }
            ResponseMode::ContentLength => {
                let allowed = usize::min(data.len(), usize::try_from(self.remaining).unwrap_or(usize::MAX));
                if allowed == 0 {
                    return Ok(0);
                }
                let n = self.write_stream(&data[..allowed])?;
                self.remaining -= n as u64;
                Ok(n)
            }
            ResponseMode::Raw => self.write_stream(data),
            ResponseMode::Undecided => Err(ProtoError::ResponseModeNotSet.into()),
        }
    }

    /// Write `data` as the complete response body and close: decides fixed
    /// length framing when nothing was decided yet.
    pub fn flush(&mut self, data: &[u8]) -> Result<usize, Error> {
        if let Some(e) = self.last_error.clone() {
            return Err(e);
        }
        if matches!(self.mode, ResponseMode::Undecided) {
            self.set_content_length(ContentLength::Fixed(data.len() as u64))?;
        }
        let n = self.write(data)?;
        self.close()?;
        Ok(n)
    }

    /// Finish the response. In chunked mode the terminating chunk is
    /// written; a still undecided response turns into the synthesised
    /// "server did not respond" failure.
    pub fn close(&mut self) -> Result<(), Error> {
        if let Some(e) = self.last_error.clone() {
            return Err(e);
        }
        match self.mode {
            ResponseMode::Chunked => {
                self.write_stream(LAST_CHUNK)?;
                self.ctx.response_stream().close();
            }
            ResponseMode::ContentLength | ResponseMode::Raw => self.ctx.response_stream().close(),
            // a committed header with no body, 204 style, ends cleanly; an
            // untouched response means the handler never answered.
            ResponseMode::Undecided if self.committed => self.ctx.response_stream().close(),
            ResponseMode::Undecided => self.commit_with_exception(Exception::no_response()),
        }
        self.last_error = Some(Error::from(eof()));
        Ok(())
    }

    /// Decide the framing mode. Final: a second call fails with
    /// [ProtoError::ResponseModeFinal].
    pub fn set_content_length(&mut self, len: ContentLength) -> Result<(), Error> {
        if let Some(e) = self.last_error.clone() {
            return Err(e);
        }
        if !matches!(self.mode, ResponseMode::Undecided) {
            return Err(ProtoError::ResponseModeFinal.into());
        }

        let close = request_demands_close(self.ctx.request_header());
        match len {
            ContentLength::Fixed(n) => {
                let mut fmt = itoa::Buffer::new();
                self.ctx.with_response_header(|h| {
                    h.set_header("Content-Length", fmt.format(n));
                    h.set_header("Connection", if close { "close" } else { "keep-alive" });
                });
                self.mode = ResponseMode::ContentLength;
                self.remaining = n;
            }
            ContentLength::Variable => {
                let chunked = self.ctx.request_header().version().supports_chunked();
                self.ctx.with_response_header(|h| {
                    h.remove_header("Content-Length");
                    if chunked {
                        h.add_header("Transfer-Encoding", "chunked");
                        h.add_header("Connection", if close { "close" } else { "keep-alive" });
                    } else {
                        h.add_header("Connection", "close");
                    }
                });
                self.mode = if chunked { ResponseMode::Chunked } else { ResponseMode::Raw };
                self.remaining = u64::MAX;
            }
        }
        Ok(())
    }

    /// Fail the response. Before the header is committed the failure is
    /// answered as a `500` carrying the payload; afterwards the response
    /// stream is aborted mid flight.
    pub fn set_exception(&mut self, e: Exception) {
        if !self.committed {
            self.commit_with_exception(e);
        } else {
            self.ctx.response_stream().set_error(aborted());
            self.last_error = Some(Error::aborted());
        }
    }

    fn write_stream(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.ctx.response_stream().write(data).map_err(|e| {
            let e = Error::from(e);
            self.last_error = Some(e.clone());
            e
        })
    }

    fn commit_with_exception(&mut self, e: Exception) {
        debug_assert!(!self.committed);
        let body = e.to_json();
        let mut fmt = itoa::Buffer::new();
        self.ctx.with_response_header(|h| {
            h.set_status(500, "Internal Server Error");
            h.set_version(Version::HTTP_11);
            h.set_header("Connection", "close");
            h.set_header("Content-Length", fmt.format(body.len()));
            h.set_header("Content-Type", "application/json");
            h.set_header("X-Secr-Content-Type", "protobuf-message");
            h.set_header("X-Secr-Message-Type", EXCEPTION_MESSAGE_TYPE);
        });
        self.committed = true;

        let mut buf = BytesMut::new();
        if let Err(err) = self.ctx.with_response_header(|h| encode_head(h, &mut buf)) {
            warn!(target: "h1_response", request = %self.ctx.request_id(), error = %err, "failure response could not be encoded");
        } else {
            buf.extend_from_slice(body.as_bytes());
            if let Err(err) = self.ctx.response_stream().write(&buf) {
                warn!(target: "h1_response", request = %self.ctx.request_id(), error = %err, "failure response could not be written");
            }
        }
        self.ctx.response_stream().close();
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        if !self.committed {
            self.commit_with_exception(Exception::no_response());
        }
    }
}

fn request_demands_close(request: &RequestHeader) -> bool {
    match request.header("Connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        // without an explicit preference only http/1.1 clients default to
        // keeping the connection open.
        _ => request.version() < Version::HTTP_11,
    }
}

#[cfg(test)]
mod test {
    use core::task::{Context, Poll, Waker};

    use std::io;

    use tokio::io::ReadBuf;

    use crate::{
        proto::Head,
        request::{ConnectionId, RequestAssembler},
    };

    use super::*;

    fn context(version: Version, headers: &[(&str, &str)]) -> Arc<RequestContext> {
        let mut assembler = RequestAssembler::new(ConnectionId::generate());
        assembler.append_uri("/fink");
        for (name, value) in headers {
            assembler.append_header_field(name);
            assembler.append_header_value(value);
        }
        let head = Head {
            method: "POST",
            version,
            content_length: None,
            chunked: false,
        };
        Arc::new(assembler.finalise(&head).unwrap())
    }

    // drain whatever is buffered in the response stream without blocking.
    fn drain(ctx: &RequestContext) -> (Vec<u8>, Option<io::Error>, bool) {
        let mut cx = Context::from_waker(Waker::noop());
        let mut out = Vec::new();
        let mut space = [0u8; 512];
        loop {
            let mut buf = ReadBuf::new(&mut space);
            match ctx.response_stream().poll_read_ready(&mut cx, &mut buf) {
                Poll::Pending => return (out, None, false),
                Poll::Ready(Ok(())) if buf.filled().is_empty() => return (out, None, true),
                Poll::Ready(Ok(())) => out.extend_from_slice(buf.filled()),
                Poll::Ready(Err(e)) => return (out, Some(e), false),
            }
        }
    }

    #[test]
    fn flush_writes_fixed_length_response() {
        let ctx = context(Version::HTTP_11, &[("Connection", "keep-alive")]);
        let mut res = Response::new(ctx.clone());
        assert_eq!(res.flush(b"9876543210").unwrap(), 10);

        let (bytes, err, eof) = drain(&ctx);
        assert!(err.is_none());
        assert!(eof);
        assert_eq!(
            bytes,
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: keep-alive\r\n\r\n9876543210"
        );
        assert!(!ctx.must_force_close_on_response());
    }

    #[test]
    fn chunk_framing_with_terminator() {
        let ctx = context(Version::HTTP_11, &[("Connection", "keep-alive")]);
        let mut res = Response::new(ctx.clone());
        res.set_content_length(ContentLength::Variable).unwrap();
        assert_eq!(res.write(b"abc").unwrap(), 3);
        assert_eq!(res.write(b"defgh").unwrap(), 5);
        res.close().unwrap();

        let (bytes, _, eof) = drain(&ctx);
        assert!(eof);
        assert_eq!(
            bytes,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\n\r\n3\r\nabc\r\n5\r\ndefgh\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn first_write_defaults_status_and_mode() {
        let ctx = context(Version::HTTP_11, &[]);
        let mut res = Response::new(ctx.clone());
        res.write(b"hi").unwrap();
        assert_eq!(res.mode(), ResponseMode::Chunked);
        assert!(res.committed());

        let (bytes, _, _) = drain(&ctx);
        assert!(bytes.starts_with(b"HTTP/1.1 200 OK\r\n"));
        res.close().unwrap();
    }

    #[test]
    fn http_10_variable_length_is_raw() {
        let ctx = context(Version::HTTP_10, &[]);
        let mut res = Response::new(ctx.clone());
        res.write(b"plain bytes").unwrap();
        assert_eq!(res.mode(), ResponseMode::Raw);
        res.close().unwrap();

        let (bytes, _, eof) = drain(&ctx);
        assert!(eof);
        // the response version mirrors the request version.
        assert_eq!(bytes, b"HTTP/1.0 200 OK\r\nConnection: close\r\n\r\nplain bytes");
        assert!(ctx.must_force_close_on_response());
    }

    #[test]
    fn mode_is_final() {
        let ctx = context(Version::HTTP_11, &[]);
        let mut res = Response::new(ctx);
        res.set_content_length(ContentLength::Fixed(4)).unwrap();
        match res.set_content_length(ContentLength::Variable) {
            Err(Error::Proto(ProtoError::ResponseModeFinal)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        res.flush(b"done").unwrap();
    }

    #[test]
    fn fixed_length_budget_truncates() {
        let ctx = context(Version::HTTP_11, &[("Connection", "keep-alive")]);
        let mut res = Response::new(ctx.clone());
        res.set_content_length(ContentLength::Fixed(5)).unwrap();
        assert_eq!(res.write(b"0123456789").unwrap(), 5);
        assert_eq!(res.write(b"more").unwrap(), 0);
        res.close().unwrap();

        let (bytes, _, _) = drain(&ctx);
        assert!(bytes.ends_with(b"\r\n\r\n01234"));
    }

    #[test]
    fn commit_requires_status() {
        let ctx = context(Version::HTTP_11, &[]);
        let mut res = Response::new(ctx);
        match res.commit_header() {
            Err(Error::Proto(ProtoError::MissingStatusLine)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        res.header_mut(|h| h.set_status(204, "No Content"));
        assert!(res.commit_header().is_ok());
        res.close().unwrap();
    }

    const NO_RESPONSE_500: &[u8] =
        b"HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\nContent-Length: 67\r\nContent-Type: application/json\r\nX-Secr-Content-Type: protobuf-message\r\nX-Secr-Message-Type: secr.api.Exception\r\n\r\n{\n \"name\": \"std::logic_error\",\n \"what\": \"server did not respond\"\n}\n";

    #[test]
    fn dropping_uncommitted_response_emits_500() {
        let ctx = context(Version::HTTP_11, &[("Connection", "keep-alive")]);
        drop(Response::new(ctx.clone()));

        let (bytes, _, eof) = drain(&ctx);
        assert!(eof);
        assert_eq!(bytes, NO_RESPONSE_500);
        assert!(ctx.must_force_close_on_response());
    }

    #[test]
    fn close_while_undecided_emits_500() {
        let ctx = context(Version::HTTP_11, &[]);
        let mut res = Response::new(ctx.clone());
        res.close().unwrap();
        assert!(res.close().is_err());

        let (bytes, _, _) = drain(&ctx);
        assert_eq!(bytes, NO_RESPONSE_500);
    }

    #[test]
    fn exception_after_commit_aborts_the_stream() {
        let ctx = context(Version::HTTP_11, &[]);
        let mut res = Response::new(ctx.clone());
        res.write(b"partial").unwrap();
        res.set_exception(Exception::new("worker_failure", "backend fell over"));

        let (bytes, err, _) = drain(&ctx);
        assert!(bytes.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(err.unwrap().kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn exception_before_commit_becomes_500_payload() {
        let ctx = context(Version::HTTP_11, &[]);
        let mut res = Response::new(ctx.clone());
        res.set_exception(Exception::new("worker_failure", "backend fell over"));

        let (bytes, _, eof) = drain(&ctx);
        assert!(eof);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("\"name\": \"worker_failure\""));
    }

    #[test]
    fn connection_decision_follows_request_version() {
        // http/1.0 without a preference closes.
        let ctx = context(Version::HTTP_10, &[]);
        let mut res = Response::new(ctx.clone());
        res.set_content_length(ContentLength::Fixed(5)).unwrap();
        assert_eq!(ctx.with_response_header(|h| h.header("Connection").map(str::to_string)), Some("close".into()));
        assert!(ctx.must_force_close_on_response());
        res.flush(b"01234").unwrap();

        // http/1.1 without a preference keeps the connection.
        let ctx = context(Version::HTTP_11, &[]);
        let mut res = Response::new(ctx.clone());
        res.set_content_length(ContentLength::Fixed(5)).unwrap();
        assert_eq!(ctx.with_response_header(|h| h.header("Connection").map(str::to_string)), Some("keep-alive".into()));
        assert!(!ctx.must_force_close_on_response());
        res.flush(b"01234").unwrap();

        // explicit close wins regardless of version.
        let ctx = context(Version::HTTP_11, &[("Connection", "close")]);
        let mut res = Response::new(ctx.clone());
        res.set_content_length(ContentLength::Variable).unwrap();
        assert_eq!(res.mode(), ResponseMode::Chunked);
        assert_eq!(ctx.with_response_header(|h| h.header("Connection").map(str::to_string)), Some("close".into()));
        res.flush(b"x").unwrap();
    }
}
