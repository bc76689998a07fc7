//! per request state.

use core::fmt;

use std::sync::{Mutex, OnceLock, PoisonError};

use uuid::Uuid;

use crate::{
    error::Error,
    fake_stream::FakeStream,
    header::{ContentType, Header, InvalidContentType, RequestHeader, ResponseHeader, UriParts},
    proto::Head,
};

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub struct $name(Uuid);

        impl $name {
            pub(crate) fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id! {
    /// stable identifier of one http request.
    RequestId
}

uuid_id! {
    /// stable identifier of one client connection.
    ConnectionId
}

// accumulates a request head from parser events until it can be finalised
// into a RequestContext. name/value events may arrive in arbitrary splits;
// a field event after a value event starts a new header line.
pub(crate) struct RequestAssembler {
    connection_id: ConnectionId,
    header: RequestHeader,
    state: FieldState,
}

enum FieldState {
    Idle,
    Name,
    Value,
}

impl RequestAssembler {
    pub(crate) fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            header: RequestHeader::default(),
            state: FieldState::Idle,
        }
    }

    pub(crate) fn append_uri(&mut self, chunk: &str) {
        self.header.uri.push_str(chunk);
    }

    pub(crate) fn append_header_field(&mut self, chunk: &str) {
        if !matches!(self.state, FieldState::Name) {
            self.header.headers.push(Header::new("", ""));
        }
        self.state = FieldState::Name;
        if let Some(h) = self.header.headers.last_mut() {
            h.name.push_str(chunk);
        }
    }

    pub(crate) fn append_header_value(&mut self, chunk: &str) {
        debug_assert!(!matches!(self.state, FieldState::Idle), "header value without a name");
        self.state = FieldState::Value;
        if let Some(h) = self.header.headers.last_mut() {
            h.value.push_str(chunk);
        }
    }

    /// Run url component parsing and freeze the head into a request context.
    pub(crate) fn finalise(self, head: &Head<'_>) -> Result<RequestContext, Error> {
        let Self {
            connection_id,
            mut header,
            ..
        } = self;

        let query = split_uri(&header.uri, head.method == "CONNECT")
            .ok_or_else(|| Error::InvalidUrl(header.uri.clone()))?;

        header.method = head.method.to_string();
        header.version = head.version;
        header.query = query;

        let mut response_header = ResponseHeader::default();
        response_header.set_version(head.version);

        Ok(RequestContext {
            id: RequestId::generate(),
            connection_id,
            request: header,
            content_type: OnceLock::new(),
            response_header: Mutex::new(response_header),
            request_stream: FakeStream::new(),
            response_stream: FakeStream::new(),
        })
    }
}

fn split_uri(uri: &str, connect: bool) -> Option<UriParts> {
    let mut parts = UriParts::default();

    if connect {
        let authority = uri.parse::<http::uri::Authority>().ok()?;
        parts.host = Some(authority.host().to_string());
        parts.port = authority.port().map(|p| p.as_str().to_string());
        return Some(parts);
    }

    let rest = match uri.split_once('#') {
        Some((rest, fragment)) => {
            parts.fragment = Some(fragment.to_string());
            rest
        }
        None => uri,
    };

    if rest == "*" {
        parts.path = Some(String::from("*"));
        return Some(parts);
    }

    let parsed = rest.parse::<http::Uri>().ok()?;
    parts.schema = parsed.scheme_str().map(str::to_string);
    if let Some(authority) = parsed.authority() {
        parts.host = Some(authority.host().to_string());
        parts.port = authority.port().map(|p| p.as_str().to_string());
        parts.user_info = authority.as_str().split_once('@').map(|(u, _)| u.to_string());
    }
    if !parsed.path().is_empty() {
        parts.path = Some(parsed.path().to_string());
    }
    parts.query = parsed.query().map(str::to_string);

    Some(parts)
}

/// All state tied to one http request: the parsed head, the stream feeding
/// the request body to the application and the stream carrying the response
/// back to the connection.
#[derive(Debug)]
pub struct RequestContext {
    id: RequestId,
    connection_id: ConnectionId,
    request: RequestHeader,
    content_type: OnceLock<Result<ContentType, InvalidContentType>>,
    response_header: Mutex<ResponseHeader>,
    request_stream: FakeStream,
    response_stream: FakeStream,
}

impl RequestContext {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn request_header(&self) -> &RequestHeader {
        &self.request
    }

    /// Content type of the request, derived from the `Content-Type` header
    /// on first use and cached. A request without the header yields the
    /// empty content type.
    pub fn content_type(&self) -> Result<&ContentType, InvalidContentType> {
        self.content_type
            .get_or_init(|| match self.request.header("Content-Type") {
                Some(value) => ContentType::parse(value),
                None => Ok(ContentType::default()),
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub(crate) fn with_response_header<T>(&self, f: impl FnOnce(&mut ResponseHeader) -> T) -> T {
        let mut guard = self.response_header.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// stream carrying request body bytes towards the application.
    pub(crate) fn request_stream(&self) -> &FakeStream {
        &self.request_stream
    }

    /// stream carrying response bytes towards the connection.
    pub(crate) fn response_stream(&self) -> &FakeStream {
        &self.response_stream
    }

    /// Whether the connection has to be torn down once this response is on
    /// the wire, judged by the response header alone.
    pub fn must_force_close_on_response(&self) -> bool {
        self.with_response_header(|header| {
            match header.header("Connection") {
                None => true,
                Some(v) if v.eq_ignore_ascii_case("close") => true,
                Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
                Some(_) => {
                    // an unrecognised Connection value keeps the connection
                    // only when the response is self delimiting.
                    if header.header("Content-Length").is_some() {
                        return false;
                    }
                    match header.header("Transfer-Encoding") {
                        Some(te) if te.eq_ignore_ascii_case("chunked") => false,
                        _ => true,
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use crate::header::Version;

    use super::*;

    fn head<'a>(method: &'a str, version: Version) -> Head<'a> {
        Head {
            method,
            version,
            content_length: None,
            chunked: false,
        }
    }

    fn context_for(uri: &str, method: &str) -> Result<RequestContext, Error> {
        let mut assembler = RequestAssembler::new(ConnectionId::generate());
        assembler.append_uri(uri);
        assembler.finalise(&head(method, Version::HTTP_11))
    }

    #[test]
    fn header_lines_assemble_from_split_chunks() {
        let mut assembler = RequestAssembler::new(ConnectionId::generate());
        assembler.append_uri("/fi");
        assembler.append_uri("nk");
        assembler.append_header_field("Acc");
        assembler.append_header_field("ept");
        assembler.append_header_value("text");
        assembler.append_header_value("/*");
        assembler.append_header_field("Host");
        assembler.append_header_value("example.com");

        let ctx = assembler.finalise(&head("POST", Version::HTTP_11)).unwrap();
        let header = ctx.request_header();
        assert_eq!(header.uri(), "/fink");
        assert_eq!(header.method(), "POST");
        assert_eq!(header.header("accept"), Some("text/*"));
        assert_eq!(header.header("host"), Some("example.com"));
        assert_eq!(header.headers().len(), 2);
    }

    #[test]
    fn origin_form_components() {
        let ctx = context_for("/fink?debug=1", "GET").unwrap();
        let q = ctx.request_header().query();
        assert_eq!(q.path.as_deref(), Some("/fink"));
        assert_eq!(q.query.as_deref(), Some("debug=1"));
        assert_eq!(q.schema, None);
        assert_eq!(q.host, None);
    }

    #[test]
    fn absolute_form_components() {
        let ctx = context_for("https://bob:pw@example.com:8443/a/b?x=y#frag", "GET").unwrap();
        let q = ctx.request_header().query();
        assert_eq!(q.schema.as_deref(), Some("https"));
        assert_eq!(q.host.as_deref(), Some("example.com"));
        assert_eq!(q.port.as_deref(), Some("8443"));
        assert_eq!(q.path.as_deref(), Some("/a/b"));
        assert_eq!(q.query.as_deref(), Some("x=y"));
        assert_eq!(q.fragment.as_deref(), Some("frag"));
        assert_eq!(q.user_info.as_deref(), Some("bob:pw"));
    }

    #[test]
    fn connect_takes_authority_form() {
        let ctx = context_for("example.com:443", "CONNECT").unwrap();
        let q = ctx.request_header().query();
        assert_eq!(q.host.as_deref(), Some("example.com"));
        assert_eq!(q.port.as_deref(), Some("443"));
    }

    #[test]
    fn unparseable_target_is_invalid_url() {
        match context_for("/fi nk", "GET") {
            Err(Error::InvalidUrl(uri)) => assert_eq!(uri, "/fi nk"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn content_type_is_cached() {
        let mut assembler = RequestAssembler::new(ConnectionId::generate());
        assembler.append_uri("/");
        assembler.append_header_field("Content-Type");
        assembler.append_header_value("text/html; charset=ISO-8859-4");
        let ctx = assembler.finalise(&head("POST", Version::HTTP_11)).unwrap();

        let first = ctx.content_type().unwrap() as *const ContentType;
        let again = ctx.content_type().unwrap() as *const ContentType;
        assert_eq!(first, again);
        assert_eq!(ctx.content_type().unwrap().subtype(), "html");
    }

    #[test]
    fn close_policy_truth_table() {
        let table: &[(&[(&str, &str)], bool)] = &[
            (&[], true),
            (&[("Connection", "close")], true),
            (&[("Connection", "Keep-Alive")], false),
            (&[("Connection", "upgrade"), ("Content-Length", "5")], false),
            (&[("Connection", "upgrade"), ("Transfer-Encoding", "chunked")], false),
            (&[("Connection", "upgrade"), ("Transfer-Encoding", "gzip")], true),
            (&[("Connection", "upgrade")], true),
        ];
        for (headers, expected) in table {
            let ctx = context_for("/", "GET").unwrap();
            ctx.with_response_header(|h| {
                for (name, value) in *headers {
                    h.add_header(*name, *value);
                }
            });
            assert_eq!(
                ctx.must_force_close_on_response(),
                *expected,
                "headers: {headers:?}"
            );
        }
    }
}
