//! error types.

use core::fmt;

use std::{error, io, sync::Arc};

/// Connection level error. The same value may be observed twice: once by a
/// pending [`wait_dispatch`] call and once as the outcome of [`run`].
///
/// [`wait_dispatch`]: crate::Dispatcher::wait_dispatch
/// [`run`]: crate::ServerConnection::run
#[derive(Clone, Debug)]
pub enum Error {
    /// transport fault from the underlying byte stream. terminate connection right away.
    Io(Arc<io::Error>),
    /// http/1 protocol violation. no further request is read from the connection.
    Proto(ProtoError),
    /// request target that passed head parsing but failed component splitting.
    InvalidUrl(String),
}

impl Error {
    /// true when the error is a clean end of stream on the transport.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// true when the error is a cancelled in flight operation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::ConnectionAborted)
    }

    pub(crate) fn aborted() -> Self {
        Self::Io(Arc::new(aborted()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Io(ref e) => fmt::Display::fmt(e, f),
            Self::Proto(ref e) => fmt::Display::fmt(e, f),
            Self::InvalidUrl(ref uri) => write!(f, "invalid url: {uri}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Io(ref e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

impl From<Parse> for Error {
    fn from(e: Parse) -> Self {
        Self::Proto(ProtoError::Parse(e))
    }
}

/// Http/1 protocol error: a parse failure on ingress or a response state
/// keeping violation on egress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtoError {
    /// parse error on the request stream.
    Parse(Parse),
    /// header was committed before a status line was set on the response.
    MissingStatusLine,
    /// body bytes were written while the response mode was still undecided.
    ResponseModeNotSet,
    /// the response mode was decided already and can not change.
    ResponseModeFinal,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Parse(ref e) => fmt::Display::fmt(e, f),
            Self::MissingStatusLine => f.write_str("missing status line"),
            Self::ResponseModeNotSet => f.write_str("response mode not set"),
            Self::ResponseModeFinal => f.write_str("response mode already set"),
        }
    }
}

impl error::Error for ProtoError {}

impl From<Parse> for ProtoError {
    fn from(e: Parse) -> Self {
        Self::Parse(e)
    }
}

/// Failure on parsing. Variants map one to one onto the classic parser errno
/// names clients already match on; [`Parse::name`] yields that spelling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Parse {
    /// malformed request line: method token or a target that fits no known form.
    Method,
    /// malformed request target.
    Url,
    /// http version other than 1.0/1.1.
    Version,
    /// bare CR or missing LF in the head section.
    LineEnd,
    /// invalid byte in a header name or value.
    HeaderToken,
    /// unparseable or conflicting Content-Length.
    ContentLength,
    /// invalid chunk size line in a chunked request body.
    ChunkSize,
    /// request head exceeds the buffering limit.
    HeaderOverflow,
}

impl Parse {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Method => "HPE_INVALID_METHOD",
            Self::Url => "HPE_INVALID_URL",
            Self::Version => "HPE_INVALID_VERSION",
            Self::LineEnd => "HPE_LF_EXPECTED",
            Self::HeaderToken => "HPE_INVALID_HEADER_TOKEN",
            Self::ContentLength => "HPE_INVALID_CONTENT_LENGTH",
            Self::ChunkSize => "HPE_INVALID_CHUNK_SIZE",
            Self::HeaderOverflow => "HPE_HEADER_OVERFLOW",
        }
    }
}

impl fmt::Display for Parse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl error::Error for Parse {}

impl From<httparse::Error> for Parse {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::HeaderName | httparse::Error::HeaderValue => Self::HeaderToken,
            httparse::Error::NewLine => Self::LineEnd,
            httparse::Error::Version => Self::Version,
            // more header lines than the fixed head buffer can index.
            httparse::Error::TooManyHeaders => Self::HeaderOverflow,
            _ => Self::Method,
        }
    }
}

pub(crate) fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")
}

pub(crate) fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "operation aborted")
}
