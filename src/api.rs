//! wire format of failure payloads.
//!
//! When a request handler fails before a response header is committed the
//! connection answers with a `500` carrying a JSON rendition of the failure.
//! Both the JSON shape and the `name` strings are a cross language wire
//! contract shared with existing clients of the protocol and must not drift.

use serde::Serialize;

use crate::error::Error;

/// full name of the payload message type, advertised in the
/// `X-Secr-Message-Type` response header.
pub const EXCEPTION_MESSAGE_TYPE: &str = "secr.api.Exception";

/// A failure description, possibly wrapping the failure that caused it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Exception {
    pub name: String,
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<Exception>>,
}

impl Exception {
    pub fn new(name: impl Into<String>, what: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            what: what.into(),
            nested: None,
        }
    }

    /// Payload emitted when a handler finished without producing a response.
    pub(crate) fn no_response() -> Self {
        Self::new("std::logic_error", "server did not respond")
    }

    /// Build a payload from any error, chaining its sources into `nested`.
    pub fn from_error(e: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            name: String::from("error"),
            what: e.to_string(),
            nested: e.source().map(|src| Box::new(Self::from_error(src))),
        }
    }

    /// Serialise in the payload wire format: pretty JSON with a single space
    /// of indent, a space after each colon and a terminating newline.
    pub fn to_json(&self) -> String {
        payload_json(self)
    }
}

/// Ordered collection of independent failures carried as one payload.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ExceptionList {
    pub exceptions: Vec<Exception>,
}

impl ExceptionList {
    pub fn push(&mut self, e: Exception) {
        self.exceptions.push(e);
    }

    /// see [Exception::to_json].
    pub fn to_json(&self) -> String {
        payload_json(self)
    }
}

impl FromIterator<Exception> for ExceptionList {
    fn from_iter<I: IntoIterator<Item = Exception>>(iter: I) -> Self {
        Self {
            exceptions: iter.into_iter().collect(),
        }
    }
}

fn payload_json<T: Serialize>(value: &T) -> String {
    let mut out = Vec::with_capacity(96);
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, fmt);
    value.serialize(&mut ser).expect("payload serialization is infallible");
    out.push(b'\n');
    String::from_utf8(out).expect("serde_json emits utf8")
}

impl From<&Error> for Exception {
    fn from(e: &Error) -> Self {
        match *e {
            Error::Io(ref e) => Self::new("transport_error", e.to_string()),
            Error::Proto(ref e) => Self::new("protocol_error", e.to_string()),
            Error::InvalidUrl(ref uri) => Self::new("invalid_url", uri.clone()),
        }
    }
}
