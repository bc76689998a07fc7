//! http/1 message model.
//!
//! Headers are kept as an ordered list of name/value pairs: name case is
//! preserved for the wire while lookups compare ASCII case insensitively.
//! Duplicate names are allowed in storage; [ResponseHeader::set_header]
//! collapses them while [ResponseHeader::add_header] appends.

use core::fmt;

/// http version as sent on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Self = Self { major: 1, minor: 0 };
    pub const HTTP_11: Self = Self { major: 1, minor: 1 };

    /// chunked transfer coding exists from http/1.1 on.
    pub fn supports_chunked(self) -> bool {
        self >= Self::HTTP_11
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// case insensitive name match.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

fn find<'h>(headers: &'h [Header], name: &str) -> Option<&'h Header> {
    headers.iter().find(|h| h.is(name))
}

/// Parsed request head.
#[derive(Clone, Debug, Default)]
pub struct RequestHeader {
    pub(crate) method: String,
    pub(crate) uri: String,
    pub(crate) version: Version,
    pub(crate) query: UriParts,
    pub(crate) headers: Vec<Header>,
}

impl RequestHeader {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// the request target exactly as received.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// components of the request target.
    pub fn query(&self) -> &UriParts {
        &self.query
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// first header with the given name, case insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        find(&self.headers, name).map(|h| h.value.as_str())
    }
}

/// Optional components of a request target.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UriParts {
    pub schema: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
    pub fragment: Option<String>,
    pub user_info: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

/// Response head under construction by the application.
#[derive(Clone, Debug, Default)]
pub struct ResponseHeader {
    status: Option<Status>,
    version: Version,
    headers: Vec<Header>,
}

impl ResponseHeader {
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    pub fn set_status(&mut self, code: u16, message: impl Into<String>) {
        self.status = Some(Status {
            code,
            message: message.into(),
        });
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// first header with the given name, case insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        find(&self.headers, name).map(|h| h.value.as_str())
    }

    /// Append a header, keeping existing ones with the same name.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    /// Set a header to a single value: the first occurrence is overwritten in
    /// place, every other occurrence is removed, position preserved.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        match self.headers.iter_mut().position(|h| h.is(name)) {
            Some(idx) => {
                self.headers[idx].value = value.into();
                let mut keep = idx + 1;
                self.headers.retain(|h| {
                    if keep > 0 {
                        keep -= 1;
                        return true;
                    }
                    !h.is(name)
                });
            }
            None => self.headers.push(Header::new(name, value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|h| !h.is(name));
    }
}

/// Parsed `Content-Type` value.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContentType {
    type_: String,
    subtype: String,
    parameters: Vec<Parameter>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    pub has_value: bool,
}

/// A `Content-Type` value that does not follow the media type grammar.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidContentType(String);

impl fmt::Display for InvalidContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid content type: {}", self.0)
    }
}

impl std::error::Error for InvalidContentType {}

impl ContentType {
    pub fn type_(&self) -> &str {
        &self.type_
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// first parameter with the given name, case insensitive on the name.
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Parse a media type: `type "/" subtype *( ";" parameter )`. Type,
    /// subtype and parameter names are lowercased; parameter values keep
    /// their case. Values may be quoted, with `""` escaping a quote.
    pub fn parse(value: &str) -> Result<Self, InvalidContentType> {
        let fail = || InvalidContentType(value.to_string());
        let mut input = Input::new(value);

        let mut ct = ContentType::default();
        input.skip_white();
        ct.type_ = input.token().ok_or_else(fail)?.to_ascii_lowercase();
        input.skip_white();
        if !input.consume_char('/') {
            return Err(fail());
        }
        input.skip_white();
        ct.subtype = input.token().ok_or_else(fail)?.to_ascii_lowercase();

        loop {
            input.skip_white();
            if input.consume_char(';') {
                input.skip_white();
                let name = input.token().ok_or_else(fail)?.to_ascii_lowercase();
                input.skip_white();
                let (value, has_value) = if input.consume_char('=') {
                    input.skip_white();
                    (input.token_or_quoted().ok_or_else(fail)?, true)
                } else {
                    (String::new(), false)
                };
                ct.parameters.push(Parameter { name, value, has_value });
            } else if input.is_empty() {
                return Ok(ct);
            } else {
                // anything else, a bare comma in particular, is not a single
                // media type.
                return Err(fail());
            }
        }
    }
}

// cursor over a header value for the media type grammar above.
struct Input<'a> {
    rest: &'a str,
}

impl<'a> Input<'a> {
    fn new(rest: &'a str) -> Self {
        Self { rest }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn skip_white(&mut self) {
        self.rest = self.rest.trim_start_matches([' ', '\t']);
    }

    fn consume_char(&mut self, c: char) -> bool {
        match self.rest.strip_prefix(c) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn token(&mut self) -> Option<String> {
        const SEPARATORS: &str = "()<>@,;:\\/[]?={} \t\"";
        let end = self
            .rest
            .find(|c: char| c.is_ascii_control() || SEPARATORS.contains(c))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let (token, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(token.to_string())
    }

    fn token_or_quoted(&mut self) -> Option<String> {
        if !self.consume_char('"') {
            return self.token();
        }
        let mut out = String::new();
        loop {
            if self.consume_char('"') {
                // a doubled quote is an escaped quote inside the value.
                if self.consume_char('"') {
                    out.push('"');
                } else {
                    return Some(out);
                }
            } else {
                let mut chars = self.rest.chars();
                let c = chars.next()?;
                out.push(c);
                self.rest = chars.as_str();
            }
        }
    }
}
