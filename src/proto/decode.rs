//! incremental request parsing.
//!
//! [Parser] is a push parser: feed it the connection's read buffer and it
//! drives an [Events] sink through the lifecycle of each message (begin,
//! url, header name/value pairs, headers complete, body chunks, message
//! complete) across pipelined requests. Head parsing is done by `httparse`;
//! body delimitation follows the message's transfer coding.

use core::mem;

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    error::{Error, Parse},
    header::Version,
};

/// upper bound on header lines per request.
pub const MAX_HEADERS: usize = 64;

/// upper bound on the buffered size of a request head.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Facts about a request available once its head is fully parsed.
#[derive(Debug)]
pub struct Head<'a> {
    pub method: &'a str,
    pub version: Version,
    /// declared body length. `None` for chunked or bodyless requests.
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Sink for parser events. Any error returned from a callback stops the
/// parser and is treated as a protocol failure by the connection.
pub trait Events {
    fn on_message_begin(&mut self) -> Result<(), Error>;
    fn on_url(&mut self, chunk: &str) -> Result<(), Error>;
    fn on_header_field(&mut self, chunk: &str) -> Result<(), Error>;
    fn on_header_value(&mut self, chunk: &str) -> Result<(), Error>;
    fn on_headers_complete(&mut self, head: &Head<'_>) -> Result<(), Error>;
    fn on_body(&mut self, chunk: Bytes) -> Result<(), Error>;
    fn on_message_complete(&mut self) -> Result<(), Error>;
}

enum State {
    Head,
    Body(TransferCoding),
}

/// Push parser for a stream of pipelined http/1 requests.
pub struct Parser {
    state: State,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self { state: State::Head }
    }

    /// Consume as much of `buf` as possible, emitting events. Returns once
    /// more input is required. Leftover bytes stay in `buf`.
    pub fn advance<E>(&mut self, buf: &mut BytesMut, events: &mut E) -> Result<(), Error>
    where
        E: Events,
    {
        loop {
            match self.state {
                State::Head => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    match parse_head(buf, events)? {
                        HeadOutcome::Incomplete => return Ok(()),
                        HeadOutcome::Complete(len, coding) => {
                            buf.advance(len);
                            if coding.is_eof() {
                                events.on_message_complete()?;
                            } else {
                                self.state = State::Body(coding);
                            }
                        }
                    }
                }
                State::Body(ref mut coding) => match coding.decode(buf) {
                    ChunkResult::Chunk(bytes) => events.on_body(bytes)?,
                    ChunkResult::InsufficientData => return Ok(()),
                    ChunkResult::Eof => {
                        events.on_message_complete()?;
                        self.state = State::Head;
                    }
                    ChunkResult::Err(e) => return Err(e.into()),
                },
            }
        }
    }
}

enum HeadOutcome {
    Incomplete,
    Complete(usize, TransferCoding),
}

fn parse_head<E>(buf: &mut BytesMut, events: &mut E) -> Result<HeadOutcome, Error>
where
    E: Events,
{
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(&buf[..]).map_err(Parse::from)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            return if buf.len() >= MAX_HEAD_SIZE {
                Err(Parse::HeaderOverflow.into())
            } else {
                Ok(HeadOutcome::Incomplete)
            };
        }
    };

    let method = req.method.unwrap();
    let path = req.path.unwrap();
    let version = match req.version.unwrap() {
        1 => Version::HTTP_11,
        _ => Version::HTTP_10,
    };

    validate_target(method, path)?;

    events.on_message_begin()?;
    events.on_url(path)?;

    let mut coding = TransferCoding::eof();
    let mut content_length = None;

    for h in req.headers.iter() {
        let value = core::str::from_utf8(h.value).map_err(|_| Parse::HeaderToken)?;
        events.on_header_field(h.name)?;
        events.on_header_value(value)?;

        if h.name.eq_ignore_ascii_case("content-length") {
            let len = value.trim().parse::<u64>().map_err(|_| Parse::ContentLength)?;
            if matches!(coding, TransferCoding::Length(_)) {
                return Err(Parse::ContentLength.into());
            }
            coding.try_set(TransferCoding::length(len))?;
            content_length = Some(len);
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            // chunked is an http/1.1 construct.
            if version != Version::HTTP_11 {
                return Err(Parse::HeaderToken.into());
            }
            for val in value.split(',') {
                if val.trim().eq_ignore_ascii_case("chunked") {
                    coding.try_set(TransferCoding::decode_chunked())?;
                }
            }
        }
    }

    let chunked = matches!(coding, TransferCoding::DecodeChunked(..));
    let head = Head {
        method,
        version,
        content_length,
        chunked,
    };
    events.on_headers_complete(&head)?;

    Ok(HeadOutcome::Complete(len, coding))
}

// A request target must be origin form, asterisk form, absolute form, or
// authority form for CONNECT. A bare token is indistinguishable from a stray
// token on the request line and is reported against the method.
fn validate_target(method: &str, path: &str) -> Result<(), Parse> {
    if path.starts_with('/') || path == "*" || method == "CONNECT" {
        return Ok(());
    }
    match path.split_once("://") {
        Some((scheme, rest))
            if !rest.is_empty()
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) =>
        {
            Ok(())
        }
        _ => Err(Parse::Method),
    }
}

/// Body decoder for one message, chosen from its headers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferCoding {
    /// message has no body.
    Eof,
    /// body delimited by a `Content-Length` header.
    Length(u64),
    /// body delimited by `Transfer-Encoding: chunked`.
    DecodeChunked(ChunkedState, u64),
}

impl TransferCoding {
    pub const fn eof() -> Self {
        Self::Eof
    }

    pub const fn length(len: u64) -> Self {
        Self::Length(len)
    }

    pub const fn decode_chunked() -> Self {
        Self::DecodeChunked(ChunkedState::Size, 0)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    // a coding may only be decided once per message.
    fn try_set(&mut self, other: Self) -> Result<(), Parse> {
        match *self {
            Self::Eof => {
                *self = other;
                Ok(())
            }
            _ => Err(Parse::HeaderToken),
        }
    }

    /// decode the next piece of body from `src`.
    pub fn decode(&mut self, src: &mut BytesMut) -> ChunkResult {
        match *self {
            Self::Length(0) | Self::DecodeChunked(ChunkedState::End, _) => {
                *self = Self::Eof;
                ChunkResult::Eof
            }
            Self::Eof => ChunkResult::Eof,
            _ if src.is_empty() => ChunkResult::InsufficientData,
            Self::Length(ref mut rem) => ChunkResult::Chunk(bounded_split(rem, src)),
            Self::DecodeChunked(ref mut state, ref mut size) => loop {
                let mut buf = None;
                *state = match state.step(src, size, &mut buf) {
                    Ok(Some(state)) => state,
                    Ok(None) => return ChunkResult::InsufficientData,
                    Err(e) => return ChunkResult::Err(e),
                };

                if matches!(state, ChunkedState::End) {
                    return self.decode(src);
                }

                if let Some(buf) = buf {
                    return ChunkResult::Chunk(buf);
                }
            },
        }
    }
}

/// Outcome of one [TransferCoding::decode] step.
#[derive(Debug)]
pub enum ChunkResult {
    /// non empty piece of body data.
    Chunk(Bytes),
    /// more input bytes required.
    InsufficientData,
    /// the body is complete.
    Eof,
    /// malformed body framing.
    Err(Parse),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

macro_rules! byte {
    ($rdr:ident) => {{
        if $rdr.is_empty() {
            return Ok(None);
        }
        let b = $rdr[0];
        $rdr.advance(1);
        b
    }};
}

impl ChunkedState {
    fn step(&mut self, body: &mut BytesMut, size: &mut u64, buf: &mut Option<Bytes>) -> Result<Option<Self>, Parse> {
        match *self {
            Self::Size => Self::read_size(body, size),
            Self::SizeLws => Self::read_size_lws(body),
            Self::Extension => Self::read_extension(body),
            Self::SizeLf => Self::read_size_lf(body, size),
            Self::Body => Self::read_body(body, size, buf),
            Self::BodyCr => Self::read_body_cr(body),
            Self::BodyLf => Self::read_body_lf(body),
            Self::Trailer => Self::read_trailer(body),
            Self::TrailerLf => Self::read_trailer_lf(body),
            Self::EndCr => Self::read_end_cr(body),
            Self::EndLf => Self::read_end_lf(body),
            Self::End => Ok(Some(Self::End)),
        }
    }

    fn read_size(rdr: &mut BytesMut, size: &mut u64) -> Result<Option<Self>, Parse> {
        let radix = 16;
        macro_rules! or_overflow {
            ($e:expr) => {
                match $e {
                    Some(val) => val,
                    None => return Err(Parse::ChunkSize),
                }
            };
        }
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(Some(Self::SizeLws)),
            b';' => return Ok(Some(Self::Extension)),
            b'\r' => return Ok(Some(Self::SizeLf)),
            _ => return Err(Parse::ChunkSize),
        }
        Ok(Some(Self::Size))
    }

    fn read_size_lws(rdr: &mut BytesMut) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            // white space may follow the size but no further digits.
            b'\t' | b' ' => Ok(Some(Self::SizeLws)),
            b';' => Ok(Some(Self::Extension)),
            b'\r' => Ok(Some(Self::SizeLf)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_extension(rdr: &mut BytesMut) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::SizeLf)),
            b'\n' => Err(Parse::ChunkSize),
            // extensions are skipped, not interpreted.
            _ => Ok(Some(Self::Extension)),
        }
    }

    fn read_size_lf(rdr: &mut BytesMut, size: &mut u64) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            b'\n' if *size > 0 => Ok(Some(Self::Body)),
            b'\n' => Ok(Some(Self::EndCr)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_body(rdr: &mut BytesMut, rem: &mut u64, buf: &mut Option<Bytes>) -> Result<Option<Self>, Parse> {
        if rdr.is_empty() {
            Ok(None)
        } else {
            *buf = Some(bounded_split(rem, rdr));
            if *rem > 0 {
                Ok(Some(Self::Body))
            } else {
                Ok(Some(Self::BodyCr))
            }
        }
    }

    fn read_body_cr(rdr: &mut BytesMut) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::BodyLf)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_body_lf(rdr: &mut BytesMut) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            b'\n' => Ok(Some(Self::Size)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_trailer(rdr: &mut BytesMut) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::TrailerLf)),
            _ => Ok(Some(Self::Trailer)),
        }
    }

    fn read_trailer_lf(rdr: &mut BytesMut) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            b'\n' => Ok(Some(Self::EndCr)),
            _ => Err(Parse::ChunkSize),
        }
    }

    fn read_end_cr(rdr: &mut BytesMut) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::EndLf)),
            _ => Ok(Some(Self::Trailer)),
        }
    }

    fn read_end_lf(rdr: &mut BytesMut) -> Result<Option<Self>, Parse> {
        match byte!(rdr) {
            b'\n' => Ok(Some(Self::End)),
            _ => Err(Parse::ChunkSize),
        }
    }
}

fn bounded_split(rem: &mut u64, buf: &mut BytesMut) -> Bytes {
    let len = buf.len() as u64;
    if *rem >= len {
        *rem -= len;
        buf.split().freeze()
    } else {
        let rem = mem::replace(rem, 0);
        buf.split_to(rem as usize).freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Record {
        begins: usize,
        url: String,
        fields: Vec<String>,
        values: Vec<String>,
        method: String,
        version: Option<Version>,
        body: Vec<u8>,
        completes: usize,
    }

    #[derive(Default, Debug)]
    struct Collector {
        messages: Vec<Record>,
    }

    impl Collector {
        fn current(&mut self) -> &mut Record {
            self.messages.last_mut().expect("message begin must come first")
        }
    }

    impl Events for Collector {
        fn on_message_begin(&mut self) -> Result<(), Error> {
            self.messages.push(Record {
                begins: 1,
                ..Record::default()
            });
            Ok(())
        }

        fn on_url(&mut self, chunk: &str) -> Result<(), Error> {
            self.current().url.push_str(chunk);
            Ok(())
        }

        fn on_header_field(&mut self, chunk: &str) -> Result<(), Error> {
            self.current().fields.push(chunk.to_string());
            Ok(())
        }

        fn on_header_value(&mut self, chunk: &str) -> Result<(), Error> {
            self.current().values.push(chunk.to_string());
            Ok(())
        }

        fn on_headers_complete(&mut self, head: &Head<'_>) -> Result<(), Error> {
            let method = head.method.to_string();
            let version = head.version;
            let rec = self.current();
            rec.method = method;
            rec.version = Some(version);
            Ok(())
        }

        fn on_body(&mut self, chunk: Bytes) -> Result<(), Error> {
            self.current().body.extend_from_slice(&chunk);
            Ok(())
        }

        fn on_message_complete(&mut self) -> Result<(), Error> {
            self.current().completes += 1;
            Ok(())
        }
    }

    fn feed(input: &[u8]) -> Result<Collector, Error> {
        let mut parser = Parser::new();
        let mut collector = Collector::default();
        let mut buf = BytesMut::from(input);
        parser.advance(&mut buf, &mut collector)?;
        Ok(collector)
    }

    #[test]
    fn bodyless_request() {
        let c = feed(b"GET /moo?a=1 HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(c.messages.len(), 1);
        let m = &c.messages[0];
        assert_eq!(m.url, "/moo?a=1");
        assert_eq!(m.method, "GET");
        assert_eq!(m.version, Some(Version::HTTP_11));
        assert_eq!(m.fields, ["Host"]);
        assert_eq!(m.values, ["example.com"]);
        assert!(m.body.is_empty());
        assert_eq!(m.completes, 1);
    }

    #[test]
    fn content_length_body_across_reads() {
        let mut parser = Parser::new();
        let mut collector = Collector::default();
        let mut buf = BytesMut::new();

        for piece in [
            &b"POST /fink HTTP/1.1\r\nConte"[..],
            b"nt-Length: 10\r\n\r\n01234",
            b"56789",
        ] {
            buf.extend_from_slice(piece);
            parser.advance(&mut buf, &mut collector).unwrap();
        }

        let m = &collector.messages[0];
        assert_eq!(m.body, b"0123456789");
        assert_eq!(m.completes, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn pipelined_requests() {
        let c = feed(
            b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc\
              GET /b HTTP/1.1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(c.messages.len(), 2);
        assert_eq!(c.messages[0].url, "/a");
        assert_eq!(c.messages[0].body, b"abc");
        assert_eq!(c.messages[1].url, "/b");
        assert_eq!(c.messages[1].completes, 1);
    }

    #[test]
    fn chunked_body() {
        let c = feed(
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              3\r\nabc\r\n5\r\ndefgh\r\n0\r\n\r\n",
        )
        .unwrap();
        let m = &c.messages[0];
        assert_eq!(m.body, b"abcdefgh");
        assert_eq!(m.completes, 1);
    }

    #[test]
    fn chunk_size_is_hex_with_extensions() {
        let c = feed(
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              a;ext name=value\r\n0123456789\r\n0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(c.messages[0].body, b"0123456789");
    }

    #[test]
    fn bare_token_target_is_invalid_method() {
        let err = feed(b"GET fooble HTTP/1.1\r\nAccept: text/*\r\n\r\n").unwrap_err();
        match err {
            Error::Proto(crate::error::ProtoError::Parse(p)) => assert_eq!(p.name(), "HPE_INVALID_METHOD"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn absolute_and_asterisk_targets_are_accepted() {
        assert!(feed(b"GET http://example.com/x HTTP/1.1\r\n\r\n").is_ok());
        assert!(feed(b"OPTIONS * HTTP/1.1\r\n\r\n").is_ok());
        assert!(feed(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").is_ok());
    }

    #[test]
    fn invalid_content_length_rejected() {
        let err = feed(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n").unwrap_err();
        match err {
            Error::Proto(crate::error::ProtoError::Parse(p)) => assert_eq!(p, Parse::ContentLength),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn conflicting_content_length_rejected() {
        assert!(feed(b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n").is_err());
    }

    #[test]
    fn chunked_on_http_10_rejected() {
        assert!(feed(b"POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n").is_err());
    }

    #[test]
    fn oversized_head_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend_from_slice(b"X-Padding: ");
        raw.extend(std::iter::repeat_n(b'a', MAX_HEAD_SIZE));
        let err = feed(&raw).unwrap_err();
        match err {
            Error::Proto(crate::error::ProtoError::Parse(p)) => assert_eq!(p, Parse::HeaderOverflow),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn read_chunk_size_variants() {
        fn read(s: &str) -> u64 {
            let mut state = ChunkedState::Size;
            let rdr = &mut BytesMut::from(s.as_bytes());
            let mut size = 0;
            loop {
                let result = state.step(rdr, &mut size, &mut None);
                state = result
                    .unwrap_or_else(|_| panic!("read_size failed for {s:?}"))
                    .unwrap();
                if state == ChunkedState::Body || state == ChunkedState::EndCr {
                    break;
                }
            }
            size
        }

        fn read_err(s: &str) {
            let mut state = ChunkedState::Size;
            let rdr = &mut BytesMut::from(s.as_bytes());
            let mut size = 0;
            loop {
                match state.step(rdr, &mut size, &mut None) {
                    Ok(Some(next)) => state = next,
                    Ok(None) => panic!("ran out of input for {s:?}"),
                    Err(e) => {
                        assert_eq!(e, Parse::ChunkSize);
                        return;
                    }
                }
                if state == ChunkedState::Body || state == ChunkedState::End {
                    panic!("expected error for {s:?}");
                }
            }
        }

        assert_eq!(1, read("1\r\n"));
        assert_eq!(1, read("01\r\n"));
        assert_eq!(0, read("0\r\n"));
        assert_eq!(10, read("A\r\n"));
        assert_eq!(10, read("a\r\n"));
        assert_eq!(255, read("Ff\r\n"));
        assert_eq!(255, read("Ff   \r\n"));
        assert_eq!(1, read("1;extension\r\n"));
        assert_eq!(3, read("3   ; extension=123\r\n"));
        read_err("F\rF");
        read_err("X\r\n");
        read_err("-1\r\n");
        read_err("1 invalid extension\r\n");
        read_err("1;reject\nnewlines\r\n");
        // overflow
        read_err("f0000000000000003\r\n");
    }
}
