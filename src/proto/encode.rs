//! response head and body framing.

use std::io::Write;

use bytes::{BufMut, BytesMut};

use crate::{
    error::ProtoError,
    header::ResponseHeader,
};

pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Serialise the response head: status line, header lines in stored order
/// with names verbatim, blank line terminator.
pub(crate) fn encode_head(header: &ResponseHeader, buf: &mut BytesMut) -> Result<(), ProtoError> {
    let status = header.status().ok_or(ProtoError::MissingStatusLine)?;
    let version = header.version();

    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/");
    buf.extend_from_slice(itoa_buf.format(version.major).as_bytes());
    buf.extend_from_slice(b".");
    buf.extend_from_slice(itoa_buf.format(version.minor).as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(itoa_buf.format(status.code).as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(status.message.as_bytes());
    buf.extend_from_slice(b"\r\n");

    for h in header.headers() {
        buf.reserve(h.name.len() + h.value.len() + 4);
        buf.extend_from_slice(h.name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(h.value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
    Ok(())
}

/// Frame one body chunk for `transfer-encoding: chunked`.
pub(crate) fn encode_chunk(data: &[u8], buf: &mut BytesMut) {
    write!(Writer(buf), "{:X}\r\n", data.len()).expect("BytesMut write is infallible");
    buf.reserve(data.len() + 2);
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

// io::Write adapter over BytesMut for the chunk size line.
struct Writer<'a>(&'a mut BytesMut);

impl Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::header::Version;

    use super::*;

    #[test]
    fn head_format() {
        let mut header = ResponseHeader::default();
        header.set_version(Version::HTTP_11);
        header.set_status(200, "OK");
        header.add_header("Content-Length", "10");
        header.add_header("Connection", "keep-alive");

        let mut buf = BytesMut::new();
        encode_head(&header, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn head_requires_status() {
        let mut header = ResponseHeader::default();
        header.set_version(Version::HTTP_11);
        let mut buf = BytesMut::new();
        assert_eq!(encode_head(&header, &mut buf), Err(ProtoError::MissingStatusLine));
        assert!(buf.is_empty());
    }

    #[test]
    fn chunk_format() {
        let mut buf = BytesMut::new();
        encode_chunk(b"abc", &mut buf);
        encode_chunk(b"defgh", &mut buf);
        buf.extend_from_slice(LAST_CHUNK);
        assert_eq!(&buf[..], b"3\r\nabc\r\n5\r\ndefgh\r\n0\r\n\r\n");
    }

    #[test]
    fn chunk_sizes_are_hex() {
        let mut buf = BytesMut::new();
        encode_chunk(&[0u8; 26], &mut buf);
        assert!(buf.starts_with(b"1A\r\n"));
    }
}
