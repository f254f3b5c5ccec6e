//! The message parser collaborator and the default HTTP/1.1 head reader.
//!
//! Parsing raw bytes into a request head is collaborator territory; the
//! engine only requires the [`MessageParser`] contract. The built-in
//! implementation reads HTTP/1.1 request heads from a buffered reader.
//! Inbound chunked transfer encoding is not handled here; hosts that
//! front the engine are expected to de-chunk.

use std::io::BufRead;

/// Limit on one header line before the parser gives up.
const MAX_LINE_LENGTH: usize = 16 * 1024;
/// Limit on the number of header lines in one request head.
const MAX_HEADER_LINES: usize = 256;

/// The undigested head of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHead {
    /// The method token exactly as sent.
    pub method: String,
    /// The request target (origin or absolute form).
    pub target: String,
    /// The HTTP version token (`HTTP/1.1`).
    pub version: String,
    /// Raw header lines split into name/value pairs.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Error from reading one request head.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Reading from the channel failed.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    /// A header line exceeded the hard limit.
    #[error("header line too long")]
    LineTooLong,
    /// The request line or a header line does not parse.
    #[error("malformed request head: {0}")]
    Malformed(String),
}

/// Parses raw bytes from a client channel into request heads.
pub trait MessageParser: Send + Sync {
    /// Reads one request head.
    ///
    /// Returns `Ok(None)` on a clean end of stream before any byte of a
    /// new request, which ends a keep-alive connection without error.
    fn read_head(&self, reader: &mut dyn BufRead) -> Result<Option<RequestHead>, ParseError>;
}

/// The built-in HTTP/1.1 head reader.
#[derive(Debug, Default)]
pub struct Http11Parser;

impl Http11Parser {
    fn read_line(&self, reader: &mut dyn BufRead) -> Result<Option<String>, ParseError> {
        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(ParseError::LineTooLong);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

impl MessageParser for Http11Parser {
    fn read_head(&self, reader: &mut dyn BufRead) -> Result<Option<RequestHead>, ParseError> {
        // Tolerate empty lines in front of the request line
        let request_line = loop {
            match self.read_line(reader)? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };

        let mut pieces = request_line.split_whitespace();
        let method = pieces
            .next()
            .ok_or_else(|| ParseError::Malformed(request_line.clone()))?
            .to_owned();
        let target = pieces
            .next()
            .ok_or_else(|| ParseError::Malformed(request_line.clone()))?
            .to_owned();
        let version = pieces.next().unwrap_or("HTTP/1.1").to_owned();
        if !version.starts_with("HTTP/") {
            return Err(ParseError::Malformed(request_line));
        }

        let mut headers = Vec::new();
        loop {
            let line = self
                .read_line(reader)?
                .ok_or_else(|| ParseError::Malformed("truncated header block".to_owned()))?;
            if line.is_empty() {
                break;
            }
            if headers.len() >= MAX_HEADER_LINES {
                return Err(ParseError::Malformed("too many header lines".to_owned()));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::Malformed(line.clone()))?;
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }

        Ok(Some(RequestHead {
            method,
            target,
            version,
            headers,
        }))
    }
}

/// Reads a request body of `length` bytes, capped by `limit`.
pub fn read_sized_body(
    reader: &mut dyn BufRead,
    length: u64,
    limit: u64,
) -> Result<Vec<u8>, ParseError> {
    if length > limit {
        return Err(ParseError::Malformed(format!(
            "declared body of {length} bytes exceeds the streaming limit"
        )));
    }
    let mut body = vec![0u8; length as usize];
    let mut filled = 0usize;
    while filled < body.len() {
        match std::io::Read::read(reader, &mut body[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    if (filled as u64) < length {
        tracing::warn!("short body read: got {filled} of {length} declared bytes");
        body.truncate(filled);
    }
    Ok(body)
}

/// Best-effort UTF-16 detection and in-place transcoding to UTF-8.
///
/// Returns true when the body was transcoded (the response should carry a
/// BOM). Bodies shorter than four bytes are never touched; failures keep
/// the original bytes and log a warning.
pub fn transcode_utf16(body: &mut Vec<u8>) -> bool {
    if body.len() < 4 {
        return false;
    }
    let (little_endian, offset) = match (body[0], body[1]) {
        (0xFF, 0xFE) => (true, 2),
        (0xFE, 0xFF) => (false, 2),
        // No BOM: look for the alternating-NUL shape of UTF-16 ASCII
        _ => {
            let probe = &body[..body.len().min(16)];
            let odd_nulls = probe.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
            if odd_nulls * 2 >= probe.len() - 1 {
                (true, 0)
            } else {
                return false;
            }
        }
    };

    let payload = &body[offset..];
    if payload.len() % 2 != 0 {
        tracing::warn!("body looks like UTF-16 but has odd length; left as-is");
        return false;
    }
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    match String::from_utf16(&units) {
        Ok(text) => {
            *body = text.into_bytes();
            true
        }
        Err(_) => {
            tracing::warn!("UTF-16 transcoding failed; body left as-is");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn read(head: &str) -> Result<Option<RequestHead>, ParseError> {
        let mut reader = BufReader::new(head.as_bytes());
        Http11Parser.read_head(&mut reader)
    }

    #[test]
    fn a_plain_get_parses() {
        let head = read("GET /hello/world HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/hello/world");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("localhost"));
    }

    #[test]
    fn eof_before_a_request_is_a_clean_end() {
        assert!(read("").unwrap().is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(read("NONSENSE\r\n\r\n"), Err(ParseError::Malformed(_))));
        assert!(matches!(
            read("GET /x SMTP/1.0\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_header_block_is_an_error() {
        assert!(matches!(
            read("GET / HTTP/1.1\r\nHost: x\r\n"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn sized_body_reads_exactly() {
        let mut reader = BufReader::new(&b"hello world"[..]);
        let body = read_sized_body(&mut reader, 5, 1024).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn oversized_declarations_are_refused() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_sized_body(&mut reader, 2048, 1024).is_err());
    }

    #[test]
    fn utf16_le_with_bom_is_transcoded() {
        let mut body: Vec<u8> = vec![0xFF, 0xFE];
        for unit in "soap".encode_utf16() {
            body.extend_from_slice(&unit.to_le_bytes());
        }
        assert!(transcode_utf16(&mut body));
        assert_eq!(body, b"soap");
    }

    #[test]
    fn short_bodies_are_never_transcoded() {
        let mut body = vec![0xFF, 0xFE];
        assert!(!transcode_utf16(&mut body));
        assert_eq!(body, vec![0xFF, 0xFE]);
    }

    #[test]
    fn plain_utf8_is_untouched() {
        let mut body = b"plain text body".to_vec();
        assert!(!transcode_utf16(&mut body));
        assert_eq!(body, b"plain text body");
    }
}
