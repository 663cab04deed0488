//! Incremental HTTP/1.1 request parser.
//!
//! The parser is request oriented and pausable: it consumes bytes from the
//! caller's buffer, reports how many it used, and stops right after each
//! complete message so exactly one request is handled per scheduling pass.
//! Incomplete lines are simply left unconsumed - the caller keeps them
//! buffered and feeds them again once more bytes arrived, so the parser
//! itself never buffers partial tokens.
//!
//! Events are delivered to an [HttpSink], mirroring the classic callback
//! parser interface: headers complete, body data, message complete.

use anyhow::Error;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;

/// Fatal protocol errors. Any of these tears the connection down.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported protocol version")]
    BadVersion,
    #[error("malformed header line")]
    BadHeader,
    #[error("invalid content-length header")]
    BadContentLength,
}

/// Accumulated state of the request currently being parsed.
#[derive(Debug, Default)]
pub struct RequestInfo {
    /// Upper-cased request method.
    pub method: String,
    /// Full request target as sent by the client.
    pub url: String,
    /// Leading URL segment (`/download`, `/api`, ... or `/`).
    pub prefix: String,
    /// Remainder of the URL after the prefix, including its leading slash.
    pub path: String,
    /// Version suffix, e.g. `1.1`.
    pub version: String,
    /// Header fields; names are lower-cased on ingress, values keep their
    /// case, the last occurrence of a repeated field wins.
    pub headers: HeaderMap,
    /// Parsed `content-length` (0 when absent).
    pub content_length: u64,
}

impl RequestInfo {
    fn clear(&mut self) {
        self.method.clear();
        self.url.clear();
        self.prefix.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.content_length = 0;
    }

    /// A header value as string, if present and representable.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Receiver for parser events.
pub trait HttpSink {
    /// A new message starts; reset per-request state.
    fn on_message_begin(&mut self);
    /// The header section is complete.
    fn on_headers_complete(&mut self, request: &RequestInfo) -> Result<(), Error>;
    /// A chunk of body data arrived.
    fn on_body(&mut self, request: &RequestInfo, data: &[u8]) -> Result<(), Error>;
    /// The message is complete; build the response.
    fn on_message_complete(&mut self, request: &RequestInfo) -> Result<(), Error>;
}

#[derive(Debug)]
enum State {
    RequestLine,
    Headers,
    Body { remaining: u64 },
}

/// Result of one [RequestParser::execute] pass.
pub struct Progress {
    /// Bytes consumed from the input.
    pub consumed: usize,
    /// A full message was processed; remaining input belongs to the next
    /// request.
    pub completed: bool,
}

pub struct RequestParser {
    state: State,
    request: RequestInfo,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: State::RequestLine,
            request: RequestInfo::default(),
        }
    }

    /// Consume bytes from `input`, reporting events to `sink`.
    ///
    /// Returns after one complete message (`completed` set), or once the
    /// input has no further complete token (`completed` unset). The caller
    /// drops the consumed bytes and re-presents the rest later.
    pub fn execute(&mut self, input: &[u8], sink: &mut dyn HttpSink) -> Result<Progress, Error> {
        let mut consumed = 0;

        loop {
            match self.state {
                State::RequestLine => {
                    let line = match take_line(&input[consumed..]) {
                        Some((line, used)) => {
                            consumed += used;
                            line
                        }
                        None => return Ok(Progress { consumed, completed: false }),
                    };
                    if line.is_empty() {
                        // tolerate stray empty lines between pipelined requests
                        continue;
                    }
                    sink.on_message_begin();
                    self.request.clear();
                    self.parse_request_line(line)?;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let line = match take_line(&input[consumed..]) {
                        Some((line, used)) => {
                            consumed += used;
                            line
                        }
                        None => return Ok(Progress { consumed, completed: false }),
                    };
                    if line.is_empty() {
                        self.request.content_length = self.content_length()?;
                        sink.on_headers_complete(&self.request)?;
                        if self.request.content_length == 0 {
                            sink.on_message_complete(&self.request)?;
                            self.state = State::RequestLine;
                            return Ok(Progress { consumed, completed: true });
                        }
                        self.state = State::Body {
                            remaining: self.request.content_length,
                        };
                    } else {
                        self.parse_header_line(line)?;
                    }
                }
                State::Body { remaining } => {
                    let available = input.len() - consumed;
                    if available == 0 {
                        return Ok(Progress { consumed, completed: false });
                    }
                    let take = (available as u64).min(remaining) as usize;
                    sink.on_body(&self.request, &input[consumed..consumed + take])?;
                    consumed += take;
                    if remaining > take as u64 {
                        self.state = State::Body {
                            remaining: remaining - take as u64,
                        };
                    } else {
                        sink.on_message_complete(&self.request)?;
                        self.state = State::RequestLine;
                        return Ok(Progress { consumed, completed: true });
                    }
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
        let mut parts = line.split(' ').filter(|part| !part.is_empty());

        let method = parts.next().ok_or(ParseError::BadRequestLine)?;
        let url = parts.next().ok_or(ParseError::BadRequestLine)?;
        let version = parts.next().ok_or(ParseError::BadRequestLine)?;
        if parts.next().is_some() {
            return Err(ParseError::BadRequestLine);
        }

        let method = method.to_ascii_uppercase();
        // sanity check the token, the route match works on the string
        Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::BadRequestLine)?;

        if !url.starts_with('/') {
            return Err(ParseError::BadRequestLine);
        }
        let version = version
            .strip_prefix("HTTP/")
            .ok_or(ParseError::BadVersion)?;

        // split "/segment/rest" into "/segment" + "/rest"
        let split = url[1..].find('/').map(|pos| pos + 1).unwrap_or(url.len());
        self.request.method = method;
        self.request.prefix = url[..split].to_string();
        self.request.path = url[split..].to_string();
        self.request.url = url.to_string();
        self.request.version = version.to_string();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::BadHeader)?;
        let name =
            HeaderName::from_bytes(&line[..colon]).map_err(|_| ParseError::BadHeader)?;

        let mut value = &line[colon + 1..];
        while let [b' ' | b'\t', rest @ ..] = value {
            value = rest;
        }
        while let [rest @ .., b' ' | b'\t'] = value {
            value = rest;
        }
        let value = HeaderValue::from_bytes(value).map_err(|_| ParseError::BadHeader)?;

        // last occurrence of a repeated header wins
        self.request.headers.insert(name, value);
        Ok(())
    }

    fn content_length(&self) -> Result<u64, ParseError> {
        match self.request.headers.get(http::header::CONTENT_LENGTH) {
            None => Ok(0),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(ParseError::BadContentLength),
        }
    }
}

/// Pop one CRLF terminated line. Returns the line without its terminator and
/// the number of bytes consumed, or None if no full line is buffered yet.
fn take_line(input: &[u8]) -> Option<(&[u8], usize)> {
    let pos = input.windows(2).position(|pair| pair == b"\r\n")?;
    Some((&input[..pos], pos + 2))
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        begins: usize,
        headers_done: usize,
        body: Vec<u8>,
        completes: usize,
    }

    impl HttpSink for RecordingSink {
        fn on_message_begin(&mut self) {
            self.begins += 1;
        }
        fn on_headers_complete(&mut self, _request: &RequestInfo) -> Result<(), Error> {
            self.headers_done += 1;
            Ok(())
        }
        fn on_body(&mut self, _request: &RequestInfo, data: &[u8]) -> Result<(), Error> {
            self.body.extend_from_slice(data);
            Ok(())
        }
        fn on_message_complete(&mut self, _request: &RequestInfo) -> Result<(), Error> {
            self.completes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_simple_get() {
        let mut parser = RequestParser::new();
        let mut sink = RecordingSink::default();

        let raw = b"GET /download/hello.txt HTTP/1.1\r\nHost: x\r\n\r\n";
        let progress = parser.execute(raw, &mut sink).unwrap();
        assert_eq!(progress.consumed, raw.len());
        assert!(progress.completed);
        assert_eq!(sink.begins, 1);
        assert_eq!(sink.headers_done, 1);
        assert_eq!(sink.completes, 1);
        assert_eq!(parser.request.method, "GET");
        assert_eq!(parser.request.prefix, "/download");
        assert_eq!(parser.request.path, "/hello.txt");
        assert_eq!(parser.request.version, "1.1");
    }

    #[test]
    fn test_incremental_feeding() {
        let mut parser = RequestParser::new();
        let mut sink = RecordingSink::default();

        let raw = b"POST /upload HTTP/1.1\r\ncontent-length: 4\r\n\r\nbody".to_vec();
        let mut buffer: Vec<u8> = Vec::new();
        let mut completed = false;
        for &byte in &raw {
            buffer.push(byte);
            let progress = parser.execute(&buffer, &mut sink).unwrap();
            buffer.drain(..progress.consumed);
            if progress.completed {
                completed = true;
            }
        }
        assert!(completed);
        assert!(buffer.is_empty());
        assert_eq!(sink.body, b"body");
        assert_eq!(sink.completes, 1);
    }

    #[test]
    fn test_pause_between_pipelined_requests() {
        let mut parser = RequestParser::new();
        let mut sink = RecordingSink::default();

        let raw = b"GET / HTTP/1.1\r\n\r\nGET /showlist HTTP/1.1\r\n\r\n";
        let progress = parser.execute(raw, &mut sink).unwrap();
        assert!(progress.completed);
        assert_eq!(sink.completes, 1);
        // second request untouched
        assert_eq!(&raw[progress.consumed..], b"GET /showlist HTTP/1.1\r\n\r\n");

        let progress = parser.execute(&raw[progress.consumed..], &mut sink).unwrap();
        assert!(progress.completed);
        assert_eq!(sink.completes, 2);
        assert_eq!(parser.request.prefix, "/showlist");
    }

    #[test]
    fn test_header_normalization() {
        let mut parser = RequestParser::new();
        let mut sink = RecordingSink::default();

        let raw = b"GET / HTTP/1.1\r\nX-Mixed-Case: KeepMyCase\r\nDup: a\r\ndup: b\r\n\r\n";
        parser.execute(raw, &mut sink).unwrap();
        assert_eq!(parser.request.header("x-mixed-case"), Some("KeepMyCase"));
        assert_eq!(parser.request.header("dup"), Some("b"));
    }

    #[test]
    fn test_method_is_uppercased() {
        let mut parser = RequestParser::new();
        let mut sink = RecordingSink::default();
        parser
            .execute(b"get / HTTP/1.1\r\n\r\n", &mut sink)
            .unwrap();
        assert_eq!(parser.request.method, "GET");
    }

    #[test]
    fn test_fatal_errors() {
        let mut parser = RequestParser::new();
        let mut sink = RecordingSink::default();
        assert!(parser.execute(b"NOT A REQUEST LINE\r\n", &mut sink).is_err());

        let mut parser = RequestParser::new();
        assert!(parser
            .execute(b"GET / HTTP/1.1\r\ncontent-length: ten\r\n\r\n", &mut sink)
            .is_err());
    }
}
