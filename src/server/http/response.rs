//! HTTP/1.1 response serialization.

use http::StatusCode;

/// Builds the raw bytes of a response.
///
/// `Content-Length` is always emitted, either from the body handed to
/// [finish](Self::finish) or explicitly via
/// [finish_with_length](Self::finish_with_length) when the body bytes are
/// streamed separately (downloads).
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(String, String)>,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Serialize status line and headers, appending `body`.
    pub fn finish(self, body: &[u8]) -> Vec<u8> {
        let mut out = self.serialize_head(body.len() as u64);
        out.extend_from_slice(body);
        out
    }

    /// Serialize status line and headers announcing `length` body bytes the
    /// caller will append later.
    pub fn finish_with_length(self, length: u64) -> Vec<u8> {
        self.serialize_head(length)
    }

    fn serialize_head(self, content_length: u64) -> Vec<u8> {
        let reason = self.status.canonical_reason().unwrap_or("Unknown");
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", content_length).as_bytes());
        out
    }
}

/// Shortcut for a JSON body with the right content type.
pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Vec<u8> {
    let body = value.to_string();
    ResponseBuilder::new(status)
        .header("Content-Type", "application/json")
        .finish(body.as_bytes())
}

/// Shortcut for a plain status response with an empty body.
pub fn status_response(status: StatusCode) -> Vec<u8> {
    ResponseBuilder::new(status).finish(b"")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_serialization() {
        let raw = ResponseBuilder::new(StatusCode::OK)
            .header("Content-Type", "text/html")
            .finish(b"hi");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.ends_with("Content-Length: 2\r\n\r\nhi"));
    }

    #[test]
    fn test_streamed_length() {
        let raw = ResponseBuilder::new(StatusCode::PARTIAL_CONTENT).finish_with_length(3);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.ends_with("Content-Length: 3\r\n\r\n"));
    }
}
