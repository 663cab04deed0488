//! Minimal HTTP/1.1 engine: incremental request parser, multipart body
//! scanner, range header parsing and response serialization.

mod multipart;
pub use multipart::{MultipartScanner, PartSink};

mod parser;
pub use parser::{HttpSink, ParseError, Progress, RequestInfo, RequestParser};

mod range;
pub use range::{parse_range, ByteRange};

mod response;
pub use response::{json_response, status_response, ResponseBuilder};
