//! `Range` request header parsing.

use anyhow::Error;
use nom::bytes::complete::tag;
use nom::combinator::opt;

use cbs_tools::nom::{parse_complete_line, parse_u64, IResult};

/// A single `bytes=START[-END]` range; END is inclusive as on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

fn parse_byte_range(i: &str) -> IResult<&str, ByteRange> {
    let (i, _) = tag("bytes=")(i)?;
    let (i, start) = parse_u64(i)?;
    let (i, _) = tag("-")(i)?;
    let (i, end) = opt(parse_u64)(i)?;
    Ok((i, ByteRange { start, end }))
}

/// Parse a `Range` header value. Multi-range requests and suffix ranges are
/// not supported and yield an error, letting the caller fall back to a full
/// response.
pub fn parse_range(value: &str) -> Result<ByteRange, Error> {
    parse_complete_line("range header", value.trim(), parse_byte_range)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(
            parse_range("bytes=2-4").unwrap(),
            ByteRange { start: 2, end: Some(4) }
        );
        assert_eq!(
            parse_range("bytes=100-").unwrap(),
            ByteRange { start: 100, end: None }
        );
        assert!(parse_range("bytes=-5").is_err());
        assert!(parse_range("bytes=1-2,4-5").is_err());
        assert!(parse_range("lines=1-2").is_err());
    }
}
