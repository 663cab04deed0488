//! Streaming multipart/form-data body scanner.
//!
//! Feeds may split the body at arbitrary byte positions; the scanner keeps
//! just enough trailing bytes buffered that a part delimiter can never
//! straddle two feeds. Framing follows RFC 2046: parts are separated by
//! `CRLF "--" boundary`, the final delimiter carries a trailing `--`, and
//! the first delimiter may appear at the very start of the body without a
//! preceding CRLF.

use anyhow::{bail, Error};

/// Receiver for scanner events.
///
/// The sink owns all effects (reserving names, writing files, bookkeeping);
/// the scanner only does framing. A part whose begin was rejected still gets
/// its data and end events, the sink is expected to ignore them.
pub trait PartSink {
    /// Part headers parsed; `filename` is the (possibly empty) value of the
    /// content-disposition filename attribute.
    fn part_begin(&mut self, filename: &str);
    /// A chunk of part payload.
    fn part_data(&mut self, data: &[u8]);
    /// The part's terminating delimiter was seen.
    fn part_end(&mut self);
    /// The body ended in the middle of this part.
    fn part_abort(&mut self);
}

#[derive(Debug)]
enum State {
    /// Before the first delimiter.
    Preamble,
    /// Collecting part headers up to the blank line.
    PartHeaders,
    /// Streaming part payload.
    PartData,
    /// After the close delimiter; everything else is discarded.
    Epilogue,
}

/// Upper bound on buffered part headers before the body counts as malformed.
const MAX_PART_HEADER_SIZE: usize = 16 * 1024;

pub struct MultipartScanner {
    /// Delimiter without leading CRLF: `--boundary`.
    delimiter: Vec<u8>,
    /// Part payload terminator: `CRLF "--" boundary`.
    terminator: Vec<u8>,
    state: State,
    buf: Vec<u8>,
    parts_seen: usize,
}

impl MultipartScanner {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        let mut terminator = Vec::with_capacity(delimiter.len() + 2);
        terminator.extend_from_slice(b"\r\n");
        terminator.extend_from_slice(&delimiter);
        Self {
            delimiter,
            terminator,
            state: State::Preamble,
            buf: Vec::new(),
            parts_seen: 0,
        }
    }

    /// Number of parts whose headers were seen so far.
    pub fn parts_seen(&self) -> usize {
        self.parts_seen
    }

    /// Feed the next slice of body bytes.
    pub fn feed(&mut self, data: &[u8], sink: &mut dyn PartSink) -> Result<(), Error> {
        self.buf.extend_from_slice(data);

        loop {
            match self.state {
                State::Preamble => {
                    if !self.scan_preamble(sink)? {
                        return Ok(());
                    }
                }
                State::PartHeaders => {
                    if !self.scan_part_headers(sink)? {
                        return Ok(());
                    }
                }
                State::PartData => {
                    if !self.scan_part_data(sink)? {
                        return Ok(());
                    }
                }
                State::Epilogue => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }

    /// The message body ended. Aborts a part that is still open.
    pub fn finish(&mut self, sink: &mut dyn PartSink) -> Result<(), Error> {
        match self.state {
            State::PartHeaders | State::PartData => {
                sink.part_abort();
                bail!("multipart body ended inside a part");
            }
            State::Preamble if self.parts_seen == 0 => {
                bail!("multipart body contained no parts");
            }
            _ => Ok(()),
        }
    }

    /// Look for the first delimiter. Returns false when more input is
    /// needed.
    fn scan_preamble(&mut self, _sink: &mut dyn PartSink) -> Result<bool, Error> {
        match find(&self.buf, &self.delimiter) {
            Some(pos) => {
                // the delimiter must sit at the body start or behind a CRLF
                let at_line_start =
                    pos == 0 || (pos >= 2 && &self.buf[pos - 2..pos] == b"\r\n");
                let after = pos + self.delimiter.len();
                match self.delimiter_suffix(after)? {
                    Some(next_state) if at_line_start => {
                        self.buf.drain(..after);
                        self.enter_after_delimiter(next_state);
                        Ok(true)
                    }
                    Some(_) => {
                        // false match inside the preamble, skip past it
                        self.buf.drain(..after);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            None => {
                // keep a suffix that could still grow into a delimiter
                let keep = self.delimiter.len() + 1;
                if self.buf.len() > keep {
                    let cut = self.buf.len() - keep;
                    self.buf.drain(..cut);
                }
                Ok(false)
            }
        }
    }

    /// Parse the header block of the current part. Returns false when more
    /// input is needed.
    fn scan_part_headers(&mut self, sink: &mut dyn PartSink) -> Result<bool, Error> {
        match find(&self.buf, b"\r\n\r\n") {
            Some(pos) => {
                let filename = extract_filename(&self.buf[..pos]).unwrap_or_default();
                self.parts_seen += 1;
                sink.part_begin(&filename);
                self.buf.drain(..pos + 4);
                self.state = State::PartData;
                Ok(true)
            }
            None if self.buf.len() > MAX_PART_HEADER_SIZE => {
                bail!("oversized multipart part header");
            }
            None => Ok(false),
        }
    }

    /// Stream payload up to the next delimiter. Returns false when more
    /// input is needed.
    fn scan_part_data(&mut self, sink: &mut dyn PartSink) -> Result<bool, Error> {
        match find(&self.buf, &self.terminator) {
            Some(pos) => {
                let after = pos + self.terminator.len();
                match self.delimiter_suffix(after)? {
                    Some(next_state) => {
                        if pos > 0 {
                            sink.part_data(&self.buf[..pos]);
                        }
                        sink.part_end();
                        self.buf.drain(..after);
                        self.enter_after_delimiter(next_state);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            None => {
                // flush everything that can no longer be part of a
                // terminator; keep terminator.len() + 1 residual bytes
                let keep = self.terminator.len() + 1;
                if self.buf.len() > keep {
                    let cut = self.buf.len() - keep;
                    sink.part_data(&self.buf[..cut]);
                    self.buf.drain(..cut);
                }
                Ok(false)
            }
        }
    }

    /// Inspect the two bytes following a delimiter at offset `after`:
    /// `--` closes the body, CRLF starts the next part headers. Returns
    /// None when those bytes are not buffered yet.
    fn delimiter_suffix(&self, after: usize) -> Result<Option<State>, Error> {
        if self.buf.len() < after + 2 {
            return Ok(None);
        }
        match &self.buf[after..after + 2] {
            b"--" => Ok(Some(State::Epilogue)),
            b"\r\n" => Ok(Some(State::PartHeaders)),
            other => bail!("malformed multipart delimiter suffix {:?}", other),
        }
    }

    fn enter_after_delimiter(&mut self, next_state: State) {
        match next_state {
            State::PartHeaders => {
                // drop the CRLF that terminated the delimiter line
                self.buf.drain(..2);
                self.state = State::PartHeaders;
            }
            State::Epilogue => {
                self.buf.clear();
                self.state = State::Epilogue;
            }
            _ => unreachable!(),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Pull the filename attribute out of a part header block,
/// case-insensitive on the attribute key.
fn extract_filename(headers: &[u8]) -> Option<String> {
    let headers = String::from_utf8_lossy(headers);
    for line in headers.split("\r\n") {
        let lower = line.to_ascii_lowercase();
        if let Some(key_pos) = lower.find("filename=") {
            let rest = line[key_pos + "filename=".len()..].strip_prefix('"')?;
            let end = rest.find('"')?;
            return Some(rest[..end].to_string());
        }
    }
    None
}
