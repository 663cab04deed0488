//! Wakeup pipe between workers and the reactor.
//!
//! Workers cannot touch epoll themselves; they write little ASCII commands
//! into a pipe the reactor polls. Each command is `<op><fd>_<gen>` followed
//! by a comma, where op is `r` (run a read pass), `w` (new bytes to send) or
//! `c` (tear the connection down). The generation suffix lets the reactor
//! discard commands that refer to an fd that was closed and reused in the
//! meantime.

use std::fmt;
use std::os::unix::io::RawFd;

use nom::branch::alt;
use nom::character::complete::char;
use nom::combinator::map;

use cbs_tools::nom::{parse_complete_line, parse_u64, IResult};

pub const MAX_FD: u64 = 10_000_000;
pub const GENERATION_MODULO: u32 = 10_000;

/// Connection identity: file descriptor plus its reuse generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionId {
    pub fd: RawFd,
    pub generation: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.fd, self.generation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeupOp {
    Read,
    Write,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakeupCmd {
    pub op: WakeupOp,
    pub id: SessionId,
}

impl WakeupCmd {
    pub fn encode(&self) -> String {
        let op = match self.op {
            WakeupOp::Read => 'r',
            WakeupOp::Write => 'w',
            WakeupOp::Close => 'c',
        };
        format!("{}{},", op, self.id)
    }
}

fn parse_op(i: &str) -> IResult<&str, WakeupOp> {
    alt((
        map(char('r'), |_| WakeupOp::Read),
        map(char('w'), |_| WakeupOp::Write),
        map(char('c'), |_| WakeupOp::Close),
    ))(i)
}

fn parse_cmd(i: &str) -> IResult<&str, WakeupCmd> {
    let (i, op) = parse_op(i)?;
    let (i, fd) = parse_u64(i)?;
    let (i, _) = char('_')(i)?;
    let (i, generation) = parse_u64(i)?;
    Ok((
        i,
        WakeupCmd {
            op,
            id: SessionId {
                fd: fd as RawFd,
                generation: generation as u32,
            },
        },
    ))
}

/// Splits the pipe byte stream into commands.
///
/// Bytes after the last comma are kept for the next feed, so a command may
/// straddle two pipe reads. Malformed or out-of-range commands are logged
/// and skipped.
#[derive(Default)]
pub struct WakeupDecoder {
    residual: Vec<u8>,
}

impl WakeupDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<WakeupCmd> {
        self.residual.extend_from_slice(data);

        let mut cmds = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.residual[start..].iter().position(|&b| b == b',') {
            let raw = &self.residual[start..start + pos];
            start += pos + 1;

            let raw = match std::str::from_utf8(raw) {
                Ok(raw) => raw,
                Err(_) => {
                    log::error!("ignoring non-ascii wakeup command");
                    continue;
                }
            };
            match parse_complete_line("wakeup command", raw, parse_cmd) {
                Ok(cmd) => {
                    if (cmd.id.fd as u64) < MAX_FD && cmd.id.generation < GENERATION_MODULO {
                        cmds.push(cmd);
                    } else {
                        log::error!("ignoring out-of-range wakeup command {:?}", raw);
                    }
                }
                Err(err) => log::error!("{}", err),
            }
        }
        self.residual.drain(..start);
        cmds
    }
}

/// Write end of the wakeup pipe, shared by all workers.
///
/// Commands are far below `PIPE_BUF`, so concurrent writers never interleave
/// within a command.
#[derive(Clone)]
pub struct Notifier {
    fd: RawFd,
}

impl Notifier {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn notify(&self, op: WakeupOp, id: SessionId) {
        let msg = WakeupCmd { op, id }.encode();
        loop {
            match nix::unistd::write(self.fd, msg.as_bytes()) {
                Ok(_) => return,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("unable to notify reactor about {}: {}", id, err);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cmd(op: WakeupOp, fd: RawFd, generation: u32) -> WakeupCmd {
        WakeupCmd {
            op,
            id: SessionId { fd, generation },
        }
    }

    #[test]
    fn test_encode() {
        assert_eq!(cmd(WakeupOp::Write, 17, 3).encode(), "w17_3,");
        assert_eq!(cmd(WakeupOp::Close, 9999999, 9999).encode(), "c9999999_9999,");
    }

    #[test]
    fn test_decode_stream() {
        let mut decoder = WakeupDecoder::new();
        assert_eq!(
            decoder.feed(b"r5_1,w6_2,"),
            vec![cmd(WakeupOp::Read, 5, 1), cmd(WakeupOp::Write, 6, 2)]
        );
    }

    #[test]
    fn test_partial_command_kept() {
        let mut decoder = WakeupDecoder::new();
        assert_eq!(decoder.feed(b"w12_"), vec![]);
        assert_eq!(decoder.feed(b"34,c1"), vec![cmd(WakeupOp::Write, 12, 34)]);
        assert_eq!(decoder.feed(b"_0,"), vec![cmd(WakeupOp::Close, 1, 0)]);
    }

    #[test]
    fn test_malformed_skipped() {
        let mut decoder = WakeupDecoder::new();
        assert_eq!(
            decoder.feed(b"bogus,w2_2,x9,c3_77777,w4_4,"),
            vec![cmd(WakeupOp::Write, 2, 2), cmd(WakeupOp::Write, 4, 4)]
        );
    }
}
