//! I/O utilities.

use nix::fcntl::OFlag;

use crate::fd::Fd;

/// Safe wrapper for `nix::unistd::pipe2` defaulting to `O_CLOEXEC | O_NONBLOCK` and guarding the
/// file descriptors.
pub fn pipe() -> Result<(Fd, Fd), nix::Error> {
    let (pin, pout) = nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    Ok((Fd(pin), Fd(pout)))
}

#[cfg(test)]
mod test {
    #[test]
    fn pipe_roundtrip() {
        use std::os::unix::io::AsRawFd;

        let (r, w) = super::pipe().unwrap();
        nix::unistd::write(w.as_raw_fd(), b"ok").unwrap();
        let mut buf = [0u8; 8];
        let n = nix::unistd::read(r.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok");

        // both ends are non-blocking
        assert_eq!(
            nix::unistd::read(r.as_raw_fd(), &mut buf),
            Err(nix::errno::Errno::EAGAIN)
        );
    }
}
