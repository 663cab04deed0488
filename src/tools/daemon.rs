//! Classic double-fork daemonization.

use std::path::Path;

use anyhow::{bail, Error};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};

/// Detach from the controlling terminal and run from `workdir`.
///
/// Standard double fork: the first child calls ``setsid(2)``, the second
/// survives and has stdio redirected to `/dev/null`. The parent branches
/// exit immediately with ``_exit(2)`` so no atexit handlers run twice.
pub fn daemonize(workdir: &Path) -> Result<(), Error> {
    chdir(workdir)?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
        Ok(ForkResult::Child) => (),
        Err(err) => bail!("first fork failed - {}", err),
    }

    setsid()?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
        Ok(ForkResult::Child) => (),
        Err(err) => bail!("second fork failed - {}", err),
    }

    let devnull = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
    dup2(devnull, 0)?;
    dup2(devnull, 1)?;
    dup2(devnull, 2)?;
    if devnull > 2 {
        let _ = nix::unistd::close(devnull);
    }

    Ok(())
}
