//! Single-threaded epoll reactor.
//!
//! Owns the listening socket, the wakeup pipe's read end and every client
//! socket. All socket syscalls happen here; parsing and disk work is pushed
//! to the worker pool. Client sockets are registered edge-triggered, so
//! every read and write loop runs until `EAGAIN`.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use anyhow::{format_err, Error};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::socket::{
    accept4, bind, getpeername, getsockname, listen, setsockopt, socket, sockopt, AddressFamily,
    SockFlag, SockType, SockaddrIn,
};

use cbs_tools::fd::Fd;

use super::session::{ServerShared, Session, SessionTask};
use super::wakeup::{SessionId, WakeupCmd, WakeupDecoder, WakeupOp, GENERATION_MODULO};

/// Initialization failures, kept apart so the binary can exit with the
/// matching code.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("unable to create wakeup pipe - {0}")]
    Pipe(nix::Error),
    #[error("unable to create listen socket - {0}")]
    SocketCreate(nix::Error),
    #[error("unable to bind port {1} - {0}")]
    SocketBind(nix::Error, u16),
    #[error("unable to listen - {0}")]
    SocketListen(nix::Error),
    #[error("unable to create epoll instance - {0}")]
    EpollCreate(nix::Error),
    #[error("unable to start worker pool - {0}")]
    Spawn(anyhow::Error),
}

pub struct Reactor {
    epoll: Fd,
    listener: Fd,
    pipe_r: Fd,
    shared: Arc<ServerShared>,
    sessions: HashMap<RawFd, Arc<Session>>,
    generations: HashMap<RawFd, u32>,
    decoder: WakeupDecoder,
}

impl Reactor {
    /// Create the epoll instance, bind the listening socket and register
    /// both it and the wakeup pipe. `pipe_r` is the read end matching the
    /// notifier stored in `shared`.
    pub fn bind(shared: Arc<ServerShared>, pipe_r: Fd) -> Result<Self, SetupError> {
        let port = shared.config.server_port;

        let listener = Fd(socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(SetupError::SocketCreate)?);

        setsockopt(listener.as_raw_fd(), sockopt::ReuseAddr, &true)
            .map_err(SetupError::SocketCreate)?;
        let addr = SockaddrIn::new(0, 0, 0, 0, port);
        bind(listener.as_raw_fd(), &addr).map_err(|err| SetupError::SocketBind(err, port))?;
        listen(listener.as_raw_fd(), shared.config.listen_queue_size)
            .map_err(SetupError::SocketListen)?;

        let epoll = Fd(epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(SetupError::EpollCreate)?);

        let mut reactor = Self {
            epoll,
            listener,
            pipe_r,
            shared,
            sessions: HashMap::new(),
            generations: HashMap::new(),
            decoder: WakeupDecoder::new(),
        };

        reactor
            .register(reactor.listener.as_raw_fd(), EpollFlags::EPOLLIN | EpollFlags::EPOLLET)
            .map_err(SetupError::EpollCreate)?;
        reactor
            .register(reactor.pipe_r.as_raw_fd(), EpollFlags::EPOLLIN | EpollFlags::EPOLLET)
            .map_err(SetupError::EpollCreate)?;

        Ok(reactor)
    }

    /// Local port of the listening socket (useful with port 0).
    pub fn local_port(&self) -> Result<u16, Error> {
        let addr: SockaddrIn = getsockname(self.listener.as_raw_fd())
            .map_err(|err| format_err!("getsockname failed - {}", err))?;
        Ok(addr.port())
    }

    fn register(&self, fd: RawFd, flags: EpollFlags) -> Result<(), nix::Error> {
        let mut event = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.epoll.as_raw_fd(), EpollOp::EpollCtlAdd, fd, &mut event)
    }

    fn rearm(&self, fd: RawFd, flags: EpollFlags) {
        let mut event = EpollEvent::new(flags, fd as u64);
        if let Err(err) = epoll_ctl(self.epoll.as_raw_fd(), EpollOp::EpollCtlMod, fd, &mut event) {
            log::error!("epoll_ctl(MOD) failed for fd {} - {}", fd, err);
        }
    }

    /// Run the event loop. Only fatal epoll errors return.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut events =
            vec![EpollEvent::empty(); self.shared.config.epoll_events_size.max(1)];
        let mut scratch = vec![0u8; self.shared.config.tcp_buffer_read_size.max(1)];

        loop {
            let count = match epoll_wait(self.epoll.as_raw_fd(), &mut events, -1) {
                Ok(count) => count,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(format_err!("epoll_wait failed - {}", err)),
            };

            for idx in 0..count {
                let event = events[idx];
                let fd = event.data() as RawFd;

                if fd == self.listener.as_raw_fd() {
                    self.accept_clients();
                } else if fd == self.pipe_r.as_raw_fd() {
                    self.drain_wakeup_pipe(&mut scratch);
                } else {
                    let flags = event.events();
                    if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                        self.close_session(fd);
                        continue;
                    }
                    if flags.contains(EpollFlags::EPOLLIN) {
                        self.read_pass(fd, &mut scratch);
                    }
                    if flags.contains(EpollFlags::EPOLLOUT) && self.sessions.contains_key(&fd) {
                        self.write_pass(fd);
                    }
                }
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let fd = match accept4(
                self.listener.as_raw_fd(),
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(fd) => fd,
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("accept failed - {}", err);
                    return;
                }
            };

            let generation = self
                .generations
                .entry(fd)
                .and_modify(|generation| *generation = (*generation + 1) % GENERATION_MODULO)
                .or_insert(1);
            let id = SessionId {
                fd,
                generation: *generation,
            };

            let peer = match getpeername::<SockaddrIn>(fd) {
                Ok(addr) => addr.to_string(),
                Err(_) => "unknown".to_string(),
            };

            if let Err(err) = self.register(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLET) {
                log::error!("unable to register client fd {} - {}", fd, err);
                let _ = nix::unistd::close(fd);
                continue;
            }

            log::info!("client {}: connected as {}", peer, id);
            let session = Session::new(id, peer, Arc::clone(&self.shared));
            self.sessions.insert(fd, session);
        }
    }

    fn drain_wakeup_pipe(&mut self, scratch: &mut [u8]) {
        let mut commands: Vec<WakeupCmd> = Vec::new();
        loop {
            match nix::unistd::read(self.pipe_r.as_raw_fd(), scratch) {
                Ok(0) => break,
                Ok(count) => commands.extend(self.decoder.feed(&scratch[..count])),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("wakeup pipe read failed - {}", err);
                    break;
                }
            }
        }

        for cmd in commands {
            // a command for a recycled fd carries a stale generation
            match self.generations.get(&cmd.id.fd) {
                Some(generation) if *generation == cmd.id.generation => (),
                _ => {
                    log::debug!("discarding stale wakeup command for {}", cmd.id);
                    continue;
                }
            }
            if !self.sessions.contains_key(&cmd.id.fd) {
                continue;
            }
            match cmd.op {
                WakeupOp::Read => self.read_pass(cmd.id.fd, scratch),
                WakeupOp::Write => {
                    self.rearm(
                        cmd.id.fd,
                        EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT | EpollFlags::EPOLLET,
                    );
                    self.write_pass(cmd.id.fd);
                }
                WakeupOp::Close => self.close_session(cmd.id.fd),
            }
        }
    }

    fn read_pass(&mut self, fd: RawFd, scratch: &mut [u8]) {
        let session = match self.sessions.get(&fd) {
            Some(session) => Arc::clone(session),
            None => return,
        };

        let mut schedule = false;
        loop {
            match nix::unistd::read(fd, scratch) {
                Ok(0) => {
                    log::info!("client {}: closed by peer", session.peer);
                    self.close_session(fd);
                    return;
                }
                Ok(count) => {
                    if session.push_input(&scratch[..count]) {
                        schedule = true;
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::warn!("client {}: read error - {}", session.peer, err);
                    self.close_session(fd);
                    return;
                }
            }
        }

        if schedule {
            let job = SessionTask::Drive(session).into_job(self.shared.pool.clone());
            self.shared.pool.push(job);
        }
    }

    fn write_pass(&mut self, fd: RawFd) {
        let session = match self.sessions.get(&fd) {
            Some(session) => Arc::clone(session),
            None => return,
        };

        let mut failed = false;
        let remaining = session.drain_output(|buf| {
            while !buf.is_empty() {
                match nix::unistd::write(fd, buf) {
                    Ok(count) => {
                        buf.drain(..count);
                    }
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        log::warn!("client {}: write error - {}", session.peer, err);
                        failed = true;
                        break;
                    }
                }
            }
        });

        if failed {
            self.close_session(fd);
        } else if remaining == 0 {
            // nothing left to send, stop watching for writability
            self.rearm(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLET);
        }
    }

    fn close_session(&mut self, fd: RawFd) {
        // the fd lives exactly as long as its session; a second call for
        // the same fd must not close a recycled descriptor
        let session = match self.sessions.remove(&fd) {
            Some(session) => session,
            None => return,
        };
        session.close();
        log::info!("client {}: connection {} closed", session.peer, session.id);
        if let Err(err) = epoll_ctl(self.epoll.as_raw_fd(), EpollOp::EpollCtlDel, fd, None) {
            if err != Errno::ENOENT && err != Errno::EBADF {
                log::warn!("epoll_ctl(DEL) failed for fd {} - {}", fd, err);
            }
        }
        let _ = nix::unistd::close(fd);
    }
}
