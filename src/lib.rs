//! Cloud backup server library.
//!
//! A single-host HTTP file backup service: an epoll based reactor thread
//! multiplexes all client sockets, a bounded worker pool runs the
//! per-connection HTTP state machines, and a metadata registry with
//! asynchronous JSON snapshots tracks the backed up files.

pub mod datastore;
pub mod server;
pub mod tools;

/// Process exit codes for fatal initialization failures.
pub mod exitcode {
    pub const DAEMONIZE_ERROR: i32 = 1;
    pub const LOGGER_INIT_ERROR: i32 = 2;
    pub const DATASTORE_INIT_ERROR: i32 = 3;
    pub const LOAD_CONFIG_ERROR: i32 = 4;
    pub const PIPE_INIT_ERROR: i32 = 5;
    pub const SOCKET_INIT_ERROR: i32 = 6;
    pub const SOCKET_BIND_ERROR: i32 = 7;
    pub const SOCKET_LISTEN_ERROR: i32 = 8;
    pub const EPOLL_CREATE_ERROR: i32 = 9;
    pub const ALLOCATION_ERROR: i32 = 10;
    pub const SERVER_START_ERROR: i32 = 11;
}
