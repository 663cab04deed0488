//! The request engine: reactor, sessions, worker pool and HTTP machinery.

pub mod handlers;
pub mod http;
pub mod reactor;
pub mod session;
pub mod wakeup;
pub mod worker_pool;

use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use anyhow::Error;

use cbs_config::Config;

use crate::datastore::DataStore;

use reactor::{Reactor, SetupError};
use session::ServerShared;
use wakeup::Notifier;
use worker_pool::WorkerPool;

/// The assembled server. All components are constructed here and handed
/// around by shared reference; nothing is process-global.
pub struct Server {
    reactor: Reactor,
}

impl Server {
    /// Construct the worker pool and wakeup pipe and bind the reactor.
    ///
    /// The [SetupError] cases map onto the binary's distinct exit codes.
    pub fn bind(config: Arc<Config>, store: Arc<DataStore>) -> Result<Self, SetupError> {
        let pool = WorkerPool::spawn(
            config.thread_pool_threads_size,
            config.thread_pool_queue_capacity,
        )
        .map_err(SetupError::Spawn)?;

        let (pipe_r, pipe_w) = cbs_tools::io::pipe().map_err(SetupError::Pipe)?;
        let notifier = Notifier::new(pipe_w.as_raw_fd());

        let shared = Arc::new(ServerShared {
            config,
            store,
            pool,
            notifier,
            pipe_w,
        });

        let reactor = Reactor::bind(shared, pipe_r)?;
        Ok(Self { reactor })
    }

    /// Port the listener actually bound (relevant when configured as 0).
    pub fn local_port(&self) -> Result<u16, Error> {
        self.reactor.local_port()
    }

    /// Run the reactor loop; does not return while the server is healthy.
    pub fn run(mut self) -> Result<(), Error> {
        log::info!("server running");
        self.reactor.run()
    }
}
