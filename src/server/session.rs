//! Per-connection state and the worker-side task chain.
//!
//! The reactor owns the socket; workers only ever touch the session's
//! buffers and talk back through the wakeup pipe. At most one worker task is
//! scheduled or running per session (the `processing` flag), which also
//! makes the parser state single-threaded without further locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cbs_config::Config;

use crate::datastore::DataStore;

use super::handlers::{Download, RequestHandler};
use super::http::RequestParser;
use super::wakeup::{Notifier, SessionId, WakeupOp};
use super::worker_pool::{Job, WorkerPool};

/// State shared by the reactor and all sessions.
pub struct ServerShared {
    pub config: Arc<Config>,
    pub store: Arc<DataStore>,
    pub pool: WorkerPool,
    pub notifier: Notifier,
    /// Keeps the pipe write end open as long as any session can notify.
    pub pipe_w: cbs_tools::fd::Fd,
}

struct InputBuffer {
    buf: Vec<u8>,
    /// A worker task is scheduled or running for this session.
    processing: bool,
}

struct Proto {
    parser: RequestParser,
    handler: RequestHandler,
}

pub struct Session {
    pub id: SessionId,
    pub peer: String,
    closed: AtomicBool,
    input: Mutex<InputBuffer>,
    output: Mutex<Vec<u8>>,
    proto: Mutex<Proto>,
    shared: Arc<ServerShared>,
}

impl Session {
    pub fn new(id: SessionId, peer: String, shared: Arc<ServerShared>) -> Arc<Self> {
        let handler = RequestHandler::new(Arc::clone(&shared.store), peer.clone());
        Arc::new(Self {
            id,
            peer,
            closed: AtomicBool::new(false),
            input: Mutex::new(InputBuffer {
                buf: Vec::new(),
                processing: false,
            }),
            output: Mutex::new(Vec::new()),
            proto: Mutex::new(Proto {
                parser: RequestParser::new(),
                handler,
            }),
            shared,
        })
    }

    /// Stop all worker activity for this session. Called by the reactor on
    /// the close path; in-flight tasks notice at their next checkpoint.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Append received bytes. Returns true if the caller should schedule a
    /// drive task (none is in flight yet).
    pub fn push_input(&self, data: &[u8]) -> bool {
        let mut input = self.input.lock().unwrap();
        input.buf.extend_from_slice(data);
        if input.processing {
            false
        } else {
            input.processing = true;
            true
        }
    }

    /// Run `f` on the pending output bytes; used by the reactor's write
    /// pass. Returns the remaining length.
    pub fn drain_output<F: FnOnce(&mut Vec<u8>)>(&self, f: F) -> usize {
        let mut output = self.output.lock().unwrap();
        f(&mut output);
        output.len()
    }

    fn notify(&self, op: WakeupOp) {
        self.shared.notifier.notify(op, self.id);
    }

    fn append_output(&self, data: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(data);
        self.notify(WakeupOp::Write);
    }

    /// One parser pass over at most `per_handle_request_size` buffered
    /// bytes. Returns the follow-up task, if any.
    fn drive(self: &Arc<Self>) -> Option<SessionTask> {
        if self.is_closed() {
            return None;
        }

        let (window, buffered) = {
            let input = self.input.lock().unwrap();
            let take = input
                .buf
                .len()
                .min(self.shared.config.per_handle_request_size);
            (input.buf[..take].to_vec(), input.buf.len())
        };

        let (consumed, completed) = {
            let mut proto = self.proto.lock().unwrap();
            let Proto { parser, handler } = &mut *proto;
            match parser.execute(&window, handler) {
                Ok(progress) => (progress.consumed, progress.completed),
                Err(err) => {
                    log::error!(
                        "client {}: closing connection, request error - {}",
                        self.peer,
                        err
                    );
                    self.notify(WakeupOp::Close);
                    return None;
                }
            }
        };

        let mut follow = None;
        if completed {
            let (reply, download) = self.proto.lock().unwrap().handler.take_result();
            if !reply.is_empty() {
                self.append_output(&reply);
            }
            if let Some(download) = download {
                follow = Some(SessionTask::Stream(Arc::clone(self), download));
            }
        }

        let mut input = self.input.lock().unwrap();
        input.buf.drain(..consumed);
        if follow.is_none() {
            // respin only on progress: either bytes were consumed or more
            // arrived while we were parsing; otherwise wait for the reactor
            if !input.buf.is_empty() && (consumed > 0 || input.buf.len() > buffered) {
                follow = Some(SessionTask::Drive(Arc::clone(self)));
            } else {
                input.processing = false;
            }
        }
        follow
    }

    /// Stream one download chunk into the output buffer, then reschedule
    /// until the range is drained. Disk errors tear the connection down
    /// since the response head is already on the wire.
    fn stream_chunk(self: &Arc<Self>, download: Download) -> Option<SessionTask> {
        if self.is_closed() {
            return None;
        }

        let Download { name, start, end } = download;
        if start < end {
            let entry = match self.shared.store.lookup(&name) {
                Some(entry) => entry,
                None => {
                    // deleted mid-download
                    self.notify(WakeupOp::Close);
                    return None;
                }
            };

            let cached = if start == 0 {
                self.shared.store.prefix_get(&name)
            } else {
                None
            };

            let chunk: Vec<u8> = match cached {
                Some(prefix) if !prefix.is_empty() => {
                    let take = (prefix.len() as u64).min(end - start) as usize;
                    prefix.slice(..take).to_vec()
                }
                _ => {
                    let want = (end - start).min(self.shared.config.max_file_read_size as u64);
                    let read = {
                        let _guard = entry.lock.read().unwrap();
                        cbs_tools::fs::read_chunk_at(
                            self.shared.store.file_path(&name),
                            start,
                            want as usize,
                        )
                    };
                    match read {
                        Ok(data) if !data.is_empty() => {
                            if start == 0 {
                                self.shared.store.prefix_put(&name, &data);
                            }
                            data
                        }
                        Ok(_) => {
                            log::error!(
                                "client {}: file {} ended early at {}",
                                self.peer,
                                name,
                                start
                            );
                            self.notify(WakeupOp::Close);
                            return None;
                        }
                        Err(err) => {
                            log::error!(
                                "client {}: read error on {} - {}",
                                self.peer,
                                name,
                                err
                            );
                            self.notify(WakeupOp::Close);
                            return None;
                        }
                    }
                }
            };

            self.append_output(&chunk);
            let start = start + chunk.len() as u64;
            if start < end {
                return Some(SessionTask::Stream(
                    Arc::clone(self),
                    Download { name, start, end },
                ));
            }
        }

        // range drained, pick up the next pipelined request if buffered
        let mut input = self.input.lock().unwrap();
        if !input.buf.is_empty() {
            Some(SessionTask::Drive(Arc::clone(self)))
        } else {
            input.processing = false;
            None
        }
    }
}

/// A schedulable unit of session work.
#[derive(Clone)]
pub enum SessionTask {
    Drive(Arc<Session>),
    Stream(Arc<Session>, Download),
}

impl SessionTask {
    fn run(self) -> Option<SessionTask> {
        match self {
            SessionTask::Drive(session) => session.drive(),
            SessionTask::Stream(session, download) => session.stream_chunk(download),
        }
    }

    /// Package the task for the worker pool.
    pub fn into_job(self, pool: WorkerPool) -> Job {
        Job::new(move || run_chain(self, &pool))
    }
}

/// Execute a task and submit its follow-up through the pool; when the ring
/// is full the follow-up runs right here, keeping the system progressing
/// under pressure.
fn run_chain(task: SessionTask, pool: &WorkerPool) {
    let mut current = Some(task);
    while let Some(task) = current.take() {
        if let Some(next) = task.run() {
            match pool.try_push(next.clone().into_job(pool.clone())) {
                Ok(()) => (),
                Err(_rejected) => current = Some(next),
            }
        }
    }
}
