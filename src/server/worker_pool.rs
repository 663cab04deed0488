//! Fixed-size worker pool with a bounded task ring.
//!
//! Producers and consumers are coordinated by two counting semaphores (free
//! slots and ready tasks) so both directions are O(1); one lock guards the
//! producer index, another the consumer index. `push` blocks when the ring
//! is full, `try_push` hands the task back instead so callers can shed work
//! into their own thread.

use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use cbs_tools::sync::Semaphore;

/// A unit of work executed on a pool thread.
pub struct Job(Box<dyn FnOnce() + Send + 'static>);

impl Job {
    pub fn new<F: FnOnce() + Send + 'static>(func: F) -> Self {
        Self(Box::new(func))
    }

    pub fn run(self) {
        (self.0)()
    }
}

struct Ring {
    slots: Vec<Mutex<Option<Job>>>,
    producer_pos: Mutex<usize>,
    consumer_pos: Mutex<usize>,
    free_slots: Semaphore,
    ready_tasks: Semaphore,
}

impl Ring {
    fn store(&self, job: Job) {
        let mut pos = self.producer_pos.lock().unwrap();
        *self.slots[*pos].lock().unwrap() = Some(job);
        *pos = (*pos + 1) % self.slots.len();
    }

    fn take(&self) -> Job {
        let mut pos = self.consumer_pos.lock().unwrap();
        let job = self.slots[*pos].lock().unwrap().take();
        *pos = (*pos + 1) % self.slots.len();
        // the ready_tasks semaphore guarantees the slot is filled
        job.expect("task ring slot unexpectedly empty")
    }
}

/// Cloneable handle to the worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    ring: Arc<Ring>,
}

impl WorkerPool {
    /// Start `threads` workers draining a ring of `capacity` slots.
    pub fn spawn(threads: usize, capacity: usize) -> Result<Self, Error> {
        let capacity = capacity.max(1);
        let ring = Arc::new(Ring {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            producer_pos: Mutex::new(0),
            consumer_pos: Mutex::new(0),
            free_slots: Semaphore::new(capacity),
            ready_tasks: Semaphore::new(0),
        });

        for idx in 0..threads.max(1) {
            let ring = Arc::clone(&ring);
            std::thread::Builder::new()
                .name(format!("worker{}", idx))
                .spawn(move || worker_loop(&ring))
                .map_err(|err| format_err!("unable to start worker thread - {}", err))?;
        }

        Ok(Self { ring })
    }

    /// Enqueue a job, blocking while the ring is full.
    pub fn push(&self, job: Job) {
        self.ring.free_slots.acquire();
        self.ring.store(job);
        self.ring.ready_tasks.release();
    }

    /// Enqueue a job if a slot is free, otherwise hand it back.
    pub fn try_push(&self, job: Job) -> Result<(), Job> {
        if !self.ring.free_slots.try_acquire() {
            return Err(job);
        }
        self.ring.store(job);
        self.ring.ready_tasks.release();
        Ok(())
    }
}

fn worker_loop(ring: &Ring) {
    loop {
        ring.ready_tasks.acquire();
        let job = ring.take();
        ring.free_slots.release();

        // a panicking task must never take the worker down with it
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job.run())).is_err() {
            log::error!("worker task panicked");
        }
    }
}
