//! Worker pools backing the SSDP servers and the GENA layer.
//!
//! Three disciplines: an unbounded *server* pool spawning one named thread
//! per long-lived receive loop, a bounded *io* pool for short sends and
//! fetches that rejects when saturated, and a single-worker *callback*
//! executor that preserves FIFO delivery of notifications to user code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

const MAX_IO_WORKERS: usize = 8;

pub struct TaskExecutors {
    server: ServerExecutor,
    io: QueueExecutor,
    callback: QueueExecutor,
}

impl TaskExecutors {
    pub fn new() -> Self {
        let workers = io_worker_count();
        Self {
            server: ServerExecutor::new(),
            io: QueueExecutor::bounded_pool("upnp-io", workers, workers * 2),
            callback: QueueExecutor::single_worker("upnp-callback"),
        }
    }

    /// Spawn a dedicated thread for a long-lived task. The thread name is
    /// `upnp-server` plus the given suffix.
    pub fn server(&self, name_suffix: &str, task: impl FnOnce() + Send + 'static) -> bool {
        self.server.execute(name_suffix, Box::new(task))
    }

    /// Queue a short I/O task. Returns false when the pool is saturated or
    /// terminated; the task is dropped in that case.
    pub fn io(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.io.execute(Box::new(task))
    }

    /// Queue a user notification. Single worker, FIFO.
    pub fn callback(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.callback.execute(Box::new(task))
    }

    /// After termination every submission returns false. Running receive
    /// loops are not interrupted; they observe their own cancellation.
    pub fn terminate(&self) {
        self.server.terminate();
        self.io.terminate();
        self.callback.terminate();
    }
}

impl Default for TaskExecutors {
    fn default() -> Self {
        Self::new()
    }
}

fn io_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
        .min(MAX_IO_WORKERS)
}

struct ServerExecutor {
    terminated: AtomicBool,
}

impl ServerExecutor {
    fn new() -> Self {
        Self {
            terminated: AtomicBool::new(false),
        }
    }

    fn execute(&self, name_suffix: &str, job: Job) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        let name = format!("upnp-server{}", name_suffix);
        match thread::Builder::new().name(name).spawn(job) {
            Ok(_) => true,
            Err(err) => {
                warn!("Failed to spawn server thread: {}", err);
                false
            }
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}

/// Channel-fed pool. Workers drain until the sender side is dropped.
struct QueueExecutor {
    sender: Mutex<Option<Sender<Job>>>,
}

impl QueueExecutor {
    fn bounded_pool(name: &str, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = bounded::<Job>(capacity);
        for i in 0..workers {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                });
            if let Err(err) = spawned {
                warn!("Failed to spawn {} worker: {}", name, err);
            }
        }
        Self {
            sender: Mutex::new(Some(tx)),
        }
    }

    fn single_worker(name: &str) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
        if let Err(err) = spawned {
            warn!("Failed to spawn {} worker: {}", name, err);
        }
        Self {
            sender: Mutex::new(Some(tx)),
        }
    }

    fn execute(&self, job: Job) -> bool {
        let guard = self.sender.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => true,
                Err(err) => {
                    debug!("Task rejected: {}", err);
                    false
                }
            },
            None => false,
        }
    }

    fn terminate(&self) {
        // Dropping the sender lets workers drain the queue and exit.
        self.sender.lock().unwrap().take();
    }
}
