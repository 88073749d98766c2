//! Fixed-size worker pool that turns request bodies into framed responses.
//!
//! The listener never runs action code itself. Each request body is queued
//! as a [`Task`]; a worker thread runs the [`RequestHandler`], frames the
//! response and hands it back over a oneshot channel.

use super::protocol::{encode_frame, Response};
use crate::engine::lock_unpoisoned;
use crate::{Result, SimError};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Turns one request body into one response body.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

impl<F> RequestHandler for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}

/// One queued request and where to send its framed response.
pub struct Task {
    pub request: Vec<u8>,
    pub reply: oneshot::Sender<Vec<u8>>,
}

impl Task {
    pub fn new(request: Vec<u8>) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }
}

struct Queue {
    tasks: VecDeque<Task>,
    running: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Worker threads draining a shared task queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one) named `ipc-worker-N`.
    pub fn new(threads: usize, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                running: true,
            }),
            available: Condvar::new(),
        });

        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let worker_shared = shared.clone();
            let handler = handler.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("ipc-worker-{}", index))
                .spawn(move || worker_loop(&worker_shared, handler.as_ref()));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    let pool = Self {
                        shared,
                        workers: Mutex::new(workers),
                    };
                    pool.shutdown();
                    return Err(SimError::Transport {
                        message: format!("failed to spawn worker thread: {}", err),
                    });
                }
            }
        }

        info!("Worker pool started with {} threads", threads);
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task. Fails once the pool is shutting down.
    pub fn submit(&self, task: Task) -> Result<()> {
        let mut queue = lock_unpoisoned(&self.shared.queue);
        if !queue.running {
            return Err(SimError::Transport {
                message: "worker pool is shut down".to_string(),
            });
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.shared.queue).running
    }

    /// Stop accepting tasks, let the workers drain the queue and join them.
    pub fn shutdown(&self) {
        lock_unpoisoned(&self.shared.queue).running = false;
        self.shared.available.notify_all();

        let workers: Vec<JoinHandle<()>> = lock_unpoisoned(&self.workers).drain(..).collect();
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("IPC worker thread panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("running", &self.is_running())
            .field("workers", &lock_unpoisoned(&self.workers).len())
            .finish()
    }
}

fn worker_loop(shared: &Shared, handler: &dyn RequestHandler) {
    loop {
        let task = {
            let mut queue = lock_unpoisoned(&shared.queue);
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if !queue.running {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };

        let frame = run_task(handler, &task.request);
        if task.reply.send(frame).is_err() {
            debug!("Connection closed before its response was ready");
        }
    }
}

/// Run the handler and frame its output. A panic or an oversize response
/// becomes an error envelope.
fn run_task(handler: &dyn RequestHandler, request: &[u8]) -> Vec<u8> {
    let body = catch_unwind(AssertUnwindSafe(|| handler.handle(request))).unwrap_or_else(|_| {
        error!("Request handler panicked");
        fallback_body("Internal error")
    });
    match encode_frame(&body) {
        Ok(frame) => frame,
        Err(err) => {
            error!("Failed to frame response: {}", err);
            encode_frame(&fallback_body(&format!("Encode error: {}", err))).unwrap_or_default()
        }
    }
}

fn fallback_body(message: &str) -> Vec<u8> {
    Response::failure("", message).encode().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo() -> Arc<dyn RequestHandler> {
        Arc::new(|request: &[u8]| request.to_vec())
    }

    #[test]
    fn test_task_round_trip_is_framed() {
        let pool = WorkerPool::new(2, echo()).unwrap();
        let (task, rx) = Task::new(b"abc".to_vec());
        pool.submit(task).unwrap();
        let frame = rx.blocking_recv().unwrap();
        assert_eq!(&frame[..4], &3u32.to_be_bytes());
        assert_eq!(&frame[4..], b"abc");
        pool.shutdown();
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let handler: Arc<dyn RequestHandler> = Arc::new(|_: &[u8]| -> Vec<u8> { panic!("boom") });
        let pool = WorkerPool::new(1, handler).unwrap();
        let (task, rx) = Task::new(Vec::new());
        pool.submit(task).unwrap();
        let frame = rx.blocking_recv().unwrap();
        let response = Response::decode(&frame[4..]).unwrap();
        assert_eq!(response.error.as_deref(), Some("Internal error"));

        // The worker survives the panic.
        let (task, rx) = Task::new(Vec::new());
        pool.submit(task).unwrap();
        assert!(rx.blocking_recv().is_ok());
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(1, echo()).unwrap();
        pool.shutdown();
        assert!(!pool.is_running());
        let (task, _rx) = Task::new(Vec::new());
        assert!(pool.submit(task).is_err());
        // Idempotent
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        let handler: Arc<dyn RequestHandler> = Arc::new(move |request: &[u8]| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            counter.fetch_add(1, Ordering::SeqCst);
            request.to_vec()
        });
        let pool = WorkerPool::new(2, handler).unwrap();
        let receivers: Vec<_> = (0..10)
            .map(|i| {
                let (task, rx) = Task::new(vec![i]);
                pool.submit(task).unwrap();
                rx
            })
            .collect();
        pool.shutdown();
        assert_eq!(served.load(Ordering::SeqCst), 10);
        for rx in receivers {
            assert!(rx.blocking_recv().is_ok());
        }
    }
}
