//! Admission-controlled handler dispatch: a fixed pool of worker threads
//! behind a bounded queue. When pool and queue are both saturated, `submit`
//! fails synchronously and the caller sheds the request (503) itself;
//! submission never blocks and a rejected job is never silently dropped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool and queue are both full; the job was not enqueued.
#[derive(Debug, Error)]
#[error("dispatcher saturated: job rejected")]
pub struct Overloaded;

/// Bounded worker pool with tail-drop admission control.
pub struct Dispatcher {
    sender: Option<SyncSender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns `workers` threads sharing a queue of depth `queue_depth`.
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        assert!(workers > 0, "dispatcher needs at least one worker");
        let (sender, receiver) = sync_channel::<Job>(queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("bastion-worker-{id}"))
                    .spawn(move || worker_loop(id, receiver))
                    .expect("spawn worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Enqueues a job for execution on a worker thread.
    ///
    /// Returns [`Overloaded`] without blocking when every worker is busy
    /// and the queue is full. Accepted jobs run exactly once.
    pub fn submit<F>(&self, job: F) -> Result<(), Overloaded>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return Err(Overloaded);
        };
        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => Err(Overloaded),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops once the queue drains.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = receiver.lock().unwrap();
            guard.recv()
        };
        match job {
            Ok(job) => {
                // A panicking handler must not take the worker down; the
                // request side observes the dropped ResponseWriter as a 500.
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(worker = id, "handler panicked");
                }
            }
            Err(_) => break,
        }
    }
}
