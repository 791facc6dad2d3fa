use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bastion::dispatch::Dispatcher;

struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

fn spin_until(deadline: Duration, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_excess_jobs_are_rejected_exactly() {
    const WORKERS: usize = 2;
    const QUEUE: usize = 2;
    let dispatcher = Dispatcher::new(WORKERS, QUEUE);
    let gate = Gate::new();
    let started = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    // Fill every worker and every queue slot with blocking jobs.
    for _ in 0..WORKERS + QUEUE {
        let gate = Arc::clone(&gate);
        let started = Arc::clone(&started);
        let ran = Arc::clone(&ran);
        dispatcher
            .submit(move || {
                started.fetch_add(1, Ordering::SeqCst);
                gate.wait();
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .expect("job within capacity must be accepted");
    }
    // Both workers must have picked up a job so the queue holds the rest.
    spin_until(Duration::from_secs(5), || {
        started.load(Ordering::SeqCst) == WORKERS
    });

    // Saturated: every further submit is shed, none blocks.
    let mut rejected = 0;
    for _ in 0..3 {
        if dispatcher.submit(|| unreachable!("rejected job must never run")).is_err() {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 3);

    gate.release();
    drop(dispatcher); // joins workers
    assert_eq!(ran.load(Ordering::SeqCst), WORKERS + QUEUE);
}

#[test]
fn test_accepted_jobs_run_exactly_once_each() {
    let dispatcher = Dispatcher::new(4, 16);
    let runs: Vec<Arc<AtomicUsize>> = (0..20).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    for counter in &runs {
        let counter = Arc::clone(counter);
        dispatcher
            .submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    drop(dispatcher);

    for (i, counter) in runs.iter().enumerate() {
        assert_eq!(counter.load(Ordering::SeqCst), 1, "job {i}");
    }
}

#[test]
fn test_worker_survives_panicking_job() {
    let dispatcher = Dispatcher::new(1, 8);
    let ran = Arc::new(AtomicUsize::new(0));

    dispatcher.submit(|| panic!("handler blew up")).unwrap();
    let counter = Arc::clone(&ran);
    dispatcher
        .submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    drop(dispatcher);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
