//! Fixed-size worker pool for CPU-bound fan-out.
//!
//! Used to parallelise query matching during searches and the chunk phase of
//! merge sorts. Workers share a single job channel and run until the pool is
//! dropped.

use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (job_tx, job_rx) = channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let workers = (0..num_threads)
            .map(|_| {
                let job_rx = Arc::clone(&job_rx);
                thread::spawn(move || worker_loop(&job_rx))
            })
            .collect();

        Self {
            job_tx: Some(job_tx),
            workers,
        }
    }

    /// Create a pool sized to the machine's available parallelism.
    #[must_use]
    pub fn with_default_size() -> Self {
        let num_threads = thread::available_parallelism().map_or(4, usize::from);
        Self::new(num_threads)
    }

    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Submit a job. Jobs run in submission order per worker but with no
    /// ordering guarantee across workers.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.job_tx {
            let _ = tx.send(Box::new(job));
        }
    }
}

fn worker_loop(job_rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = match job_rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.job_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
