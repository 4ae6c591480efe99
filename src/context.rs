//! Single-threaded background job loops.
//!
//! The store runs two of these: a worker context for its own periodic tasks
//! (draining index monitor queues) and a monitor context that hosts event
//! delivery from filesystem monitor backends. Neither shares mutable state
//! with callers except through typed channels; both are joined on drop.

use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Quit,
}

pub(crate) struct TaskContext {
    job_tx: Sender<Job>,
    thread: Option<JoinHandle<()>>,
}

impl TaskContext {
    /// Spawn a plain job loop.
    pub(crate) fn new(name: &str) -> Self {
        Self::spawn(name, None)
    }

    /// Spawn a job loop that additionally runs `tick` whenever `interval`
    /// elapses without a job arriving.
    pub(crate) fn with_tick(
        name: &str,
        interval: Duration,
        tick: Box<dyn FnMut() + Send + 'static>,
    ) -> Self {
        Self::spawn(name, Some((interval, tick)))
    }

    fn spawn(name: &str, tick: Option<(Duration, Box<dyn FnMut() + Send + 'static>)>) -> Self {
        let (job_tx, job_rx) = channel::<Job>();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut tick = tick;
                loop {
                    let job = match &mut tick {
                        Some((interval, tick_fn)) => match job_rx.recv_timeout(*interval) {
                            Ok(job) => job,
                            Err(RecvTimeoutError::Timeout) => {
                                tick_fn();
                                continue;
                            }
                            Err(RecvTimeoutError::Disconnected) => return,
                        },
                        None => match job_rx.recv() {
                            Ok(job) => job,
                            Err(_) => return,
                        },
                    };
                    match job {
                        Job::Run(job) => job(),
                        Job::Quit => return,
                    }
                }
            })
            .expect("failed to spawn background context");

        Self {
            job_tx,
            thread: Some(thread),
        }
    }

    #[must_use]
    pub(crate) fn handle(&self) -> TaskContextHandle {
        TaskContextHandle {
            job_tx: self.job_tx.clone(),
        }
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        let _ = self.job_tx.send(Job::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Cheap handle for posting jobs onto a context from other threads.
#[derive(Clone)]
pub(crate) struct TaskContextHandle {
    job_tx: Sender<Job>,
}

impl TaskContextHandle {
    /// Post a job; silently dropped when the context is gone.
    pub(crate) fn post(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.job_tx.send(Job::Run(Box::new(job)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn posted_jobs_run_in_order() {
        let ctx = TaskContext::new("test-ctx");
        let handle = ctx.handle();
        let (tx, rx) = channel();
        for i in 0..3 {
            let tx = tx.clone();
            handle.post(move || {
                let _ = tx.send(i);
            });
        }
        assert_eq!(rx.recv().unwrap(), 0);
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
    }

    #[test]
    fn tick_fires_when_idle() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        let _ctx = TaskContext::with_tick(
            "tick-ctx",
            Duration::from_millis(5),
            Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ticks.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "tick never fired");
            thread::yield_now();
        }
    }
}
