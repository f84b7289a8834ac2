//! Cooperative tick loop on a dedicated OS thread.
//!
//! Each equipment producer and the aggregator run as one [`WorkerThread`]:
//! a named OS thread that repeatedly invokes a tick callback. A tick is
//! never preempted by this runner; between ticks the loop either continues
//! immediately (`Ok`), sleeps one quantum (`Idle`), or exits (`Error`).
//! The stop flag is only checked at tick boundaries, so an in-flight tick
//! always completes.
//!
//! Teardown belongs to the callback's captured state: when the loop exits,
//! the closure is dropped on the worker thread and component `Drop` impls
//! run there (e.g. an equipment stopping its DMA channel).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

/// Outcome of one scheduling quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// Work was done; call again without sleeping.
    Ok,
    /// No useful progress; the scheduler may sleep briefly.
    Idle,
    /// Fatal condition; the loop exits.
    Error,
}

/// Default inter-tick sleep quantum.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(1);

pub struct WorkerThread {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn a named worker running `tick` until stop or `Error`.
    pub fn spawn<F>(name: &str, idle_sleep: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> TickResult + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(worker = %thread_name, "worker loop starting");
                while !thread_stop.load(Ordering::Acquire) {
                    match tick() {
                        TickResult::Ok => {}
                        TickResult::Idle => std::thread::sleep(idle_sleep),
                        TickResult::Error => {
                            error!(worker = %thread_name, "worker loop aborting on error");
                            break;
                        }
                    }
                }
                debug!(worker = %thread_name, "worker loop finished");
                // `tick` dropped here: captured component teardown runs
                // on the worker thread.
            })?;
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to exit at the next tick boundary without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the loop to finish. Harmless if already joined.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    /// Request stop and optionally join.
    pub fn stop(&mut self, wait: bool) {
        self.request_stop();
        if wait {
            self.join();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for WorkerThread {
    /// Dropping a worker stops and joins it; use [`stop`](Self::stop) with
    /// `wait = false` first for an asynchronous shutdown.
    fn drop(&mut self) {
        self.request_stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicU64::new(0));
        let tick_count = Arc::clone(&count);
        let mut worker = WorkerThread::spawn("test-ticker", DEFAULT_IDLE_SLEEP, move || {
            tick_count.fetch_add(1, Ordering::Relaxed);
            TickResult::Ok
        })
        .unwrap();

        while count.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }
        worker.stop(true);
        let after_stop = count.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(count.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn test_error_exits_loop() {
        let count = Arc::new(AtomicU64::new(0));
        let tick_count = Arc::clone(&count);
        let mut worker = WorkerThread::spawn("test-error", DEFAULT_IDLE_SLEEP, move || {
            tick_count.fetch_add(1, Ordering::Relaxed);
            TickResult::Error
        })
        .unwrap();

        worker.join();
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(worker.is_finished());
    }

    #[test]
    fn test_teardown_runs_on_exit() {
        struct Guard(Arc<AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = Guard(Arc::clone(&dropped));
        let mut worker = WorkerThread::spawn("test-teardown", DEFAULT_IDLE_SLEEP, move || {
            let _ = &guard;
            TickResult::Idle
        })
        .unwrap();

        worker.stop(true);
        assert!(dropped.load(Ordering::Acquire));
    }
}
