//! Cooperative cancellation for worker threads
//!
//! A worker receives a `Shutdown` token and checks it at every loop iteration
//! and every sleep. Dropping the trigger side cancels. The owner joins with a
//! bounded wait: a worker stuck in a slow read is detached, never killed.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

/// Cancellation token observed by a worker
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: Receiver<()>,
}

/// Owner side of a `Shutdown` token
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: Option<Sender<()>>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = flume::bounded(1);
    (ShutdownTrigger { tx: Some(tx) }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&mut self) {
        self.tx.take();
    }
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        self.rx.is_disconnected()
    }

    /// Sleep for up to `timeout`; returns `true` early if shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// A named worker thread with cooperative shutdown and bounded join
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    trigger: ShutdownTrigger,
    done: Receiver<()>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> std::io::Result<Self>
    where
        F: FnOnce(Shutdown) + Send + 'static,
    {
        let name = name.into();
        let (trigger, shutdown) = shutdown_channel();
        let (done_tx, done) = flume::bounded::<()>(1);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            // Dropped on exit, including unwinding
            let _done = done_tx;
            f(shutdown);
        })?;
        Ok(Self {
            name,
            handle: Some(handle),
            trigger,
            done,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_disconnected()
    }

    /// Request shutdown and wait up to `timeout`. Returns `false` if the worker
    /// was still running when the wait expired; it is then detached.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.trigger.trigger();
        let exited = matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected) | Ok(())
        );
        if let Some(handle) = self.handle.take() {
            if exited {
                if handle.join().is_err() {
                    warn!(worker = %self.name, "worker panicked");
                }
                debug!(worker = %self.name, "worker joined");
            } else {
                warn!(worker = %self.name, ?timeout, "worker did not stop in time, detaching");
            }
        }
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_returns_early_on_trigger() {
        let (mut trigger, shutdown) = shutdown_channel();
        assert!(!shutdown.is_requested());
        assert!(!shutdown.wait(Duration::from_millis(5)));
        trigger.trigger();
        assert!(shutdown.is_requested());
        assert!(shutdown.wait(Duration::from_secs(60)));
    }

    #[test]
    fn worker_stops_and_joins() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let worker = Worker::spawn("ticker", move |shutdown| {
            while !shutdown.wait(Duration::from_millis(5)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(worker.stop(Duration::from_secs(2)));
        let after = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn stuck_worker_is_detached_after_timeout() {
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        let worker = Worker::spawn("stuck", move |_shutdown| {
            let _ = release_rx.recv();
        })
        .unwrap();
        assert!(!worker.stop(Duration::from_millis(20)));
        drop(release_tx);
    }
}
