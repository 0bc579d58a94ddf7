//! Cooperative cancellation with a forceful backstop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::ipc::WorkerKillHandle;
use crate::signal::SigintWatch;

/// Set-once cancellation flag shared by the executor, its watcher and
/// every task context.
///
/// Once cancelled it stays cancelled. Each executor owns a fresh one.
#[derive(Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<FlagInner>,
}

#[derive(Default)]
struct FlagInner {
    cancelled: AtomicBool,
    /// Wakes the watcher; the bool records that the watcher was released.
    gate: Mutex<bool>,
    changed: Condvar,
}

impl std::fmt::Debug for CancellationFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationFlag")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Set the flag. Returns `true` for the call that actually set it.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::AcqRel);
        if first {
            let _gate = self.inner.gate.lock();
            self.inner.changed.notify_all();
        }
        first
    }

    /// Block until the flag is set or the watcher is released.
    ///
    /// With a SIGINT watch the gate is re-checked every `interval` and a
    /// delivered SIGINT sets the flag. Returns whether the flag was set.
    fn wait(&self, sigint: Option<(SigintWatch, Duration)>) -> bool {
        let mut released = self.inner.gate.lock();
        while !self.is_cancelled() && !*released {
            match sigint {
                Some((watch, interval)) => {
                    self.inner.changed.wait_for(&mut released, interval);
                    if watch.fired() && !self.inner.cancelled.swap(true, Ordering::AcqRel) {
                        tracing::debug!("SIGINT received; cancelling");
                    }
                }
                None => self.inner.changed.wait(&mut released),
            }
        }
        self.is_cancelled()
    }

    fn release(&self) {
        let mut released = self.inner.gate.lock();
        *released = true;
        self.inner.changed.notify_all();
    }

    fn rearm(&self) {
        *self.inner.gate.lock() = false;
    }
}

/// Background thread that kills every worker once the flag is set.
///
/// Started per execution; [`release_and_join`](Self::release_and_join)
/// must run before the execution returns so the thread never outlives it.
pub struct CancellationWatcher {
    flag: CancellationFlag,
    thread: Option<JoinHandle<()>>,
}

impl CancellationWatcher {
    /// Start watching `flag`. With `sigint_poll`, SIGINTs delivered from
    /// now on also set the flag, checked at that interval.
    pub fn spawn(
        flag: CancellationFlag,
        workers: Vec<WorkerKillHandle>,
        sigint_poll: Option<Duration>,
    ) -> std::io::Result<Self> {
        flag.rearm();
        let watched = flag.clone();
        let sigint = sigint_poll.map(|interval| (SigintWatch::new(), interval));
        let thread = thread::Builder::new()
            .name("mpdriver-cancel-watcher".into())
            .spawn(move || {
                if watched.wait(sigint) {
                    tracing::debug!("Cancellation requested; killing {} workers", workers.len());
                    for worker in &workers {
                        worker.kill();
                    }
                }
            })?;
        Ok(Self {
            flag,
            thread: Some(thread),
        })
    }

    /// Let the watcher exit and wait for it.
    pub fn release_and_join(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.flag.release();
            if thread.join().is_err() {
                tracing::error!("Cancellation watcher panicked");
            }
        }
    }
}

impl Drop for CancellationWatcher {
    fn drop(&mut self) {
        self.join();
    }
}
