//! The caller-supplied unit of work and what it sees while running.

use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::cancel::CancellationFlag;
use crate::progress::ProgressHandle;

/// A work object, constructed once per worker and run once per task.
///
/// Everything that crosses the process boundary is a serde type. Worker
/// processes find the implementation by [`NAME`](Work::NAME), so it must
/// match what the worker binary passes to [`serve`](crate::worker::serve).
pub trait Work: Sized + 'static {
    const NAME: &'static str;

    /// Constructor input, cloned into every worker.
    type Init: Serialize + DeserializeOwned + Clone + Send + 'static;
    /// One task.
    type Args: Serialize + DeserializeOwned + Send + 'static;
    /// One result.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn init(init: Self::Init) -> anyhow::Result<Self>;

    fn run(&mut self, args: Self::Args, ctx: &TaskContext) -> anyhow::Result<Self::Output>;
}

/// Re-entrant lock serializing a worker's writes to shared streams.
///
/// Worker processes hold it for every progress round trip and while
/// reporting an interrupt, so holding it in task code keeps a block of
/// output together.
#[derive(Clone, Default)]
pub struct IoLock(Arc<ReentrantMutex<()>>);

impl IoLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.lock()
    }
}

impl std::fmt::Debug for IoLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IoLock")
    }
}

/// Per-task view of the executor.
#[derive(Debug, Clone)]
pub struct TaskContext {
    progress: ProgressHandle,
    cancellation: CancellationFlag,
    slot: Option<usize>,
    io: IoLock,
}

impl TaskContext {
    pub fn new(
        progress: ProgressHandle,
        cancellation: CancellationFlag,
        slot: Option<usize>,
        io: IoLock,
    ) -> Self {
        Self {
            progress,
            cancellation,
            slot,
            io,
        }
    }

    /// Handle for creating bars and printing lines.
    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    /// Long-running tasks should stop early once this is true.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Worker slot, `None` when running in-process.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn io_lock(&self) -> &IoLock {
        &self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_lock_is_reentrant() {
        let lock = IoLock::new();
        let outer = lock.lock();
        let inner = lock.clone();
        let _nested = inner.lock();
        drop(outer);
    }
}
