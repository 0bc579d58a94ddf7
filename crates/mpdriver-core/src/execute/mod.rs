//! Task execution.
//!
//! Two implementations of [`Executor`]: [`DirectExecutor`] runs tasks on
//! the calling thread, [`ProcessExecutor`] spreads them over worker
//! processes. [`build`] picks one from the configured worker count so
//! call sites never branch on it.

mod cancel;
mod direct;
mod process;
mod report;
mod work;

use std::any::Any;

pub use cancel::{CancellationFlag, CancellationWatcher};
pub use direct::DirectExecutor;
pub use process::ProcessExecutor;
pub use report::{ExecutionReport, ExecutionStatus};
pub use work::{IoLock, TaskContext, Work};

use crate::config::ExecutorConfig;
use crate::error::Result;
use crate::progress::{BarOptions, ProgressHandle};

/// Runs batches of tasks for one kind of work.
pub trait Executor<W: Work> {
    /// Run `tasks` and report how the run ended.
    ///
    /// `results` always has one entry per task, in submission order.
    fn execute_report(
        &mut self,
        tasks: Vec<W::Args>,
        options: BarOptions,
    ) -> ExecutionReport<W::Output>;

    /// Run `tasks`, failing only if a task failed.
    ///
    /// An interrupted run returns the results that were ready.
    fn execute(
        &mut self,
        tasks: Vec<W::Args>,
        options: BarOptions,
    ) -> Result<Vec<Option<W::Output>>> {
        self.execute_report(tasks, options).into_result()
    }

    /// Handle for the executor's own progress display.
    fn progress(&self) -> ProgressHandle;

    /// The executor's cancellation flag. Cancelling it stops the current
    /// run and every later one.
    fn cancellation(&self) -> CancellationFlag;
}

/// Build the executor `config.workers` asks for.
pub fn build<W: Work>(init: W::Init, config: ExecutorConfig) -> Result<Box<dyn Executor<W>>> {
    match config.workers {
        None => Ok(Box::new(DirectExecutor::<W>::new(init, config)?)),
        Some(_) => Ok(Box::new(ProcessExecutor::<W>::new(init, config)?)),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
