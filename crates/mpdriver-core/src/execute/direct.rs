//! In-process execution.
//!
//! Runs every task on the calling thread with a local progress renderer.
//! Used when no worker count is configured.

use std::panic::{AssertUnwindSafe, catch_unwind};

use super::cancel::{CancellationFlag, CancellationWatcher};
use super::report::{ExecutionReport, ExecutionStatus, empty_results, finish_bar, overall_options};
use super::work::{IoLock, TaskContext, Work};
use super::{Executor, panic_message};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::progress::{BarOptions, ProgressHandle};
use crate::signal::SigintGuard;

pub struct DirectExecutor<W: Work> {
    work: W,
    progress: ProgressHandle,
    flag: CancellationFlag,
    io: IoLock,
    config: ExecutorConfig,
}

impl<W: Work> DirectExecutor<W> {
    /// Construct the work object in this process.
    pub fn new(init: W::Init, config: ExecutorConfig) -> Result<Self> {
        let work = W::init(init).map_err(|e| Error::WorkerInit(format!("{:#}", e)))?;
        Ok(Self {
            work,
            progress: ProgressHandle::local(&config.progress),
            flag: CancellationFlag::new(),
            io: IoLock::new(),
            config,
        })
    }
}

impl<W: Work> Executor<W> for DirectExecutor<W> {
    fn execute_report(
        &mut self,
        tasks: Vec<W::Args>,
        options: BarOptions,
    ) -> ExecutionReport<W::Output> {
        let n = tasks.len();
        if self.flag.is_cancelled() {
            return ExecutionReport::cancelled(n);
        }

        let _sigint = SigintGuard::install()
            .inspect_err(|e| tracing::warn!("Could not install SIGINT handler: {}", e))
            .ok();
        let watcher = match CancellationWatcher::spawn(
            self.flag.clone(),
            Vec::new(),
            Some(self.config.poll_interval),
        ) {
            Ok(watcher) => watcher,
            Err(e) => return ExecutionReport::aborted(empty_results(n), e.into()),
        };

        let mut results = empty_results(n);
        let mut proxy = match self
            .progress
            .wrap(tasks.into_iter().enumerate(), overall_options(options, n))
        {
            Ok(proxy) => proxy,
            Err(e) => {
                watcher.release_and_join();
                return ExecutionReport::aborted(results, e);
            }
        };

        let ctx = TaskContext::new(self.progress.clone(), self.flag.clone(), None, self.io.clone());
        let mut status = ExecutionStatus::Completed;
        let mut error = None;

        for (index, args) in &mut proxy {
            if self.flag.is_cancelled() {
                status = ExecutionStatus::Interrupted;
                break;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| self.work.run(args, &ctx)));
            match outcome {
                Ok(Ok(output)) => results[index] = Some(output),
                Ok(Err(e)) => {
                    error = Some(Error::Task {
                        index,
                        message: format!("{:#}", e),
                    });
                    status = ExecutionStatus::Aborted;
                    break;
                }
                Err(payload) => {
                    error = Some(Error::Task {
                        index,
                        message: format!("panicked: {}", panic_message(payload)),
                    });
                    status = ExecutionStatus::Aborted;
                    break;
                }
            }
        }

        if status == ExecutionStatus::Completed && self.flag.is_cancelled() {
            status = ExecutionStatus::Interrupted;
        }
        if let Some(e) = proxy.take_error()
            && error.is_none()
        {
            status = ExecutionStatus::Aborted;
            error = Some(e);
        }

        if status != ExecutionStatus::Completed {
            self.flag.cancel();
        }
        watcher.release_and_join();
        finish_bar(proxy.bar(), status);
        drop(proxy);

        tracing::debug!("In-process execution finished: {:?}", status);
        match error {
            Some(e) => ExecutionReport::aborted(results, e),
            None => ExecutionReport::new(status, results),
        }
    }

    fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    fn cancellation(&self) -> CancellationFlag {
        self.flag.clone()
    }
}
