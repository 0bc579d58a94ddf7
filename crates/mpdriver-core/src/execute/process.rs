//! Multi-process execution.
//!
//! Owns the progress coordinator and a fixed set of worker processes.
//! Tasks are handed out one at a time to whichever worker is idle;
//! results are stored by submission index.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};

use super::cancel::{CancellationFlag, CancellationWatcher};
use super::report::{
    ExecutionReport, ExecutionStatus, announce, empty_results, finish_bar, overall_options,
};
use super::work::Work;
use super::Executor;
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::ipc::{
    SpawnParams, TaskOutcome, WorkerEvent, WorkerProcess, decode_payload, encode_payload,
    find_worker_program,
};
use crate::progress::{BarHandle, BarOptions, Coordinator, CoordinatorStats, ProgressHandle};
use crate::signal::SigintGuard;

pub struct ProcessExecutor<W: Work> {
    /// `None` once a worker has exited or been reaped.
    workers: Vec<Option<WorkerProcess>>,
    events: Receiver<WorkerEvent>,
    coordinator: Coordinator,
    progress: ProgressHandle,
    flag: CancellationFlag,
    config: ExecutorConfig,
    _work: PhantomData<fn() -> W>,
}

impl<W: Work> ProcessExecutor<W> {
    /// Start the coordinator and spawn `config.workers` workers (at least one),
    /// each constructed from a clone of `init`.
    pub fn new(init: W::Init, config: ExecutorConfig) -> Result<Self> {
        let count = config.workers.unwrap_or(1).max(1);
        let program: PathBuf = find_worker_program(config.worker_program.as_deref())?;
        let coordinator = Coordinator::spawn(&config.progress)?;
        let init_json = encode_payload(&init)?;
        let flag = CancellationFlag::new();
        let (events_tx, events) = mpsc::channel();

        // One requester per worker slot, registered up front.
        let mut transports: Vec<_> = (0..count).map(|_| coordinator.register()).collect();

        let mut workers = Vec::with_capacity(count);
        for slot in 0..count {
            let Some(transport) = transports.pop() else {
                break;
            };
            let worker = WorkerProcess::spawn(SpawnParams {
                program: &program,
                work_name: W::NAME,
                slot,
                init_json: init_json.clone(),
                transport,
                flag: flag.clone(),
                events: events_tx.clone(),
            })?;
            workers.push(Some(worker));
        }

        tracing::debug!(
            "Started {} '{}' workers from {}",
            workers.len(),
            W::NAME,
            program.display()
        );

        let progress = coordinator.handle();
        Ok(Self {
            workers,
            events,
            coordinator,
            progress,
            flag,
            config,
            _work: PhantomData,
        })
    }

    /// Pids of the workers still owned by the pool.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.iter().flatten().map(|w| w.pid()).collect()
    }

    pub fn live_workers(&self) -> usize {
        self.workers.iter().flatten().count()
    }

    pub fn coordinator_stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    /// Drop a worker from the pool, killing it if it is still running.
    fn retire(&mut self, slot: usize) {
        if let Some(worker) = self.workers.get_mut(slot).and_then(Option::take) {
            drop(worker);
        }
    }

    /// Reap every worker. Used after an interrupt or abort.
    fn retire_all(&mut self) {
        for slot in 0..self.workers.len() {
            self.retire(slot);
        }
    }

    /// Account for events left over from an earlier run.
    fn drain_stale_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let WorkerEvent::Exited { slot } = event {
                tracing::debug!("Worker {} exited between runs", slot);
                self.retire(slot);
            }
        }
    }

    fn dispatch(
        &mut self,
        tasks: Vec<W::Args>,
        bar: &BarHandle,
    ) -> (ExecutionStatus, Vec<Option<W::Output>>, Option<Error>) {
        let n = tasks.len();
        let mut results = empty_results(n);
        let mut pending = VecDeque::with_capacity(n);
        for (index, args) in tasks.iter().enumerate() {
            match encode_payload(args) {
                Ok(json) => pending.push_back((index, json)),
                Err(e) => return (ExecutionStatus::Aborted, results, Some(e)),
            }
        }

        let mut in_flight: Vec<Option<usize>> = vec![None; self.workers.len()];
        let mut resolved = vec![false; n];
        let mut remaining = n;

        for slot in 0..self.workers.len() {
            self.feed(slot, &mut pending, &mut in_flight);
        }

        while remaining > 0 {
            if self.flag.is_cancelled() {
                return (ExecutionStatus::Interrupted, results, None);
            }
            if self.live_workers() == 0 && in_flight.iter().all(Option::is_none) {
                announce(
                    &self.progress,
                    &format!("All workers are gone; {} tasks produce no result", remaining),
                );
                break;
            }

            let event = match self.events.recv_timeout(self.config.poll_interval) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Every worker reader has stopped");
                    break;
                }
            };

            match event {
                WorkerEvent::Finished {
                    slot,
                    index,
                    outcome,
                } => {
                    if in_flight.get(slot).copied().flatten() == Some(index) {
                        in_flight[slot] = None;
                    }
                    if index >= n || resolved[index] {
                        tracing::debug!("Ignoring duplicate result for task {}", index);
                    } else {
                        resolved[index] = true;
                        remaining -= 1;
                        match outcome {
                            TaskOutcome::Output(json) => match decode_payload(&json) {
                                Ok(output) => results[index] = Some(output),
                                Err(e) => return (ExecutionStatus::Aborted, results, Some(e)),
                            },
                            TaskOutcome::Failed(message) => {
                                let error = Error::Task { index, message };
                                return (ExecutionStatus::Aborted, results, Some(error));
                            }
                            TaskOutcome::Panic(message) => {
                                let error = Error::Task {
                                    index,
                                    message: format!("panicked: {}", message),
                                };
                                return (ExecutionStatus::Aborted, results, Some(error));
                            }
                        }
                        if let Err(e) = bar.update(1) {
                            return (ExecutionStatus::Aborted, results, Some(e));
                        }
                    }
                    self.feed(slot, &mut pending, &mut in_flight);
                }
                WorkerEvent::Interrupted { slot } => {
                    tracing::debug!("Worker {} was interrupted", slot);
                }
                WorkerEvent::Exited { slot } => {
                    self.retire(slot);
                    if let Some(index) = in_flight.get_mut(slot).and_then(Option::take) {
                        if self.flag.is_cancelled() {
                            continue;
                        }
                        announce(
                            &self.progress,
                            &format!(
                                "Worker {} exited while running task {}; its result is lost",
                                slot, index
                            ),
                        );
                        if !resolved[index] {
                            resolved[index] = true;
                            remaining -= 1;
                        }
                    }
                }
            }
        }

        let status = if self.flag.is_cancelled() {
            ExecutionStatus::Interrupted
        } else {
            ExecutionStatus::Completed
        };
        (status, results, None)
    }

    /// Send the next pending task to `slot` if it is idle and alive.
    fn feed(
        &mut self,
        slot: usize,
        pending: &mut VecDeque<(usize, Vec<u8>)>,
        in_flight: &mut [Option<usize>],
    ) {
        if in_flight.get(slot).copied().flatten().is_some() {
            return;
        }
        let Some(Some(worker)) = self.workers.get(slot) else {
            return;
        };
        let Some((index, json)) = pending.pop_front() else {
            return;
        };

        match worker.run(index, json.clone()) {
            Ok(()) => in_flight[slot] = Some(index),
            Err(e) => {
                tracing::warn!("Could not send task {} to worker {}: {}", index, slot, e);
                pending.push_front((index, json));
                self.retire(slot);
                // Hand the task to another idle worker, if any.
                for other in 0..in_flight.len() {
                    if other != slot && in_flight[other].is_none() && self.workers[other].is_some() {
                        self.feed(other, pending, in_flight);
                        break;
                    }
                }
            }
        }
    }
}

impl<W: Work> Executor<W> for ProcessExecutor<W> {
    fn execute_report(
        &mut self,
        tasks: Vec<W::Args>,
        options: BarOptions,
    ) -> ExecutionReport<W::Output> {
        let n = tasks.len();
        self.drain_stale_events();
        if self.flag.is_cancelled() || self.live_workers() == 0 {
            return ExecutionReport::cancelled(n);
        }

        let _sigint = SigintGuard::install()
            .inspect_err(|e| tracing::warn!("Could not install SIGINT handler: {}", e))
            .ok();
        let kill_handles = self.workers.iter().flatten().map(|w| w.kill_handle()).collect();
        let watcher = match CancellationWatcher::spawn(
            self.flag.clone(),
            kill_handles,
            Some(self.config.poll_interval),
        ) {
            Ok(watcher) => watcher,
            Err(e) => return ExecutionReport::aborted(empty_results(n), e.into()),
        };

        let bar = match self.progress.bar(overall_options(options, n)) {
            Ok(bar) => bar,
            Err(e) => {
                watcher.release_and_join();
                return ExecutionReport::aborted(empty_results(n), e);
            }
        };

        let (status, results, error) = self.dispatch(tasks, &bar);

        if status != ExecutionStatus::Completed {
            // Wakes the watcher, which kills whatever is still running.
            self.flag.cancel();
        }
        watcher.release_and_join();
        if status != ExecutionStatus::Completed {
            self.retire_all();
        }
        finish_bar(&bar, status);

        tracing::debug!("Process execution finished: {:?}", status);
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

impl<W: Work> Drop for ProcessExecutor<W> {
    fn drop(&mut self) {
        for worker in self.workers.iter_mut().filter_map(Option::take) {
            worker.shutdown();
        }
        self.coordinator.shutdown();
    }
}
