//! Outcome of one `execute` call and the aggregate bar that shows it.

use crate::error::{Error, Result};
use crate::progress::{BarHandle, BarOptions, Colour, ProgressHandle, status_label};

/// Terminal state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Every task was attempted.
    Completed,
    /// SIGINT or an explicit cancel stopped the run.
    Interrupted,
    /// A task failed; its error is in the report.
    Aborted,
}

impl ExecutionStatus {
    /// Description the aggregate bar ends with.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Interrupted => "^C",
            ExecutionStatus::Aborted => "Aborted",
        }
    }

    pub fn colour(&self) -> Colour {
        match self {
            ExecutionStatus::Completed => Colour::Green,
            ExecutionStatus::Interrupted => Colour::Yellow,
            ExecutionStatus::Aborted => Colour::Red,
        }
    }
}

/// Results in submission order plus how the run ended.
#[derive(Debug)]
pub struct ExecutionReport<T> {
    pub status: ExecutionStatus,
    /// One slot per task; `None` where no value was produced.
    pub results: Vec<Option<T>>,
    /// The error behind an `Aborted` run.
    pub error: Option<Error>,
}

impl<T> ExecutionReport<T> {
    pub(crate) fn new(status: ExecutionStatus, results: Vec<Option<T>>) -> Self {
        Self {
            status,
            results,
            error: None,
        }
    }

    pub(crate) fn aborted(results: Vec<Option<T>>, error: Error) -> Self {
        Self {
            status: ExecutionStatus::Aborted,
            results,
            error: Some(error),
        }
    }

    /// Report for an executor that can no longer run anything.
    pub(crate) fn cancelled(tasks: usize) -> Self {
        Self::aborted(empty_results(tasks), Error::Cancelled)
    }

    /// Results, or the error for an aborted run. Interrupted runs return
    /// whatever had finished.
    pub fn into_result(self) -> Result<Vec<Option<T>>> {
        match self.status {
            ExecutionStatus::Aborted => Err(self.error.unwrap_or(Error::Aborted)),
            ExecutionStatus::Completed | ExecutionStatus::Interrupted => Ok(self.results),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

pub(crate) fn empty_results<T>(n: usize) -> Vec<Option<T>> {
    std::iter::repeat_with(|| None).take(n).collect()
}

/// Fill in the aggregate bar defaults for `tasks` tasks.
pub(crate) fn overall_options(mut options: BarOptions, tasks: usize) -> BarOptions {
    options.total.get_or_insert(tasks as u64);
    options
}

/// Recolour and relabel the aggregate bar for its final state.
pub(crate) fn finish_bar(bar: &BarHandle, status: ExecutionStatus) {
    let finished = bar
        .set_colour(Some(status.colour()))
        .and_then(|_| bar.set_description(status_label(status.label())))
        .and_then(|_| bar.close());
    if let Err(e) = finished {
        tracing::warn!("Failed to finalize progress bar: {}", e);
    }
}

/// Print a line through the progress display, falling back to logging.
pub(crate) fn announce(progress: &ProgressHandle, line: &str) {
    if let Err(e) = progress.write(line) {
        tracing::warn!("{} ({})", line, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result_by_status() {
        let ok = ExecutionReport::new(ExecutionStatus::Completed, vec![Some(1), Some(2)]);
        assert_eq!(ok.into_result().unwrap(), vec![Some(1), Some(2)]);

        let interrupted = ExecutionReport::new(ExecutionStatus::Interrupted, vec![Some(1), None]);
        assert_eq!(interrupted.into_result().unwrap(), vec![Some(1), None]);

        let aborted: ExecutionReport<i32> = ExecutionReport::aborted(
            vec![None],
            Error::Task {
                index: 0,
                message: "x".into(),
            },
        );
        assert!(matches!(
            aborted.into_result(),
            Err(Error::Task { index: 0, .. })
        ));
    }

    #[test]
    fn test_cancelled_report() {
        let report: ExecutionReport<()> = ExecutionReport::cancelled(3);
        assert_eq!(report.results.len(), 3);
        assert!(matches!(report.into_result(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_overall_total_defaults_to_task_count() {
        assert_eq!(overall_options(BarOptions::overall(), 4).total, Some(4));
        assert_eq!(
            overall_options(BarOptions::overall().total(9), 4).total,
            Some(9)
        );
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(ExecutionStatus::Interrupted.label(), "^C");
        assert_eq!(ExecutionStatus::Aborted.colour(), Colour::Red);
    }
}
