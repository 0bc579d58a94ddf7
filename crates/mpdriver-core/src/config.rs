//! Executor and progress display configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::progress::RenderTarget;

/// Environment variable that puts a spawned process into worker mode.
///
/// Its value is the [`Work::NAME`](crate::execute::Work::NAME) the
/// worker should serve.
pub const WORKER_ENV: &str = "MPDRIVER_WORKER";

/// Environment variable overriding the worker program.
pub const WORKER_PATH_ENV: &str = "MPDRIVER_WORKER_PATH";

/// Progress display settings.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Time between coordinator render passes (5 per second by default).
    pub render_interval: Duration,
    /// Where bars are drawn.
    pub target: RenderTarget,
    /// Line width for captured output; terminals report their own.
    pub width: u16,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            render_interval: Duration::from_millis(200),
            target: RenderTarget::default(),
            width: 100,
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker process count, `None` to run in-process.
    pub workers: Option<usize>,
    /// Program spawned for each worker. Falls back to
    /// `MPDRIVER_WORKER_PATH`, then the current executable.
    pub worker_program: Option<PathBuf>,
    pub progress: ProgressConfig,
    /// How often the result loop checks for interrupts.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: None,
            worker_program: None,
            progress: ProgressConfig::default(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ExecutorConfig {
    pub fn with_workers(workers: Option<usize>) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }
}
