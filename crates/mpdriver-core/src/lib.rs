//! Multi-process batch execution with one ordered progress display.
//!
//! This crate provides:
//! - A progress coordinator that owns every bar and orders them on screen
//! - Progress handles and iterator proxies for the main process and workers
//! - Direct and multi-process executors behind one [`Executor`] trait
//! - Cancellation on SIGINT with forced worker teardown

pub mod config;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod progress;
pub mod signal;
pub mod worker;

pub use config::{ExecutorConfig, ProgressConfig};
pub use error::{Error, Result};
pub use execute::{
    CancellationFlag, DirectExecutor, ExecutionReport, ExecutionStatus, Executor, ProcessExecutor,
    TaskContext, Work, build,
};
pub use progress::{
    BarHandle, BarOptions, Colour, Coordinator, ProgressHandle, Proxy, RenderTarget,
};
