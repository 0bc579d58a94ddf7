//! Executor tests against real worker processes.
//!
//! Workers are this crate's binary re-executed in worker mode.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use mpdriver_apps::{RunApp, RunArgs, RunInit};
use mpdriver_core::progress::RenderTarget;
use mpdriver_core::{
    BarOptions, Error, ExecutionStatus, Executor, ExecutorConfig, ProcessExecutor, ProgressConfig,
};
use tempfile::TempDir;

fn config(workers: usize) -> ExecutorConfig {
    ExecutorConfig {
        workers: Some(workers),
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_mpdriver"))),
        progress: ProgressConfig {
            target: RenderTarget::Hidden,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn executor(workers: usize) -> ProcessExecutor<RunApp> {
    let init = RunInit {
        chunk_size: 8,
        video_extensions: vec![],
    };
    ProcessExecutor::new(init, config(workers)).unwrap()
}

fn task(source: &Path) -> RunArgs {
    RunArgs {
        source: source.to_path_buf(),
        summary: None,
        description_width: 0,
    }
}

/// `n` clips where clip `i` is `8 * (i + 1)` bytes long.
fn clips(dir: &Path, n: usize) -> Vec<PathBuf> {
    (0..n)
        .map(|i| {
            let path = dir.join(format!("clip{:02}.mp4", i));
            fs::write(&path, vec![i as u8; 8 * (i + 1)]).unwrap();
            path
        })
        .collect()
}

#[test]
fn test_results_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let sources = clips(dir.path(), 9);
    let mut pool = executor(3);
    assert_eq!(pool.worker_pids().len(), 3);

    let results = pool
        .execute(sources.iter().map(|s| task(s)).collect(), BarOptions::overall())
        .unwrap();

    assert_eq!(results.len(), 9);
    for (i, result) in results.into_iter().enumerate() {
        let summary = result.flatten().unwrap();
        assert_eq!(summary.source, sources[i]);
        assert_eq!(summary.frames, (i + 1) as u64);
    }
    assert!(pool.coordinator_stats().count("create") >= 10);
}

#[test]
fn test_empty_batch() {
    let mut pool = executor(2);
    let results = pool.execute(Vec::new(), BarOptions::overall()).unwrap();
    assert!(results.is_empty());

    // The pool is still usable afterwards.
    let dir = TempDir::new().unwrap();
    let sources = clips(dir.path(), 1);
    let results = pool
        .execute(vec![task(&sources[0])], BarOptions::overall())
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[test]
fn test_failed_task_aborts() {
    let dir = TempDir::new().unwrap();
    let mut sources = clips(dir.path(), 5);
    sources[2] = dir.path().join("missing.mp4");

    let mut pool = executor(2);
    let err = pool
        .execute(sources.iter().map(|s| task(s)).collect(), BarOptions::overall())
        .unwrap_err();
    assert!(matches!(err, Error::Task { index: 2, ref message } if message.contains("cannot open")));

    let again = pool.execute(vec![task(&sources[0])], BarOptions::overall());
    assert!(matches!(again, Err(Error::Cancelled)));
}

#[cfg(unix)]
#[test]
fn test_cancel_kills_blocked_workers() {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let dir = TempDir::new().unwrap();
    // Opening a FIFO for reading blocks until a writer shows up.
    let fifo = dir.path().join("stuck.mp4");
    let c_path = CString::new(fifo.as_os_str().as_bytes()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

    let mut pool = executor(2);
    let pids = pool.worker_pids();
    let flag = pool.cancellation();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        flag.cancel();
    });

    let started = Instant::now();
    let report = pool.execute_report(vec![task(&fifo), task(&fifo)], BarOptions::overall());
    canceller.join().unwrap();

    assert_eq!(report.status, ExecutionStatus::Interrupted);
    assert!(report.results.iter().all(Option::is_none));
    assert!(started.elapsed() < Duration::from_secs(10));

    for pid in pids {
        assert_ne!(unsafe { libc::kill(pid as libc::pid_t, 0) }, 0, "worker {} survived", pid);
    }
    assert_eq!(pool.live_workers(), 0);
}
