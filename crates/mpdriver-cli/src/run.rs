//! Run command implementation.
//!
//! Plans the sources, hands them to an executor and prints a summary
//! once the progress display is gone.

use std::path::PathBuf;
use std::time::Instant;

use mpdriver_apps::{MediaKinds, PlanOptions, RunApp, RunInit, plan};
use mpdriver_core::{BarOptions, ExecutionStatus, ExecutorConfig};

use crate::colors;

pub struct RunOptions {
    pub src: PathBuf,
    pub output: Option<PathBuf>,
    pub cpu: Option<usize>,
    pub overwrite: bool,
    pub add_ext: Vec<String>,
    pub chunk_size: usize,
}

pub fn execute(options: RunOptions) -> anyhow::Result<()> {
    let start = Instant::now();
    anyhow::ensure!(
        options.src.exists(),
        "source not found: {}",
        options.src.display()
    );

    let kinds = MediaKinds::with_video_extensions(&options.add_ext);
    let init = RunInit {
        chunk_size: options.chunk_size,
        video_extensions: options.add_ext.clone(),
    };
    let mut executor =
        mpdriver_core::build::<RunApp>(init, ExecutorConfig::with_workers(options.cpu))?;

    let tasks = plan(
        &PlanOptions {
            root: &options.src,
            output: options.output.as_deref(),
            overwrite: options.overwrite,
            kinds: &kinds,
        },
        &executor.progress(),
    )?;

    if tasks.is_empty() {
        drop(executor);
        println!(
            "{}No sources to process under {}.{}",
            colors::YELLOW,
            options.src.display(),
            colors::RESET
        );
        return Ok(());
    }

    let report = executor.execute_report(tasks, BarOptions::overall());
    // Tear down workers and the display before printing.
    drop(executor);

    let done: Vec<_> = report.results.iter().flatten().flatten().collect();
    let frames: u64 = done.iter().map(|s| s.frames).sum();
    let elapsed = start.elapsed().as_secs_f64();

    match report.status {
        ExecutionStatus::Completed => {
            println!(
                "{}Completed{} {} of {} sources ({} frames) in {:.2}s",
                colors::GREEN,
                colors::RESET,
                done.len(),
                report.results.len(),
                frames,
                elapsed
            );
            for summary in done.iter().filter_map(|s| s.summary.as_ref()) {
                println!("  {}{}{}", colors::DIM, summary.display(), colors::RESET);
            }
            Ok(())
        }
        ExecutionStatus::Interrupted => {
            println!(
                "{}{}Interrupted{} after {} of {} sources",
                colors::BOLD,
                colors::YELLOW,
                colors::RESET,
                done.len(),
                report.results.len()
            );
            Ok(())
        }
        ExecutionStatus::Aborted => {
            println!("{}Aborted{}", colors::RED, colors::RESET);
            match report.into_result() {
                Err(e) => Err(e.into()),
                Ok(_) => Err(mpdriver_core::Error::Aborted.into()),
            }
        }
    }
}
