//! mpdriver CLI - batch processing of media sources over worker processes.

mod colors;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mpdriver")]
#[command(about = "Process media sources in parallel with one progress display")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream every frame of the sources under SRC and write summaries
    Run {
        /// Video file, or a directory of videos and image sequences
        src: PathBuf,

        /// Directory the per-source JSON summaries are written to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of worker processes (in-process when omitted)
        #[arg(short = 'p', long)]
        cpu: Option<usize>,

        /// Replace summaries that already exist
        #[arg(long)]
        overwrite: bool,

        /// Extra file extension to treat as video (repeatable)
        #[arg(long = "add-ext", value_name = "EXT")]
        add_ext: Vec<String>,

        /// Bytes per frame when reading video containers
        #[arg(long, default_value_t = mpdriver_apps::run::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    // Stdout belongs to the worker protocol and the summary.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    if let Some(name) = mpdriver_core::worker::requested() {
        init_tracing(false);
        mpdriver_apps::serve_worker(&name)?;
        return Ok(());
    }

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let format_error = |err: anyhow::Error| -> anyhow::Error {
        match err.downcast_ref::<mpdriver_core::Error>() {
            Some(mpdriver_core::Error::Task { index, message }) => {
                anyhow::anyhow!("task {} failed: {}", index, message)
            }
            _ => err,
        }
    };

    match cli.command {
        Commands::Run {
            src,
            output,
            cpu,
            overwrite,
            add_ext,
            chunk_size,
        } => run::execute(run::RunOptions {
            src,
            output,
            cpu,
            overwrite,
            add_ext,
            chunk_size,
        })
        .map_err(format_error)?,
    }

    Ok(())
}
