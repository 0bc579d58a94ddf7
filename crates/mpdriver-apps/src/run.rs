//! The `run` app: stream every frame of every source through a bar.
//!
//! Sources are planned in the main process ([`plan`]), then each one is
//! a task. A task reads its frames, folds them into per-frame statistics
//! and writes a JSON summary next to the other outputs.

use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use anyhow::Context;
use mpdriver_core::progress::status_label;
use mpdriver_core::{BarOptions, Colour, ProgressHandle, TaskContext, Work};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::media::{MediaKinds, display_width, pad_to_width};

/// Default bytes per frame when a source is a video container.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Extension of the written summaries.
pub const SUMMARY_EXTENSION: &str = "json";

/// Per-worker construction input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInit {
    /// Bytes per frame for video containers.
    pub chunk_size: usize,
    /// Extra video extensions, so workers classify like the planner.
    pub video_extensions: Vec<String>,
}

impl Default for RunInit {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            video_extensions: Vec::new(),
        }
    }
}

/// One source to process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArgs {
    pub source: PathBuf,
    /// Where the summary goes, `None` to only read the source.
    pub summary: Option<PathBuf>,
    /// Display width the bar description is padded to.
    pub description_width: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub bytes: u64,
    pub mean: f64,
    pub digest: u64,
}

/// What a processed source produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    pub summary: Option<PathBuf>,
}

#[derive(Serialize)]
struct SummaryFile<'a> {
    source: &'a Path,
    frames: &'a [FrameStats],
}

pub struct RunApp {
    kinds: MediaKinds,
    chunk_size: usize,
}

impl Work for RunApp {
    const NAME: &'static str = "run";
    type Init = RunInit;
    type Args = RunArgs;
    /// `None` when the source was skipped or the run was interrupted.
    type Output = Option<SourceSummary>;

    fn init(init: RunInit) -> anyhow::Result<Self> {
        if init.chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        Ok(Self {
            kinds: MediaKinds::with_video_extensions(&init.video_extensions),
            chunk_size: init.chunk_size,
        })
    }

    fn run(&mut self, args: RunArgs, ctx: &TaskContext) -> anyhow::Result<Option<SourceSummary>> {
        let frames = self
            .kinds
            .frames(&args.source, self.chunk_size)
            .with_context(|| format!("cannot open {}", args.source.display()))?;
        let total = frames.size_hint().0 as u64;

        let source = args.source.display().to_string();
        let options = BarOptions::new(pad_to_width(&source, args.description_width))
            .total(total)
            .priority(0.0)
            .unit("f");
        let mut proxy = ctx.progress().wrap(frames, options)?;

        let mut stats = Vec::with_capacity(total as usize);
        let mut interrupted = false;
        for frame in &mut proxy {
            if ctx.is_cancelled() {
                interrupted = true;
                break;
            }
            let frame = frame.with_context(|| format!("cannot read a frame of {}", source))?;
            stats.push(frame_stats(&frame));
        }
        proxy.close()?;

        if interrupted {
            tracing::debug!("Stopped {} after {} frames", source, stats.len());
            return Ok(None);
        }

        if stats.is_empty() {
            ctx.progress()
                .write(format!("skip at {} because it has no frames", source))?;
            return Ok(None);
        }

        if let Some(path) = &args.summary {
            let _io = ctx.io_lock().lock();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
            let file = SummaryFile {
                source: &args.source,
                frames: &stats,
            };
            fs::write(path, serde_json::to_vec_pretty(&file)?)
                .with_context(|| format!("cannot write {}", path.display()))?;
        }

        Ok(Some(SourceSummary {
            frames: stats.len() as u64,
            bytes: stats.iter().map(|s| s.bytes).sum(),
            source: args.source,
            summary: args.summary,
        }))
    }
}

fn frame_stats(frame: &[u8]) -> FrameStats {
    let sum: u64 = frame.iter().map(|&b| u64::from(b)).sum();
    let mut hasher = FxHasher::default();
    hasher.write(frame);
    FrameStats {
        bytes: frame.len() as u64,
        mean: if frame.is_empty() {
            0.0
        } else {
            sum as f64 / frame.len() as f64
        },
        digest: hasher.finish(),
    }
}

/// Inputs for planning a run.
#[derive(Debug, Clone)]
pub struct PlanOptions<'a> {
    pub root: &'a Path,
    pub output: Option<&'a Path>,
    pub overwrite: bool,
    pub kinds: &'a MediaKinds,
}

/// Discover the sources under `root` and build one task per source
/// that still has work to do, behind a `Searching...` bar.
///
/// With an output directory, a source whose summary already exists is
/// dropped unless `overwrite` is set. Descriptions are padded to the
/// widest source path.
pub fn plan(options: &PlanOptions<'_>, progress: &ProgressHandle) -> anyhow::Result<Vec<RunArgs>> {
    let sources = options
        .kinds
        .discover(options.root)
        .with_context(|| format!("cannot search {}", options.root.display()))?;

    let searching = BarOptions::new(status_label("Searching..."))
        .colour(Colour::Cyan)
        .priority(1.0);
    let mut proxy = progress.wrap(sources, searching)?;

    let mut tasks = Vec::new();
    for source in &mut proxy {
        let summary = options.output.map(|dir| summary_path(dir, options.root, &source));
        if let Some(path) = &summary
            && !options.overwrite
            && path.exists()
        {
            tracing::debug!("{} exists; skipping", path.display());
            continue;
        }
        tasks.push(RunArgs {
            source,
            summary,
            description_width: 0,
        });
    }
    proxy.close()?;

    let width = tasks
        .iter()
        .map(|t| display_width(&t.source.display().to_string()))
        .max()
        .unwrap_or(0);
    for task in &mut tasks {
        task.description_width = width;
    }
    Ok(tasks)
}

/// Summary location for `source`: its path relative to `root`, under
/// `output`, with the summary extension.
pub fn summary_path(output: &Path, root: &Path, source: &Path) -> PathBuf {
    let relative = match source.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("source")),
    };
    output.join(relative).with_extension(SUMMARY_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpdriver_core::execute::IoLock;
    use mpdriver_core::progress::{RenderTarget, SharedBuffer};
    use mpdriver_core::{CancellationFlag, ProgressConfig};

    fn ctx_with(buffer: &SharedBuffer) -> TaskContext {
        let progress = ProgressHandle::local(&ProgressConfig {
            target: RenderTarget::Buffer(buffer.clone()),
            ..Default::default()
        });
        TaskContext::new(progress, CancellationFlag::new(), None, IoLock::new())
    }

    fn app() -> RunApp {
        RunApp::init(RunInit {
            chunk_size: 4,
            video_extensions: vec![],
        })
        .unwrap()
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let init = RunInit {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(RunApp::init(init).is_err());
    }

    #[test]
    fn test_run_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        fs::write(&clip, [1u8; 10]).unwrap();
        let out = dir.path().join("out/clip.json");

        let buffer = SharedBuffer::new();
        let summary = app()
            .run(
                RunArgs {
                    source: clip.clone(),
                    summary: Some(out.clone()),
                    description_width: 0,
                },
                &ctx_with(&buffer),
            )
            .unwrap()
            .unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.bytes, 10);
        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&out).unwrap()).unwrap();
        assert_eq!(written["frames"].as_array().unwrap().len(), 3);
        assert_eq!(written["frames"][0]["mean"], 1.0);
    }

    #[test]
    fn test_empty_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let seq = dir.path().join("empty");
        fs::create_dir(&seq).unwrap();

        let buffer = SharedBuffer::new();
        let out = app()
            .run(
                RunArgs {
                    source: seq.clone(),
                    summary: Some(dir.path().join("empty.json")),
                    description_width: 0,
                },
                &ctx_with(&buffer),
            )
            .unwrap();

        assert!(out.is_none());
        assert!(!dir.path().join("empty.json").exists());
        assert!(buffer.contents().contains("skip at"));
    }

    #[test]
    fn test_missing_source_fails() {
        let buffer = SharedBuffer::new();
        let err = app()
            .run(
                RunArgs {
                    source: PathBuf::from("/nonexistent/clip.mp4"),
                    summary: None,
                    description_width: 0,
                },
                &ctx_with(&buffer),
            )
            .unwrap_err();
        assert!(format!("{:#}", err).contains("cannot open"));
    }

    #[test]
    fn test_plan_skips_existing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("in");
        let output = dir.path().join("out");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.mp4"), b"a").unwrap();
        fs::write(root.join("bb.mp4"), b"b").unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("a.json"), b"{}").unwrap();

        let kinds = MediaKinds::default();
        let progress = ProgressHandle::local(&ProgressConfig {
            target: RenderTarget::Hidden,
            ..Default::default()
        });
        let mut options = PlanOptions {
            root: &root,
            output: Some(&output),
            overwrite: false,
            kinds: &kinds,
        };

        let tasks = plan(&options, &progress).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source, root.join("bb.mp4"));
        assert_eq!(tasks[0].summary, Some(output.join("bb.json")));

        options.overwrite = true;
        let tasks = plan(&options, &progress).unwrap();
        assert_eq!(tasks.len(), 2);
        let widest = display_width(&root.join("bb.mp4").display().to_string());
        assert!(tasks.iter().all(|t| t.description_width == widest));
    }

    #[test]
    fn test_summary_path() {
        let out = Path::new("/out");
        assert_eq!(
            summary_path(out, Path::new("/in"), Path::new("/in/x/seq")),
            PathBuf::from("/out/x/seq.json")
        );
        assert_eq!(
            summary_path(out, Path::new("/in/clip.mp4"), Path::new("/in/clip.mp4")),
            PathBuf::from("/out/clip.json")
        );
    }
}
