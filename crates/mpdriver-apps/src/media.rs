//! Media source discovery.
//!
//! A source is either a video file or a directory whose entries are all
//! images (a frame sequence). Classification is by file extension only.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use unicode_width::UnicodeWidthStr;

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "mkv", "webm", "wmv", "flv", "m4v", "mpg", "mpeg", "3gp", "ts",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "webp", "ppm", "pgm",
];

/// Extension tables used to classify files.
#[derive(Debug, Clone)]
pub struct MediaKinds {
    video: FxHashSet<String>,
    image: FxHashSet<String>,
}

impl Default for MediaKinds {
    fn default() -> Self {
        Self {
            video: VIDEO_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            image: IMAGE_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl MediaKinds {
    /// Default tables plus extra video extensions (`mts` or `.mts`).
    pub fn with_video_extensions<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kinds = Self::default();
        for ext in extra {
            kinds.add_video_extension(ext.as_ref());
        }
        kinds
    }

    pub fn add_video_extension(&mut self, ext: &str) {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        if !ext.is_empty() {
            self.video.insert(ext);
        }
    }

    pub fn is_video(&self, path: &Path) -> bool {
        extension(path).is_some_and(|e| self.video.contains(&e))
    }

    pub fn is_image(&self, path: &Path) -> bool {
        extension(path).is_some_and(|e| self.image.contains(&e))
    }

    /// Every source under `root`, sorted.
    ///
    /// `root` itself counts when it is a video file or a frame directory.
    /// Empty directories count as frame directories with no frames.
    pub fn discover(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if root.is_file() {
            if self.is_video(root) {
                found.push(root.to_path_buf());
            }
            return Ok(found);
        }
        self.walk(root, &mut found)?;
        found.sort();
        Ok(found)
    }

    /// Symlinked files count; symlinked directories are not descended into.
    fn walk(&self, dir: &Path, found: &mut Vec<PathBuf>) -> io::Result<()> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            entries.push((entry.path(), entry.file_type()?.is_symlink()));
        }

        if entries.iter().all(|(p, _)| p.is_file() && self.is_image(p)) {
            found.push(dir.to_path_buf());
        }
        for (entry, symlink) in entries {
            if entry.is_dir() {
                if symlink {
                    tracing::debug!("Not following symlinked directory {}", entry.display());
                } else {
                    self.walk(&entry, found)?;
                }
            } else if self.is_video(&entry) {
                found.push(entry);
            }
        }
        Ok(())
    }

    /// Frames of one source.
    pub fn frames(&self, source: &Path, chunk_size: usize) -> io::Result<Frames> {
        if source.is_dir() {
            let mut images = Vec::new();
            for entry in fs::read_dir(source)? {
                let path = entry?.path();
                if self.is_image(&path) {
                    images.push(path);
                }
            }
            images.sort();
            return Ok(Frames::Images(images.into_iter()));
        }

        let chunk_size = chunk_size.max(1);
        let len = fs::metadata(source)?.len();
        Ok(Frames::Chunks {
            reader: BufReader::new(File::open(source)?),
            chunk_size,
            remaining: len.div_ceil(chunk_size as u64) as usize,
        })
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Raw frames of a source: one image file each, or fixed-size chunks of
/// a video container.
pub enum Frames {
    Images(std::vec::IntoIter<PathBuf>),
    Chunks {
        reader: BufReader<File>,
        chunk_size: usize,
        remaining: usize,
    },
}

impl Iterator for Frames {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Frames::Images(paths) => paths.next().map(fs::read),
            Frames::Chunks {
                reader,
                chunk_size,
                remaining,
            } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                let mut chunk = Vec::with_capacity(*chunk_size);
                match reader.by_ref().take(*chunk_size as u64).read_to_end(&mut chunk) {
                    Ok(0) => {
                        *remaining = 0;
                        None
                    }
                    Ok(_) => Some(Ok(chunk)),
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = match self {
            Frames::Images(paths) => paths.len(),
            Frames::Chunks { remaining, .. } => *remaining,
        };
        (n, Some(n))
    }
}

/// Terminal columns `text` occupies.
pub fn display_width(text: &str) -> usize {
    UnicodeWidthStr::width(text)
}

/// Left-align `text` in `width` display columns.
pub fn pad_to_width(text: &str, width: usize) -> String {
    let used = display_width(text);
    let mut padded = text.to_string();
    padded.extend(std::iter::repeat_n(' ', width.saturating_sub(used)));
    padded
}
