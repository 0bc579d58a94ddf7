//! The terminal region live bars are drawn into.
//!
//! Drawing is delegated to an [`indicatif::MultiProgress`]. The board
//! decides the order; the screen only mirrors it by re-inserting bars
//! whenever the settled order changes.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressDrawTarget, TermLike};
use parking_lot::Mutex;

/// Where rendered bars go.
#[derive(Clone, Default)]
pub enum RenderTarget {
    #[default]
    Stderr,
    Stdout,
    /// Render nothing.
    Hidden,
    /// Capture output in memory.
    Buffer(SharedBuffer),
}

impl fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderTarget::Stderr => f.write_str("Stderr"),
            RenderTarget::Stdout => f.write_str("Stdout"),
            RenderTarget::Hidden => f.write_str("Hidden"),
            RenderTarget::Buffer(_) => f.write_str("Buffer"),
        }
    }
}

/// Cloneable in-memory sink.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    fn push(&self, s: &str) {
        self.0.lock().extend_from_slice(s.as_bytes());
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedBuffer").field(&self.0.lock().len()).finish()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A fixed-width terminal that appends every drawn line to a buffer.
///
/// Cursor movement is dropped, so the buffer reads as a log of frames.
#[derive(Debug)]
struct CaptureTerm {
    buffer: SharedBuffer,
    width: u16,
}

impl TermLike for CaptureTerm {
    fn width(&self) -> u16 {
        self.width
    }

    fn move_cursor_up(&self, _n: usize) -> io::Result<()> {
        Ok(())
    }

    fn move_cursor_down(&self, _n: usize) -> io::Result<()> {
        Ok(())
    }

    fn move_cursor_right(&self, _n: usize) -> io::Result<()> {
        Ok(())
    }

    fn move_cursor_left(&self, _n: usize) -> io::Result<()> {
        Ok(())
    }

    fn write_line(&self, s: &str) -> io::Result<()> {
        self.buffer.push(s);
        self.buffer.push("\n");
        Ok(())
    }

    fn write_str(&self, s: &str) -> io::Result<()> {
        self.buffer.push(s);
        Ok(())
    }

    fn clear_line(&self) -> io::Result<()> {
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

fn draw_target(target: &RenderTarget, width: u16) -> ProgressDrawTarget {
    match target {
        RenderTarget::Stderr => ProgressDrawTarget::stderr(),
        RenderTarget::Stdout => ProgressDrawTarget::stdout(),
        RenderTarget::Hidden => ProgressDrawTarget::hidden(),
        RenderTarget::Buffer(buffer) => ProgressDrawTarget::term_like(Box::new(CaptureTerm {
            buffer: buffer.clone(),
            width,
        })),
    }
}

/// The live region: one [`MultiProgress`] and the target it draws to.
pub struct Screen {
    multi: MultiProgress,
    target: RenderTarget,
}

impl Screen {
    /// `width` only applies to captured output; terminals report their own.
    pub fn new(target: &RenderTarget, width: u16) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(draw_target(target, width)),
            target: target.clone(),
        }
    }

    /// Replace the region's rows with `views`, top to bottom.
    pub(crate) fn arrange<'a>(&self, views: impl IntoIterator<Item = &'a indicatif::ProgressBar>) {
        let views: Vec<_> = views.into_iter().collect();
        for view in &views {
            self.multi.remove(view);
        }
        for view in views {
            self.multi.add(view.clone());
        }
    }

    /// Attach a bar below the current rows.
    pub(crate) fn attach(&self, view: &indicatif::ProgressBar) {
        self.multi.add(view.clone());
    }

    /// Take a bar out of the region. Lines of a finished bar are left alone.
    pub(crate) fn detach(&self, view: &indicatif::ProgressBar) {
        self.multi.remove(view);
    }

    /// Print a permanent line above the region.
    ///
    /// When the region is hidden because the stream is not a terminal,
    /// the line still goes to that stream.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        if !self.multi.is_hidden() {
            return self.multi.println(line);
        }
        match &self.target {
            RenderTarget::Stderr => writeln!(io::stderr().lock(), "{}", line),
            RenderTarget::Stdout => writeln!(io::stdout().lock(), "{}", line),
            RenderTarget::Buffer(buffer) => {
                buffer.push(line);
                buffer.push("\n");
                Ok(())
            }
            RenderTarget::Hidden => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_line_reaches_buffer() {
        let buffer = SharedBuffer::new();
        let screen = Screen::new(&RenderTarget::Buffer(buffer.clone()), 80);

        screen.write_line("hello").unwrap();
        assert!(buffer.contents().contains("hello"));
    }

    #[test]
    fn test_hidden_target_discards_lines() {
        let screen = Screen::new(&RenderTarget::Hidden, 80);
        screen.write_line("nothing").unwrap();
    }

    #[test]
    fn test_attached_bar_is_drawn() {
        let buffer = SharedBuffer::new();
        let screen = Screen::new(&RenderTarget::Buffer(buffer.clone()), 80);
        let view = indicatif::ProgressBar::with_draw_target(Some(3), ProgressDrawTarget::hidden());
        view.set_style(indicatif::ProgressStyle::with_template("row {pos}/{len}").unwrap());

        screen.attach(&view);
        view.set_position(2);
        view.finish();

        assert!(buffer.contents().contains("row 2/3"), "{}", buffer.contents());
    }
}
