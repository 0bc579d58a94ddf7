//! A single progress line.
//!
//! `ProgressBar` has no concurrency of its own. It is owned by the
//! coordinator (or the local renderer in single-process mode) and keeps
//! the authoritative state. An [`indicatif::ProgressBar`] view is synced
//! from it whenever a refresh is due.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use indicatif::{ProgressDrawTarget, ProgressState, ProgressStyle};

use super::types::{BarAttr, BarId, BarOptions, BarValue, Colour};

const PROGRESS_CHARS: &str = "█▉▊▋▌▍▎▏ ";

pub struct ProgressBar {
    id: BarId,
    options: BarOptions,
    count: u64,
    position: Option<usize>,
    last_render: Option<Instant>,
    dirty: bool,
    /// Description, colour or total changed since the view was styled.
    restyle: bool,
    closed: bool,
    view: indicatif::ProgressBar,
}

impl ProgressBar {
    pub fn new(id: BarId, options: BarOptions) -> Self {
        let view = indicatif::ProgressBar::with_draw_target(options.total, ProgressDrawTarget::hidden());
        Self {
            id,
            options,
            count: 0,
            position: None,
            last_render: None,
            dirty: true,
            restyle: true,
            closed: false,
            view,
        }
    }

    pub fn id(&self) -> BarId {
        self.id
    }

    pub fn options(&self) -> &BarOptions {
        &self.options
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn view(&self) -> &indicatif::ProgressBar {
        &self.view
    }

    /// Advance the counter by `delta`.
    pub fn update(&mut self, delta: u64) {
        if self.closed {
            return;
        }
        self.count = self.count.saturating_add(delta);
        self.dirty = true;
    }

    /// Mark the bar finished and draw its final state.
    ///
    /// A bar with `leave` keeps its last line on screen. Further
    /// mutations are ignored.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sync();
        if self.options.leave {
            self.view.finish();
        } else {
            self.view.finish_and_clear();
        }
    }

    /// Zero the counter and restart the clock, optionally with a new total.
    pub fn reset(&mut self, total: Option<u64>) {
        self.count = 0;
        self.view.reset();
        if total.is_some() {
            self.options.total = total;
            self.restyle = true;
        }
        self.dirty = true;
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.options.description = description.into();
        self.restyle = true;
        self.dirty = true;
    }

    pub fn set_colour(&mut self, colour: Option<Colour>) {
        self.options.colour = colour;
        self.restyle = true;
        self.dirty = true;
    }

    /// Assigned by the ordering pass only.
    pub fn set_position(&mut self, position: Option<usize>) {
        if self.position != position {
            self.position = position;
            self.dirty = true;
        }
    }

    pub fn get(&self, attr: BarAttr) -> BarValue {
        match attr {
            BarAttr::Total => BarValue::Total(self.options.total),
            BarAttr::Count => BarValue::Count(self.count),
            BarAttr::Description => BarValue::Description(self.options.description.clone()),
            BarAttr::Colour => BarValue::Colour(self.options.colour),
            BarAttr::Priority => BarValue::Priority(self.options.priority),
            BarAttr::Position => BarValue::Position(self.position.map(|p| p as u64)),
        }
    }

    /// Apply an attribute write. Position is owned by the layout and refused.
    pub fn set(&mut self, value: BarValue) -> Result<(), String> {
        match value {
            BarValue::Total(total) => {
                self.options.total = total;
                self.restyle = true;
            }
            BarValue::Count(count) => self.count = count,
            BarValue::Description(description) => {
                self.options.description = description;
                self.restyle = true;
            }
            BarValue::Colour(colour) => {
                self.options.colour = colour;
                self.restyle = true;
            }
            BarValue::Priority(priority) => self.options.priority = priority,
            BarValue::Position(_) => {
                return Err("position is assigned by the ordering pass".to_string());
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Whether an update-driven render is due, honouring the refresh interval bounds.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        match self.last_render {
            None => true,
            Some(last) => {
                let since = now.saturating_duration_since(last);
                (self.dirty && since >= secs(self.options.min_interval))
                    || since >= secs(self.options.max_interval)
            }
        }
    }

    /// Push the current state to the view. Unpositioned bars are not drawn.
    pub fn refresh(&mut self) {
        if self.position.is_none() {
            return;
        }
        self.sync();
        self.view.tick();
        self.last_render = Some(Instant::now());
        self.dirty = false;
    }

    fn sync(&mut self) {
        if self.restyle {
            self.view.set_style(style(&self.options));
            self.view.set_message(self.options.description.clone());
            if let Some(total) = self.options.total {
                self.view.set_length(total);
            }
            self.restyle = false;
        }
        self.view.set_position(self.count);
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Template for a bar, e.g. `desc:  42%|████▌     | 42/100 [00:00:03<00:00:04, 14.00it/s]`.
///
/// Open-ended bars show only the counter, elapsed time and rate.
pub(crate) fn template(options: &BarOptions) -> String {
    let desc = if options.description.is_empty() {
        ""
    } else {
        "{msg}: "
    };
    let (key, cells) = match options.width {
        Some(cells) => ("bar", cells.to_string()),
        None => ("wide_bar", String::new()),
    };
    let colour = options
        .colour
        .map(|c| format!(".{}", style_key(c)))
        .unwrap_or_default();
    let bar = if cells.is_empty() && colour.is_empty() {
        format!("{{{}}}", key)
    } else {
        format!("{{{}:{}{}}}", key, cells, colour)
    };

    match options.total {
        Some(_) => format!(
            "{}{{percent:>3}}%|{}| {{pos}}/{{len}} [{{elapsed_precise}}<{{eta_precise}}, {{rate}}]",
            desc, bar
        ),
        None => format!("{}{{pos}}{{unit}} [{{elapsed_precise}}, {{rate}}]", desc),
    }
}

fn style(options: &BarOptions) -> ProgressStyle {
    let template = template(options);
    let style = match ProgressStyle::with_template(&template) {
        Ok(style) => style,
        Err(e) => {
            tracing::warn!("Invalid progress template {:?}: {}", template, e);
            ProgressStyle::default_bar()
        }
    };
    let unit = options.unit.clone();
    let rate_unit = options.unit.clone();
    style
        .progress_chars(PROGRESS_CHARS)
        .with_key("unit", move |_: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = w.write_str(&unit);
        })
        .with_key("rate", move |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = write!(w, "{:.2}{}/s", state.per_sec(), rate_unit);
        })
}

/// Style name understood by indicatif templates. 24-bit colours map to
/// the nearest entry of the 256-colour cube.
fn style_key(colour: Colour) -> String {
    match colour {
        Colour::Rgb(r, g, b) => {
            let level = |c: u8| (u16::from(c) * 5 + 127) / 255;
            (16 + 36 * level(r) + 6 * level(g) + level(b)).to_string()
        }
        named => named.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::screen::{RenderTarget, Screen, SharedBuffer};

    fn bar(options: BarOptions) -> ProgressBar {
        ProgressBar::new(BarId(1), options)
    }

    #[test]
    fn test_template_with_total() {
        let t = template(&BarOptions::new("files").total(4));
        assert!(t.starts_with("{msg}: {percent:>3}%|{wide_bar}|"), "{t}");
        assert!(t.contains("{pos}/{len}"), "{t}");
        assert!(ProgressStyle::with_template(&t).is_ok());
    }

    #[test]
    fn test_template_open_ended() {
        let t = template(&BarOptions::default());
        assert_eq!(t, "{pos}{unit} [{elapsed_precise}, {rate}]");
    }

    #[test]
    fn test_template_colour_and_cells() {
        let t = template(&BarOptions::new("x").total(2).colour(Colour::Green).width(30));
        assert!(t.contains("{bar:30.green}"), "{t}");

        let t = template(&BarOptions::new("x").total(2).colour(Colour::Rgb(255, 0, 0)));
        assert!(t.contains("{wide_bar:.196}"), "{t}");
        assert!(ProgressStyle::with_template(&t).is_ok());
    }

    #[test]
    fn test_closed_bar_ignores_updates() {
        let mut b = bar(BarOptions::new("x").total(10));
        b.update(3);
        b.close();
        b.update(3);
        assert_eq!(b.count(), 3);
        assert!(b.is_closed());
        assert!(b.view().is_finished());
    }

    #[test]
    fn test_reset_replaces_total() {
        let mut b = bar(BarOptions::new("x").total(10));
        b.update(5);
        b.reset(Some(20));
        assert_eq!(b.get(BarAttr::Count), BarValue::Count(0));
        assert_eq!(b.get(BarAttr::Total), BarValue::Total(Some(20)));
    }

    #[test]
    fn test_position_cannot_be_set_directly() {
        let mut b = bar(BarOptions::default());
        assert!(b.set(BarValue::Position(Some(3))).is_err());
        assert!(b.set(BarValue::Description("d".into())).is_ok());
        assert_eq!(b.get(BarAttr::Description), BarValue::Description("d".into()));
    }

    #[test]
    fn test_refresh_requires_position() {
        let mut b = bar(BarOptions::new("x").total(4));
        b.update(1);
        b.refresh();
        assert_eq!(b.view().position(), 0);

        b.set_position(Some(0));
        b.refresh();
        assert_eq!(b.view().position(), 1);
        assert_eq!(b.view().length(), Some(4));
        assert!(!b.needs_refresh(Instant::now()));
    }

    #[test]
    fn test_leave_draws_final_line() {
        let buffer = SharedBuffer::new();
        let screen = Screen::new(&RenderTarget::Buffer(buffer.clone()), 80);
        let mut b = bar(BarOptions::new("kept").total(2).leave(true));
        screen.attach(b.view());
        b.set_position(Some(0));
        b.update(2);
        b.close();

        let out = buffer.contents();
        assert!(out.contains("kept: 100%|"), "{out}");
        assert!(out.contains("| 2/2 ["), "{out}");
    }

    #[test]
    fn test_style_key_maps_rgb_to_cube() {
        assert_eq!(style_key(Colour::Cyan), "cyan");
        assert_eq!(style_key(Colour::Rgb(0, 0, 0)), "16");
        assert_eq!(style_key(Colour::Rgb(255, 255, 255)), "231");
    }
}
