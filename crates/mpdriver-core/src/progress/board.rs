//! Live bars, their layout and the screen they render into.
//!
//! Shared by the coordinator's render loop and the in-process renderer.
//! The layout is the only authority on order; the screen is re-arranged
//! to match it after every pass that moved a bar.

use std::time::Instant;

use rustc_hash::FxHashMap;

use super::bar::ProgressBar;
use super::layout::{Layout, OrderKey};
use super::screen::Screen;
use super::types::{BarAttr, BarId, BarOptions, BarValue, ProgressOp};

pub(crate) struct Board {
    bars: FxHashMap<BarId, ProgressBar>,
    layout: Layout,
    screen: Screen,
    /// Order the screen was last arranged in.
    arranged: Vec<BarId>,
}

impl Board {
    pub(crate) fn new(screen: Screen) -> Self {
        Self {
            bars: FxHashMap::default(),
            layout: Layout::new(),
            screen,
            arranged: Vec::new(),
        }
    }

    pub(crate) fn contains(&self, id: BarId) -> bool {
        self.bars.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.bars.len()
    }

    pub(crate) fn get(&self, id: BarId, attr: BarAttr) -> Option<BarValue> {
        self.bars.get(&id).map(|bar| bar.get(attr))
    }

    /// Instantiate a bar and queue it for the next layout pass.
    pub(crate) fn create(&mut self, id: BarId, options: BarOptions, created_at: Instant) {
        self.layout
            .insert(OrderKey::new(options.priority, created_at, id));
        self.bars.insert(id, ProgressBar::new(id, options));
    }

    /// Apply one mutating operation to a live bar.
    ///
    /// Returns a message for operations the bar refuses.
    pub(crate) fn apply(&mut self, id: BarId, op: ProgressOp) -> Result<(), String> {
        if let ProgressOp::Close = op {
            self.close(id);
            return Ok(());
        }

        let Some(bar) = self.bars.get_mut(&id) else {
            return Err(format!("{} does not exist", id));
        };

        match op {
            ProgressOp::Update { delta } => bar.update(delta),
            ProgressOp::Reset { total } => bar.reset(total),
            ProgressOp::SetDescription(description) => bar.set_description(description),
            ProgressOp::SetColour(colour) => bar.set_colour(colour),
            ProgressOp::SetAttr(BarValue::Priority(priority)) => {
                bar.set(BarValue::Priority(priority))?;
                self.layout.reprioritize(id, priority);
            }
            ProgressOp::SetAttr(value) => bar.set(value)?,
            other => return Err(format!("'{}' is not a bar mutation", other.name())),
        }
        Ok(())
    }

    fn close(&mut self, id: BarId) {
        self.layout.remove(id);
        self.arranged.retain(|other| *other != id);
        if let Some(mut bar) = self.bars.remove(&id) {
            if bar.position().is_none() && bar.options().leave {
                // Never drawn; attach so the final line still shows.
                self.screen.attach(bar.view());
            }
            bar.close();
            if !bar.options().leave {
                self.screen.detach(bar.view());
            }
        }
    }

    /// Print a line above the live region.
    pub(crate) fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.screen.write_line(line)
    }

    /// Run the ordering pass, assign positions, then redraw.
    ///
    /// Positions are all assigned and the screen re-arranged before any
    /// bar is drawn, so two bars never share a row mid-update. With
    /// `force` every bar is redrawn.
    pub(crate) fn redraw(&mut self, force: bool) {
        let order: Vec<BarId> = self.layout.settle().iter().map(|k| k.id).collect();

        let mut moved = Vec::with_capacity(order.len());
        for (pos, id) in order.iter().enumerate() {
            if let Some(bar) = self.bars.get_mut(id) {
                moved.push(bar.position() != Some(pos));
                bar.set_position(Some(pos));
            } else {
                moved.push(false);
            }
        }

        if order != self.arranged {
            let views = order.iter().filter_map(|id| self.bars.get(id)).map(|bar| bar.view());
            self.screen.arrange(views);
            self.arranged = order.clone();
        }

        let now = Instant::now();
        for (id, moved) in order.iter().zip(moved) {
            if let Some(bar) = self.bars.get_mut(id)
                && (force || moved || bar.needs_refresh(now))
            {
                bar.refresh();
            }
        }
    }

    /// Close every bar, leaving only the lines of bars that asked to stay.
    pub(crate) fn close_all(&mut self) {
        let mut ids: Vec<BarId> = self.layout.order().iter().map(|k| k.id).collect();
        for id in self.bars.keys() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        for id in ids {
            self.close(id);
        }
        self.redraw(true);
    }

    /// Screen positions by bar id, as of the last pass.
    pub(crate) fn positions(&self) -> Vec<(BarId, usize)> {
        self.layout
            .order()
            .iter()
            .enumerate()
            .map(|(pos, k)| (k.id, pos))
            .collect()
    }
}
