//! Screen ordering of live bars.
//!
//! The displayed order is kept as a FIFO sequence that is always sorted
//! by [`OrderKey`]. Bars created since the last pass wait in a min-heap.
//! Each pass merges the two with a two-pointer walk, drops bars closed
//! in the meantime, and hands back the new order. Index in that order is
//! the bar's screen position, so positions are always `0..k`.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

use rustc_hash::FxHashSet;

use super::types::BarId;

/// Ordering key: priority, then creation time, then id.
#[derive(Debug, Clone, Copy)]
pub struct OrderKey {
    pub priority: f64,
    pub created_at: Instant,
    pub id: BarId,
}

impl OrderKey {
    pub fn new(priority: f64, created_at: Instant, id: BarId) -> Self {
        Self {
            priority,
            created_at,
            id,
        }
    }
}

impl PartialEq for OrderKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderKey {}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Displayed order plus the pending changes for the next pass.
#[derive(Debug, Default)]
pub struct Layout {
    displayed: VecDeque<OrderKey>,
    created: BinaryHeap<Reverse<OrderKey>>,
    /// Ids to drop from both streams on the next pass.
    closed: FxHashSet<BarId>,
    /// Ids whose displayed entry is stale because they were re-queued.
    requeued: FxHashSet<BarId>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a newly created bar for the next pass.
    pub fn insert(&mut self, key: OrderKey) {
        self.created.push(Reverse(key));
    }

    /// Mark a bar as closed; it disappears on the next pass.
    pub fn remove(&mut self, id: BarId) {
        self.closed.insert(id);
    }

    /// Move a bar to a new priority, keeping its creation time.
    ///
    /// Returns `false` if the bar is not known to the layout.
    pub fn reprioritize(&mut self, id: BarId, priority: f64) -> bool {
        let pending: Vec<OrderKey> = self.created.drain().map(|Reverse(k)| k).collect();
        let mut found = None;
        for key in pending {
            if key.id == id {
                found = Some(key);
            } else {
                self.created.push(Reverse(key));
            }
        }

        if found.is_none() && !self.requeued.contains(&id) {
            found = self.displayed.iter().find(|k| k.id == id).copied();
            if found.is_some() {
                self.requeued.insert(id);
            }
        }

        match found {
            Some(key) => {
                self.created
                    .push(Reverse(OrderKey::new(priority, key.created_at, id)));
                true
            }
            None => false,
        }
    }

    /// Merge pending creations into the displayed order and drop closed bars.
    ///
    /// Returns the settled order; a bar's index is its screen position.
    pub fn settle(&mut self) -> &VecDeque<OrderKey> {
        let mut previous = std::mem::take(&mut self.displayed);
        let mut next = VecDeque::with_capacity(previous.len() + self.created.len());

        let mut ordered = self.pop_displayed(&mut previous);
        let mut created = self.created.pop().map(|Reverse(k)| k);

        loop {
            let item = match (ordered, created) {
                (None, None) => break,
                (Some(o), Some(c)) if o <= c => {
                    ordered = self.pop_displayed(&mut previous);
                    o
                }
                (Some(o), None) => {
                    ordered = self.pop_displayed(&mut previous);
                    o
                }
                (_, Some(c)) => {
                    created = self.created.pop().map(|Reverse(k)| k);
                    c
                }
            };

            if !self.closed.contains(&item.id) {
                next.push_back(item);
            }
        }

        self.closed.clear();
        self.requeued.clear();
        self.displayed = next;
        &self.displayed
    }

    /// Current displayed order, as of the last pass.
    pub fn order(&self) -> &VecDeque<OrderKey> {
        &self.displayed
    }

    /// Screen position of a bar, as of the last pass.
    pub fn position_of(&self, id: BarId) -> Option<usize> {
        self.displayed.iter().position(|k| k.id == id)
    }

    /// Number of bars on screen after the last pass.
    pub fn len(&self) -> usize {
        self.displayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.displayed.is_empty()
    }

    fn pop_displayed(&self, previous: &mut VecDeque<OrderKey>) -> Option<OrderKey> {
        while let Some(key) = previous.pop_front() {
            if !self.requeued.contains(&key.id) {
                return Some(key);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(priority: f64, base: Instant, offset_ms: u64, id: u64) -> OrderKey {
        OrderKey::new(priority, base + Duration::from_millis(offset_ms), BarId(id))
    }

    fn ids(layout: &Layout) -> Vec<u64> {
        layout.order().iter().map(|k| k.id.0).collect()
    }

    #[test]
    fn test_creations_settle_in_priority_order() {
        let base = Instant::now();
        let mut layout = Layout::new();
        layout.insert(key(3.0, base, 0, 1));
        layout.insert(key(1.0, base, 1, 2));
        layout.insert(key(2.0, base, 2, 3));

        layout.settle();

        assert_eq!(ids(&layout), vec![2, 3, 1]);
        assert_eq!(layout.position_of(BarId(2)), Some(0));
    }

    #[test]
    fn test_existing_bars_keep_relative_order() {
        let base = Instant::now();
        let mut layout = Layout::new();
        layout.insert(key(0.0, base, 0, 1));
        layout.insert(key(0.0, base, 1, 2));
        layout.settle();

        layout.insert(key(0.0, base, 2, 3));
        layout.insert(key(-1.0, base, 3, 4));
        layout.settle();

        assert_eq!(ids(&layout), vec![4, 1, 2, 3]);
    }

    #[test]
    fn test_equal_keys_fall_back_to_insertion_order() {
        let base = Instant::now();
        let mut layout = Layout::new();
        for id in 1..=4 {
            layout.insert(key(5.0, base, 0, id));
        }
        layout.settle();
        assert_eq!(ids(&layout), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_positions_stay_contiguous_after_closes() {
        let base = Instant::now();
        let mut layout = Layout::new();
        for id in 1..=6 {
            layout.insert(key(id as f64, base, id, id));
        }
        layout.settle();

        layout.remove(BarId(2));
        layout.remove(BarId(5));
        layout.insert(key(2.5, base, 10, 7));
        layout.settle();

        assert_eq!(ids(&layout), vec![1, 7, 3, 4, 6]);
        let positions: Vec<usize> = layout
            .order()
            .iter()
            .map(|k| layout.position_of(k.id).unwrap())
            .collect();
        assert_eq!(positions, (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn test_bar_closed_before_first_pass_never_shows() {
        let base = Instant::now();
        let mut layout = Layout::new();
        layout.insert(key(1.0, base, 0, 1));
        layout.insert(key(2.0, base, 1, 2));
        layout.remove(BarId(1));
        layout.settle();

        assert_eq!(ids(&layout), vec![2]);
    }

    #[test]
    fn test_reprioritize_moves_displayed_bar() {
        let base = Instant::now();
        let mut layout = Layout::new();
        layout.insert(key(1.0, base, 0, 1));
        layout.insert(key(2.0, base, 1, 2));
        layout.insert(key(3.0, base, 2, 3));
        layout.settle();

        assert!(layout.reprioritize(BarId(3), 0.0));
        layout.settle();
        assert_eq!(ids(&layout), vec![3, 1, 2]);

        assert!(!layout.reprioritize(BarId(42), 0.0));
    }

    #[test]
    fn test_reprioritize_pending_bar() {
        let base = Instant::now();
        let mut layout = Layout::new();
        layout.insert(key(1.0, base, 0, 1));
        layout.insert(key(2.0, base, 1, 2));

        assert!(layout.reprioritize(BarId(2), 0.5));
        layout.settle();
        assert_eq!(ids(&layout), vec![2, 1]);
    }

    #[test]
    fn test_empty_settle() {
        let mut layout = Layout::new();
        assert!(layout.settle().is_empty());
        assert!(layout.is_empty());
    }
}
