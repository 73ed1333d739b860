//! Work items and the position container
//!
//! A `PositionContainer` holds the ordered list of work items one dispatcher
//! cycles through. The layout itself is fixed for the whole run; only the
//! per-run status fields change while IO is in flight, and the between-round
//! transformations (shuffle, jumble, block offset) reorder or move items.

pub mod generate;
pub mod lengths;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use std::time::Instant;

/// What a work item does when its turn comes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    /// Flush the device write cache
    Flush,
    /// Trim the range (performed synchronously, outside the async queue)
    Discard,
    /// Stall until everything in flight completes
    Pause,
}

impl Action {
    /// Single-letter code used by the dump format
    pub fn code(self) -> char {
        match self {
            Action::Read => 'R',
            Action::Write => 'W',
            Action::Flush => 'F',
            Action::Discard => 'D',
            Action::Pause => 'P',
        }
    }

    /// Whether the action moves data through a slot buffer
    pub fn uses_slot(self) -> bool {
        matches!(self, Action::Read | Action::Write)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Read => write!(f, "read"),
            Action::Write => write!(f, "write"),
            Action::Flush => write!(f, "flush"),
            Action::Discard => write!(f, "discard"),
            Action::Pause => write!(f, "pause"),
        }
    }
}

/// Mutable per-run state of a work item
///
/// `in_flight` and `slot` are only meaningful between submission and harvest.
#[derive(Debug, Clone, Default)]
pub struct ItemStatus {
    pub in_flight: bool,
    pub submit_time: Option<Instant>,
    pub finish_time: Option<Instant>,
    pub success: bool,
    pub slot: Option<usize>,
}

/// One scheduled operation
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Byte offset, aligned to the device alignment
    pub position: u64,
    /// Length in bytes
    pub length: usize,
    pub action: Action,
    /// Earliest submission time relative to the round start
    pub scheduled_offset_us: u64,
    /// Content seed for written data
    pub seed: u64,
    /// Index of the write this read verifies
    pub verify: Option<usize>,
    pub status: ItemStatus,
}

impl WorkItem {
    pub fn new(position: u64, length: usize, action: Action, seed: u64) -> Self {
        Self {
            position,
            length,
            action,
            scheduled_offset_us: 0,
            seed,
            verify: None,
            status: ItemStatus::default(),
        }
    }
}

/// Ordered work items plus the run identity stamped into every write
#[derive(Debug, Clone)]
pub struct PositionContainer {
    items: Vec<WorkItem>,
    run_uuid: u64,
}

impl PositionContainer {
    pub fn new(items: Vec<WorkItem>, run_uuid: u64) -> Self {
        Self { items, run_uuid }
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [WorkItem] {
        &mut self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn run_uuid(&self) -> u64 {
        self.run_uuid
    }

    /// Largest length among slot-using items (sizes the buffer pool)
    pub fn max_block_size(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.action.uses_slot())
            .map(|i| i.length)
            .max()
            .unwrap_or(0)
    }

    /// Sum of read/write/discard lengths in one pass over the container
    pub fn pass_bytes(&self) -> u64 {
        self.items
            .iter()
            .filter(|i| matches!(i.action, Action::Read | Action::Write | Action::Discard))
            .map(|i| i.length as u64)
            .sum()
    }

    pub fn count(&self, action: Action) -> usize {
        self.items.iter().filter(|i| i.action == action).count()
    }

    /// Forget every item's per-run status
    pub fn reset_status(&mut self) {
        for item in &mut self.items {
            item.status = ItemStatus::default();
        }
    }

    /// Reorder all items randomly
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        order.shuffle(&mut rng);
        self.apply_order(&order);
    }

    /// Shuffle inside consecutive windows of `window` items
    ///
    /// Keeps the coarse order (e.g. sequential sweeps) while breaking the fine
    /// order within each window.
    pub fn jumble(&mut self, window: usize, seed: u64) {
        if window < 2 {
            return;
        }
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        for chunk in order.chunks_mut(window) {
            chunk.shuffle(&mut rng);
        }
        self.apply_order(&order);
    }

    /// Move every data item forward by `block` bytes inside `[min, max)`
    ///
    /// Items whose new range would cross `max` wrap back to the start of the
    /// range.
    pub fn add_block_size(&mut self, block: u64, min: u64, max: u64) {
        let span = max.saturating_sub(min);
        if span == 0 {
            return;
        }
        for item in &mut self.items {
            if !matches!(item.action, Action::Read | Action::Write | Action::Discard) {
                continue;
            }
            let mut next = min + (item.position.saturating_sub(min) + block) % span;
            if next + item.length as u64 > max {
                next = min;
            }
            item.position = next;
        }
    }

    /// Schedule items evenly so one pass runs at `iops` operations per second
    pub fn add_delay(&mut self, iops: f64) {
        if iops <= 0.0 {
            return;
        }
        let gap_us = 1_000_000.0 / iops;
        for (i, item) in self.items.iter_mut().enumerate() {
            item.scheduled_offset_us = (i as f64 * gap_us) as u64;
        }
    }

    // order[new] = old; verify links follow their targets
    fn apply_order(&mut self, order: &[usize]) {
        let mut new_index = vec![0usize; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }
        let mut reordered: Vec<WorkItem> = order.iter().map(|&old| self.items[old].clone()).collect();
        for item in &mut reordered {
            item.verify = item.verify.map(|v| new_index[v]);
        }
        // Pacing belongs to the slot in the sequence, not the item
        for (item, old) in reordered.iter_mut().zip(self.items.iter()) {
            item.scheduled_offset_us = old.scheduled_offset_us;
        }
        self.items = reordered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(n: usize) -> PositionContainer {
        let mut items: Vec<WorkItem> = (0..n)
            .map(|i| WorkItem::new((i * 4096) as u64, 4096, Action::Write, i as u64))
            .collect();
        for i in 0..n {
            let mut read = WorkItem::new((i * 4096) as u64, 4096, Action::Read, i as u64);
            read.verify = Some(i);
            items.push(read);
        }
        PositionContainer::new(items, 42)
    }

    fn assert_links_intact(pc: &PositionContainer) {
        for item in pc.items() {
            if let Some(v) = item.verify {
                let target = &pc.items()[v];
                assert_eq!(target.action, Action::Write);
                assert_eq!(target.position, item.position);
            }
        }
    }

    #[test]
    fn test_shuffle_keeps_verify_links() {
        let mut pc = container(32);
        let before: Vec<u64> = pc.items().iter().map(|i| i.position).collect();
        pc.shuffle(7);
        let after: Vec<u64> = pc.items().iter().map(|i| i.position).collect();

        assert_ne!(before, after);
        let mut sorted_before = before.clone();
        let mut sorted_after = after.clone();
        sorted_before.sort();
        sorted_after.sort();
        assert_eq!(sorted_before, sorted_after);
        assert_links_intact(&pc);
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let mut a = container(16);
        let mut b = container(16);
        a.shuffle(99);
        b.shuffle(99);
        let pa: Vec<u64> = a.items().iter().map(|i| i.position).collect();
        let pb: Vec<u64> = b.items().iter().map(|i| i.position).collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_jumble_stays_within_window() {
        let mut pc = container(32);
        pc.jumble(8, 3);
        for (idx, item) in pc.items().iter().enumerate() {
            let original = if item.action == Action::Write {
                (item.position / 4096) as usize
            } else {
                32 + (item.position / 4096) as usize
            };
            assert_eq!(idx / 8, original / 8);
        }
        assert_links_intact(&pc);
    }

    #[test]
    fn test_add_block_size_wraps() {
        let items = vec![
            WorkItem::new(0, 4096, Action::Write, 0),
            WorkItem::new(8192, 4096, Action::Write, 0),
            WorkItem::new(0, 0, Action::Flush, 0),
        ];
        let mut pc = PositionContainer::new(items, 1);
        pc.add_block_size(4096, 0, 12288);

        assert_eq!(pc.items()[0].position, 4096);
        assert_eq!(pc.items()[1].position, 0);
        assert_eq!(pc.items()[2].position, 0);
    }

    #[test]
    fn test_add_delay_spacing() {
        let mut pc = container(2);
        pc.add_delay(1000.0);
        let offsets: Vec<u64> = pc.items().iter().map(|i| i.scheduled_offset_us).collect();
        assert_eq!(offsets, vec![0, 1000, 2000, 3000]);

        // Shuffling keeps the schedule attached to the sequence slots
        pc.shuffle(5);
        let offsets: Vec<u64> = pc.items().iter().map(|i| i.scheduled_offset_us).collect();
        assert_eq!(offsets, vec![0, 1000, 2000, 3000]);
    }

    #[test]
    fn test_reset_status_and_sizes() {
        let mut pc = container(4);
        pc.items_mut()[0].status.success = true;
        pc.items_mut()[1].status.in_flight = true;
        pc.reset_status();
        assert!(pc.items().iter().all(|i| !i.status.success && !i.status.in_flight));

        assert_eq!(pc.max_block_size(), 4096);
        assert_eq!(pc.pass_bytes(), 8 * 4096);
        assert_eq!(pc.count(Action::Read), 4);
        assert_eq!(pc.run_uuid(), 42);
    }
}
