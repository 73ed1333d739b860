//! Position generation
//!
//! Lays work items out over `[min_position, max_position)` of a device, drawing
//! lengths from a `LengthSet` and actions from the configured mix. Positions
//! are always multiples of the alignment.

use super::lengths::LengthSet;
use super::{Action, PositionContainer, WorkItem};
use crate::Result;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cap on generated positions when no explicit count is requested
pub const DEFAULT_MAX_POSITIONS: usize = 10_000_000;

/// Parameters for one layout
#[derive(Debug, Clone)]
pub struct LayoutSpec {
    /// First usable byte (rounded up to the alignment)
    pub min_position: u64,
    /// One past the last usable byte
    pub max_position: u64,
    pub alignment: usize,
    pub lengths: LengthSet,
    /// Probability that an item reads
    pub read_fraction: f64,
    /// Probability that an item discards
    pub discard_fraction: f64,
    /// Keep ascending order instead of shuffling
    pub sequential: bool,
    /// Follow the layout with a read-back of every write
    pub verify: bool,
    /// Give each item its own content seed
    pub unique_seeds: bool,
    /// Exact number of primary items; wraps around the range when needed
    pub count: Option<usize>,
}

/// Run identity stamped into write watermarks
///
/// Wall-clock seconds times ten, offset by the worker id so concurrent jobs on
/// the same device never share an identity.
pub fn run_uuid(worker_id: usize) -> u64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs * 10 + worker_id as u64
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Build the work items for one job
pub fn generate(spec: &LayoutSpec, seed: u64, run_uuid: u64) -> Result<PositionContainer> {
    anyhow::ensure!(spec.alignment.is_power_of_two(), "alignment {} is not a power of two", spec.alignment);
    anyhow::ensure!(!spec.lengths.is_empty(), "no block sizes configured");

    let align = spec.alignment as u64;
    let start = align_up(spec.min_position, align);
    anyhow::ensure!(
        start + spec.lengths.min() as u64 <= spec.max_position,
        "range {}..{} cannot hold a single {} byte block",
        spec.min_position,
        spec.max_position,
        spec.lengths.min()
    );

    let limit = spec.count.unwrap_or(DEFAULT_MAX_POSITIONS);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut primary = Vec::new();
    let mut cursor = start;

    while primary.len() < limit {
        let len = spec.lengths.sample(&mut rng);
        if cursor + len as u64 > spec.max_position {
            if spec.count.is_none() {
                break;
            }
            cursor = start;
            if cursor + len as u64 > spec.max_position {
                continue;
            }
        }

        let roll: f64 = rng.gen();
        let action = if roll < spec.read_fraction {
            Action::Read
        } else if roll < spec.read_fraction + spec.discard_fraction {
            Action::Discard
        } else {
            Action::Write
        };

        let item_seed = if spec.unique_seeds {
            seed.wrapping_add(primary.len() as u64 + 1)
        } else {
            seed
        };
        primary.push(WorkItem::new(cursor, len, action, item_seed));
        cursor = align_up(cursor + len as u64, align);
    }

    if spec.count.is_none() && primary.len() == limit {
        tracing::info!(positions = limit, "position count capped; range not fully covered");
    }

    let mut container = PositionContainer::new(primary, run_uuid);
    if !spec.sequential {
        container.shuffle(seed);
    }

    if spec.verify {
        let mut items = container.items().to_vec();
        let writes: Vec<usize> = (0..items.len())
            .filter(|&i| items[i].action == Action::Write)
            .collect();
        for w in writes {
            let mut read = WorkItem::new(items[w].position, items[w].length, Action::Read, items[w].seed);
            read.verify = Some(w);
            items.push(read);
        }
        container = PositionContainer::new(items, run_uuid);
    }

    tracing::debug!(
        positions = container.len(),
        reads = container.count(Action::Read),
        writes = container.count(Action::Write),
        discards = container.count(Action::Discard),
        "generated positions"
    );
    Ok(container)
}
