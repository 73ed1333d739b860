//! Weighted block-length sets

use crate::Result;
use rand::Rng;

/// Upper bound for a single IO
pub const MAX_BLOCK_LEN: usize = 1 << 30;

/// A set of block lengths with relative frequencies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LengthSet {
    entries: Vec<(usize, u64)>,
    total_weight: u64,
}

impl LengthSet {
    /// Single fixed length
    pub fn fixed(len: usize) -> Result<Self> {
        let mut set = Self::default();
        set.add(len, 1)?;
        Ok(set)
    }

    /// Every multiple of `align` in `[low, high]`, equally likely
    pub fn aligned_range(low: usize, high: usize, align: usize) -> Result<Self> {
        anyhow::ensure!(align > 0, "alignment must be non-zero");
        let mut set = Self::default();
        let mut len = low.div_ceil(align) * align;
        while len <= high {
            set.add(len, 1)?;
            len += align;
        }
        anyhow::ensure!(!set.is_empty(), "no {}-aligned length between {} and {}", align, low, high);
        Ok(set)
    }

    /// `low`, `2*low`, `4*low`, ... up to `high`, equally likely
    pub fn powers_of_two(low: usize, high: usize) -> Result<Self> {
        anyhow::ensure!(low > 0, "lowest block size must be non-zero");
        let mut set = Self::default();
        let mut len = low;
        while len <= high {
            set.add(len, 1)?;
            len *= 2;
        }
        Ok(set)
    }

    pub fn add(&mut self, len: usize, weight: u64) -> Result<()> {
        anyhow::ensure!(len > 0, "block length must be non-zero");
        anyhow::ensure!(
            len <= MAX_BLOCK_LEN,
            "block length {} exceeds the {} byte limit",
            len,
            MAX_BLOCK_LEN
        );
        let weight = weight.max(1);
        self.entries.push((len, weight));
        self.total_weight += weight;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn min(&self) -> usize {
        self.entries.iter().map(|e| e.0).min().unwrap_or(0)
    }

    pub fn max(&self) -> usize {
        self.entries.iter().map(|e| e.0).max().unwrap_or(0)
    }

    /// Draw a length according to the weights
    pub fn sample<R: Rng>(&self, rng: &mut R) -> usize {
        match self.entries.len() {
            0 => 0,
            1 => self.entries[0].0,
            _ => {
                let mut pick = rng.gen_range(0..self.total_weight);
                for &(len, weight) in &self.entries {
                    if pick < weight {
                        return len;
                    }
                    pick -= weight;
                }
                self.entries[self.entries.len() - 1].0
            }
        }
    }
}
