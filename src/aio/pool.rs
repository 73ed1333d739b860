//! Buffer pool and slot free list
//!
//! One aligned allocation holds `2 * slots` buffers of `max_len` bytes: the
//! write side first, then the read side. Slot `i` owns write buffer `i` and
//! read buffer `i`; the `SlotRing` hands out slot indices so that no two
//! in-flight requests ever share a buffer.
//!
//! ```text
//! base                                    base + slots*max_len
//! [ w0 | w1 | ... | w(n-1) ]              [ r0 | r1 | ... | r(n-1) ]
//! ```

use super::error::DispatchError;
use super::watermark::Watermark;
use crate::Result;
use anyhow::Context;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// Fill `buf` with the deterministic pattern for `seed`
pub fn fill_pattern(buf: &mut [u8], seed: u64) {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    rng.fill_bytes(buf);
}

/// Aligned write/read buffers for every slot
pub struct BufferPool {
    base: *mut u8,
    layout: Layout,
    slots: usize,
    max_len: usize,
    /// Seed whose pattern currently fills each write buffer
    cached_seed: Vec<Option<u64>>,
}

// The pool owns its memory; raw pointers never escape beyond in-flight requests
unsafe impl Send for BufferPool {}

impl BufferPool {
    /// Allocate `slots` buffer pairs of `max_len` bytes (rounded up to `alignment`)
    ///
    /// Write buffers start out holding the pattern for `seed`, read buffers are
    /// zeroed. `ram_limit` caps the total allocation.
    pub fn new(slots: usize, max_len: usize, alignment: usize, ram_limit: Option<u64>, seed: u64) -> Result<Self> {
        anyhow::ensure!(slots > 0, "buffer pool needs at least one slot");
        anyhow::ensure!(alignment.is_power_of_two(), "alignment {} is not a power of two", alignment);

        let max_len = max_len.max(1).div_ceil(alignment) * alignment;
        let total = max_len
            .checked_mul(slots)
            .and_then(|n| n.checked_mul(2))
            .context("buffer pool size overflows")?;

        if let Some(limit) = ram_limit {
            if total as u64 > limit {
                return Err(DispatchError::BufferTooLarge {
                    needed: total as u64,
                    limit,
                }
                .into());
            }
        }

        let layout = Layout::from_size_align(total, alignment).context("invalid buffer pool layout")?;
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            anyhow::bail!("failed to allocate {} byte buffer pool", total);
        }

        let mut pool = Self {
            base,
            layout,
            slots,
            max_len,
            cached_seed: vec![None; slots],
        };
        for slot in 0..slots {
            fill_pattern(pool.write_buf_mut(slot), seed);
            pool.cached_seed[slot] = Some(seed);
        }

        tracing::debug!(slots, max_len, bytes = total, "buffer pool allocated");
        Ok(pool)
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Total bytes allocated
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn write_ptr(&self, slot: usize) -> *mut u8 {
        assert!(slot < self.slots, "slot {} out of range", slot);
        unsafe { self.base.add(slot * self.max_len) }
    }

    #[inline]
    pub fn read_ptr(&self, slot: usize) -> *mut u8 {
        assert!(slot < self.slots, "slot {} out of range", slot);
        unsafe { self.base.add((self.slots + slot) * self.max_len) }
    }

    fn write_buf_mut(&mut self, slot: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.write_ptr(slot), self.max_len) }
    }

    /// Ready the write buffer of `slot` for a write of `len` bytes
    ///
    /// The pattern is regenerated only when the slot last held a different
    /// seed; the watermark is always installed.
    pub fn prepare_write(&mut self, slot: usize, len: usize, seed: u64, mark: Watermark) -> *mut u8 {
        let len = len.min(self.max_len);
        if self.cached_seed[slot] != Some(seed) {
            fill_pattern(self.write_buf_mut(slot), seed);
            self.cached_seed[slot] = Some(seed);
        }
        mark.stamp(&mut self.write_buf_mut(slot)[..len]);
        self.write_ptr(slot)
    }

    /// Contents of the read buffer of `slot`, valid once its read has completed
    pub fn read_buf(&self, slot: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.read_ptr(slot), len.min(self.max_len)) }
    }

    /// Contents of the write buffer of `slot`
    pub fn write_buf(&self, slot: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.write_ptr(slot), len.min(self.max_len)) }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Fixed ring of free slot indices
///
/// `take` pops from the head, `give` pushes at the tail. Every index in
/// `0..capacity` is either in the ring or held by exactly one caller.
#[derive(Debug)]
pub struct SlotRing {
    ring: Vec<usize>,
    head: usize,
    tail: usize,
    free: usize,
    held: Vec<bool>,
}

impl SlotRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: (0..capacity).collect(),
            head: 0,
            tail: 0,
            free: capacity,
            held: vec![false; capacity],
        }
    }

    /// Next free slot, if any
    pub fn take(&mut self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        let slot = self.ring[self.head];
        self.head = (self.head + 1) % self.ring.len();
        self.free -= 1;
        self.held[slot] = true;
        Some(slot)
    }

    /// Return a slot obtained from `take`
    pub fn give(&mut self, slot: usize) -> Result<()> {
        anyhow::ensure!(slot < self.ring.len(), "slot {} out of range", slot);
        anyhow::ensure!(self.held[slot], "slot {} returned twice", slot);

        self.held[slot] = false;
        self.ring[self.tail] = slot;
        self.tail = (self.tail + 1) % self.ring.len();
        self.free += 1;
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Free indices in allocation order
    pub fn free_slots(&self) -> Vec<usize> {
        (0..self.free)
            .map(|i| self.ring[(self.head + i) % self.ring.len()])
            .collect()
    }

    /// Indices currently handed out
    pub fn held_slots(&self) -> Vec<usize> {
        (0..self.held.len()).filter(|&s| self.held[s]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_layout_and_alignment() {
        let pool = BufferPool::new(4, 3000, 4096, None, 1).unwrap();
        assert_eq!(pool.max_len(), 4096);
        assert_eq!(pool.size(), 2 * 4 * 4096);
        for slot in 0..4 {
            assert_eq!(pool.write_ptr(slot) as usize % 4096, 0);
            assert_eq!(pool.read_ptr(slot) as usize - pool.write_ptr(slot) as usize, 4 * 4096);
        }
        assert!(pool.read_buf(2, 4096).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_prepare_write_pattern_and_watermark() {
        let mut pool = BufferPool::new(2, 4096, 512, None, 5).unwrap();
        let mut expected = vec![0u8; 4096];
        fill_pattern(&mut expected, 5);
        assert_eq!(pool.write_buf(0, 4096), &expected[..]);

        let mark = Watermark::new(8192, 77);
        pool.prepare_write(1, 4096, 9, mark);
        fill_pattern(&mut expected, 9);
        let buf = pool.write_buf(1, 4096);
        assert_eq!(Watermark::read(buf), mark);
        assert_eq!(&buf[16..], &expected[16..]);
    }

    #[test]
    fn test_prepare_write_keeps_cached_pattern() {
        let mut pool = BufferPool::new(1, 512, 512, None, 3).unwrap();
        pool.prepare_write(0, 512, 3, Watermark::new(0, 1));
        let first = pool.write_buf(0, 512)[16..].to_vec();
        pool.prepare_write(0, 512, 3, Watermark::new(512, 1));
        assert_eq!(&pool.write_buf(0, 512)[16..], &first[..]);
        assert_eq!(Watermark::read(pool.write_buf(0, 512)).position, 512);
    }

    #[test]
    fn test_ram_limit() {
        let err = BufferPool::new(8, 1 << 20, 4096, Some(1 << 20), 0).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::BufferTooLarge { needed, .. }) if *needed == 16 << 20
        ));
    }

    #[test]
    fn test_slot_ring_fifo_and_conservation() {
        let mut ring = SlotRing::new(3);
        assert_eq!(ring.take(), Some(0));
        assert_eq!(ring.take(), Some(1));
        ring.give(0).unwrap();
        assert_eq!(ring.take(), Some(2));
        assert_eq!(ring.take(), Some(0));
        assert_eq!(ring.take(), None);

        ring.give(1).unwrap();
        ring.give(2).unwrap();
        let mut all: Vec<usize> = ring.free_slots();
        all.extend(ring.held_slots());
        all.sort();
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[test]
    fn test_slot_ring_rejects_double_give() {
        let mut ring = SlotRing::new(2);
        let s = ring.take().unwrap();
        ring.give(s).unwrap();
        assert!(ring.give(s).is_err());
        assert!(ring.give(9).is_err());
        assert_eq!(ring.free_count(), 2);
    }
}
