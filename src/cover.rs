//! Per-varnode liveness coverage.
//!
//! A varnode's cover is a set of block-local op-order intervals connecting its definition to
//! all of its uses through the CFG. Intervals are stored as plain op-order integers rather than
//! op handles because the optimizer deletes ops wholesale; an integer interval stays meaningful
//! as long as the block's op ordering is refreshed, where a handle would dangle.

use crate::containers::unordered::UnorderedMap;

/// One liveness interval inside a single block. `start == -1 && end == -1` is the empty
/// interval; `start == 0 && end == i32::MAX` covers the whole block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CoverBlock {
    pub start: i32,
    pub end: i32,
}

impl Default for CoverBlock {
    fn default() -> Self {
        Self { start: -1, end: -1 }
    }
}

impl CoverBlock {
    pub fn is_empty(&self) -> bool {
        self.start == -1 && self.end == -1
    }

    /// Mark the definition point. Liveness begins strictly at the defining op.
    pub fn set_begin(&mut self, order: i32) {
        self.start = order;
        if self.end < order {
            self.end = order;
        }
    }

    /// Extend the interval to reach a use at `order`.
    pub fn set_end(&mut self, order: i32) {
        if self.is_empty() {
            self.start = 0;
        }
        if order > self.end {
            self.end = order;
        }
    }

    /// Cover the whole block (used for blocks a live value merely flows through).
    pub fn set_all(&mut self) {
        self.start = 0;
        self.end = i32::MAX;
    }

    pub fn is_all(&self) -> bool {
        self.start == 0 && self.end == i32::MAX
    }

    /// Whether the op at `order` falls inside this interval.
    pub fn contains(&self, order: i32) -> bool {
        !self.is_empty() && self.start <= order && order <= self.end
    }
}

/// The full cover of one varnode: one interval per block it is live in, keyed by the block's
/// arena index.
#[derive(Clone, Default, Debug)]
pub struct Cover {
    c: UnorderedMap<usize, CoverBlock>,
}

impl Cover {
    pub fn clear(&mut self) {
        self.c.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.c.is_empty()
    }

    pub fn block(&self, block: usize) -> Option<&CoverBlock> {
        self.c.get(&block)
    }

    fn block_mut(&mut self, block: usize) -> &mut CoverBlock {
        self.c.entry(block).or_default()
    }

    /// Record the definition point of the covered varnode.
    pub fn add_def_point(&mut self, block: usize, order: i32) {
        self.block_mut(block).set_begin(order);
    }

    /// Record a use at (`block`, `order`).
    pub fn add_ref_point(&mut self, block: usize, order: i32) {
        self.block_mut(block).set_end(order);
    }

    /// Mark `block` as fully covered (the value flows through it untouched). Returns `false` if
    /// the block was already fully covered, so a recursive closure can stop.
    pub fn extend_whole(&mut self, block: usize) -> bool {
        let cb = self.block_mut(block);
        if cb.is_all() {
            return false;
        }
        cb.set_all();
        true
    }

    /// Whether the point (`block`, `order`) lies inside the cover.
    pub fn contains(&self, block: usize, order: i32) -> bool {
        self.c.get(&block).map_or(false, |cb| cb.contains(order))
    }

    /// Iterate over the (block index, interval) pairs of the cover.
    pub fn iter(&self) -> impl Iterator<Item = (&usize, &CoverBlock)> {
        self.c.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_contains_def_and_uses() {
        let mut cover = Cover::default();
        cover.add_def_point(3, 5);
        cover.add_ref_point(3, 9);
        assert!(cover.contains(3, 5));
        assert!(cover.contains(3, 7));
        assert!(cover.contains(3, 9));
        assert!(!cover.contains(3, 10));
        assert!(!cover.contains(4, 5));
    }

    #[test]
    fn whole_block_extension_is_idempotent() {
        let mut cover = Cover::default();
        assert!(cover.extend_whole(1));
        assert!(!cover.extend_whole(1));
        assert!(cover.contains(1, 0));
        assert!(cover.contains(1, i32::MAX));
    }
}
