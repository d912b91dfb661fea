//! Stack alias analysis: the safe zone, the backward store query, and dead-store removal.
//!
//! The safe zone is a set of stack-pointer-relative byte ranges the caller asserts are private
//! to the function: nothing outside the function reads or writes them, and no pointer into them
//! escapes. Inside the zone, two accesses alias exactly when their resolved intervals overlap,
//! which is what lets obfuscator-injected scratch traffic be proven dead.

use crate::address::ValueLattice;
use crate::config::CONFIG;
use crate::error::EngineError;
use crate::funcdata::{BlockId, Funcdata, OpId};
use crate::log::*;
use crate::pcodeop::Opcode;

/// One safe-zone range: `size` bytes starting at stack offset `start` (offsets are relative to
/// the entry value of the stack pointer and normally negative).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RangeNode {
    pub start: i128,
    pub size: i128,
}

impl RangeNode {
    pub fn contains(&self, offset: i128, size: i128) -> bool {
        offset >= self.start && offset + size <= self.start + self.size
    }
}

/// Verdict of comparing two memory access intervals.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AliasVerdict {
    /// Identical interval: a load here reads exactly what the store wrote.
    Same,
    /// Provably non-overlapping.
    Disjoint,
    /// Anything else.
    May,
}

/// Result of the backward store search from a load.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StoreQuery {
    /// The most recent store writing exactly the loaded interval.
    Found(OpId),
    /// A store (or call) that may touch the interval blocks the search; the witness is
    /// returned so callers can report why forwarding failed.
    MayStore(OpId),
    /// The search ran out of dominators without meeting any interfering store.
    Nothing,
}

impl Funcdata {
    pub fn set_safezone(&mut self, start: i128, size: i128) {
        self.safezone.push(RangeNode { start, size });
        self.flags.safezone_enabled = true;
    }

    pub fn in_safezone(&self, offset: i128, size: i128) -> bool {
        self.flags.safezone_enabled && self.safezone.iter().any(|r| r.contains(offset, size))
    }

    /// Compare two resolved access intervals. Absolute and stack-relative accesses are disjoint
    /// only when the stack side lies inside the safe zone; without that assertion an absolute
    /// address could point anywhere, the stack included.
    pub fn test_strict_alias(
        &self,
        a: ValueLattice,
        asize: i32,
        b: ValueLattice,
        bsize: i32,
    ) -> AliasVerdict {
        let overlap = |x: i128, xs: i32, y: i128, ys: i32| -> AliasVerdict {
            if x == y && xs == ys {
                AliasVerdict::Same
            } else if x + xs as i128 <= y || y + ys as i128 <= x {
                AliasVerdict::Disjoint
            } else {
                AliasVerdict::May
            }
        };
        if a.is_constant() && b.is_constant() {
            return overlap(a.value, asize, b.value, bsize);
        }
        if a.is_rel_constant() && b.is_rel_constant() {
            if a.rel == b.rel {
                return overlap(a.value, asize, b.value, bsize);
            }
            return AliasVerdict::May;
        }
        let (rel, relsize, _other) = if a.is_rel_constant() && b.is_constant() {
            (a, asize, b)
        } else if b.is_rel_constant() && a.is_constant() {
            (b, bsize, a)
        } else {
            return AliasVerdict::May;
        };
        if Some(rel.rel) == self.sp_addr && self.in_safezone(rel.value, relsize as i128) {
            AliasVerdict::Disjoint
        } else {
            AliasVerdict::May
        }
    }

    /// Whether a call site's prototype rules out writes the caller can observe.
    fn call_is_benign(&self, op: OpId) -> bool {
        self.calls
            .iter()
            .find(|s| s.op == op)
            .map(|s| !s.proto.side_effect)
            .unwrap_or(false)
    }

    /// Whether one op inside a block could write the interval `laddr`/`lsize`. Returns the
    /// witness when it could, the exact-match store when it provably does, nothing when the op
    /// is harmless.
    fn op_store_verdict(&self, op: OpId, laddr: ValueLattice, lsize: i32) -> Option<StoreQuery> {
        if self.op(op).is_call() {
            if self.call_is_benign(op) {
                return None;
            }
            return Some(StoreQuery::MayStore(op));
        }
        if self.op(op).opcode != Opcode::Store {
            return None;
        }
        if self.op(op).flags.uncalculated_store {
            if CONFIG.topstore_mark {
                return None;
            }
            return Some(StoreQuery::MayStore(op));
        }
        let saddr = self.vn(self.op(op).inputs[0]).value;
        let ssize = self.vn(self.op(op).inputs[1]).size;
        match self.test_strict_alias(laddr, lsize, saddr, ssize) {
            AliasVerdict::Same => Some(StoreQuery::Found(op)),
            AliasVerdict::May => Some(StoreQuery::MayStore(op)),
            AliasVerdict::Disjoint => None,
        }
    }

    /// Search the blocks strictly between a join `bottom` and its dominator `top` for anything
    /// that could write `laddr`/`lsize`. The dominator hop in [`store_query`](Self::store_query)
    /// skips these sibling paths, so an interfering store here makes forwarding unsound even
    /// when the dominator holds an exact match.
    fn interfering_on_paths(
        &self,
        top: BlockId,
        bottom: BlockId,
        laddr: ValueLattice,
        lsize: i32,
    ) -> Result<Option<OpId>, EngineError> {
        let mut visited = vec![false; self.blocks.len()];
        let mut work: Vec<BlockId> = self.blocks[bottom.0]
            .in_edges
            .iter()
            .map(|e| e.point)
            .collect();
        let mut steps = 0usize;
        while let Some(bl) = work.pop() {
            if bl == top || bl == bottom || visited[bl.0] {
                continue;
            }
            visited[bl.0] = true;
            steps += 1;
            if steps > CONFIG.max_walk_depth {
                return Err(EngineError::WalkDepth(CONFIG.max_walk_depth));
            }
            for &op in &self.blocks[bl.0].ops {
                match self.op_store_verdict(op, laddr, lsize) {
                    // An exact match on a sibling path is still only on some paths.
                    Some(StoreQuery::Found(op)) | Some(StoreQuery::MayStore(op)) => {
                        return Ok(Some(op));
                    }
                    _ => {}
                }
            }
            for e in &self.blocks[bl.0].in_edges {
                work.push(e.point);
            }
        }
        Ok(None)
    }

    /// Walk backward from `load` through its block and then up the dominator chain, looking for
    /// the store that produced the loaded value. Unresolved stores block the search unless the
    /// topstore marking is enabled, in which case they are skipped as already-marked. Hopping
    /// from a join to its dominator skips the sibling paths in between; those are scanned for
    /// interference before the hop.
    pub fn store_query(&self, load: OpId) -> Result<StoreQuery, EngineError> {
        let laddr = self.vn(self.op(load).inputs[0]).value;
        let lsize = self
            .op(load)
            .output
            .map(|o| self.vn(o).size)
            .unwrap_or(4);
        let Some(mut bl) = self.op(load).parent else {
            return Ok(StoreQuery::Nothing);
        };
        let mut before: i32 = self.op(load).order;
        let mut depth = 0usize;
        loop {
            depth += 1;
            if depth > CONFIG.max_walk_depth {
                return Err(EngineError::WalkDepth(CONFIG.max_walk_depth));
            }
            for &op in self.blocks[bl.0].ops.iter().rev() {
                if self.op(op).order >= before {
                    continue;
                }
                if let Some(verdict) = self.op_store_verdict(op, laddr, lsize) {
                    return Ok(verdict);
                }
            }
            match self.blocks[bl.0].immed_dom {
                Some(idom) if idom != bl => {
                    if self.blocks[bl.0].in_edges.len() > 1 {
                        if let Some(witness) = self.interfering_on_paths(idom, bl, laddr, lsize)? {
                            return Ok(StoreQuery::MayStore(witness));
                        }
                    }
                    bl = idom;
                    before = i32::MAX;
                }
                _ => return Ok(StoreQuery::Nothing),
            }
        }
    }

    /// Forward the stored value into a load when the backward query finds an exact match. Used
    /// by propagation, so the forwarded result is a lattice value, not a graph rewrite.
    pub fn forward_store(&mut self, load: OpId) -> Option<ValueLattice> {
        match self.store_query(load) {
            Ok(StoreQuery::Found(store)) => {
                let v = self.vn(self.op(store).inputs[1]).value;
                if v.is_constant() || v.is_rel_constant() {
                    Some(v)
                } else {
                    None
                }
            }
            Ok(_) => None,
            Err(_) => None,
        }
    }

    /// Whether `store` writes inside the safe zone at a resolved stack offset.
    fn store_in_safezone(&self, store: OpId) -> bool {
        let addr = self.vn(self.op(store).inputs[0]).value;
        if !addr.is_rel_constant() || Some(addr.rel) != self.sp_addr {
            return false;
        }
        let size = self.vn(self.op(store).inputs[1]).size;
        self.in_safezone(addr.value, size as i128)
    }

    /// Delete stores into the safe zone that no remaining load can observe. Each deletion can
    /// orphan the value computation feeding the store and can turn further loads dead, so the
    /// pass alternates with dead-code elimination until nothing moves.
    pub fn remove_dead_stores(&mut self) -> Result<(), EngineError> {
        let mut removed = 0usize;
        let mut changed = true;
        while changed {
            changed = false;
            let stores: Vec<OpId> = self
                .alive_ops()
                .into_iter()
                .filter(|&op| self.op(op).opcode == Opcode::Store)
                .collect();
            let loads: Vec<OpId> = self
                .alive_ops()
                .into_iter()
                .filter(|&op| self.op(op).opcode == Opcode::Load)
                .collect();
            for store in stores {
                if !self.store_in_safezone(store) {
                    continue;
                }
                let saddr = self.vn(self.op(store).inputs[0]).value;
                let ssize = self.vn(self.op(store).inputs[1]).size;
                let observed = loads.iter().any(|&load| {
                    if self.op(load).is_dead() {
                        return false;
                    }
                    let laddr = self.vn(self.op(load).inputs[0]).value;
                    let lsize = self.op(load).output.map(|o| self.vn(o).size).unwrap_or(4);
                    self.test_strict_alias(saddr, ssize, laddr, lsize) != AliasVerdict::Disjoint
                });
                if !observed {
                    self.op_destroy(store);
                    removed += 1;
                    changed = true;
                }
            }
            if changed {
                self.dead_code_elimination();
            }
        }
        if removed > 0 {
            info!("dead stores removed"; "func" => &self.name, "stores" => removed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn fd_with_sp() -> Funcdata {
        let mut fd = Funcdata::new("t", Address::ram(0));
        fd.sp_addr = Some(Address::register(0x34));
        fd
    }

    #[test]
    fn safezone_ranges_contain_their_intervals() {
        let r = RangeNode { start: -0x40, size: 0x40 };
        assert!(r.contains(-0x40, 4));
        assert!(r.contains(-4, 4));
        assert!(!r.contains(-0x44, 4));
        assert!(!r.contains(-4, 8));
    }

    #[test]
    fn strict_alias_on_same_base_offsets() {
        let mut fd = fd_with_sp();
        fd.set_safezone(-0x100, 0x100);
        let sp = Address::register(0x34);
        let a = ValueLattice::rel_constant(sp, -8);
        let b = ValueLattice::rel_constant(sp, -8);
        let c = ValueLattice::rel_constant(sp, -16);
        let d = ValueLattice::rel_constant(sp, -10);
        assert_eq!(fd.test_strict_alias(a, 4, b, 4), AliasVerdict::Same);
        assert_eq!(fd.test_strict_alias(a, 4, c, 4), AliasVerdict::Disjoint);
        assert_eq!(fd.test_strict_alias(a, 4, d, 4), AliasVerdict::May);
    }

    #[test]
    fn absolute_vs_stack_needs_the_safezone() {
        let mut fd = fd_with_sp();
        let sp = Address::register(0x34);
        let stack = ValueLattice::rel_constant(sp, -8);
        let global = ValueLattice::constant(0x8000);
        assert_eq!(fd.test_strict_alias(stack, 4, global, 4), AliasVerdict::May);
        fd.set_safezone(-0x100, 0x100);
        assert_eq!(
            fd.test_strict_alias(stack, 4, global, 4),
            AliasVerdict::Disjoint
        );
    }
}
