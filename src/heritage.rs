//! SSA construction ("heritage"): phi placement and renaming.
//!
//! Runs on a CFG whose structure information is current. Register and unique locations are
//! renamed; constant-space varnodes carry their own value and ram appears only as code
//! references and load/store targets, so neither participates. A read with no reaching
//! definition becomes a function input. The pass is re-runnable: after CFG surgery the caller
//! rewinds with [`Funcdata::heritage_clear`] and calls [`Funcdata::heritage`] again.

use std::collections::BinaryHeap;

use itertools::Itertools;

use crate::address::{Address, SpaceKind};
use crate::config::CONFIG;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::EngineError;
use crate::funcdata::{BlockId, Funcdata, VarnodeId};
use crate::log::*;
use crate::pcodeop::Opcode;

type LocKey = (Address, i32);

fn renameable(addr: Address) -> bool {
    matches!(addr.space, SpaceKind::Register | SpaceKind::Unique)
}

impl Funcdata {
    /// Build SSA form: place phis on the iterated dominance frontier of every written location,
    /// then rename all reads and defs along a pre-order dominator walk.
    pub fn heritage(&mut self) -> Result<(), EngineError> {
        let depth = self.dom_depths();
        let frontier = self.dominance_frontier();
        let locations = self.collect_locations();
        debug!("heritage"; "func" => &self.name, "locations" => locations.len());
        for loc in locations {
            self.place_phis(loc, &frontier, &depth);
        }
        self.rename()?;
        self.fold_trivial_phis();
        self.build_liverange();
        Ok(())
    }

    /// Dominator-tree depth of every block (entry at zero).
    fn dom_depths(&self) -> Vec<usize> {
        let mut depth = vec![0usize; self.blocks.len()];
        for &bl in &self.rpo {
            if let Some(idom) = self.blocks[bl.0].immed_dom {
                depth[bl.0] = depth[idom.0] + 1;
            }
        }
        depth
    }

    /// The classic dominance-frontier computation off join points.
    pub fn dominance_frontier(&self) -> Vec<Vec<BlockId>> {
        let mut df: Vec<Vec<BlockId>> = vec![Vec::new(); self.blocks.len()];
        for &bl in &self.rpo {
            if self.blocks[bl.0].in_edges.len() < 2 {
                continue;
            }
            let Some(idom) = self.blocks[bl.0].immed_dom else { continue };
            for i in 0..self.blocks[bl.0].in_edges.len() {
                let mut runner = self.blocks[bl.0].in_edges[i].point;
                while runner != idom {
                    if !df[runner.0].contains(&bl) {
                        df[runner.0].push(bl);
                    }
                    match self.blocks[runner.0].immed_dom {
                        Some(d) => runner = d,
                        None => break,
                    }
                }
            }
        }
        df
    }

    /// Every renameable location written or read anywhere in the live graph.
    fn collect_locations(&self) -> Vec<LocKey> {
        let mut locs: UnorderedSet<LocKey> = UnorderedSet::new();
        for op in self.alive_ops() {
            for &vn in &self.op(op).inputs {
                if !vn.is_invalid() && renameable(self.vn(vn).addr) {
                    locs.insert(self.vn(vn).loc_key());
                }
            }
            if let Some(out) = self.op(op).output {
                if renameable(self.vn(out).addr) {
                    locs.insert(self.vn(out).loc_key());
                }
            }
        }
        locs.iter().copied().sorted().collect()
    }

    /// Insert phis for `loc` on the iterated dominance frontier of its def blocks, deepest
    /// blocks first so each frontier node is expanded at most once.
    fn place_phis(&mut self, loc: LocKey, frontier: &[Vec<BlockId>], depth: &[usize]) {
        let mut defblocks: Vec<BlockId> = Vec::new();
        for op in self.alive_ops() {
            if let Some(out) = self.op(op).output {
                if self.vn(out).loc_key() == loc {
                    let bl = self.op(op).parent.expect("live op is placed");
                    if !defblocks.contains(&bl) {
                        defblocks.push(bl);
                    }
                }
            }
        }
        if defblocks.is_empty() {
            return;
        }
        let mut queue: BinaryHeap<(usize, usize)> =
            defblocks.iter().map(|b| (depth[b.0], b.0)).collect();
        let mut placed = vec![false; self.blocks.len()];
        let mut visited = vec![false; self.blocks.len()];
        while let Some((_, bi)) = queue.pop() {
            if visited[bi] {
                continue;
            }
            visited[bi] = true;
            for &fb in &frontier[bi] {
                if placed[fb.0] {
                    continue;
                }
                placed[fb.0] = true;
                let npreds = self.blocks[fb.0].in_edges.len();
                let addr = self.blocks[fb.0]
                    .first_op()
                    .map(|op| self.op(op).get_addr())
                    .unwrap_or(self.entry);
                let phi = self.newop(npreds, addr);
                self.op_set_opcode(phi, Opcode::MultiEqual);
                let out = self.new_varnode(loc.1, loc.0);
                self.op_set_output(phi, out);
                self.op_insert_begin(phi, fb);
                // A phi is itself a def; its block joins the iteration.
                queue.push((depth[fb.0], fb.0));
            }
        }
    }

    /// Pre-order dominator walk binding every read to its reaching definition and assigning SSA
    /// versions to every def. Reads with no reaching def become function inputs.
    fn rename(&mut self) -> Result<(), EngineError> {
        enum Visit {
            Enter(BlockId),
            Exit(Vec<LocKey>),
        }
        let Some(entry) = self.entry_block else { return Ok(()) };
        let children = self.dom_children();
        let mut stacks: UnorderedMap<LocKey, Vec<VarnodeId>> = UnorderedMap::new();
        let mut versions: UnorderedMap<LocKey, i32> = UnorderedMap::new();
        let mut input_cache: UnorderedMap<LocKey, VarnodeId> = UnorderedMap::new();
        let mut walk = vec![Visit::Enter(entry)];

        while let Some(visit) = walk.pop() {
            if walk.len() > CONFIG.max_walk_depth {
                return Err(EngineError::WalkDepth(CONFIG.max_walk_depth));
            }
            let bl = match visit {
                Visit::Exit(pushed) => {
                    for loc in pushed {
                        stacks.get_mut(&loc).expect("pushed during Enter").pop();
                    }
                    continue;
                }
                Visit::Enter(bl) => bl,
            };
            let mut pushed: Vec<LocKey> = Vec::new();

            for op in self.blocks[bl.0].ops.clone() {
                if self.op(op).opcode != Opcode::MultiEqual {
                    for slot in 0..self.op(op).inputs.len() {
                        let vn = self.op(op).inputs[slot];
                        if vn.is_invalid() || !renameable(self.vn(vn).addr) {
                            continue;
                        }
                        let loc = self.vn(vn).loc_key();
                        let reaching = self.reaching_def(&mut stacks, &mut input_cache, loc);
                        if reaching != vn {
                            self.op_set_input(op, reaching, slot);
                        }
                    }
                }
                if let Some(out) = self.op(op).output {
                    if renameable(self.vn(out).addr) {
                        let loc = self.vn(out).loc_key();
                        let v = versions.entry(loc).or_insert(0);
                        self.vns[out.0].version = *v;
                        *v += 1;
                        stacks.entry(loc).or_default().push(out);
                        pushed.push(loc);
                    }
                }
            }

            // Feed this block's reaching defs into successor phis.
            for i in 0..self.blocks[bl.0].out_edges.len() {
                let succ = self.blocks[bl.0].out_edges[i].point;
                let in_slots: Vec<usize> = self.blocks[succ.0]
                    .in_edges
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.point == bl)
                    .map(|(j, _)| j)
                    .collect();
                for phi in self.blocks[succ.0].ops.clone() {
                    if self.op(phi).opcode != Opcode::MultiEqual {
                        break;
                    }
                    let loc = {
                        let out = self.op(phi).output.expect("phi has an output");
                        self.vn(out).loc_key()
                    };
                    let reaching = self.reaching_def(&mut stacks, &mut input_cache, loc);
                    for &slot in &in_slots {
                        self.op_set_input(phi, reaching, slot);
                    }
                }
            }

            walk.push(Visit::Exit(pushed));
            for &child in children[bl.0].iter().rev() {
                walk.push(Visit::Enter(child));
            }
        }
        Ok(())
    }

    /// Current reaching def for `loc`, creating (and caching) a function input when none.
    fn reaching_def(
        &mut self,
        stacks: &mut UnorderedMap<LocKey, Vec<VarnodeId>>,
        input_cache: &mut UnorderedMap<LocKey, VarnodeId>,
        loc: LocKey,
    ) -> VarnodeId {
        if let Some(top) = stacks.get(&loc).and_then(|s| s.last()) {
            return *top;
        }
        if let Some(&input) = input_cache.get(&loc) {
            return input;
        }
        let input = self.new_varnode(loc.1, loc.0);
        self.set_input_varnode(input);
        self.vns[input.0].version = 0;
        input_cache.insert(loc, input);
        input
    }

    /// Phis with one input, or whose inputs are all the same varnode, degrade to copies.
    pub fn fold_trivial_phis(&mut self) {
        for op in self.alive_ops() {
            if self.op(op).opcode != Opcode::MultiEqual {
                continue;
            }
            let inputs = &self.op(op).inputs;
            if inputs.is_empty() {
                continue;
            }
            let uniform = inputs.iter().all(|&v| v == inputs[0]);
            if inputs.len() == 1 || uniform {
                let keep = inputs[0];
                while self.op(op).inputs.len() > 1 {
                    let last = self.op(op).inputs.len() - 1;
                    self.op_remove_input(op, last);
                }
                self.op_set_input(op, keep, 0);
                self.op_set_opcode(op, Opcode::Copy);
            }
        }
    }

    // ---- liveness covers ----

    /// Rebuild the cover of every written or input varnode. In complete mode the cover is
    /// closed upward from each use through predecessor blocks until the def block; in fast mode
    /// only the single-block interval around the def is kept.
    pub fn build_liverange(&mut self) {
        for vi in 0..self.vns.len() {
            let vn = VarnodeId(vi);
            if self.vns[vi].is_free() || self.vns[vi].in_constant_space() {
                continue;
            }
            self.vns[vi].clear_cover();
            self.build_one_cover(vn);
            self.vns[vi].flags.cover_dirty = false;
        }
    }

    fn build_one_cover(&mut self, vn: VarnodeId) {
        let def_block = self.vns[vn.0].def.and_then(|op| self.op(op).parent);
        if let Some(op) = self.vns[vn.0].def {
            if let Some(bl) = self.op(op).parent {
                let order = self.op(op).order;
                self.vns[vn.0].cover.add_def_point(bl.0, order);
                self.vns[vn.0].simple_cover.set_begin(order);
            }
        }
        for use_op in self.vns[vn.0].uses.clone() {
            let Some(use_block) = self.op(use_op).parent else { continue };
            // A phi reads its input on the incoming edge, i.e. at the bottom of the
            // corresponding predecessor, not inside its own block.
            let (bl, order) = if self.op(use_op).opcode == Opcode::MultiEqual {
                let slot = self.op(use_op).get_slot(vn).expect("use lists are exact");
                let pred = self.blocks[use_block.0].in_edges[slot].point;
                (pred, i32::MAX)
            } else {
                (use_block, self.op(use_op).order)
            };
            self.vns[vn.0].cover.add_ref_point(bl.0, order);
            if Some(bl) == def_block {
                self.vns[vn.0].simple_cover.set_end(order);
            }
            if !CONFIG.complete_liverange {
                continue;
            }
            // Close the cover upward: every block the value flows through is fully covered.
            if Some(bl) != def_block {
                let mut work: Vec<BlockId> =
                    self.blocks[bl.0].in_edges.iter().map(|e| e.point).collect();
                while let Some(p) = work.pop() {
                    if Some(p) == def_block {
                        continue;
                    }
                    if !self.vns[vn.0].cover.extend_whole(p.0) {
                        continue;
                    }
                    work.extend(self.blocks[p.0].in_edges.iter().map(|e| e.point));
                }
            }
        }
    }

    /// Whether `a` and `b` are simultaneously live anywhere. Requires both covers to be
    /// current.
    pub fn intersect_cover(&self, a: VarnodeId, b: VarnodeId) -> bool {
        let ca = &self.vn(a).cover;
        let cb = &self.vn(b).cover;
        for (bi, ia) in ca.iter() {
            if let Some(ib) = cb.block(*bi) {
                if !ia.is_empty() && !ib.is_empty() && ia.start <= ib.end && ib.start <= ia.end {
                    return true;
                }
            }
        }
        false
    }
}
