//! Control-flow structure: spanning tree, dominators, loops and branch pruning.
//!
//! `structure_reset` recomputes everything from the raw edge lists; it is cheap enough to rerun
//! after any CFG surgery and every pass that mutates edges is expected to call it before the
//! next pass reads dominance or loop information.

use crate::block::{BlockType, EdgeLabel};
use crate::error::EngineError;
use crate::funcdata::{BlockId, Funcdata, OpId};
use crate::log::*;
use crate::pcodeop::Opcode;

impl Funcdata {
    /// Recompute reverse postorder, the dominator tree and loop structure from scratch,
    /// removing any block unreachable from the entry along the way.
    pub fn structure_reset(&mut self) {
        for b in self.blocks.iter_mut() {
            b.index = -1;
            b.dfnum = -1;
            b.immed_dom = None;
            b.loop_header = None;
            b.loop_nodes.clear();
            b.flags.loopheader = false;
            b.flags.irreducible = false;
            b.flags.exitpath = false;
            b.flags.unsplice = false;
            b.btype = BlockType::Condition;
            for e in b.in_edges.iter_mut().chain(b.out_edges.iter_mut()) {
                e.label &= EdgeLabel::TRUE_EDGE;
            }
        }
        self.spanning_tree();
        self.remove_unreachable_blocks();
        self.calc_dominators();
        self.calc_loops();
        self.classify_loops();
        self.calc_exitpath();
    }

    /// Iterative DFS from the entry assigning discovery numbers and labeling every edge as
    /// tree, back, forward or cross. Back-edge targets get their loopheader flag here.
    fn spanning_tree(&mut self) {
        let Some(entry) = self.entry_block else { return };
        let mut dfnum = 0i32;
        let mut postorder: Vec<BlockId> = Vec::new();
        // (block, next out-slot to visit); a block stays on the stack until all succs finish.
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        let mut on_stack = vec![false; self.blocks.len()];
        self.blocks[entry.0].dfnum = dfnum;
        dfnum += 1;
        on_stack[entry.0] = true;

        while let Some(&mut (bl, ref mut slot)) = stack.last_mut() {
            if *slot >= self.blocks[bl.0].out_edges.len() {
                stack.pop();
                on_stack[bl.0] = false;
                postorder.push(bl);
                continue;
            }
            let cur_slot = *slot;
            *slot += 1;
            let succ = self.blocks[bl.0].out_edges[cur_slot].point;
            let label = if self.blocks[succ.0].dfnum < 0 {
                self.blocks[succ.0].dfnum = dfnum;
                dfnum += 1;
                on_stack[succ.0] = true;
                stack.push((succ, 0));
                EdgeLabel::TREE
            } else if on_stack[succ.0] {
                self.blocks[succ.0].flags.loopheader = true;
                EdgeLabel::BACK | EdgeLabel::LOOP
            } else if self.blocks[bl.0].dfnum < self.blocks[succ.0].dfnum {
                EdgeLabel::FORWARD
            } else {
                EdgeLabel::CROSS
            };
            self.set_out_edge_flag(bl, cur_slot, label);
        }

        self.rpo = postorder;
        self.rpo.reverse();
        for (i, &bl) in self.rpo.iter().enumerate() {
            self.blocks[bl.0].index = i as i32;
        }
    }

    /// Drop every live block the spanning tree never reached: destroy its ops, trim the phi
    /// inputs its edges fed, and mark it dead.
    pub fn remove_unreachable_blocks(&mut self) {
        let unreachable: Vec<BlockId> = (0..self.blocks.len())
            .map(BlockId)
            .filter(|b| !self.blocks[b.0].flags.dead && self.blocks[b.0].dfnum < 0)
            .collect();
        for bl in unreachable {
            debug!("removing unreachable block"; "func" => &self.name, "block" => format!("{:?}", bl));
            while !self.blocks[bl.0].out_edges.is_empty() {
                let target = self.blocks[bl.0].out_edges[0].point;
                let slot = self.blocks[target.0]
                    .get_in_slot(bl)
                    .expect("edge lists are mutually consistent");
                self.remove_in_edge_with_phis(target, slot);
            }
            while !self.blocks[bl.0].in_edges.is_empty() {
                self.remove_in_edge(bl, 0);
            }
            for op in self.blocks[bl.0].ops.clone() {
                self.op_destroy(op);
            }
            self.blocks[bl.0].flags.dead = true;
        }
    }

    /// Iterative reverse-postorder dominator computation (two-finger intersection).
    fn calc_dominators(&mut self) {
        let Some(entry) = self.entry_block else { return };
        self.blocks[entry.0].immed_dom = Some(entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &bl in self.rpo.clone().iter() {
                if bl == entry {
                    continue;
                }
                let mut new_idom: Option<BlockId> = None;
                for i in 0..self.blocks[bl.0].in_edges.len() {
                    let pred = self.blocks[bl.0].in_edges[i].point;
                    if self.blocks[pred.0].immed_dom.is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(cur) => self.intersect(cur, pred),
                    });
                }
                if let Some(idom) = new_idom {
                    if self.blocks[bl.0].immed_dom != Some(idom) {
                        self.blocks[bl.0].immed_dom = Some(idom);
                        changed = true;
                    }
                }
            }
        }
        // The entry's self-loop is an artifact of the algorithm.
        self.blocks[entry.0].immed_dom = None;
    }

    fn intersect(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            while self.blocks[a.0].index > self.blocks[b.0].index {
                a = self.blocks[a.0].immed_dom.expect("processed in rpo order");
            }
            while self.blocks[b.0].index > self.blocks[a.0].index {
                b = self.blocks[b.0].immed_dom.expect("processed in rpo order");
            }
        }
        a
    }

    /// Whether `a` dominates `b`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = Some(b);
        while let Some(c) = cur {
            if c == a {
                return true;
            }
            cur = self.blocks[c.0].immed_dom;
        }
        false
    }

    /// Children of each block in the dominator tree, indexed by arena slot.
    pub fn dom_children(&self) -> Vec<Vec<BlockId>> {
        let mut children = vec![Vec::new(); self.blocks.len()];
        for &bl in &self.rpo {
            if let Some(idom) = self.blocks[bl.0].immed_dom {
                children[idom.0].push(bl);
            }
        }
        children
    }

    /// Build natural loops from the back edges. A back edge whose target does not dominate its
    /// source makes the target an irreducible header; no loop body is collected for it.
    fn calc_loops(&mut self) {
        let mut loops: Vec<(BlockId, Vec<BlockId>)> = Vec::new();
        for &h in self.rpo.clone().iter() {
            let mut body: Vec<BlockId> = Vec::new();
            let mut seen = vec![false; self.blocks.len()];
            let mut irreducible = false;
            for i in 0..self.blocks[h.0].in_edges.len() {
                let e = self.blocks[h.0].in_edges[i];
                if !e.label.contains(EdgeLabel::BACK) {
                    continue;
                }
                let tail = e.point;
                if !self.dominates(h, tail) {
                    irreducible = true;
                    continue;
                }
                // Backward walk from the tail collects every block that can reach it without
                // passing through the header.
                let mut work = vec![tail];
                seen[h.0] = true;
                while let Some(b) = work.pop() {
                    if seen[b.0] {
                        continue;
                    }
                    seen[b.0] = true;
                    body.push(b);
                    for ie in &self.blocks[b.0].in_edges {
                        work.push(ie.point);
                    }
                }
            }
            if irreducible {
                self.blocks[h.0].flags.irreducible = true;
            }
            if !body.is_empty() || self.blocks[h.0].flags.loopheader {
                body.push(h);
                body.sort_by_key(|b| self.blocks[b.0].index);
                loops.push((h, body));
            }
        }
        // Innermost-first assignment: members keep the smallest loop that claims them.
        loops.sort_by_key(|(_, body)| body.len());
        for (h, body) in &loops {
            for &b in body {
                if b != *h && self.blocks[b.0].loop_header.is_none() {
                    self.blocks[b.0].loop_header = Some(*h);
                }
            }
            // A nested header's own membership records the enclosing loop.
            if self.blocks[h.0].loop_header.is_none() {
                for (outer, obody) in &loops {
                    if outer != h && obody.contains(h) {
                        self.blocks[h.0].loop_header = Some(*outer);
                        break;
                    }
                }
            }
        }
        for (h, body) in loops {
            self.blocks[h.0].loop_nodes = body;
        }
    }

    /// Assign while-do / do-while shapes and mark loop exit targets unsplice.
    fn classify_loops(&mut self) {
        for hi in 0..self.blocks.len() {
            let h = BlockId(hi);
            if !self.blocks[hi].flags.loopheader || self.blocks[hi].flags.irreducible {
                continue;
            }
            let body = self.blocks[hi].loop_nodes.clone();
            // The latch is the in-loop source of a back edge into the header.
            let latch = self.blocks[hi]
                .in_edges
                .iter()
                .find(|e| e.label.contains(EdgeLabel::BACK))
                .map(|e| e.point);
            let exits_loop = |fd: &Funcdata, b: BlockId| {
                fd.blocks[b.0]
                    .out_edges
                    .iter()
                    .any(|e| !body.contains(&e.point))
            };
            let ends_in_cbranch = |fd: &Funcdata, b: BlockId| {
                fd.blocks[b.0]
                    .last_op()
                    .map(|op| fd.op(op).opcode == Opcode::CBranch)
                    .unwrap_or(false)
            };
            if let Some(latch) = latch {
                if ends_in_cbranch(self, latch) && exits_loop(self, latch) {
                    self.blocks[latch.0].btype = BlockType::DoWhile;
                } else if ends_in_cbranch(self, h) && exits_loop(self, h) {
                    self.blocks[hi].btype = BlockType::WhileDo;
                }
            }
            // Exit targets are shared merge points; cloning passes must not cross them.
            for &b in &body {
                for i in 0..self.blocks[b.0].out_edges.len() {
                    let t = self.blocks[b.0].out_edges[i].point;
                    if !body.contains(&t) {
                        self.blocks[t.0].flags.unsplice = true;
                    }
                }
            }
        }
        for bi in 0..self.blocks.len() {
            if self.blocks[bi].flags.switch_out {
                self.blocks[bi].btype = BlockType::Switch;
            }
        }
    }

    /// Mark blocks from which every path leads out of the function (backward fixpoint from the
    /// return blocks).
    fn calc_exitpath(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for &bl in self.rpo.clone().iter().rev() {
                if self.blocks[bl.0].flags.exitpath {
                    continue;
                }
                let exits = if self.blocks[bl.0].flags.return_block {
                    true
                } else if self.blocks[bl.0].is_end() {
                    false
                } else {
                    self.blocks[bl.0]
                        .out_edges
                        .iter()
                        .all(|e| self.blocks[e.point.0].flags.exitpath)
                };
                if exits {
                    self.blocks[bl.0].flags.exitpath = true;
                    changed = true;
                }
            }
        }
    }

    // ---- edge surgery that respects phis ----

    /// Remove the in-edge at `slot` of `bl` and the matching input slot of every phi in `bl`.
    /// Phis left with a single input fold to copies.
    pub fn remove_in_edge_with_phis(&mut self, bl: BlockId, slot: usize) {
        self.remove_in_edge(bl, slot);
        for op in self.blocks[bl.0].ops.clone() {
            if self.op(op).opcode != Opcode::MultiEqual {
                break;
            }
            if slot < self.op(op).inputs.len() {
                self.op_remove_input(op, slot);
            }
            if self.op(op).inputs.len() == 1 {
                self.op_set_opcode(op, Opcode::Copy);
            }
        }
    }

    /// Resolve every queued branch whose control folded to a constant: computed branches are
    /// rewritten to direct ones, constant conditional branches lose their untaken edge, and
    /// structure plus values are recomputed. Repeats until propagation stops producing new
    /// foldable branches; returns how many branches were folded in total.
    ///
    /// Queue entries can go stale: an op queued while its input looked constant may see that
    /// input demoted by a later phi merge in the same fixpoint run. Such entries are skipped;
    /// if the input folds again, propagation requeues the op.
    pub fn prune_constant_branches(&mut self) -> Result<usize, EngineError> {
        let mut pruned = 0usize;
        while !self.cbr_queue.is_empty() || !self.calcbr_queue.is_empty() {
            let mut resolved = 0usize;
            for op in std::mem::take(&mut self.calcbr_queue) {
                if self.op(op).is_dead() || !self.vn(self.op(op).inputs[0]).is_constant() {
                    continue;
                }
                if self.resolve_computed_branch(op) {
                    resolved += 1;
                }
            }
            if resolved > 0 {
                // The new direct edge changes which definitions reach its target; phis,
                // dominance and every lattice value are invalid until SSA is rebuilt from
                // scratch. The rewind also drops the queued conditional branches, which were
                // judged on the stale values; propagation requeues whatever still folds.
                pruned += resolved;
                self.heritage_clear();
                self.structure_reset();
                self.heritage()?;
                self.propagate_to_fixpoint()?;
                continue;
            }
            let mut folded = 0usize;
            for op in std::mem::take(&mut self.cbr_queue) {
                if self.op(op).is_dead() || !self.vn(self.op(op).inputs[1]).is_constant() {
                    continue;
                }
                self.branch_remove(op);
                folded += 1;
            }
            pruned += folded;
            if folded == 0 {
                // Every entry was stale; the queues are empty now.
                continue;
            }
            self.structure_reset();
            self.splice_trivial_blocks();
            self.propagate_to_fixpoint()?;
        }
        Ok(pruned)
    }

    /// Delete a conditional branch whose condition is a known constant, severing the edge that
    /// can never be taken.
    pub fn branch_remove(&mut self, op: OpId) {
        let bl = self.op(op).parent.expect("queued branch is placed");
        let cond = self.op(op).inputs[1];
        debug_assert!(self.vn(cond).is_constant());
        let taken = self.vn(cond).get_val() != 0;
        let dead_edge = if taken {
            self.blocks[bl.0].get_false_edge()
        } else {
            self.blocks[bl.0].get_true_edge()
        };
        if let Some(target) = dead_edge.map(|e| e.point) {
            let in_slot = self.blocks[target.0]
                .get_in_slot(bl)
                .expect("edge lists are mutually consistent");
            trace!("folding constant branch";
                "func" => &self.name,
                "op" => format!("{:?}", self.op(op).seq),
                "taken" => taken);
            self.remove_in_edge_with_phis(target, in_slot);
        }
        self.op_destroy(op);
    }

    /// Merge every block with a single successor into that successor when the successor has no
    /// other predecessors and no phis. Unsplice-flagged blocks are left alone.
    pub fn splice_trivial_blocks(&mut self) {
        let mut merged = true;
        while merged {
            merged = false;
            for bi in 0..self.blocks.len() {
                let bl = BlockId(bi);
                if self.blocks[bi].flags.dead || self.blocks[bi].out_edges.len() != 1 {
                    continue;
                }
                let succ = self.blocks[bi].get_out(0);
                if succ == bl
                    || self.blocks[succ.0].in_edges.len() != 1
                    || self.blocks[succ.0].is_entry_point()
                    || self.blocks[succ.0].flags.unsplice
                {
                    continue;
                }
                let has_phi = self.blocks[succ.0]
                    .first_op()
                    .map(|op| self.op(op).opcode == Opcode::MultiEqual)
                    .unwrap_or(false);
                if has_phi {
                    continue;
                }
                // A terminating goto in the predecessor is now redundant.
                if let Some(last) = self.blocks[bi].last_op() {
                    if self.op(last).opcode == Opcode::Branch {
                        self.op_destroy(last);
                    }
                }
                self.remove_out_edge(bl, 0);
                for op in self.blocks[succ.0].ops.clone() {
                    self.blocks[succ.0].ops.retain(|&o| o != op);
                    self.all_ops[op.0].parent = None;
                    self.blocks[bi].ops.push(op);
                    self.all_ops[op.0].parent = Some(bl);
                }
                while !self.blocks[succ.0].out_edges.is_empty() {
                    let e = self.blocks[succ.0].out_edges[0];
                    self.remove_out_edge(succ, 0);
                    self.add_edge(bl, e.point, e.label & EdgeLabel::TRUE_EDGE);
                }
                self.blocks[succ.0].flags.dead = true;
                self.fix_order(bl);
                if self.blocks[succ.0].flags.return_block {
                    self.blocks[bi].flags.return_block = true;
                }
                merged = true;
            }
        }
        self.structure_reset();
    }
}
