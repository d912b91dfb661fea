//! Guided loop unrolling: the pass that defeats interpreter-style obfuscation.
//!
//! A VM-protected function is one big dispatch loop whose control depends on a bytecode stream
//! sitting in read-only memory. Each peel clones the loop body in front of the loop; with the
//! bytecode index entering the clone as a known constant, propagation folds the clone's dispatch
//! branch, pruning collapses it to the single handler actually executed, and the residual loop
//! sees the next index. Repeating this walks the whole bytecode program out of the loop. The
//! peel itself is semantics-preserving and fully general; only the stopping heuristics know
//! anything about interpreters.

use crate::block::EdgeLabel;
use crate::config::CONFIG;
use crate::error::EngineError;
use crate::funcdata::{BlockId, FuncCallSpec, Funcdata};
use crate::log::*;
use crate::pcodeop::Opcode;

impl Funcdata {
    /// Pick the interpreter dispatch loop, when the function looks VM-protected: the largest
    /// reducible loop whose body both loads from memory and branches on what it loaded. A plain
    /// counted loop matches too; peeling it once is harmless because the driver stops as soon
    /// as a peel folds nothing.
    pub fn detect_vmhead(&self) -> Option<BlockId> {
        let mut best: Option<BlockId> = None;
        for &h in &self.rpo {
            if !self.blocks[h.0].flags.loopheader || self.blocks[h.0].flags.irreducible {
                continue;
            }
            let body = &self.blocks[h.0].loop_nodes;
            let mut loads = false;
            let mut dispatch = false;
            for &b in body {
                for &op in &self.blocks[b.0].ops {
                    match self.op(op).opcode {
                        Opcode::Load => loads = true,
                        Opcode::BranchInd | Opcode::CBranch => dispatch = true,
                        _ => {}
                    }
                }
            }
            if !(loads && dispatch) {
                continue;
            }
            match best {
                Some(cur)
                    if self.blocks[cur.0].loop_nodes.len() >= self.blocks[h.0].loop_nodes.len() => {}
                _ => best = Some(h),
            }
        }
        best
    }

    /// Clone one block's ops into a fresh block. Reads rebind to the interned free varnode of
    /// their location and outputs get fresh varnodes, so the clone is pre-SSA; the caller is
    /// expected to rerun heritage over the whole function afterwards. Call sites are
    /// re-registered against the existing specs, never duplicated bodies.
    pub fn clone_block(&mut self, src: BlockId) -> BlockId {
        let dst = self.new_block();
        for op in self.blocks[src.0].ops.clone() {
            let addr = self.op(op).get_addr();
            let ninputs = self.op(op).num_input();
            let opcode = self.op(op).opcode;
            let copy = self.newop(ninputs, addr);
            self.op_set_opcode(copy, opcode);
            self.all_ops[copy.0].flags.startinst = self.op(op).flags.startinst;
            for slot in 0..ninputs {
                let vn = self.op(op).inputs[slot];
                if vn.is_invalid() {
                    continue;
                }
                let v = self.vn(vn);
                let cloned = if v.in_constant_space() {
                    self.new_constant(v.size, v.addr.offset)
                } else if v.addr.space == crate::address::SpaceKind::Ram {
                    self.new_varnode(v.size, v.addr)
                } else {
                    let (addr, size) = v.loc_key();
                    self.new_free_varnode(size, addr)
                };
                self.op_set_input(copy, cloned, slot);
            }
            if let Some(out) = self.op(op).output {
                let (addr, size) = self.vn(out).loc_key();
                let new_out = self.new_varnode(size, addr);
                self.op_set_output(copy, new_out);
            }
            if self.op(op).is_call() {
                if let Some(spec) = self.calls.iter().find(|s| s.op == op).cloned() {
                    self.calls.push(FuncCallSpec { op: copy, ..spec });
                }
            }
            self.op_insert_end(copy, dst);
        }
        self.blocks[src.0].copymap = Some(dst);
        dst
    }

    /// Copy a whole web of blocks, preserving internal edges between the clones. Edges leaving
    /// the web keep their original targets; back edges into `header` are redirected so the
    /// clones fall through into the original loop. Returns the clone of `header`.
    pub fn clone_web(&mut self, header: BlockId, body: &[BlockId]) -> BlockId {
        for &b in body {
            self.blocks[b.0].copymap = None;
        }
        for &b in body {
            self.clone_block(b);
        }
        for &b in body {
            let src_clone = self.blocks[b.0].copymap.expect("cloned just above");
            for i in 0..self.blocks[b.0].out_edges.len() {
                let e = self.blocks[b.0].out_edges[i];
                let keep = e.label & EdgeLabel::TRUE_EDGE;
                let target = if e.point == header && e.label.contains(EdgeLabel::BACK) {
                    // The clone's back edge feeds the original loop: this is the peel.
                    header
                } else if let Some(clone) = body
                    .contains(&e.point)
                    .then(|| self.blocks[e.point.0].copymap)
                    .flatten()
                {
                    clone
                } else {
                    e.point
                };
                self.add_edge(src_clone, target, keep);
            }
        }
        self.blocks[header.0].copymap.expect("header is in the body")
    }

    /// Peel one iteration of the loop at `header`: entry edges from outside the loop are moved
    /// onto a fresh copy of the body, which then falls through into the original loop. Refuses
    /// irreducible loops and loops whose body crosses a shared merge point.
    pub fn peel_loop(&mut self, header: BlockId) -> Result<bool, EngineError> {
        if self.blocks[header.0].flags.irreducible {
            return Ok(false);
        }
        let body = self.blocks[header.0].loop_nodes.clone();
        if body.is_empty() || body.iter().any(|&b| self.blocks[b.0].flags.unsplice) {
            return Ok(false);
        }
        let entry_slots: Vec<usize> = self.blocks[header.0]
            .in_edges
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.label.contains(EdgeLabel::BACK))
            .map(|(i, _)| i)
            .collect();
        if entry_slots.is_empty() || Some(header) == self.entry_block {
            return Ok(false);
        }
        let header_clone = self.clone_web(header, &body);
        // Walk slots highest-first so removal inside replace_in_edge cannot shift the rest.
        for &slot in entry_slots.iter().rev() {
            self.replace_in_edge(header, slot, header_clone);
        }
        Ok(true)
    }

    /// A do-while loop runs its body once before testing anything, so a single peel rewrites it
    /// into a guarded while-do whose first iteration is explicit. Mainly useful for giving the
    /// unroller (and the reader) a loop whose condition is evaluated at the top.
    pub fn dowhile_to_ifwhile(&mut self, header: BlockId) -> Result<bool, EngineError> {
        let peeled = self.peel_loop(header)?;
        if peeled {
            self.reheritage()?;
        }
        Ok(peeled)
    }

    /// Rebuild SSA and values after CFG surgery: rewind, restructure, re-heritage, propagate,
    /// and fold whatever became constant. Returns how many branches pruning resolved.
    fn reheritage(&mut self) -> Result<usize, EngineError> {
        self.heritage_clear();
        self.structure_reset();
        self.heritage()?;
        self.propagate_to_fixpoint()?;
        self.prune_constant_branches()
    }

    /// The driver: peel the dispatch loop at `vmhead` until it unravels, the iteration bound is
    /// reached, or a peel stops folding anything (meaning control no longer depends on values
    /// the lattice can see).
    pub fn loop_unrolling(&mut self, vmhead: BlockId) -> Result<(), EngineError> {
        for iteration in 0..CONFIG.max_unroll {
            if self.blocks[vmhead.0].flags.dead || !self.blocks[vmhead.0].flags.loopheader {
                info!("dispatch loop fully unrolled";
                    "func" => &self.name, "iterations" => iteration);
                return Ok(());
            }
            if !self.peel_loop(vmhead)? {
                debug!("dispatch loop not peelable"; "func" => &self.name);
                return Ok(());
            }
            if let Some(clone) = self.blocks[vmhead.0].copymap {
                self.blocks[clone.0].vm_byteindex = iteration as i32;
            }
            let folded = self.reheritage()?;
            if folded == 0 {
                debug!("peel stopped folding; leaving residual loop intact";
                    "func" => &self.name, "iterations" => iteration + 1);
                return Ok(());
            }
        }
        warn!("unroll bound reached with the dispatch loop still live";
            "func" => &self.name, "bound" => CONFIG.max_unroll);
        Ok(())
    }
}
