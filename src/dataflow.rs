//! Value propagation over the four-point lattice.
//!
//! A plain worklist fixpoint: every live op is evaluated, and whenever an op's output moves
//! down the lattice its readers are requeued. The same per-op evaluation
//! ([`Funcdata::compute_op`]) is reused verbatim by the trace-guided unrolling, which is what
//! keeps the two agreeing about what "the condition folded" means.

use std::collections::VecDeque;

use crate::address::{sext_to_size, wrap_to_size, LatticeHeight, ValueLattice};
use crate::error::{ComputeOutcome, EngineError};
use crate::funcdata::{Funcdata, OpId};
use crate::log::*;
use crate::pcodeop::Opcode;

impl Funcdata {
    /// Run lattice propagation to a fixed point over the live graph. Branches whose control
    /// folds constant along the way, conditional and computed alike, are queued for the prune
    /// loop; nothing rewrites the graph here.
    pub fn propagate_to_fixpoint(&mut self) -> Result<(), EngineError> {
        self.seed_lattice();
        let mut work: VecDeque<OpId> = self.alive_ops().into();
        let mut queued = vec![false; self.all_ops.len()];
        for &op in &work {
            queued[op.0] = true;
        }
        let mut evaluated = 0usize;
        while let Some(op) = work.pop_front() {
            queued[op.0] = false;
            if self.op(op).is_dead() {
                continue;
            }
            evaluated += 1;
            match self.compute_op(op) {
                ComputeOutcome::Settled { changed } => {
                    if changed {
                        if let Some(out) = self.op(op).output {
                            for &user in &self.vn(out).uses {
                                if !queued[user.0] {
                                    queued[user.0] = true;
                                    work.push_back(user);
                                }
                            }
                        }
                    }
                }
                ComputeOutcome::ConstCbranch => {
                    if !self.cbr_queue.contains(&op) {
                        self.cbr_queue.push(op);
                    }
                }
                ComputeOutcome::MeetCalcBranch => {
                    if !self.calcbr_queue.contains(&op) {
                        self.calcbr_queue.push(op);
                    }
                }
                ComputeOutcome::FreeSelf => {}
            }
        }
        trace!("propagation settled";
            "func" => &self.name,
            "evaluations" => evaluated,
            "const_branches" => self.cbr_queue.len());
        Ok(())
    }

    /// Initial lattice facts: the stack pointer enters the function at depth zero.
    fn seed_lattice(&mut self) {
        let Some(sp) = self.sp_addr else { return };
        for &vn in &self.inputs.clone() {
            if self.vn(vn).addr == sp {
                self.vns[vn.0].value = ValueLattice::rel_constant(sp, 0);
            }
        }
    }

    /// Evaluate one op on the lattice. The caller dispatches on the outcome; this never mutates
    /// the graph, only lattice values and op flags.
    pub fn compute_op(&mut self, op: OpId) -> ComputeOutcome {
        let opcode = self.op(op).opcode;
        // An op reading its own output outside a phi means heritage could not bind the read;
        // the value is unknowable through this path.
        if opcode != Opcode::MultiEqual {
            if let Some(out) = self.op(op).output {
                if self.op(op).inputs.contains(&out) {
                    self.vns[out.0].value = ValueLattice::bottom();
                    return ComputeOutcome::FreeSelf;
                }
            }
        }
        let inval = |fd: &Funcdata, slot: usize| fd.vn(fd.op(op).inputs[slot]).value;
        let new = match opcode {
            Opcode::Copy => inval(self, 0),
            Opcode::MultiEqual => {
                let mut acc = ValueLattice::top();
                let out = self.op(op).output;
                for &vn in &self.op(op).inputs {
                    if Some(vn) == out {
                        continue;
                    }
                    acc = acc.merge(&self.vn(vn).value);
                }
                acc
            }
            Opcode::Load => self.compute_load(op),
            Opcode::Store => {
                let addrval = inval(self, 0);
                self.all_ops[op.0].flags.uncalculated_store =
                    !addrval.is_constant() && !addrval.is_rel_constant();
                return ComputeOutcome::Settled { changed: false };
            }
            Opcode::CBranch => {
                if inval(self, 1).is_constant() {
                    return ComputeOutcome::ConstCbranch;
                }
                return ComputeOutcome::Settled { changed: false };
            }
            Opcode::BranchInd => {
                if inval(self, 0).is_constant() {
                    return ComputeOutcome::MeetCalcBranch;
                }
                return ComputeOutcome::Settled { changed: false };
            }
            Opcode::Branch | Opcode::Return | Opcode::Nop => {
                return ComputeOutcome::Settled { changed: false };
            }
            Opcode::Call | Opcode::CallInd => {
                // Whatever the callee computes is outside the lattice.
                ValueLattice::bottom()
            }
            Opcode::IntZext => self.compute_ext(op, false),
            Opcode::IntSext => self.compute_ext(op, true),
            Opcode::Int2Comp | Opcode::IntNegate | Opcode::BoolNegate => self.compute_unary(op),
            Opcode::SubPiece => self.compute_subpiece(op),
            _ => self.compute_binary(op),
        };
        self.finish_compute(op, new)
    }

    fn finish_compute(&mut self, op: OpId, new: ValueLattice) -> ComputeOutcome {
        let Some(out) = self.op(op).output else {
            return ComputeOutcome::Settled { changed: false };
        };
        let old = self.vn(out).value;
        if new == old {
            return ComputeOutcome::Settled { changed: false };
        }
        if new.is_constant() || new.is_rel_constant() {
            self.all_ops[op.0].flags.changed = true;
        }
        self.vns[out.0].value = new;
        ComputeOutcome::Settled { changed: true }
    }

    fn compute_load(&mut self, op: OpId) -> ValueLattice {
        let addrval = self.vn(self.op(op).inputs[0]).value;
        let out = self.op(op).output.expect("load has an output");
        let size = self.vn(out).size;
        if addrval.is_constant() {
            if addrval.value == 0 {
                self.all_ops[op.0].flags.zero_load = true;
                return ValueLattice::bottom();
            }
            if let Some(word) = self.read_const_mem(addrval.value as u64, size) {
                return ValueLattice::constant(wrap_to_size(word as i128, size));
            }
        }
        if addrval.is_constant() || addrval.is_rel_constant() {
            // A resolvable address outside the image: the store query may forward a value.
            if let Some(v) = self.forward_store(op) {
                return v;
            }
        }
        if addrval.is_top() {
            return ValueLattice::top();
        }
        ValueLattice::bottom()
    }

    fn compute_ext(&mut self, op: OpId, signed: bool) -> ValueLattice {
        let input = self.op(op).inputs[0];
        let v = self.vn(input).value;
        let insize = self.vn(input).size;
        let outsize = self.op(op).output.map(|o| self.vn(o).size).unwrap_or(insize);
        match v.height {
            LatticeHeight::Constant => {
                let raw = if signed {
                    sext_to_size(v.value, insize)
                } else {
                    wrap_to_size(v.value, insize)
                };
                ValueLattice::constant(wrap_to_size(raw, outsize))
            }
            LatticeHeight::Top => ValueLattice::top(),
            _ => ValueLattice::bottom(),
        }
    }

    fn compute_unary(&mut self, op: OpId) -> ValueLattice {
        let v = self.vn(self.op(op).inputs[0]).value;
        let size = self
            .op(op)
            .output
            .map(|o| self.vn(o).size)
            .unwrap_or(4);
        match v.height {
            LatticeHeight::Constant => {
                let r = match self.op(op).opcode {
                    Opcode::Int2Comp => wrap_to_size(v.value.wrapping_neg(), size),
                    Opcode::IntNegate => wrap_to_size(!v.value, size),
                    Opcode::BoolNegate => (v.value == 0) as i128,
                    _ => unreachable!("unary dispatch"),
                };
                ValueLattice::constant(r)
            }
            LatticeHeight::Top => ValueLattice::top(),
            _ => ValueLattice::bottom(),
        }
    }

    fn compute_subpiece(&mut self, op: OpId) -> ValueLattice {
        let v = self.vn(self.op(op).inputs[0]).value;
        let shift = self.vn(self.op(op).inputs[1]).value;
        let size = self
            .op(op)
            .output
            .map(|o| self.vn(o).size)
            .unwrap_or(4);
        match v.height {
            LatticeHeight::Constant => {
                let shifted = (v.value as u128 >> (shift.value * 8).min(127)) as i128;
                ValueLattice::constant(wrap_to_size(shifted, size))
            }
            LatticeHeight::Top => ValueLattice::top(),
            _ => ValueLattice::bottom(),
        }
    }

    /// The binary rule table: constants evaluate modulo the output width; rel-constants survive
    /// add/sub against constants, cancel against the same base, and demote otherwise.
    fn compute_binary(&mut self, op: OpId) -> ValueLattice {
        let a = self.vn(self.op(op).inputs[0]).value;
        let b = self.vn(self.op(op).inputs[1]).value;
        let opcode = self.op(op).opcode;
        let size = self
            .op(op)
            .output
            .map(|o| self.vn(o).size)
            .unwrap_or_else(|| self.vn(self.op(op).inputs[0]).size);

        if a.is_bottom() || b.is_bottom() {
            return ValueLattice::bottom();
        }
        if a.is_top() || b.is_top() {
            return ValueLattice::top();
        }

        use LatticeHeight::*;
        match (a.height, b.height) {
            (Constant, Constant) => eval_const_binary(opcode, a.value, b.value, size),
            (RelConstant, Constant) => match opcode {
                Opcode::IntAdd => ValueLattice::rel_constant(a.rel, a.value + b.value),
                Opcode::IntSub => ValueLattice::rel_constant(a.rel, a.value - b.value),
                _ => ValueLattice::bottom(),
            },
            (Constant, RelConstant) => match opcode {
                Opcode::IntAdd => ValueLattice::rel_constant(b.rel, b.value + a.value),
                _ => ValueLattice::bottom(),
            },
            (RelConstant, RelConstant) if a.rel == b.rel => match opcode {
                // The bases cancel; the result is a true constant.
                Opcode::IntSub => ValueLattice::constant(wrap_to_size(a.value - b.value, size)),
                Opcode::IntEqual => ValueLattice::constant((a.value == b.value) as i128),
                Opcode::IntNotEqual => ValueLattice::constant((a.value != b.value) as i128),
                Opcode::IntLess | Opcode::IntSLess => {
                    ValueLattice::constant((a.value < b.value) as i128)
                }
                Opcode::IntLessEqual | Opcode::IntSLessEqual => {
                    ValueLattice::constant((a.value <= b.value) as i128)
                }
                _ => ValueLattice::bottom(),
            },
            _ => ValueLattice::bottom(),
        }
    }

    /// A computed branch whose target folded to a known address: rewrite it to a direct branch
    /// when the target block already exists in the graph. The new edge changes which
    /// definitions reach the target, so the caller must rebuild SSA before trusting any value
    /// again; [`prune_constant_branches`](Self::prune_constant_branches) drives that.
    pub(crate) fn resolve_computed_branch(&mut self, op: OpId) -> bool {
        let target = self.vn(self.op(op).inputs[0]).value.value as u64;
        let Some(target_block) = self.find_block_at(target) else {
            debug!("computed branch target lies outside the decoded body";
                "func" => &self.name, "target" => format!("{:#x}", target));
            return false;
        };
        let bl = self.op(op).parent.expect("live op is placed");
        let tvn = self.new_varnode(4, crate::address::Address::ram(target));
        self.op_set_input(op, tvn, 0);
        self.op_set_opcode(op, Opcode::Branch);
        self.blocks[bl.0].flags.switch_out = false;
        while !self.blocks[bl.0].out_edges.is_empty() {
            let t = self.blocks[bl.0].out_edges[0].point;
            let slot = self.blocks[t.0]
                .get_in_slot(bl)
                .expect("edge lists are mutually consistent");
            self.remove_in_edge_with_phis(t, slot);
        }
        self.add_edge(bl, target_block, crate::block::EdgeLabel::empty());
        true
    }

    /// The block whose first instruction sits at ram offset `addr`.
    pub fn find_block_at(&self, addr: u64) -> Option<crate::funcdata::BlockId> {
        for &bl in &self.rpo {
            if let Some(op) = self.blocks[bl.0].first_op() {
                if self.op(op).get_addr().offset == addr {
                    return Some(bl);
                }
            }
        }
        None
    }

    /// Annotate every op touching the stack pointer with its depth below function entry.
    pub fn compute_sp(&mut self) {
        let Some(sp) = self.sp_addr else { return };
        for op in self.alive_ops() {
            let mut depth = None;
            for &vn in &self.op(op).inputs {
                if vn.is_invalid() {
                    continue;
                }
                let v = self.vn(vn);
                if v.addr == sp && v.value.is_rel_constant() && v.value.rel == sp {
                    depth = Some(v.value.value);
                }
            }
            if depth.is_none() {
                if let Some(out) = self.op(op).output {
                    let v = self.vn(out);
                    if v.addr == sp && v.value.is_rel_constant() && v.value.rel == sp {
                        depth = Some(v.value.value);
                    }
                }
            }
            self.all_ops[op.0].sp_depth = depth;
        }
    }

    /// Delete ops whose outputs nothing reads, repeatedly, until nothing else dies. Side
    /// effects (stores, branches, calls) always survive, as do loads from address zero: the
    /// original program faults there and the output graph must too.
    pub fn dead_code_elimination(&mut self) {
        let mut removed = 0usize;
        let mut changed = true;
        while changed {
            changed = false;
            for op in self.alive_ops() {
                if self.op(op).is_dead()
                    || self.op(op).has_side_effect()
                    || self.op(op).flags.zero_load
                {
                    continue;
                }
                let dead = match self.op(op).output {
                    Some(out) => self.vn(out).has_no_use(),
                    None => self.op(op).opcode == Opcode::Nop,
                };
                if dead {
                    self.op_destroy(op);
                    removed += 1;
                    changed = true;
                }
            }
        }
        if removed > 0 {
            debug!("dead code removed"; "func" => &self.name, "ops" => removed);
        }
    }
}

fn eval_const_binary(opcode: Opcode, a: i128, b: i128, size: i32) -> ValueLattice {
    let sa = sext_to_size(a, size);
    let sb = sext_to_size(b, size);
    let ua = wrap_to_size(a, size);
    let ub = wrap_to_size(b, size);
    let r = match opcode {
        Opcode::IntAdd => a.wrapping_add(b),
        Opcode::IntSub => a.wrapping_sub(b),
        Opcode::IntMult => a.wrapping_mul(b),
        Opcode::IntDiv => {
            if ub == 0 {
                return ValueLattice::bottom();
            }
            ua / ub
        }
        Opcode::IntSDiv => {
            if sb == 0 {
                return ValueLattice::bottom();
            }
            sa.wrapping_div(sb)
        }
        Opcode::IntRem => {
            if ub == 0 {
                return ValueLattice::bottom();
            }
            ua % ub
        }
        Opcode::IntSRem => {
            if sb == 0 {
                return ValueLattice::bottom();
            }
            sa.wrapping_rem(sb)
        }
        Opcode::IntAnd | Opcode::BoolAnd => a & b,
        Opcode::IntOr | Opcode::BoolOr => a | b,
        Opcode::IntXor | Opcode::BoolXor => a ^ b,
        Opcode::IntLeft => {
            if ub >= 128 {
                0
            } else {
                (ua as u128).wrapping_shl(ub as u32) as i128
            }
        }
        Opcode::IntRight => {
            if ub >= 128 {
                0
            } else {
                (ua as u128 >> ub) as i128
            }
        }
        Opcode::IntSRight => {
            if ub >= 128 {
                if sa < 0 {
                    -1
                } else {
                    0
                }
            } else {
                sa >> ub
            }
        }
        Opcode::IntEqual => (ua == ub) as i128,
        Opcode::IntNotEqual => (ua != ub) as i128,
        Opcode::IntLess => (ua < ub) as i128,
        Opcode::IntSLess => (sa < sb) as i128,
        Opcode::IntLessEqual => (ua <= ub) as i128,
        Opcode::IntSLessEqual => (sa <= sb) as i128,
        _ => return ValueLattice::bottom(),
    };
    ValueLattice::constant(wrap_to_size(r, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[test]
    fn const_arithmetic_wraps_at_operand_width() {
        let v = eval_const_binary(Opcode::IntAdd, 0xffff_ffff, 1, 4);
        assert_eq!(v, ValueLattice::constant(0));
        let v = eval_const_binary(Opcode::IntSub, 0, 1, 4);
        assert_eq!(v, ValueLattice::constant(0xffff_ffff));
    }

    #[test]
    fn signed_and_unsigned_compares_disagree_on_negatives() {
        // 0xffffffff is -1 signed, huge unsigned.
        let lt_signed = eval_const_binary(Opcode::IntSLess, 0xffff_ffff, 1, 4);
        let lt_unsigned = eval_const_binary(Opcode::IntLess, 0xffff_ffff, 1, 4);
        assert_eq!(lt_signed, ValueLattice::constant(1));
        assert_eq!(lt_unsigned, ValueLattice::constant(0));
    }

    #[test]
    fn division_by_zero_is_bottom() {
        assert!(eval_const_binary(Opcode::IntDiv, 5, 0, 4).is_bottom());
        assert!(eval_const_binary(Opcode::IntSRem, 5, 0, 4).is_bottom());
    }

    #[test]
    fn same_base_rel_constants_cancel_under_sub() {
        let sp = Address::register(0x34);
        let mut fd = crate::funcdata::Funcdata::new("t", Address::ram(0));
        let bl = fd.new_block();
        fd.entry_block = Some(bl);
        fd.blocks[bl.0].flags.entry_point = true;
        fd.rpo = vec![bl];
        let a = fd.new_varnode(4, Address::register(0x10));
        let b = fd.new_varnode(4, Address::register(0x14));
        fd.vns[a.0].value = ValueLattice::rel_constant(sp, -8);
        fd.vns[b.0].value = ValueLattice::rel_constant(sp, -24);
        let op = fd.newop(2, Address::ram(0x1000));
        fd.op_set_opcode(op, Opcode::IntSub);
        fd.op_set_input(op, a, 0);
        fd.op_set_input(op, b, 1);
        let out = fd.new_varnode_out(4, Address::register(0x18), op);
        fd.op_insert_end(op, bl);
        fd.compute_op(op);
        assert_eq!(fd.vn(out).value, ValueLattice::constant(16));
    }
}
