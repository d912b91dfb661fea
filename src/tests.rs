//! Synthetic-program builders and whole-pipeline tests.
//!
//! The builders construct small graphs directly against the arena API (no decoder involved) so
//! unit tests elsewhere can exercise a single pass; the tests at the bottom drive full programs
//! through the decoder and the pipeline.

use crate::address::Address;
use crate::block::EdgeLabel;
use crate::funcdata::{BlockId, Funcdata, OpId, VarnodeId};
use crate::pcodeop::Opcode;

pub const R0: u64 = 0x0;
pub const R1: u64 = 0x4;
pub const R4: u64 = 0x10;
pub const COND: u64 = 0x20;
pub const SP: u64 = 0x34;

/// A hand-built function plus the block handles tests care about.
pub struct SyntheticProgram {
    pub fd: Funcdata,
    pub entry: BlockId,
    pub join: BlockId,
}

/// Append an op to `bl`: reads intern as free varnodes, constants as fresh constant nodes.
pub fn emit(
    fd: &mut Funcdata,
    bl: BlockId,
    addr: u64,
    opcode: Opcode,
    out: Option<(Address, i32)>,
    ins: &[VarnodeId],
) -> OpId {
    let op = fd.newop(ins.len(), Address::ram(addr));
    fd.op_set_opcode(op, opcode);
    for (slot, &vn) in ins.iter().enumerate() {
        fd.op_set_input(op, vn, slot);
    }
    if let Some((addr, size)) = out {
        fd.new_varnode_out(size, addr, op);
    }
    fd.op_insert_end(op, bl);
    op
}

impl SyntheticProgram {
    /// entry --(true)--> then --> join <-- else <--(false)-- entry, with both branches writing
    /// a different constant into r0 and the join reading it.
    pub fn diamond_const_writes(a: u64, b: u64) -> Self {
        let mut fd = Funcdata::new("diamond", Address::ram(0x1000));
        let entry = fd.new_block();
        let then_bl = fd.new_block();
        let else_bl = fd.new_block();
        let join = fd.new_block();
        fd.entry_block = Some(entry);
        fd.blocks[entry.0].flags.entry_point = true;

        let target = fd.new_varnode(4, Address::ram(0x1008));
        let cond = fd.new_free_varnode(1, Address::register(COND));
        emit(&mut fd, entry, 0x1000, Opcode::CBranch, None, &[target, cond]);

        let ca = fd.new_constant(4, a);
        emit(
            &mut fd,
            then_bl,
            0x1008,
            Opcode::Copy,
            Some((Address::register(R0), 4)),
            &[ca],
        );
        let cb = fd.new_constant(4, b);
        emit(
            &mut fd,
            else_bl,
            0x1004,
            Opcode::Copy,
            Some((Address::register(R0), 4)),
            &[cb],
        );

        let r0 = fd.new_free_varnode(4, Address::register(R0));
        emit(
            &mut fd,
            join,
            0x100c,
            Opcode::Copy,
            Some((Address::register(R1), 4)),
            &[r0],
        );
        emit(&mut fd, join, 0x1010, Opcode::Return, None, &[]);

        fd.add_edge(entry, then_bl, EdgeLabel::TRUE_EDGE);
        fd.add_edge(entry, else_bl, EdgeLabel::empty());
        fd.add_edge(then_bl, join, EdgeLabel::empty());
        fd.add_edge(else_bl, join, EdgeLabel::empty());
        Self { fd, entry, join }
    }

    /// One block copying an unwritten register; exactly one function input should appear.
    pub fn straightline_copy_chain() -> Self {
        let mut fd = Funcdata::new("straight", Address::ram(0x1000));
        let entry = fd.new_block();
        fd.entry_block = Some(entry);
        fd.blocks[entry.0].flags.entry_point = true;
        let r1 = fd.new_free_varnode(4, Address::register(R1));
        emit(
            &mut fd,
            entry,
            0x1000,
            Opcode::Copy,
            Some((Address::register(R0), 4)),
            &[r1],
        );
        emit(&mut fd, entry, 0x1004, Opcode::Return, None, &[]);
        Self { fd, entry, join: entry }
    }

    /// entry -> header; header conditionally exits; body branches back to header.
    pub fn whiledo_loop() -> Self {
        let mut fd = Funcdata::new("whiledo", Address::ram(0x1000));
        let entry = fd.new_block();
        let header = fd.new_block();
        let body = fd.new_block();
        let exit = fd.new_block();
        fd.entry_block = Some(entry);
        fd.blocks[entry.0].flags.entry_point = true;

        let target = fd.new_varnode(4, Address::ram(0x1010));
        let cond = fd.new_free_varnode(1, Address::register(COND));
        emit(&mut fd, header, 0x1004, Opcode::CBranch, None, &[target, cond]);
        let back = fd.new_varnode(4, Address::ram(0x1004));
        emit(&mut fd, body, 0x1008, Opcode::Branch, None, &[back]);
        emit(&mut fd, exit, 0x1010, Opcode::Return, None, &[]);
        fd.blocks[exit.0].flags.return_block = true;

        fd.add_edge(entry, header, EdgeLabel::empty());
        fd.add_edge(header, exit, EdgeLabel::TRUE_EDGE);
        fd.add_edge(header, body, EdgeLabel::empty());
        fd.add_edge(body, header, EdgeLabel::empty());
        Self { fd, entry, join: header }
    }

    /// A cycle with two entries; neither cycle node dominates the other.
    pub fn irreducible_pair() -> Self {
        let mut fd = Funcdata::new("irreducible", Address::ram(0x1000));
        let entry = fd.new_block();
        let a = fd.new_block();
        let b = fd.new_block();
        fd.entry_block = Some(entry);
        fd.blocks[entry.0].flags.entry_point = true;

        let target = fd.new_varnode(4, Address::ram(0x1008));
        let cond = fd.new_free_varnode(1, Address::register(COND));
        emit(&mut fd, entry, 0x1000, Opcode::CBranch, None, &[target, cond]);

        fd.add_edge(entry, a, EdgeLabel::TRUE_EDGE);
        fd.add_edge(entry, b, EdgeLabel::empty());
        fd.add_edge(a, b, EdgeLabel::empty());
        fd.add_edge(b, a, EdgeLabel::empty());
        Self { fd, entry, join: a }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ValueLattice;
    use crate::block::BlockType;
    use crate::decoder::{OpTemplate, StaticDecoder, VarnodeData};
    use crate::engine::{Engine, RegisterSet};

    fn reg(offset: u64) -> VarnodeData {
        VarnodeData::register(offset, 4)
    }

    fn con(value: u64) -> VarnodeData {
        VarnodeData::constant(value, 4)
    }

    fn uniq(offset: u64, size: i32) -> VarnodeData {
        VarnodeData::new(crate::address::SpaceKind::Unique, offset, size)
    }

    fn tpl(opcode: Opcode, output: Option<VarnodeData>, inputs: Vec<VarnodeData>) -> OpTemplate {
        OpTemplate::new(opcode, output, inputs)
    }

    // ---- structure ----

    /// Brute-force dominator sets: b dominates x iff removing b makes x unreachable.
    fn brute_force_dominators(fd: &Funcdata, x: BlockId) -> Vec<BlockId> {
        let entry = fd.entry_block.expect("entry exists");
        let mut doms = Vec::new();
        for &cand in &fd.rpo {
            let mut seen = vec![false; fd.blocks.len()];
            let mut work = vec![entry];
            while let Some(bl) = work.pop() {
                if bl == cand || seen[bl.0] {
                    continue;
                }
                seen[bl.0] = true;
                for e in &fd.blocks[bl.0].out_edges {
                    work.push(e.point);
                }
            }
            if !seen[x.0] {
                doms.push(cand);
            }
        }
        doms
    }

    #[test]
    fn dominators_match_brute_force() {
        let mut prog = SyntheticProgram::whiledo_loop();
        prog.fd.structure_reset();
        for &bl in prog.fd.rpo.clone().iter() {
            let brute = brute_force_dominators(&prog.fd, bl);
            for &cand in &prog.fd.rpo {
                assert_eq!(
                    prog.fd.dominates(cand, bl),
                    brute.contains(&cand),
                    "dominates({:?}, {:?})",
                    cand,
                    bl
                );
            }
        }
    }

    #[test]
    fn whiledo_loop_is_classified_and_labeled() {
        let mut prog = SyntheticProgram::whiledo_loop();
        prog.fd.structure_reset();
        let header = prog.join;
        assert!(prog.fd.blocks[header.0].flags.loopheader);
        assert!(!prog.fd.blocks[header.0].flags.irreducible);
        assert_eq!(prog.fd.blocks[header.0].btype, BlockType::WhileDo);
        assert_eq!(prog.fd.blocks[header.0].loop_nodes.len(), 2);
        let back_in = prog.fd.blocks[header.0]
            .in_edges
            .iter()
            .filter(|e| e.label.contains(EdgeLabel::BACK))
            .count();
        assert_eq!(back_in, 1);
        // The loop's exit target is a merge point cloning must not cross.
        let exit = prog.fd.blocks[header.0]
            .get_true_edge()
            .expect("exit edge")
            .point;
        assert!(prog.fd.blocks[exit.0].flags.unsplice);
        // Only the exit block is guaranteed to leave the function; the header can loop forever.
        assert!(prog.fd.blocks[exit.0].flags.exitpath);
        assert!(!prog.fd.blocks[header.0].flags.exitpath);
    }

    #[test]
    fn dowhile_self_loop_is_rewritten_to_a_guarded_while() {
        let mut fd = Funcdata::new("dowhile", Address::ram(0x1000));
        let entry = fd.new_block();
        let body = fd.new_block();
        let exit = fd.new_block();
        fd.entry_block = Some(entry);
        fd.blocks[entry.0].flags.entry_point = true;
        let target = fd.new_varnode(4, Address::ram(0x1004));
        let cond = fd.new_free_varnode(1, Address::register(COND));
        emit(&mut fd, body, 0x1004, Opcode::CBranch, None, &[target, cond]);
        emit(&mut fd, exit, 0x1008, Opcode::Return, None, &[]);
        fd.blocks[exit.0].flags.return_block = true;
        fd.add_edge(entry, body, EdgeLabel::empty());
        fd.add_edge(body, body, EdgeLabel::TRUE_EDGE);
        fd.add_edge(body, exit, EdgeLabel::empty());

        fd.structure_reset();
        assert_eq!(fd.blocks[body.0].btype, BlockType::DoWhile);
        assert_eq!(fd.dowhile_to_ifwhile(body), Ok(true));
        // The entry now reaches a peeled copy whose fallthrough guards the original loop.
        assert_ne!(fd.blocks[entry.0].out_edges[0].point, body);
        let cbranches = fd
            .alive_ops()
            .iter()
            .filter(|&&op| fd.op(op).opcode == Opcode::CBranch)
            .count();
        assert_eq!(cbranches, 2);
    }

    #[test]
    fn irreducible_cycles_are_flagged_and_refuse_peeling() {
        let mut prog = SyntheticProgram::irreducible_pair();
        prog.fd.structure_reset();
        let flagged: Vec<BlockId> = prog
            .fd
            .rpo
            .iter()
            .copied()
            .filter(|&b| prog.fd.blocks[b.0].flags.irreducible)
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(prog.fd.peel_loop(flagged[0]), Ok(false));
    }

    #[test]
    fn edge_surgery_keeps_the_half_lists_mirrored() {
        let mut fd = Funcdata::new("edges", Address::ram(0));
        let blocks: Vec<BlockId> = (0..5).map(|_| fd.new_block()).collect();
        for i in 0..4 {
            fd.add_edge(blocks[i], blocks[i + 1], EdgeLabel::empty());
        }
        fd.add_edge(blocks[0], blocks[2], EdgeLabel::TRUE_EDGE);
        fd.add_edge(blocks[4], blocks[0], EdgeLabel::empty());
        fd.add_edge(blocks[2], blocks[2], EdgeLabel::empty());
        assert!(fd.check_edge_consistency());
        fd.remove_out_edge(blocks[0], 0);
        assert!(fd.check_edge_consistency());
        fd.replace_in_edge(blocks[2], 0, blocks[3]);
        assert!(fd.check_edge_consistency());
        fd.remove_edge(blocks[2], blocks[2]);
        assert!(fd.check_edge_consistency());
        fd.replace_out_edge(blocks[4], 0, blocks[1]);
        assert!(fd.check_edge_consistency());
    }

    // ---- values through the pipeline ----

    #[test]
    fn phi_of_distinct_constants_demotes_and_cover_spans_the_diamond() {
        let mut prog = SyntheticProgram::diamond_const_writes(1, 2);
        prog.fd.structure_reset();
        prog.fd.heritage().expect("heritage");
        prog.fd.propagate_to_fixpoint().expect("propagate");
        let join = prog.join;
        let phi = prog.fd.blocks[join.0].ops[0];
        assert_eq!(prog.fd.op(phi).opcode, Opcode::MultiEqual);
        let out = prog.fd.op(phi).output.expect("phi output");
        assert!(prog.fd.vn(out).value.is_bottom());
        // Each branch constant is live from its def to the bottom of its block.
        for &input in &prog.fd.op(phi).inputs {
            let def = prog.fd.vn(input).def.expect("written in a branch");
            let bl = prog.fd.op(def).parent.expect("placed");
            assert!(prog.fd.vn(input).cover.contains(bl.0, i32::MAX));
        }
        // The two branch-local values never coexist, but the phi output overlaps the value it
        // feeds inside the join block.
        let ins = prog.fd.op(phi).inputs.clone();
        assert!(!prog.fd.intersect_cover(ins[0], ins[1]));
        let r1 = prog.fd.blocks[join.0]
            .ops
            .iter()
            .find_map(|&op| (prog.fd.op(op).opcode == Opcode::Copy).then(|| prog.fd.op(op).output))
            .flatten()
            .expect("join writes r1");
        assert!(prog.fd.intersect_cover(out, r1));
    }

    #[test]
    fn interned_free_reads_resolve_to_one_input() {
        let mut fd = Funcdata::new("intern", Address::ram(0));
        let a = fd.new_free_varnode(4, Address::register(R1));
        let b = fd.new_free_varnode(4, Address::register(R1));
        assert_eq!(a, b);
        // A written varnode at the location must not be handed out as free.
        let op = fd.newop(1, Address::ram(0));
        fd.op_set_opcode(op, Opcode::Copy);
        let c = fd.new_constant(4, 1);
        fd.op_set_input(op, c, 0);
        fd.op_set_output(op, a);
        let d = fd.new_free_varnode(4, Address::register(R1));
        assert_ne!(a, d);
    }

    #[test]
    fn constant_branch_prunes_the_untaken_side() {
        let mut dec = StaticDecoder::new();
        dec.add_instruction(0x1000, 4, vec![tpl(Opcode::Copy, Some(reg(R0)), vec![con(1)])]);
        dec.add_instruction(
            0x1004,
            4,
            vec![
                tpl(Opcode::IntEqual, Some(uniq(0, 1)), vec![reg(R0), con(1)]),
                tpl(Opcode::CBranch, None, vec![VarnodeData::ram(0x1010), uniq(0, 1)]),
            ],
        );
        dec.add_instruction(0x1008, 4, vec![tpl(Opcode::Copy, Some(reg(R1)), vec![con(0xdead)])]);
        dec.add_instruction(0x100c, 4, vec![tpl(Opcode::Return, None, vec![reg(R1)])]);
        dec.add_instruction(0x1010, 4, vec![tpl(Opcode::Copy, Some(reg(R1)), vec![con(0x2a)])]);
        dec.add_instruction(0x1014, 4, vec![tpl(Opcode::Return, None, vec![reg(R1)])]);

        let mut fd = Funcdata::new("pruned", Address::ram(0x1000));
        fd.follow_flow(&dec).expect("flow");
        fd.run_pipeline().expect("pipeline");

        assert!(fd.find_block_at(0x1008).is_none(), "untaken side removed");
        assert!(fd
            .alive_ops()
            .iter()
            .all(|&op| fd.op(op).opcode != Opcode::CBranch));
        assert!(fd
            .vns
            .iter()
            .any(|v| v.addr == Address::register(R1)
                && v.flags.written
                && v.value == ValueLattice::constant(0x2a)));
    }

    #[test]
    fn stack_pointer_rides_the_rel_constant_lattice() {
        let mut dec = StaticDecoder::new();
        dec.add_instruction(
            0x1000,
            4,
            vec![tpl(Opcode::IntSub, Some(reg(SP)), vec![reg(SP), con(0x10)])],
        );
        dec.add_instruction(
            0x1004,
            4,
            vec![tpl(Opcode::IntAdd, Some(reg(R0)), vec![reg(SP), con(4)])],
        );
        dec.add_instruction(0x1008, 4, vec![tpl(Opcode::Return, None, vec![reg(R0)])]);

        let mut fd = Funcdata::new("sp", Address::ram(0x1000));
        fd.sp_addr = Some(Address::register(SP));
        fd.follow_flow(&dec).expect("flow");
        fd.run_pipeline().expect("pipeline");

        let sp = Address::register(SP);
        assert!(fd
            .vns
            .iter()
            .any(|v| v.addr == Address::register(R0)
                && v.value == ValueLattice::rel_constant(sp, -0xc)));
        // The annotation reflects the depth at each op that touches sp.
        let depths: Vec<Option<i128>> = fd
            .alive_ops()
            .iter()
            .map(|&op| fd.op(op).sp_depth)
            .collect();
        assert!(depths.contains(&Some(0)));
        assert!(depths.contains(&Some(-0x10)));
    }

    #[test]
    fn safezone_stores_nobody_loads_are_removed_for_good() {
        let mut fd = Funcdata::new("deadstore", Address::ram(0x1000));
        fd.sp_addr = Some(Address::register(SP));
        fd.set_safezone(-0x100, 0x100);
        let entry = fd.new_block();
        fd.entry_block = Some(entry);
        fd.blocks[entry.0].flags.entry_point = true;
        let sp = fd.new_free_varnode(4, Address::register(SP));
        let four = fd.new_constant(4, 4);
        let addr_op = emit(
            &mut fd,
            entry,
            0x1000,
            Opcode::IntSub,
            Some((Address::new(crate::address::SpaceKind::Unique, 0), 4)),
            &[sp, four],
        );
        let addr = fd.op(addr_op).output.expect("address computed");
        let val = fd.new_constant(4, 42);
        emit(&mut fd, entry, 0x1004, Opcode::Store, None, &[addr, val]);
        emit(&mut fd, entry, 0x1008, Opcode::Return, None, &[]);

        fd.structure_reset();
        fd.heritage().expect("heritage");
        fd.propagate_to_fixpoint().expect("propagate");
        fd.remove_dead_stores().expect("dead stores");
        fd.dead_code_elimination();
        assert_eq!(fd.alive_ops().len(), 1, "only the return survives");
        let before = fd.alive_ops();
        fd.remove_dead_stores().expect("second run");
        assert_eq!(fd.alive_ops(), before, "removal is idempotent");
    }

    #[test]
    fn branch_side_store_blocks_forwarding_across_the_join() {
        // entry stores 5 to [sp-4] and branches; the then-side stores 7 to the same slot; the
        // join loads it. The dominating store must not be forwarded past the sibling store.
        let mut fd = Funcdata::new("sidestore", Address::ram(0x1000));
        fd.sp_addr = Some(Address::register(SP));
        fd.set_safezone(-0x100, 0x100);
        let entry = fd.new_block();
        let then_bl = fd.new_block();
        let join = fd.new_block();
        fd.entry_block = Some(entry);
        fd.blocks[entry.0].flags.entry_point = true;
        let slot = |fd: &mut Funcdata, bl, addr, uniq_off| {
            let sp = fd.new_free_varnode(4, Address::register(SP));
            let four = fd.new_constant(4, 4);
            let op = emit(
                fd,
                bl,
                addr,
                Opcode::IntSub,
                Some((Address::new(crate::address::SpaceKind::Unique, uniq_off), 4)),
                &[sp, four],
            );
            fd.op(op).output.expect("address computed")
        };

        let a0 = slot(&mut fd, entry, 0x1000, 0);
        let five = fd.new_constant(4, 5);
        emit(&mut fd, entry, 0x1004, Opcode::Store, None, &[a0, five]);
        let target = fd.new_varnode(4, Address::ram(0x1010));
        let cond = fd.new_free_varnode(1, Address::register(COND));
        emit(&mut fd, entry, 0x1008, Opcode::CBranch, None, &[target, cond]);

        let a1 = slot(&mut fd, then_bl, 0x1010, 8);
        let seven = fd.new_constant(4, 7);
        emit(&mut fd, then_bl, 0x1014, Opcode::Store, None, &[a1, seven]);

        let a2 = slot(&mut fd, join, 0x1020, 0x10);
        let load = emit(
            &mut fd,
            join,
            0x1024,
            Opcode::Load,
            Some((Address::register(R0), 4)),
            &[a2],
        );
        emit(&mut fd, join, 0x1028, Opcode::Return, None, &[]);

        fd.add_edge(entry, then_bl, EdgeLabel::TRUE_EDGE);
        fd.add_edge(entry, join, EdgeLabel::empty());
        fd.add_edge(then_bl, join, EdgeLabel::empty());

        fd.structure_reset();
        fd.heritage().expect("heritage");
        fd.propagate_to_fixpoint().expect("propagate");

        assert!(matches!(
            fd.store_query(load).expect("query"),
            crate::alias::StoreQuery::MayStore(_)
        ));
        let lv = fd.vn(fd.op(load).output.expect("load output")).value;
        assert!(lv.is_bottom(), "the slot depends on the branch, got {:?}", lv);
    }

    #[test]
    fn demoted_loop_condition_does_not_fold_the_branch() {
        // The exit compare looks constant while the back-edge value is still unanalyzed, then a
        // phi merge demotes it; the queued fold must be discarded, not applied.
        let mut dec = StaticDecoder::new();
        dec.add_instruction(0x1000, 4, vec![tpl(Opcode::Copy, Some(reg(R4)), vec![con(0)])]);
        dec.add_instruction(
            0x1004,
            4,
            vec![
                tpl(Opcode::IntEqual, Some(uniq(0, 1)), vec![reg(R4), con(0)]),
                tpl(Opcode::CBranch, None, vec![VarnodeData::ram(0x1010), uniq(0, 1)]),
            ],
        );
        dec.add_instruction(
            0x1008,
            4,
            vec![tpl(Opcode::IntAdd, Some(reg(R4)), vec![reg(R4), con(1)])],
        );
        dec.add_instruction(
            0x100c,
            4,
            vec![tpl(Opcode::Branch, None, vec![VarnodeData::ram(0x1004)])],
        );
        dec.add_instruction(0x1010, 4, vec![tpl(Opcode::Return, None, vec![reg(R4)])]);

        let mut fd = Funcdata::new("demoted", Address::ram(0x1000));
        fd.follow_flow(&dec).expect("flow");
        fd.run_pipeline().expect("pipeline");

        assert!(
            fd.alive_ops()
                .iter()
                .any(|&op| fd.op(op).opcode == Opcode::CBranch),
            "the branch survives the stale queue entry"
        );
        assert!(fd.rpo.iter().any(|&b| fd.blocks[b.0].flags.loopheader));
    }

    #[test]
    fn resolved_computed_branch_rebuilds_phis_for_the_new_edge() {
        // One path reaches 0x1010 directly, the other through a computed branch whose target
        // folds. After the rewrite the join needs a phi per in-edge.
        let mut dec = StaticDecoder::new();
        dec.add_instruction(
            0x1000,
            4,
            vec![tpl(
                Opcode::CBranch,
                None,
                vec![
                    VarnodeData::ram(0x1010),
                    VarnodeData::new(crate::address::SpaceKind::Register, COND, 1),
                ],
            )],
        );
        dec.add_instruction(0x1004, 4, vec![tpl(Opcode::Copy, Some(reg(R1)), vec![con(1)])]);
        dec.add_instruction(0x1008, 4, vec![tpl(Opcode::Copy, Some(reg(R0)), vec![con(0x1010)])]);
        dec.add_instruction(0x100c, 4, vec![tpl(Opcode::BranchInd, None, vec![reg(R0)])]);
        dec.add_instruction(
            0x1010,
            4,
            vec![tpl(Opcode::IntAdd, Some(reg(R4)), vec![reg(R1), con(1)])],
        );
        dec.add_instruction(0x1014, 4, vec![tpl(Opcode::Return, None, vec![reg(R4)])]);

        let mut fd = Funcdata::new("calcbr", Address::ram(0x1000));
        fd.follow_flow(&dec).expect("flow");
        fd.run_pipeline().expect("pipeline");

        assert!(fd
            .alive_ops()
            .iter()
            .all(|&op| fd.op(op).opcode != Opcode::BranchInd));
        let ind = fd.find_block_at(0x1004).expect("rewritten block");
        assert!(!fd.blocks[ind.0].flags.switch_out);
        let join = fd.find_block_at(0x1010).expect("join target");
        assert_eq!(fd.blocks[join.0].in_edges.len(), 2);
        assert!(
            fd.blocks[join.0]
                .ops
                .iter()
                .any(|&op| fd.op(op).opcode == Opcode::MultiEqual),
            "the branch-dependent register gets a phi"
        );
        for &bl in &fd.rpo {
            for &op in &fd.blocks[bl.0].ops {
                if fd.op(op).opcode != Opcode::MultiEqual {
                    break;
                }
                assert_eq!(fd.op(op).inputs.len(), fd.blocks[bl.0].in_edges.len());
            }
        }
        assert!(fd.check_edge_consistency());
    }

    #[test]
    fn loop_carried_stack_adjustment_demotes_to_bottom() {
        // The loop body moves sp every iteration; the value re-entering the header differs from
        // the entry value, so everything downstream of the merge leaves the rel lattice.
        let mut dec = StaticDecoder::new();
        dec.add_instruction(
            0x1000,
            4,
            vec![tpl(Opcode::IntSub, Some(reg(SP)), vec![reg(SP), con(0x10)])],
        );
        dec.add_instruction(
            0x1004,
            4,
            vec![tpl(Opcode::IntSub, Some(reg(SP)), vec![reg(SP), con(4)])],
        );
        dec.add_instruction(
            0x1008,
            4,
            vec![
                tpl(Opcode::IntEqual, Some(uniq(0, 1)), vec![reg(R0), con(0)]),
                tpl(Opcode::CBranch, None, vec![VarnodeData::ram(0x1004), uniq(0, 1)]),
            ],
        );
        dec.add_instruction(
            0x100c,
            4,
            vec![tpl(Opcode::IntAdd, Some(reg(R1)), vec![reg(SP), con(0)])],
        );
        dec.add_instruction(0x1010, 4, vec![tpl(Opcode::Return, None, vec![reg(R1)])]);

        let mut fd = Funcdata::new("sp_loop", Address::ram(0x1000));
        fd.sp_addr = Some(Address::register(SP));
        fd.follow_flow(&dec).expect("flow");
        fd.run_pipeline().expect("pipeline");

        let sp = Address::register(SP);
        // The pre-loop adjustment still rides the rel lattice.
        assert!(fd
            .vns
            .iter()
            .any(|v| v.addr == sp && v.value == ValueLattice::rel_constant(sp, -0x10)));
        // The merge at the loop header demotes, and the post-loop read sees Bottom.
        assert!(fd.alive_ops().iter().any(|&op| {
            fd.op(op).opcode == Opcode::MultiEqual
                && fd.op(op).output.map_or(false, |o| {
                    fd.vn(o).addr == sp && fd.vn(o).value.is_bottom()
                })
        }));
        assert!(fd
            .vns
            .iter()
            .filter(|v| v.addr == Address::register(R1) && v.flags.written)
            .all(|v| v.value.is_bottom()));
    }

    // ---- the interpreter scenario ----

    /// A three-opcode bytecode VM: opcode 1 adds 5 to the accumulator, opcode 2 doubles it,
    /// opcode 0 returns. The dispatch loop loads the next opcode byte from a table in rodata.
    fn vm_decoder() -> StaticDecoder {
        let mut dec = StaticDecoder::new();
        // entry: acc = 0; idx = 0
        dec.add_instruction(
            0x1000,
            4,
            vec![
                tpl(Opcode::Copy, Some(reg(R0)), vec![con(0)]),
                tpl(Opcode::Copy, Some(reg(R4)), vec![con(0)]),
            ],
        );
        // header: byte = table[idx]; if byte == 1 goto add_handler
        dec.add_instruction(
            0x1004,
            4,
            vec![tpl(Opcode::IntAdd, Some(uniq(0x40, 4)), vec![con(0x2000), reg(R4)])],
        );
        dec.add_instruction(
            0x1008,
            4,
            vec![tpl(Opcode::Load, Some(uniq(0x48, 1)), vec![uniq(0x40, 4)])],
        );
        dec.add_instruction(
            0x100c,
            4,
            vec![
                tpl(
                    Opcode::IntEqual,
                    Some(uniq(0x4c, 1)),
                    vec![uniq(0x48, 1), VarnodeData::constant(1, 1)],
                ),
                tpl(Opcode::CBranch, None, vec![VarnodeData::ram(0x1020), uniq(0x4c, 1)]),
            ],
        );
        // if byte == 2 goto double_handler
        dec.add_instruction(
            0x1010,
            4,
            vec![
                tpl(
                    Opcode::IntEqual,
                    Some(uniq(0x4c, 1)),
                    vec![uniq(0x48, 1), VarnodeData::constant(2, 1)],
                ),
                tpl(Opcode::CBranch, None, vec![VarnodeData::ram(0x1030), uniq(0x4c, 1)]),
            ],
        );
        // fallthrough: opcode 0 terminates
        dec.add_instruction(0x1014, 4, vec![tpl(Opcode::Return, None, vec![reg(R0)])]);
        // add_handler: acc += 5; idx += 1; goto header
        dec.add_instruction(
            0x1020,
            4,
            vec![tpl(Opcode::IntAdd, Some(reg(R0)), vec![reg(R0), con(5)])],
        );
        dec.add_instruction(
            0x1024,
            4,
            vec![tpl(Opcode::IntAdd, Some(reg(R4)), vec![reg(R4), con(1)])],
        );
        dec.add_instruction(
            0x1028,
            4,
            vec![tpl(Opcode::Branch, None, vec![VarnodeData::ram(0x1004)])],
        );
        // double_handler: acc *= 2; idx += 1; goto header
        dec.add_instruction(
            0x1030,
            4,
            vec![tpl(Opcode::IntMult, Some(reg(R0)), vec![reg(R0), con(2)])],
        );
        dec.add_instruction(
            0x1034,
            4,
            vec![tpl(Opcode::IntAdd, Some(reg(R4)), vec![reg(R4), con(1)])],
        );
        dec.add_instruction(
            0x1038,
            4,
            vec![tpl(Opcode::Branch, None, vec![VarnodeData::ram(0x1004)])],
        );
        dec
    }

    #[test]
    fn vm_dispatch_loop_unrolls_into_straightline_code() {
        let mut engine = Engine::new(RegisterSet::arm32()).expect("registers");
        engine.add_memory(0x2000, vec![1, 2, 0]);
        engine.set_decoder(Box::new(vm_decoder()));
        engine.add_function("vm", 0x1000);
        assert_eq!(engine.run(), 1);

        let fd = engine.find_func_by_name("vm").expect("registered");
        assert!(fd.flags.processing_complete);
        assert!(fd.vmhead.is_some(), "dispatch loop was detected");
        assert!(
            fd.rpo.iter().all(|&b| !fd.blocks[b.0].flags.loopheader),
            "no loop survives"
        );
        // (0 + 5) * 2: the whole bytecode program evaluated statically.
        assert!(fd
            .vns
            .iter()
            .any(|v| v.addr == Address::register(R0)
                && v.flags.written
                && v.value == ValueLattice::constant(10)));
    }

    #[test]
    fn unroll_bound_leaves_the_residual_loop_intact() {
        let mut engine = Engine::new(RegisterSet::arm32()).expect("registers");
        // More add-opcodes than the iteration bound can consume.
        engine.add_memory(0x2000, vec![1u8; 200]);
        engine.set_decoder(Box::new(vm_decoder()));
        engine.add_function("vm_long", 0x1000);
        assert_eq!(engine.run(), 1);

        let fd = engine.find_func_by_name("vm_long").expect("registered");
        assert!(fd.flags.processing_complete);
        assert!(
            fd.rpo.iter().any(|&b| fd.blocks[b.0].flags.loopheader),
            "residual dispatch loop survives the bound"
        );
    }

    #[test]
    fn calls_register_their_callees() {
        let mut dec = StaticDecoder::new();
        dec.add_instruction(
            0x1000,
            4,
            vec![tpl(Opcode::Call, None, vec![VarnodeData::ram(0x2000)])],
        );
        dec.add_instruction(0x1004, 4, vec![tpl(Opcode::Return, None, vec![])]);
        dec.add_instruction(0x2000, 4, vec![tpl(Opcode::Return, None, vec![])]);

        let mut engine = Engine::new(RegisterSet::arm32()).expect("registers");
        engine.set_decoder(Box::new(dec));
        engine.add_function("caller", 0x1000);
        assert_eq!(engine.run(), 2, "the callee was discovered and built");
        let caller = engine.find_func_by_name("caller").expect("registered");
        assert_eq!(caller.calls.len(), 1);
        assert_eq!(caller.calls[0].proto.name, "fn_00002000");
        assert!(engine.find_func_by_addr(0x2000).is_some());
    }
}
