//! SSA micro-instructions.
//!
//! One machine instruction decodes to one or more pcode ops; every op carries a
//! [`SeqNum`] (instruction address plus per-address sub-index) as its identity. Once an op's
//! `dead` flag is set it is excluded from all dataflow, but the allocation itself survives in
//! the arena until bulk cleanup so that handles never dangle mid-pass.

use crate::address::Address;
use crate::funcdata::{BlockId, VarnodeId};

/// The micro-operation vocabulary understood by the engine.
///
/// A deliberately small subset of a full pcode instruction set: enough to express integer
/// arithmetic, comparisons, memory traffic and control flow. `MultiEqual` is the phi marker
/// inserted by heritage; it never comes out of a decoder.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Opcode {
    Copy,
    Load,
    Store,
    Branch,
    CBranch,
    BranchInd,
    Call,
    CallInd,
    Return,
    /// Phi node; one input per in-edge of the owning block.
    MultiEqual,
    IntEqual,
    IntNotEqual,
    IntLess,
    IntSLess,
    IntLessEqual,
    IntSLessEqual,
    IntAdd,
    IntSub,
    IntMult,
    IntDiv,
    IntSDiv,
    IntRem,
    IntSRem,
    IntAnd,
    IntOr,
    IntXor,
    IntLeft,
    IntRight,
    IntSRight,
    IntZext,
    IntSext,
    Int2Comp,
    IntNegate,
    BoolNegate,
    BoolAnd,
    BoolOr,
    BoolXor,
    SubPiece,
    Nop,
}

impl Opcode {
    /// Control transfer away from the fallthrough path (calls excluded; they return).
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::Branch | Opcode::CBranch | Opcode::BranchInd | Opcode::Return
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Opcode::Call | Opcode::CallInd)
    }

    /// Whether execution can continue at the next instruction address.
    pub fn has_fallthrough(&self) -> bool {
        !matches!(self, Opcode::Branch | Opcode::BranchInd | Opcode::Return)
    }
}

/// Identity of an op: the address of the machine instruction it came from, plus a sub-index
/// unique within the function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum {
    pub addr: Address,
    pub uniq: usize,
}

impl SeqNum {
    pub fn new(addr: Address, uniq: usize) -> Self {
        Self { addr, uniq }
    }
}

impl std::fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#x}:{}", self.addr.offset, self.uniq)
    }
}

/// Named flag set of an op.
#[derive(Clone, Copy, Default, Debug)]
pub struct OpFlags {
    /// First op of its basic block.
    pub startblock: bool,
    /// First op of its machine instruction.
    pub startinst: bool,
    pub branch: bool,
    pub call: bool,
    pub returns: bool,
    /// A placement marker (phi) rather than decoded behavior.
    pub marker: bool,
    /// Excluded from dataflow; storage reclaimed at bulk cleanup.
    pub dead: bool,
    /// This op was rewritten (folded to a copy/constant) by some pass.
    pub changed: bool,
    /// A store whose target address never resolved; load queries may not skip it unless the
    /// topstore marking is enabled.
    pub uncalculated_store: bool,
    /// A load from address zero, kept only to preserve a crash-faithful graph.
    pub zero_load: bool,
}

/// One SSA micro-instruction.
#[derive(Clone)]
pub struct PcodeOp {
    pub opcode: Opcode,
    pub seq: SeqNum,
    /// Owning block, once the op has been linked into the CFG.
    pub parent: Option<BlockId>,
    /// Position within the parent block's op list; refreshed whenever that list changes.
    pub order: i32,
    pub output: Option<VarnodeId>,
    pub inputs: Vec<VarnodeId>,
    /// Registry index of the callee, for direct calls whose target is known.
    pub callee: Option<usize>,
    pub flags: OpFlags,
    /// Stack depth below function entry at this op, when the rel-constant lattice resolved one.
    pub sp_depth: Option<i128>,
}

impl PcodeOp {
    pub fn new(ninputs: usize, seq: SeqNum) -> Self {
        Self {
            opcode: Opcode::Nop,
            seq,
            parent: None,
            order: -1,
            output: None,
            inputs: vec![VarnodeId::INVALID; ninputs],
            callee: None,
            flags: OpFlags {
                // Ops are born dead; insertion into a block revives them.
                dead: true,
                ..Default::default()
            },
            sp_depth: None,
        }
    }

    pub fn set_opcode(&mut self, opc: Opcode) {
        self.opcode = opc;
        self.flags.branch = opc.is_branch();
        self.flags.call = opc.is_call();
        self.flags.returns = opc == Opcode::Return;
        self.flags.marker = opc == Opcode::MultiEqual;
    }

    pub fn get_addr(&self) -> Address {
        self.seq.addr
    }

    pub fn is_dead(&self) -> bool {
        self.flags.dead
    }

    pub fn is_call(&self) -> bool {
        self.flags.call || self.callee.is_some()
    }

    pub fn num_input(&self) -> usize {
        self.inputs.len()
    }

    pub fn get_in(&self, slot: usize) -> VarnodeId {
        self.inputs[slot]
    }

    pub fn get_slot(&self, vn: VarnodeId) -> Option<usize> {
        self.inputs.iter().position(|&i| i == vn)
    }

    /// Whether removing this op can change observable behavior even with an unused output.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Store
                | Opcode::Branch
                | Opcode::CBranch
                | Opcode::BranchInd
                | Opcode::Call
                | Opcode::CallInd
                | Opcode::Return
        )
    }
}
