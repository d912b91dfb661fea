//! Per-function analysis state: the arena that owns every varnode, op and block.
//!
//! All cross-references in the dataflow graph are plain index handles into the three arenas
//! held here. Handles are never invalidated while a function is being processed; deleting an op
//! or varnode marks it dead and unlinks it, the slot itself survives until the whole `Funcdata`
//! is dropped. This keeps every pass free to hold handles across arbitrary graph surgery.

use std::collections::BTreeMap;

use crate::address::{Address, SpaceKind, ValueLattice};
use crate::alias::RangeNode;
use crate::block::{EdgeLabel, FlowBlock};
use crate::config::CONFIG;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::decoder::{DecodeResult, OpTemplate, PcodeDecoder, VarnodeData};
use crate::error::EngineError;
use crate::log::*;
use crate::pcodeop::{Opcode, PcodeOp, SeqNum};
use crate::varnode::Varnode;

/// Handle to a [`Varnode`] in its function's arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarnodeId(pub usize);

impl VarnodeId {
    /// Placeholder for an input slot that has not been filled yet.
    pub const INVALID: VarnodeId = VarnodeId(usize::MAX);

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

/// Handle to a [`PcodeOp`] in its function's arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub usize);

/// Handle to a [`FlowBlock`] in its function's arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

impl std::fmt::Debug for VarnodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_invalid() {
            write!(f, "vn#-")
        } else {
            write!(f, "vn#{}", self.0)
        }
    }
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "blk#{}", self.0)
    }
}

/// Function-level state flags.
#[derive(Clone, Copy, Default, Debug)]
pub struct FuncFlags {
    /// The entry address had no valid decode; the function carries no graph at all.
    pub no_code: bool,
    pub blocks_generated: bool,
    pub processing_started: bool,
    pub processing_complete: bool,
    /// At least one decoded instruction had no pcode semantics.
    pub unimplemented_present: bool,
    /// Flow ran into undecodable bytes somewhere past the entry.
    pub baddata_present: bool,
    /// Stack safe-zone reasoning is switched on for this function.
    pub safezone_enabled: bool,
}

/// Prototype of a callee as far as the analysis cares.
#[derive(Clone, Debug)]
pub struct FuncProto {
    pub name: String,
    /// The callee may write memory the caller can observe.
    pub side_effect: bool,
}

impl Default for FuncProto {
    fn default() -> Self {
        Self {
            name: String::new(),
            side_effect: true,
        }
    }
}

/// One call site of the function under analysis.
#[derive(Clone, Debug)]
pub struct FuncCallSpec {
    pub op: OpId,
    /// Statically known target address, absent for unresolved indirect calls.
    pub target: Option<Address>,
    pub proto: FuncProto,
}

/// Decode record for one visited instruction address.
#[derive(Clone, Debug)]
pub struct VisitStat {
    pub length: u64,
    pub ops: Vec<OpId>,
}

/// The per-function arena plus everything the pipeline computes over it.
pub struct Funcdata {
    pub name: String,
    pub alias: Vec<String>,
    pub entry: Address,
    pub flags: FuncFlags,

    pub vns: Vec<Varnode>,
    pub all_ops: Vec<PcodeOp>,
    pub blocks: Vec<FlowBlock>,

    /// Every varnode ever created at a location, in creation order. Free-read interning and
    /// heritage's location collection both run off this map.
    pub loc_map: UnorderedMap<(Address, i32), Vec<VarnodeId>>,

    /// Decode record per visited instruction address, in address order.
    pub visited: BTreeMap<u64, VisitStat>,
    /// Addresses that must start a basic block.
    pub block_starts: UnorderedSet<u64>,

    pub entry_block: Option<BlockId>,
    /// Live blocks in reverse postorder; rebuilt by structuring.
    pub rpo: Vec<BlockId>,

    pub calls: Vec<FuncCallSpec>,
    pub safezone: Vec<RangeNode>,
    /// Conditional branches whose condition folded constant, awaiting edge pruning.
    pub cbr_queue: Vec<OpId>,
    /// Computed branches whose target folded constant, awaiting rewrite to a direct branch.
    pub calcbr_queue: Vec<OpId>,
    /// Header of the detected interpreter dispatch loop, when one was found.
    pub vmhead: Option<BlockId>,

    /// Function inputs discovered by heritage, in creation order.
    pub inputs: Vec<VarnodeId>,

    /// Register holding the stack pointer, when the register model defines one. Seeds the
    /// rel-constant lattice and anchors the safe-zone reasoning.
    pub sp_addr: Option<Address>,
    /// Read-only memory images (base address, bytes) the engine made visible to this function.
    /// Loads from constant addresses inside these images fold to constants.
    pub rodata: Vec<(u64, Vec<u8>)>,

    op_uniq: usize,
}

impl Funcdata {
    pub fn new(name: impl Into<String>, entry: Address) -> Self {
        Self {
            name: name.into(),
            alias: Vec::new(),
            entry,
            flags: FuncFlags::default(),
            vns: Vec::new(),
            all_ops: Vec::new(),
            blocks: Vec::new(),
            loc_map: UnorderedMap::new(),
            visited: BTreeMap::new(),
            block_starts: UnorderedSet::new(),
            entry_block: None,
            rpo: Vec::new(),
            calls: Vec::new(),
            safezone: Vec::new(),
            cbr_queue: Vec::new(),
            calcbr_queue: Vec::new(),
            vmhead: None,
            inputs: Vec::new(),
            sp_addr: None,
            rodata: Vec::new(),
            op_uniq: 0,
        }
    }

    /// Attach a read-only memory image. Little-endian words inside it become foldable.
    pub fn add_rodata(&mut self, base: u64, bytes: Vec<u8>) {
        self.rodata.push((base, bytes));
    }

    /// Read a little-endian word of `size` bytes at `addr` from the attached images.
    pub fn read_const_mem(&self, addr: u64, size: i32) -> Option<u64> {
        for (base, bytes) in &self.rodata {
            if addr < *base {
                continue;
            }
            let off = (addr - base) as usize;
            let size = size.clamp(1, 8) as usize;
            if off + size > bytes.len() {
                continue;
            }
            let mut v = 0u64;
            for i in (0..size).rev() {
                v = (v << 8) | bytes[off + i] as u64;
            }
            return Some(v);
        }
        None
    }

    // ---- arena accessors ----

    pub fn vn(&self, id: VarnodeId) -> &Varnode {
        &self.vns[id.0]
    }

    pub fn vn_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        &mut self.vns[id.0]
    }

    pub fn op(&self, id: OpId) -> &PcodeOp {
        &self.all_ops[id.0]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut PcodeOp {
        &mut self.all_ops[id.0]
    }

    pub fn block(&self, id: BlockId) -> &FlowBlock {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut FlowBlock {
        &mut self.blocks[id.0]
    }

    /// Live ops of the whole function, block by block in reverse postorder.
    pub fn alive_ops(&self) -> Vec<OpId> {
        let mut out = Vec::new();
        for &bl in &self.rpo {
            out.extend_from_slice(&self.blocks[bl.0].ops);
        }
        out
    }

    // ---- varnode creation ----

    fn push_varnode(&mut self, vn: Varnode) -> VarnodeId {
        let id = VarnodeId(self.vns.len());
        let key = vn.loc_key();
        self.vns.push(vn);
        self.loc_map.entry(key).or_default().push(id);
        id
    }

    /// A brand-new varnode at `addr`, unconnected to any op.
    pub fn new_varnode(&mut self, size: i32, addr: Address) -> VarnodeId {
        let create_index = self.vns.len();
        self.push_varnode(Varnode::new(size, addr, create_index))
    }

    /// The free varnode at (`addr`, `size`), reusing an existing free one when present so that
    /// repeated unbound reads of a location intern to a single node.
    pub fn new_free_varnode(&mut self, size: i32, addr: Address) -> VarnodeId {
        if let Some(list) = self.loc_map.get(&(addr, size)) {
            for &id in list {
                if self.vns[id.0].is_free() {
                    return id;
                }
            }
        }
        self.new_varnode(size, addr)
    }

    /// A fresh constant varnode. Constants are deliberately not interned; each use site gets its
    /// own node so use lists stay one-to-one.
    pub fn new_constant(&mut self, size: i32, val: u64) -> VarnodeId {
        self.new_varnode(size, Address::constant(val))
    }

    /// Create a written varnode at `addr` and attach it as the output of `op`.
    pub fn new_varnode_out(&mut self, size: i32, addr: Address, op: OpId) -> VarnodeId {
        let vn = self.new_varnode(size, addr);
        self.op_set_output(op, vn);
        vn
    }

    /// Promote `vn` to a function input (no defining op; the value enters from outside).
    pub fn set_input_varnode(&mut self, vn: VarnodeId) {
        debug_assert!(self.vns[vn.0].def.is_none());
        self.vns[vn.0].flags.input = true;
        self.inputs.push(vn);
    }

    // ---- op creation and linkage ----

    /// A new op with `ninputs` empty input slots at `addr`. Born dead; insertion revives it.
    pub fn newop(&mut self, ninputs: usize, addr: Address) -> OpId {
        let seq = SeqNum::new(addr, self.op_uniq);
        self.op_uniq += 1;
        let id = OpId(self.all_ops.len());
        self.all_ops.push(PcodeOp::new(ninputs, seq));
        id
    }

    pub fn op_set_opcode(&mut self, op: OpId, opc: Opcode) {
        self.all_ops[op.0].set_opcode(opc);
    }

    /// Bind `vn` into input `slot` of `op`, maintaining both use lists.
    pub fn op_set_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) {
        let old = self.all_ops[op.0].inputs[slot];
        if old == vn {
            return;
        }
        if !old.is_invalid() {
            self.vns[old.0].del_use(op);
        }
        self.all_ops[op.0].inputs[slot] = vn;
        if !vn.is_invalid() {
            self.vns[vn.0].add_use(op);
        }
    }

    /// Clear input `slot` of `op` without removing the slot itself.
    pub fn op_unset_input(&mut self, op: OpId, slot: usize) {
        let old = self.all_ops[op.0].inputs[slot];
        if !old.is_invalid() {
            self.vns[old.0].del_use(op);
            self.all_ops[op.0].inputs[slot] = VarnodeId::INVALID;
        }
    }

    /// Remove input `slot` of `op` entirely, shifting later slots down (phi trimming).
    pub fn op_remove_input(&mut self, op: OpId, slot: usize) {
        self.op_unset_input(op, slot);
        self.all_ops[op.0].inputs.remove(slot);
    }

    pub fn op_set_output(&mut self, op: OpId, vn: VarnodeId) {
        if let Some(old) = self.all_ops[op.0].output {
            self.vns[old.0].def = None;
            self.vns[old.0].flags.written = false;
        }
        self.all_ops[op.0].output = Some(vn);
        self.vns[vn.0].def = Some(op);
        self.vns[vn.0].flags.written = true;
    }

    pub fn op_unset_output(&mut self, op: OpId) {
        if let Some(old) = self.all_ops[op.0].output.take() {
            self.vns[old.0].def = None;
            self.vns[old.0].flags.written = false;
        }
    }

    /// Fully unlink `op` from the graph and mark it dead.
    pub fn op_destroy(&mut self, op: OpId) {
        for slot in 0..self.all_ops[op.0].inputs.len() {
            self.op_unset_input(op, slot);
        }
        self.op_unset_output(op);
        if let Some(bl) = self.all_ops[op.0].parent.take() {
            if let Some(pos) = self.blocks[bl.0].ops.iter().position(|&o| o == op) {
                self.blocks[bl.0].ops.remove(pos);
                self.fix_order(bl);
            }
        }
        self.all_ops[op.0].flags.dead = true;
    }

    // ---- op placement ----

    /// Insert `op` into `bl` at `pos`, reviving it.
    pub fn op_insert(&mut self, op: OpId, bl: BlockId, pos: usize) {
        debug_assert!(self.all_ops[op.0].parent.is_none());
        self.blocks[bl.0].ops.insert(pos, op);
        self.all_ops[op.0].parent = Some(bl);
        self.all_ops[op.0].flags.dead = false;
        self.fix_order(bl);
    }

    pub fn op_insert_begin(&mut self, op: OpId, bl: BlockId) {
        // Phis stay clustered at the top of the block, in front of ordinary ops.
        let pos = if self.all_ops[op.0].opcode == Opcode::MultiEqual {
            0
        } else {
            self.blocks[bl.0]
                .ops
                .iter()
                .position(|&o| self.all_ops[o.0].opcode != Opcode::MultiEqual)
                .unwrap_or(self.blocks[bl.0].ops.len())
        };
        self.op_insert(op, bl, pos);
    }

    pub fn op_insert_end(&mut self, op: OpId, bl: BlockId) {
        let len = self.blocks[bl.0].ops.len();
        self.op_insert(op, bl, len);
    }

    /// Refresh the `order` field and startblock flag of every op in `bl`.
    pub fn fix_order(&mut self, bl: BlockId) {
        let ops = self.blocks[bl.0].ops.clone();
        for (i, &op) in ops.iter().enumerate() {
            self.all_ops[op.0].order = i as i32;
            self.all_ops[op.0].flags.startblock = i == 0;
        }
    }

    // ---- decode-driven construction ----

    fn build_varnode(&mut self, data: &VarnodeData) -> VarnodeId {
        let addr = Address::new(data.space, data.offset);
        if data.space == SpaceKind::Constant {
            self.new_constant(data.size, data.offset)
        } else {
            self.new_free_varnode(data.size, addr)
        }
    }

    fn build_op(&mut self, tpl: &OpTemplate, addr: Address, first: bool) -> OpId {
        let op = self.newop(tpl.inputs.len(), addr);
        self.op_set_opcode(op, tpl.opcode);
        self.all_ops[op.0].flags.startinst = first;
        for (slot, data) in tpl.inputs.iter().enumerate() {
            let vn = self.build_varnode(data);
            self.op_set_input(op, vn, slot);
        }
        if let Some(out) = &tpl.output {
            let vn = self.build_varnode(out);
            self.op_set_output(op, vn);
        }
        op
    }

    /// The static code target of a branching op, when its target operand is a ram constant.
    fn static_target(&self, op: OpId) -> Option<u64> {
        let target = self.op(op).inputs.first().copied()?;
        if target.is_invalid() {
            return None;
        }
        let vn = self.vn(target);
        if vn.addr.space == SpaceKind::Ram {
            Some(vn.addr.offset)
        } else {
            None
        }
    }

    /// Breadth-first decode from the entry address, building ops and recording the block-start
    /// and flow structure needed by [`generate_blocks`](Self::generate_blocks).
    pub fn generate_ops(&mut self, decoder: &dyn PcodeDecoder) -> Result<(), EngineError> {
        let mut worklist = vec![self.entry.offset];
        self.block_starts.insert(self.entry.offset);
        while let Some(addr) = worklist.pop() {
            if self.visited.contains_key(&addr) {
                continue;
            }
            if self.visited.len() >= CONFIG.max_instructions {
                return Err(EngineError::InstructionCap {
                    addr: self.entry.offset,
                    cap: CONFIG.max_instructions,
                });
            }
            let iaddr = Address::ram(addr);
            match decoder.decode(addr) {
                DecodeResult::BadData => {
                    if addr == self.entry.offset {
                        self.flags.no_code = true;
                        return Err(EngineError::DecodeFailure { addr });
                    }
                    warn!("flow reached undecodable bytes"; "func" => &self.name, "addr" => format!("{:#x}", addr));
                    self.flags.baddata_present = true;
                }
                DecodeResult::Unimplemented { length } => {
                    self.flags.unimplemented_present = true;
                    let op = self.newop(0, iaddr);
                    self.op_set_opcode(op, Opcode::Nop);
                    self.all_ops[op.0].flags.startinst = true;
                    self.visited.insert(addr, VisitStat { length, ops: vec![op] });
                    worklist.push(addr + length);
                }
                DecodeResult::Ops { ops: templates, length } => {
                    let mut ops = Vec::with_capacity(templates.len());
                    for (i, tpl) in templates.iter().enumerate() {
                        ops.push(self.build_op(tpl, iaddr, i == 0));
                    }
                    let mut fallthrough = true;
                    for &op in &ops {
                        match self.op(op).opcode {
                            Opcode::Branch => {
                                if let Some(t) = self.static_target(op) {
                                    self.block_starts.insert(t);
                                    worklist.push(t);
                                }
                                fallthrough = false;
                            }
                            Opcode::CBranch => {
                                if let Some(t) = self.static_target(op) {
                                    self.block_starts.insert(t);
                                    worklist.push(t);
                                }
                                self.block_starts.insert(addr + length);
                            }
                            Opcode::BranchInd => {
                                fallthrough = false;
                            }
                            Opcode::Return => {
                                fallthrough = false;
                            }
                            Opcode::Call | Opcode::CallInd => {
                                let target = self.static_target(op).map(Address::ram);
                                self.calls.push(FuncCallSpec {
                                    op,
                                    target,
                                    proto: FuncProto::default(),
                                });
                            }
                            _ => {}
                        }
                    }
                    self.visited.insert(addr, VisitStat { length, ops });
                    if fallthrough {
                        worklist.push(addr + length);
                    }
                }
            }
        }
        Ok(())
    }

    /// Carve the decoded op stream into basic blocks and connect the CFG edges.
    pub fn generate_blocks(&mut self) -> Result<(), EngineError> {
        debug_assert!(!self.flags.blocks_generated);
        let addrs: Vec<u64> = self.visited.keys().copied().collect();
        let mut addr_block: UnorderedMap<u64, BlockId> = UnorderedMap::new();
        let mut cur: Option<BlockId> = None;
        let mut prev_end: Option<u64> = None;

        for &addr in &addrs {
            let stat = self.visited[&addr].clone();
            let contiguous = prev_end == Some(addr);
            if cur.is_none() || self.block_starts.contains(&addr) || !contiguous {
                cur = Some(self.new_block());
            }
            let bl = cur.expect("current block set above");
            addr_block.insert(addr, bl);
            for &op in &stat.ops {
                self.op_insert_end(op, bl);
            }
            let ends_block = stat
                .ops
                .last()
                .map(|&op| self.op(op).flags.branch)
                .unwrap_or(false);
            prev_end = Some(addr + stat.length);
            if ends_block {
                cur = None;
            }
        }

        // Connect edges off each block's terminating op.
        for bi in 0..self.blocks.len() {
            let bl = BlockId(bi);
            let Some(last) = self.blocks[bi].last_op() else { continue };
            let last_addr = self.op(last).get_addr().offset;
            let fall = last_addr + self.visited[&last_addr].length;
            match self.op(last).opcode {
                Opcode::Branch => {
                    if let Some(t) = self.static_target(last) {
                        if let Some(&target) = addr_block.get(&t) {
                            self.add_edge(bl, target, EdgeLabel::empty());
                        }
                    }
                }
                Opcode::CBranch => {
                    if let Some(t) = self.static_target(last) {
                        if let Some(&target) = addr_block.get(&t) {
                            self.add_edge(bl, target, EdgeLabel::TRUE_EDGE);
                        }
                    }
                    if let Some(&target) = addr_block.get(&fall) {
                        self.add_edge(bl, target, EdgeLabel::empty());
                    }
                }
                Opcode::BranchInd => {
                    // No statically known targets; successor edges stay absent.
                    self.blocks[bi].flags.switch_out = true;
                }
                Opcode::Return => {
                    self.blocks[bi].flags.return_block = true;
                }
                _ => {
                    if let Some(&target) = addr_block.get(&fall) {
                        self.add_edge(bl, target, EdgeLabel::empty());
                    }
                }
            }
        }

        let entry = addr_block
            .get(&self.entry.offset)
            .copied()
            .ok_or(EngineError::DecodeFailure { addr: self.entry.offset })?;
        self.blocks[entry.0].flags.entry_point = true;
        self.entry_block = Some(entry);
        self.flags.blocks_generated = true;
        debug!("control flow generated";
            "func" => &self.name,
            "instructions" => self.visited.len(),
            "blocks" => self.blocks.len());
        Ok(())
    }

    /// Decode the function and build its CFG.
    pub fn follow_flow(&mut self, decoder: &dyn PcodeDecoder) -> Result<(), EngineError> {
        self.flags.processing_started = true;
        self.generate_ops(decoder)?;
        self.generate_blocks()
    }

    // ---- pipeline ----

    /// The full optimization pipeline over an already-built CFG: structuring, SSA construction,
    /// the propagate/prune loop, interpreter-loop unrolling, then store and dead-code cleanup.
    pub fn run_pipeline(&mut self) -> Result<(), EngineError> {
        debug_assert!(self.flags.blocks_generated);
        self.structure_reset();
        self.heritage()?;
        self.propagate_to_fixpoint()?;
        self.prune_constant_branches()?;
        self.compute_sp();

        if let Some(vmhead) = self.detect_vmhead() {
            info!("interpreter dispatch loop detected";
                "func" => &self.name, "header" => format!("{:?}", vmhead));
            self.vmhead = Some(vmhead);
            self.loop_unrolling(vmhead)?;
        }

        if self.flags.safezone_enabled {
            self.remove_dead_stores()?;
        }
        self.dead_code_elimination();
        self.flags.processing_complete = true;
        Ok(())
    }

    // ---- heritage teardown ----

    /// Rewind the function to pre-SSA form so heritage can run again after CFG surgery: every
    /// phi is deleted, every non-constant read is rebound to the interned free varnode of its
    /// location, and propagation results are discarded.
    pub fn heritage_clear(&mut self) {
        let ops = self.alive_ops();
        for op in ops {
            if self.op(op).opcode == Opcode::MultiEqual {
                self.op_destroy(op);
                continue;
            }
            for slot in 0..self.op(op).inputs.len() {
                let vn = self.op(op).inputs[slot];
                if vn.is_invalid() || self.vn(vn).in_constant_space() {
                    continue;
                }
                let loc = self.vn(vn).loc_key();
                let free = self.new_free_varnode(loc.1, loc.0);
                if free != vn {
                    self.op_set_input(op, free, slot);
                }
            }
            if let Some(out) = self.op(op).output {
                self.vn_mut(out).version = -1;
                self.vn_mut(out).value = ValueLattice::top();
                self.vn_mut(out).clear_cover();
            }
        }
        for vn in std::mem::take(&mut self.inputs) {
            self.vns[vn.0].flags.input = false;
        }
        self.cbr_queue.clear();
        self.calcbr_queue.clear();
    }
}
