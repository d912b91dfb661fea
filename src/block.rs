//! Basic blocks and CFG edges.
//!
//! Every edge is stored twice (as an out-edge on the source and an in-edge on the target), each
//! half carrying the index of its mirror so either side can be found in constant time. The edge
//! mutators on [`Funcdata`](crate::funcdata::Funcdata) keep the two halves consistent; nothing
//! else may touch the edge lists.

use bitflags::bitflags;

use crate::funcdata::{BlockId, Funcdata, OpId};

bitflags! {
    /// Labels attached to a CFG edge by the spanning-tree walk and the branch connector.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct EdgeLabel: u32 {
        const TREE = 0x1;
        const FORWARD = 0x2;
        const CROSS = 0x4;
        const BACK = 0x8;
        const LOOP = 0x10;
        /// The taken side of a conditional branch.
        const TRUE_EDGE = 0x20;
    }
}

/// One half of a CFG edge.
#[derive(Clone, Copy, Debug)]
pub struct BlockEdge {
    pub point: BlockId,
    pub label: EdgeLabel,
    /// Index of the mirror half in `point`'s opposite edge list.
    pub reverse_index: usize,
}

/// Structuring shape assigned to a block during loop classification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockType {
    Condition,
    If,
    WhileDo,
    DoWhile,
    Switch,
}

/// Named flag set of a block.
#[derive(Clone, Copy, Default, Debug)]
pub struct BlockFlags {
    /// Proven unreachable; queued for removal.
    pub dead: bool,
    pub entry_point: bool,
    /// Terminates in a computed branch whose targets were not recovered.
    pub switch_out: bool,
    /// Merge point that must stay shared; cloning and splicing never cross it.
    pub unsplice: bool,
    /// Header of a loop with entries that bypass it; such loops are never restructured or
    /// unrolled.
    pub irreducible: bool,
    pub loopheader: bool,
    /// Lies on every path to the function's exit.
    pub exitpath: bool,
    /// Ends in a return.
    pub return_block: bool,
}

/// A basic block: an ordered op list plus CFG and dominance metadata.
#[derive(Clone)]
pub struct FlowBlock {
    pub btype: BlockType,
    pub flags: BlockFlags,
    pub ops: Vec<OpId>,
    /// Reverse-postorder number, assigned by structuring; -1 before that.
    pub index: i32,
    /// Depth-first discovery number from the spanning-tree walk.
    pub dfnum: i32,
    pub immed_dom: Option<BlockId>,
    /// Innermost loop this block belongs to; headers point at the enclosing loop's header.
    pub loop_header: Option<BlockId>,
    /// For a loop header: every block of its natural loop, itself included.
    pub loop_nodes: Vec<BlockId>,
    pub in_edges: Vec<BlockEdge>,
    pub out_edges: Vec<BlockEdge>,
    /// Clone built from this block by the most recent `clone_web`, while that pass runs.
    pub copymap: Option<BlockId>,
    /// Interpreter bytecode index observed at this block by VM unrolling; -1 when none.
    pub vm_byteindex: i32,
}

impl FlowBlock {
    pub fn new() -> Self {
        Self {
            btype: BlockType::Condition,
            flags: BlockFlags::default(),
            ops: Vec::new(),
            index: -1,
            dfnum: -1,
            immed_dom: None,
            loop_header: None,
            loop_nodes: Vec::new(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            copymap: None,
            vm_byteindex: -1,
        }
    }

    pub fn get_out(&self, i: usize) -> BlockId {
        self.out_edges[i].point
    }

    pub fn get_in(&self, i: usize) -> BlockId {
        self.in_edges[i].point
    }

    pub fn first_op(&self) -> Option<OpId> {
        self.ops.first().copied()
    }

    pub fn last_op(&self) -> Option<OpId> {
        self.ops.last().copied()
    }

    pub fn is_entry_point(&self) -> bool {
        self.flags.entry_point
    }

    pub fn is_dead(&self) -> bool {
        self.flags.dead
    }

    pub fn is_end(&self) -> bool {
        self.out_edges.is_empty()
    }

    /// Slot of the in-edge arriving from `inblock`, if one exists.
    pub fn get_in_slot(&self, inblock: BlockId) -> Option<usize> {
        self.in_edges.iter().position(|e| e.point == inblock)
    }

    pub fn get_out_slot(&self, outblock: BlockId) -> Option<usize> {
        self.out_edges.iter().position(|e| e.point == outblock)
    }

    /// The taken-side out-edge of a block ending in a conditional branch.
    pub fn get_true_edge(&self) -> Option<&BlockEdge> {
        self.out_edges
            .iter()
            .find(|e| e.label.contains(EdgeLabel::TRUE_EDGE))
    }

    pub fn get_false_edge(&self) -> Option<&BlockEdge> {
        self.out_edges
            .iter()
            .find(|e| !e.label.contains(EdgeLabel::TRUE_EDGE))
    }
}

impl Default for FlowBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Funcdata {
    /// Create a fresh, empty block in the arena.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(FlowBlock::new());
        id
    }

    /// Add an edge `begin -> end` carrying `label`, keeping both half-lists consistent.
    pub fn add_edge(&mut self, begin: BlockId, end: BlockId, label: EdgeLabel) {
        let out_slot = self.blocks[begin.0].out_edges.len();
        let in_slot = self.blocks[end.0].in_edges.len();
        self.blocks[begin.0].out_edges.push(BlockEdge {
            point: end,
            label,
            reverse_index: in_slot,
        });
        self.blocks[end.0].in_edges.push(BlockEdge {
            point: begin,
            label,
            reverse_index: out_slot,
        });
    }

    /// Remove the in-edge at `slot` of `bl` together with its mirror half.
    pub fn remove_in_edge(&mut self, bl: BlockId, slot: usize) {
        let edge = self.blocks[bl.0].in_edges[slot];
        self.half_delete_out_edge(edge.point, edge.reverse_index);
        self.half_delete_in_edge(bl, slot);
    }

    /// Remove the out-edge at `slot` of `bl` together with its mirror half.
    pub fn remove_out_edge(&mut self, bl: BlockId, slot: usize) {
        let edge = self.blocks[bl.0].out_edges[slot];
        self.half_delete_in_edge(edge.point, edge.reverse_index);
        self.half_delete_out_edge(bl, slot);
    }

    /// Remove the edge `begin -> end` (first matching instance).
    pub fn remove_edge(&mut self, begin: BlockId, end: BlockId) {
        if let Some(slot) = self.blocks[begin.0].get_out_slot(end) {
            self.remove_out_edge(begin, slot);
        }
    }

    /// Redirect the in-edge at `slot` of `bl` to arrive at `newtarget` instead.
    pub fn replace_in_edge(&mut self, bl: BlockId, slot: usize, newtarget: BlockId) {
        let edge = self.blocks[bl.0].in_edges[slot];
        let label = edge.label;
        let source = edge.point;
        self.remove_in_edge(bl, slot);
        self.add_edge(source, newtarget, label);
    }

    /// Redirect the out-edge at `slot` of `bl` to leave for `newtarget` instead, preserving the
    /// edge's label (a folded branch keeps its true/false sense).
    pub fn replace_out_edge(&mut self, bl: BlockId, slot: usize, newtarget: BlockId) {
        let label = self.blocks[bl.0].out_edges[slot].label;
        self.remove_out_edge(bl, slot);
        self.add_edge(bl, newtarget, label);
    }

    pub fn set_out_edge_flag(&mut self, bl: BlockId, slot: usize, label: EdgeLabel) {
        let edge = self.blocks[bl.0].out_edges[slot];
        self.blocks[bl.0].out_edges[slot].label |= label;
        self.blocks[edge.point.0].in_edges[edge.reverse_index].label |= label;
    }

    pub fn clear_out_edge_flag(&mut self, bl: BlockId, slot: usize, label: EdgeLabel) {
        let edge = self.blocks[bl.0].out_edges[slot];
        self.blocks[bl.0].out_edges[slot].label -= label;
        self.blocks[edge.point.0].in_edges[edge.reverse_index].label -= label;
    }

    fn half_delete_in_edge(&mut self, bl: BlockId, slot: usize) {
        self.blocks[bl.0].in_edges.remove(slot);
        // Mirrors of the shifted edges now point one slot too far.
        for i in slot..self.blocks[bl.0].in_edges.len() {
            let edge = self.blocks[bl.0].in_edges[i];
            self.blocks[edge.point.0].out_edges[edge.reverse_index].reverse_index = i;
        }
    }

    fn half_delete_out_edge(&mut self, bl: BlockId, slot: usize) {
        self.blocks[bl.0].out_edges.remove(slot);
        for i in slot..self.blocks[bl.0].out_edges.len() {
            let edge = self.blocks[bl.0].out_edges[i];
            self.blocks[edge.point.0].in_edges[edge.reverse_index].reverse_index = i;
        }
    }

    /// Debug invariant: every out-edge has a mirroring in-edge and vice versa.
    pub fn check_edge_consistency(&self) -> bool {
        for (bi, b) in self.blocks.iter().enumerate() {
            for (slot, e) in b.out_edges.iter().enumerate() {
                let mirror = &self.blocks[e.point.0].in_edges;
                if e.reverse_index >= mirror.len() {
                    return false;
                }
                let m = mirror[e.reverse_index];
                if m.point.0 != bi || m.reverse_index != slot {
                    return false;
                }
            }
            for (slot, e) in b.in_edges.iter().enumerate() {
                let mirror = &self.blocks[e.point.0].out_edges;
                if e.reverse_index >= mirror.len() {
                    return false;
                }
                let m = mirror[e.reverse_index];
                if m.point.0 != bi || m.reverse_index != slot {
                    return false;
                }
            }
        }
        true
    }
}
