//! Flag-selected listings of the dataflow graph, plus GraphViz rendering of the CFG.
//!
//! The flag bits compose: a driver asking for values and def/use chains ors them together. The
//! engine only renders strings; writing them anywhere is the driver's business.

use std::borrow::Cow;

use itertools::Itertools;

use crate::config::CONFIG;
use crate::funcdata::{BlockId, Funcdata, OpId, VarnodeId};

/// Print lattice values next to varnodes.
pub const DUMP_VAL: u32 = 0x01;
/// Print def/use chains under each op.
pub const DUMP_UD: u32 = 0x02;
/// Append the dead-op graveyard after the live listing.
pub const DUMP_DEAD: u32 = 0x04;
/// Elide use lists longer than the configured limit.
pub const OMIT_MORE_USE: u32 = 0x08;
/// Elide def chains past the limit.
pub const OMIT_MORE_DEF: u32 = 0x10;
/// Elide op inputs past the limit.
pub const OMIT_MORE_IN: u32 = 0x20;
/// Emit HTML font tags around constants (for dot labels).
pub const HTML_COLOR: u32 = 0x40;

pub fn dump_varnode(fd: &Funcdata, vn: VarnodeId, flags: u32) -> String {
    if vn.is_invalid() {
        return "<unbound>".to_string();
    }
    let v = fd.vn(vn);
    let mut s = format!("{:?}", v);
    if flags & DUMP_VAL != 0 && !v.value.is_top() && !v.in_constant_space() {
        if flags & HTML_COLOR != 0 && (v.value.is_constant() || v.value.is_rel_constant()) {
            s.push_str(&format!(
                "<font color=\"green\">[{:?}]</font>",
                v.value
            ));
        } else {
            s.push_str(&format!("[{:?}]", v.value));
        }
    }
    s
}

pub fn dump_op(fd: &Funcdata, op: OpId, flags: u32) -> String {
    let o = fd.op(op);
    let mut line = format!("{:4} {:>14?}: ", o.order, o.seq);
    if let Some(out) = o.output {
        line.push_str(&dump_varnode(fd, out, flags));
        line.push_str(" = ");
    }
    line.push_str(&format!("{:?}", o.opcode));
    let limit = if flags & OMIT_MORE_IN != 0 {
        CONFIG.udchain_limit
    } else {
        usize::MAX
    };
    let shown = o.inputs.len().min(limit);
    for (i, &vn) in o.inputs.iter().take(shown).enumerate() {
        line.push_str(if i == 0 { " " } else { ", " });
        line.push_str(&dump_varnode(fd, vn, flags));
    }
    if shown < o.inputs.len() {
        line.push_str(&format!(", ...{} more", o.inputs.len() - shown));
    }
    if CONFIG.dump_sp_depth {
        if let Some(depth) = o.sp_depth {
            line.push_str(&format!("   ; sp{:+#x}", depth));
        }
    }
    if flags & DUMP_UD != 0 {
        if let Some(out) = o.output {
            let uses = &fd.vn(out).uses;
            let limit = if flags & OMIT_MORE_USE != 0 {
                CONFIG.udchain_limit
            } else {
                usize::MAX
            };
            let shown = uses.iter().take(limit).map(|u| format!("{:?}", fd.op(*u).seq)).join(" ");
            line.push_str(&format!("\n        uses: {}", shown));
            if uses.len() > limit {
                line.push_str(&format!(" ...{} more", uses.len() - limit));
            }
        }
        for &vn in &o.inputs {
            if vn.is_invalid() {
                continue;
            }
            if flags & OMIT_MORE_DEF != 0 && o.inputs.len() > CONFIG.udchain_limit {
                break;
            }
            if let Some(def) = fd.vn(vn).def {
                line.push_str(&format!(
                    "\n        def of {}: {:?}",
                    dump_varnode(fd, vn, 0),
                    fd.op(def).seq
                ));
            }
        }
    }
    line
}

pub fn dump_block(fd: &Funcdata, bl: BlockId, flags: u32) -> String {
    let b = fd.block(bl);
    let mut s = format!(
        "{:?} [rpo {} dfnum {}]{}{}{}{}\n",
        bl,
        b.index,
        b.dfnum,
        if b.flags.loopheader { " loop-header" } else { "" },
        if b.flags.irreducible { " irreducible" } else { "" },
        if b.flags.entry_point { " entry" } else { "" },
        if b.vm_byteindex >= 0 {
            format!(" vm-iter {}", b.vm_byteindex)
        } else {
            String::new()
        },
    );
    let ins = b.in_edges.iter().map(|e| format!("{:?}", e.point)).join(" ");
    let outs = b.out_edges.iter().map(|e| format!("{:?}", e.point)).join(" ");
    s.push_str(&format!("  in: [{}]  out: [{}]\n", ins, outs));
    for &op in &b.ops {
        s.push_str(&dump_op(fd, op, flags));
        s.push('\n');
    }
    s
}

/// The whole function, in reverse postorder, honoring the flag bits.
pub fn dump_pcode(fd: &Funcdata, flags: u32) -> String {
    let mut s = format!("function {} @ {:?}\n", fd.name, fd.entry);
    for &bl in &fd.rpo {
        s.push_str(&dump_block(fd, bl, flags));
    }
    if flags & DUMP_DEAD != 0 {
        let dead: Vec<OpId> = (0..fd.all_ops.len())
            .map(OpId)
            .filter(|&op| fd.op(op).is_dead())
            .collect();
        if !dead.is_empty() {
            s.push_str(&format!("dead ops ({}):\n", dead.len()));
            for op in dead {
                s.push_str(&format!("     {:>14?}: {:?}\n", fd.op(op).seq, fd.op(op).opcode));
            }
        }
    }
    s
}

type Nd = usize;
type Ed = (usize, usize);

/// Adapter presenting a function's CFG to the `dot` crate.
pub struct CfgGraph<'a> {
    fd: &'a Funcdata,
    flags: u32,
}

impl<'a> CfgGraph<'a> {
    pub fn new(fd: &'a Funcdata, flags: u32) -> Self {
        // Dot labels are HTML; constants get colorized there.
        Self { fd, flags: flags | HTML_COLOR }
    }
}

impl<'a> dot::Labeller<'a, Nd, Ed> for CfgGraph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        let sanitized: String = self
            .fd
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        dot::Id::new(format!("cfg_{}", sanitized)).unwrap_or_else(|_| {
            dot::Id::new("cfg").expect("static id is valid")
        })
    }

    fn node_id(&'a self, n: &Nd) -> dot::Id<'a> {
        dot::Id::new(format!("blk{}", n)).expect("generated id is valid")
    }

    fn node_label(&'a self, n: &Nd) -> dot::LabelText<'a> {
        dot::LabelText::html(dump_block(self.fd, BlockId(*n), self.flags))
    }

    fn edge_label(&'a self, e: &Ed) -> dot::LabelText<'a> {
        let (src, dst) = *e;
        let label = self.fd.blocks[src]
            .out_edges
            .iter()
            .find(|edge| edge.point.0 == dst)
            .map(|edge| format!("{:?}", edge.label))
            .unwrap_or_default();
        dot::LabelText::label(label)
    }
}

impl<'a> dot::GraphWalk<'a, Nd, Ed> for CfgGraph<'a> {
    fn nodes(&'a self) -> dot::Nodes<'a, Nd> {
        Cow::Owned(self.fd.rpo.iter().map(|b| b.0).collect::<Vec<_>>())
    }

    fn edges(&'a self) -> dot::Edges<'a, Ed> {
        let mut out = Vec::new();
        for &bl in &self.fd.rpo {
            for e in &self.fd.blocks[bl.0].out_edges {
                out.push((bl.0, e.point.0));
            }
        }
        Cow::Owned(out)
    }

    fn source(&'a self, e: &Ed) -> Nd {
        e.0
    }

    fn target(&'a self, e: &Ed) -> Nd {
        e.1
    }
}

/// Render the CFG as GraphViz dot into `writer`.
pub fn render_cfg<W: std::io::Write>(
    fd: &Funcdata,
    flags: u32,
    writer: &mut W,
) -> std::io::Result<()> {
    dot::render(&CfgGraph::new(fd, flags), writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::pcodeop::Opcode;

    fn tiny_func() -> Funcdata {
        let mut fd = Funcdata::new("tiny", Address::ram(0x1000));
        let bl = fd.new_block();
        fd.entry_block = Some(bl);
        fd.blocks[bl.0].flags.entry_point = true;
        fd.rpo = vec![bl];
        let c = fd.new_constant(4, 7);
        let op = fd.newop(1, Address::ram(0x1000));
        fd.op_set_opcode(op, Opcode::Copy);
        fd.op_set_input(op, c, 0);
        fd.new_varnode_out(4, Address::register(0), op);
        fd.op_insert_end(op, bl);
        fd
    }

    #[test]
    fn listing_carries_values_only_when_asked() {
        let mut fd = tiny_func();
        let op = fd.blocks[fd.rpo[0].0].ops[0];
        fd.compute_op(op);
        let plain = dump_pcode(&fd, 0);
        let valued = dump_pcode(&fd, DUMP_VAL);
        assert!(!plain.contains("[0x7]"));
        assert!(valued.contains("[0x7]"));
    }

    #[test]
    fn cfg_renders_to_dot() {
        let fd = tiny_func();
        let mut out = Vec::new();
        render_cfg(&fd, 0, &mut out).expect("render into memory");
        let text = String::from_utf8(out).expect("dot output is utf8");
        assert!(text.contains("digraph cfg_tiny"));
        assert!(text.contains("blk0"));
    }
}
