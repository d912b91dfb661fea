//! SSA values.
//!
//! A varnode is one (address-space, offset, size) storage cell at one program point. Before
//! heritage a varnode read that has no visible definition is "free"; heritage either binds it to
//! a reaching definition or promotes it to a function input. All cross-links are arena handles
//! owned by the enclosing [`Funcdata`](crate::funcdata::Funcdata).

use crate::address::{Address, ValueLattice};
use crate::cover::{Cover, CoverBlock};
use crate::funcdata::OpId;

/// Named flag set of a varnode (kept as explicit booleans rather than packed bits).
#[derive(Clone, Copy, Default, Debug)]
pub struct VarnodeFlags {
    /// The value enters the function from outside; it has no defining op.
    pub input: bool,
    /// The value has exactly one defining op.
    pub written: bool,
    /// The cover is stale and must be rebuilt before the next complete-precision query.
    pub cover_dirty: bool,
}

/// An SSA value: one storage cell at one program point.
#[derive(Clone)]
pub struct Varnode {
    pub addr: Address,
    pub size: i32,
    /// Creation-order index; the third component of varnode identity.
    pub create_index: usize,
    pub flags: VarnodeFlags,
    /// Abstract value assigned by propagation.
    pub value: ValueLattice,
    /// Defining op; present iff `flags.written`.
    pub def: Option<OpId>,
    /// Ordered list of ops reading this varnode.
    pub uses: Vec<OpId>,
    /// SSA version within this varnode's location, assigned during renaming.
    pub version: i32,
    /// Complete liveness cover (valid when not `cover_dirty`).
    pub cover: Cover,
    /// Fast single-block cover used by peephole-grade queries.
    pub simple_cover: CoverBlock,
}

impl Varnode {
    pub fn new(size: i32, addr: Address, create_index: usize) -> Self {
        let mut value = ValueLattice::top();
        if addr.is_constant() {
            value = ValueLattice::constant(addr.offset as i128);
        }
        Self {
            addr,
            size,
            create_index,
            flags: VarnodeFlags {
                cover_dirty: true,
                ..Default::default()
            },
            value,
            def: None,
            uses: Vec::new(),
            version: -1,
            cover: Cover::default(),
            simple_cover: CoverBlock::default(),
        }
    }

    pub fn get_addr(&self) -> Address {
        self.addr
    }

    /// Location key used for interning, renaming and collecting: everything but the version.
    pub fn loc_key(&self) -> (Address, i32) {
        (self.addr, self.size)
    }

    pub fn is_constant(&self) -> bool {
        self.value.is_constant()
    }

    pub fn in_constant_space(&self) -> bool {
        self.addr.is_constant()
    }

    pub fn is_rel_constant(&self) -> bool {
        self.value.is_rel_constant()
    }

    pub fn is_input(&self) -> bool {
        self.flags.input
    }

    /// Neither written nor an input: the varnode is an unbound read awaiting heritage.
    pub fn is_free(&self) -> bool {
        !self.flags.written && !self.flags.input
    }

    /// Whether heritage already knows what this varnode means (constants never rename).
    pub fn is_heritage_known(&self) -> bool {
        self.flags.input || self.flags.written || self.in_constant_space()
    }

    pub fn has_no_use(&self) -> bool {
        self.uses.is_empty()
    }

    /// The concrete value; only meaningful for `Constant` height.
    pub fn get_val(&self) -> i128 {
        debug_assert!(self.value.is_constant());
        self.value.value
    }

    pub fn add_use(&mut self, op: OpId) {
        self.uses.push(op);
    }

    pub fn del_use(&mut self, op: OpId) {
        if let Some(pos) = self.uses.iter().position(|&u| u == op) {
            self.uses.remove(pos);
        }
    }

    pub fn clear_cover(&mut self) {
        self.cover.clear();
        self.simple_cover = CoverBlock::default();
        self.flags.cover_dirty = true;
    }
}

impl std::fmt::Debug for Varnode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.in_constant_space() {
            write!(f, "#{:#x}:{}", self.addr.offset, self.size)
        } else if self.version >= 0 {
            write!(f, "{:?}:{}.{}", self.addr, self.size, self.version)
        } else {
            write!(f, "{:?}:{}", self.addr, self.size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceKind;

    #[test]
    fn constant_space_varnodes_carry_their_value() {
        let vn = Varnode::new(4, Address::constant(0x30), 0);
        assert!(vn.value.is_constant());
        assert_eq!(vn.value.value, 0x30);
        assert!(vn.is_heritage_known());
    }

    #[test]
    fn free_until_written_or_input() {
        let mut vn = Varnode::new(4, Address::new(SpaceKind::Register, 0), 1);
        assert!(vn.is_free());
        vn.flags.input = true;
        assert!(!vn.is_free());
        assert!(vn.is_input());
    }
}
