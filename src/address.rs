//! Value-space locations and the abstract-value lattice used by propagation.
//!
//! Three address spaces matter to the analysis proper: the processor register space, a
//! per-function scratch ("unique") space, and the constant pseudo-space. Ram appears only as the
//! home of code references and memory accesses. A [`ValueLattice`] rides on every varnode; its
//! `RelConstant` height is what lets the engine track stack depth symbolically without
//! simulating register state.

/// The address spaces known to the engine.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum SpaceKind {
    /// The constant pseudo-space; the offset of an address in this space *is* the value.
    Constant,
    /// Processor register file.
    Register,
    /// Per-function temporaries introduced by decoding and by the analysis itself.
    Unique,
    /// Main memory; used for code references and load/store targets.
    Ram,
}

/// A location in some address space. Equality and ordering are (space, offset).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub space: SpaceKind,
    pub offset: u64,
}

impl Address {
    pub fn new(space: SpaceKind, offset: u64) -> Self {
        Self { space, offset }
    }

    /// An address in the constant pseudo-space carrying `value` as its offset.
    pub fn constant(value: u64) -> Self {
        Self {
            space: SpaceKind::Constant,
            offset: value,
        }
    }

    pub fn register(offset: u64) -> Self {
        Self {
            space: SpaceKind::Register,
            offset,
        }
    }

    pub fn ram(offset: u64) -> Self {
        Self {
            space: SpaceKind::Ram,
            offset,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.space == SpaceKind::Constant
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.space {
            SpaceKind::Constant => write!(f, "#{:#x}", self.offset),
            SpaceKind::Register => write!(f, "reg:{:#x}", self.offset),
            SpaceKind::Unique => write!(f, "u:{:#x}", self.offset),
            SpaceKind::Ram => write!(f, "ram:{:#x}", self.offset),
        }
    }
}

/// The four heights of the abstract-value lattice.
///
/// `Top` is "not yet analyzed"; `Bottom` is contradictory/unanalyzable and absorbs everything.
/// `RelConstant` is a value known exactly as an offset from an unknown-but-fixed base address,
/// which is how the stack pointer is tracked.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum LatticeHeight {
    Top,
    Constant,
    RelConstant,
    Bottom,
}

/// A varnode's abstract value. Ordered by height, then value, then relative base.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueLattice {
    pub height: LatticeHeight,
    pub value: i128,
    /// Base location of a `RelConstant`; meaningless at any other height.
    pub rel: Address,
}

impl ValueLattice {
    pub fn top() -> Self {
        Self {
            height: LatticeHeight::Top,
            value: 0,
            rel: Address::constant(0),
        }
    }

    pub fn bottom() -> Self {
        Self {
            height: LatticeHeight::Bottom,
            value: 0,
            rel: Address::constant(0),
        }
    }

    pub fn constant(value: i128) -> Self {
        Self {
            height: LatticeHeight::Constant,
            value,
            rel: Address::constant(0),
        }
    }

    /// A value known to be `base + value` for the unknown-but-fixed content of `base`.
    pub fn rel_constant(base: Address, value: i128) -> Self {
        Self {
            height: LatticeHeight::RelConstant,
            value,
            rel: base,
        }
    }

    pub fn is_top(&self) -> bool {
        self.height == LatticeHeight::Top
    }

    pub fn is_bottom(&self) -> bool {
        self.height == LatticeHeight::Bottom
    }

    pub fn is_constant(&self) -> bool {
        self.height == LatticeHeight::Constant
    }

    pub fn is_rel_constant(&self) -> bool {
        self.height == LatticeHeight::RelConstant
    }

    /// The phi-join of two lattice values. `Top` is the identity; equal values join to
    /// themselves; anything else collapses to `Bottom`. Collapsing two `RelConstant`s with the
    /// same base but different offsets is exactly the conservative demotion applied to
    /// loop-carried stack values.
    pub fn merge(&self, other: &ValueLattice) -> ValueLattice {
        if self.is_top() {
            return *other;
        }
        if other.is_top() {
            return *self;
        }
        if self == other {
            return *self;
        }
        ValueLattice::bottom()
    }
}

impl std::fmt::Debug for ValueLattice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.height {
            LatticeHeight::Top => write!(f, "T"),
            LatticeHeight::Bottom => write!(f, "_|_"),
            LatticeHeight::Constant => write!(f, "{:#x}", self.value),
            LatticeHeight::RelConstant => write!(f, "{:?}{:+#x}", self.rel, self.value),
        }
    }
}

/// The bitmask covering a value of `size` bytes (`size >= 16` covers the whole `i128`).
pub fn calc_mask(size: i32) -> u128 {
    if size >= 16 {
        u128::MAX
    } else if size <= 0 {
        0
    } else {
        (1u128 << (size * 8)) - 1
    }
}

/// Truncate `v` to `size` bytes, zero-extending the result.
pub fn wrap_to_size(v: i128, size: i32) -> i128 {
    (v as u128 & calc_mask(size)) as i128
}

/// Truncate `v` to `size` bytes and sign-extend the result.
pub fn sext_to_size(v: i128, size: i32) -> i128 {
    if size >= 16 || size <= 0 {
        return v;
    }
    let bits = 128 - size * 8;
    (wrap_to_size(v, size) << bits) >> bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_follows_the_height_table() {
        let sp = Address::register(0x34);
        let c1 = ValueLattice::constant(1);
        let c2 = ValueLattice::constant(2);
        let r0 = ValueLattice::rel_constant(sp, 0);
        let r1 = ValueLattice::rel_constant(sp, -0x30);

        assert_eq!(ValueLattice::top().merge(&c1), c1);
        assert_eq!(c1.merge(&ValueLattice::top()), c1);
        assert_eq!(c1.merge(&c1), c1);
        assert_eq!(c1.merge(&c2), ValueLattice::bottom());
        assert_eq!(r0.merge(&r0), r0);
        // Same base, different depth: the loop-carried demotion.
        assert_eq!(r0.merge(&r1), ValueLattice::bottom());
        assert_eq!(ValueLattice::bottom().merge(&c1), ValueLattice::bottom());
    }

    #[test]
    fn wrapping_respects_operand_width() {
        assert_eq!(wrap_to_size(0x1_0000_0001, 4), 1);
        assert_eq!(wrap_to_size(-1, 2), 0xffff);
        assert_eq!(sext_to_size(0xff, 1), -1);
        assert_eq!(sext_to_size(0x7f, 1), 0x7f);
    }
}
