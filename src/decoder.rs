//! The decode collaborator interface.
//!
//! The engine never disassembles anything itself; it asks a [`PcodeDecoder`] for the micro-ops
//! at an address and builds its graph from the returned templates. The [`StaticDecoder`] is a
//! table-backed implementation fed by the listing lifter and by tests.

use std::collections::BTreeMap;

use crate::address::SpaceKind;
use crate::pcodeop::Opcode;

/// Storage descriptor of one operand or output in a decoded op template.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VarnodeData {
    pub space: SpaceKind,
    pub offset: u64,
    pub size: i32,
}

impl VarnodeData {
    pub fn new(space: SpaceKind, offset: u64, size: i32) -> Self {
        Self { space, offset, size }
    }

    pub fn constant(value: u64, size: i32) -> Self {
        Self::new(SpaceKind::Constant, value, size)
    }

    pub fn register(offset: u64, size: i32) -> Self {
        Self::new(SpaceKind::Register, offset, size)
    }

    pub fn ram(offset: u64) -> Self {
        Self::new(SpaceKind::Ram, offset, 4)
    }
}

/// One micro-op as the decoder describes it, before any graph linkage exists.
#[derive(Clone, Debug)]
pub struct OpTemplate {
    pub opcode: Opcode,
    pub output: Option<VarnodeData>,
    pub inputs: Vec<VarnodeData>,
}

impl OpTemplate {
    pub fn new(opcode: Opcode, output: Option<VarnodeData>, inputs: Vec<VarnodeData>) -> Self {
        Self { opcode, output, inputs }
    }
}

/// What the decoder has to say about one address.
#[derive(Clone, Debug)]
pub enum DecodeResult {
    /// A valid instruction of `length` bytes with the given pcode semantics.
    Ops { ops: Vec<OpTemplate>, length: u64 },
    /// A valid instruction the decoder has no semantics for.
    Unimplemented { length: u64 },
    /// Not an instruction at all.
    BadData,
}

/// The boundary between the analysis and whatever produces machine semantics.
pub trait PcodeDecoder {
    fn decode(&self, addr: u64) -> DecodeResult;

    /// Read a little-endian word from the program image, for read-only data such as interpreter
    /// bytecode. Decoders without a memory image return `None`.
    fn read_word(&self, _addr: u64, _size: i32) -> Option<u64> {
        None
    }
}

/// A decoder backed by pre-lifted tables: instruction templates keyed by address plus raw
/// memory sections.
#[derive(Debug, Default)]
pub struct StaticDecoder {
    insns: BTreeMap<u64, (Vec<OpTemplate>, u64)>,
    unimplemented: BTreeMap<u64, u64>,
    memory: Vec<(u64, Vec<u8>)>,
}

impl StaticDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instruction(&mut self, addr: u64, length: u64, ops: Vec<OpTemplate>) {
        self.insns.insert(addr, (ops, length));
    }

    pub fn add_unimplemented(&mut self, addr: u64, length: u64) {
        self.unimplemented.insert(addr, length);
    }

    pub fn add_memory(&mut self, base: u64, bytes: Vec<u8>) {
        self.memory.push((base, bytes));
    }

    pub fn memory_sections(&self) -> &[(u64, Vec<u8>)] {
        &self.memory
    }
}

impl PcodeDecoder for StaticDecoder {
    fn decode(&self, addr: u64) -> DecodeResult {
        if let Some((ops, length)) = self.insns.get(&addr) {
            return DecodeResult::Ops { ops: ops.clone(), length: *length };
        }
        if let Some(&length) = self.unimplemented.get(&addr) {
            return DecodeResult::Unimplemented { length };
        }
        DecodeResult::BadData
    }

    fn read_word(&self, addr: u64, size: i32) -> Option<u64> {
        let size = size.clamp(1, 8) as usize;
        for (base, bytes) in &self.memory {
            if addr < *base {
                continue;
            }
            let off = (addr - base) as usize;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_distinguishes_missing_from_unimplemented() {
        let mut d = StaticDecoder::new();
        d.add_instruction(
            0x1000,
            4,
            vec![OpTemplate::new(
                Opcode::Copy,
                Some(VarnodeData::register(0, 4)),
                vec![VarnodeData::constant(7, 4)],
            )],
        );
        d.add_unimplemented(0x1004, 4);
        assert!(matches!(d.decode(0x1000), DecodeResult::Ops { length: 4, .. }));
        assert!(matches!(d.decode(0x1004), DecodeResult::Unimplemented { length: 4 }));
        assert!(matches!(d.decode(0x2000), DecodeResult::BadData));
    }

    #[test]
    fn read_word_is_little_endian_and_bounded() {
        let mut d = StaticDecoder::new();
        d.add_memory(0x2000, vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(d.read_word(0x2000, 4), Some(0x12345678));
        assert_eq!(d.read_word(0x2002, 2), Some(0x1234));
        assert_eq!(d.read_word(0x2003, 4), None);
        assert_eq!(d.read_word(0x1fff, 1), None);
    }
}
