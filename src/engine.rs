//! The process-wide analysis context: register identities, the decode backend, and the
//! function registry.
//!
//! Functions are registered by entry address and created on first use; calls discovered while
//! building one function register their callees automatically. Failures are contained per
//! function: a function that cannot be decoded or analyzed is flagged and skipped, and the run
//! carries on with the rest.

use crate::address::{Address, SpaceKind};
use crate::containers::unordered::UnorderedMap;
use crate::decoder::PcodeDecoder;
use crate::error::EngineError;
use crate::funcdata::Funcdata;
use crate::log::*;

/// Identities of the registers the analysis treats specially. Offsets follow the ARM32 layout
/// the listings are exported with.
#[derive(Clone, Debug)]
pub struct RegisterSet {
    pub sp: Address,
    pub lr: Address,
    pub pc: Address,
    /// Argument registers in call order.
    pub args: Vec<Address>,
}

impl RegisterSet {
    pub fn arm32() -> Self {
        Self {
            sp: Address::register(0x34),
            lr: Address::register(0x38),
            pc: Address::register(0x3c),
            args: vec![
                Address::register(0x0),
                Address::register(0x4),
                Address::register(0x8),
                Address::register(0xc),
            ],
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        let mut all = vec![self.sp, self.lr, self.pc];
        all.extend(self.args.iter().copied());
        for r in &all {
            if r.space != SpaceKind::Register {
                return Err(EngineError::SpaceConfig(format!(
                    "{:?} is not in the register space",
                    r
                )));
            }
        }
        for (i, a) in all.iter().enumerate() {
            if all[i + 1..].contains(a) {
                return Err(EngineError::SpaceConfig(format!(
                    "register {:?} assigned twice",
                    a
                )));
            }
        }
        Ok(())
    }
}

/// The engine: everything shared across the functions of one analyzed program.
pub struct Engine {
    pub registers: RegisterSet,
    decoder: Option<Box<dyn PcodeDecoder>>,
    memory: Vec<(u64, Vec<u8>)>,
    pub functions: Vec<Funcdata>,
    by_addr: UnorderedMap<u64, usize>,
    by_name: UnorderedMap<String, usize>,
    /// Safe-zone range applied to every function before its pipeline runs.
    default_safezone: Option<(i128, i128)>,
}

impl Engine {
    pub fn new(registers: RegisterSet) -> Result<Self, EngineError> {
        registers.validate()?;
        Ok(Self {
            registers,
            decoder: None,
            memory: Vec::new(),
            functions: Vec::new(),
            by_addr: UnorderedMap::new(),
            by_name: UnorderedMap::new(),
            default_safezone: None,
        })
    }

    pub fn set_decoder(&mut self, decoder: Box<dyn PcodeDecoder>) {
        self.decoder = Some(decoder);
    }

    /// Attach a read-only image; it is made visible to every function built afterwards.
    pub fn add_memory(&mut self, base: u64, bytes: Vec<u8>) {
        self.memory.push((base, bytes));
    }

    /// Apply a stack safe zone of `size` bytes ending at the entry stack pointer to every
    /// function.
    pub fn set_default_safezone(&mut self, start: i128, size: i128) {
        self.default_safezone = Some((start, size));
    }

    /// Register (or find) the function at `addr`. An empty name synthesizes one from the
    /// address.
    pub fn add_function(&mut self, name: &str, addr: u64) -> usize {
        if let Some(&idx) = self.by_addr.get(&addr) {
            if !name.is_empty() && !self.functions[idx].alias.iter().any(|a| a == name) {
                self.by_name.insert(name.to_string(), idx);
                self.functions[idx].alias.push(name.to_string());
            }
            return idx;
        }
        let name = if name.is_empty() {
            format!("fn_{:08x}", addr)
        } else {
            name.to_string()
        };
        let mut fd = Funcdata::new(name.clone(), Address::ram(addr));
        fd.sp_addr = Some(self.registers.sp);
        let idx = self.functions.len();
        self.functions.push(fd);
        self.by_addr.insert(addr, idx);
        self.by_name.insert(name, idx);
        idx
    }

    pub fn find_func_by_addr(&self, addr: u64) -> Option<&Funcdata> {
        self.by_addr.get(&addr).map(|&i| &self.functions[i])
    }

    pub fn find_func_by_name(&self, name: &str) -> Option<&Funcdata> {
        self.by_name.get(name).map(|&i| &self.functions[i])
    }

    /// Build and analyze one function end to end. Callees found along the way are registered
    /// but not built; the driver decides how deep to go.
    pub fn build(&mut self, idx: usize) -> Result<(), EngineError> {
        let decoder = self.decoder.as_deref().ok_or(EngineError::NoDecoder)?;
        if self.functions[idx].flags.processing_complete {
            return Ok(());
        }
        info!("building function";
            "func" => &self.functions[idx].name,
            "entry" => format!("{:#x}", self.functions[idx].entry.offset));
        for (base, bytes) in &self.memory {
            self.functions[idx].add_rodata(*base, bytes.clone());
        }
        if let Some((start, size)) = self.default_safezone {
            self.functions[idx].set_safezone(start, size);
        }
        self.functions[idx].follow_flow(decoder)?;

        // Register callees and back-fill each call site's prototype.
        let call_targets: Vec<(usize, u64)> = self.functions[idx]
            .calls
            .iter()
            .enumerate()
            .filter_map(|(i, spec)| spec.target.map(|t| (i, t.offset)))
            .collect();
        for (spec_idx, target) in call_targets {
            let callee = self.add_function("", target);
            let callee_name = self.functions[callee].name.clone();
            let fd = &mut self.functions[idx];
            let op = fd.calls[spec_idx].op;
            fd.op_mut(op).callee = Some(callee);
            fd.calls[spec_idx].proto.name = callee_name;
        }

        self.functions[idx].run_pipeline()
    }

    /// Build every registered function, containing per-function failures. Returns how many
    /// completed.
    pub fn run(&mut self) -> usize {
        let mut done = 0usize;
        let mut next = 0usize;
        // `build` registers callees as it goes, so the list can grow under us.
        while next < self.functions.len() {
            match self.build(next) {
                Ok(()) => done += 1,
                Err(e) => {
                    warn!("function analysis failed";
                        "func" => &self.functions[next].name,
                        "error" => %e);
                }
            }
            next += 1;
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_model_rejects_misplaced_and_duplicate_registers() {
        let mut regs = RegisterSet::arm32();
        regs.sp = Address::ram(0x34);
        assert!(matches!(
            Engine::new(regs),
            Err(EngineError::SpaceConfig(_))
        ));
        let mut regs = RegisterSet::arm32();
        regs.lr = regs.sp;
        assert!(matches!(
            Engine::new(regs),
            Err(EngineError::SpaceConfig(_))
        ));
        assert!(Engine::new(RegisterSet::arm32()).is_ok());
    }

    #[test]
    fn building_without_a_decoder_is_fatal() {
        let mut engine = Engine::new(RegisterSet::arm32()).expect("valid registers");
        let idx = engine.add_function("f", 0x1000);
        assert_eq!(engine.build(idx), Err(EngineError::NoDecoder));
    }

    #[test]
    fn registration_interns_by_address_and_records_aliases() {
        let mut engine = Engine::new(RegisterSet::arm32()).expect("valid registers");
        let a = engine.add_function("f", 0x1000);
        let b = engine.add_function("f_alias", 0x1000);
        assert_eq!(a, b);
        assert!(engine.find_func_by_name("f").is_some());
        assert!(engine.find_func_by_name("f_alias").is_some());
        let anon = engine.add_function("", 0x2000);
        assert_eq!(engine.functions[anon].name, "fn_00002000");
    }
}
