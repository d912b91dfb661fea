//! Parser for exported pcode listings.
//!
//! The CLI consumes a flat textual export rather than driving a disassembler directly. The
//! format is line oriented:
//!
//! ```text
//! func example @ 0x1000
//! mem 0x2000 0102030405060708
//! insn 0x1000 4
//!   (register,0x0,4) = COPY (const,0x5,4)
//! insn 0x1004 4
//!   CBRANCH (ram,0x100c,4) , (register,0x20,1)
//! ```
//!
//! `func` names an entry point, `mem` attaches a hex-encoded read-only image, `insn` opens an
//! instruction and its indented op lines. Varnodes are `(space,offset,size)` triples; opcode
//! names follow the usual pcode spelling (`INT_ADD`, `BRANCHIND`, ...).

use thiserror::Error;

use crate::address::SpaceKind;
use crate::decoder::{OpTemplate, StaticDecoder, VarnodeData};
use crate::pcodeop::Opcode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListingParseError {
    #[error("line {line}: unknown directive {found:?}")]
    UnknownDirective { line: usize, found: String },
    #[error("line {line}: malformed varnode {found:?}")]
    BadVarnode { line: usize, found: String },
    #[error("line {line}: unknown opcode {found:?}")]
    BadOpcode { line: usize, found: String },
    #[error("line {line}: malformed number {found:?}")]
    BadNumber { line: usize, found: String },
    #[error("line {line}: op line outside an insn block")]
    OrphanOp { line: usize },
    #[error("line {line}: odd-length hex image")]
    BadImage { line: usize },
}

/// Everything a listing provides: the decode tables plus the declared entry points.
#[derive(Debug)]
pub struct Listing {
    pub decoder: StaticDecoder,
    pub functions: Vec<(String, u64)>,
}

pub fn parse_listing(text: &str) -> Result<Listing, ListingParseError> {
    let mut decoder = StaticDecoder::new();
    let mut functions = Vec::new();
    let mut current: Option<(u64, u64, Vec<OpTemplate>)> = None;

    for (i, raw) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = raw.split(';').next().unwrap_or("");
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');
        let line = line.trim();

        if indented {
            let (addr, _, ops) = current
                .as_mut()
                .ok_or(ListingParseError::OrphanOp { line: lineno })?;
            let _ = addr;
            ops.push(parse_op(line, lineno)?);
            continue;
        }

        if let Some((addr, length, ops)) = current.take() {
            if ops.is_empty() {
                decoder.add_unimplemented(addr, length);
            } else {
                decoder.add_instruction(addr, length, ops);
            }
        }

        let mut words = line.split_whitespace();
        match words.next() {
            Some("func") => {
                let name = words.next().unwrap_or("").to_string();
                let addr_str = match words.next() {
                    Some("@") => words.next().unwrap_or(""),
                    Some(other) => other,
                    None => "",
                };
                let addr = parse_num(addr_str, lineno)?;
                functions.push((name, addr));
            }
            Some("mem") => {
                let base = parse_num(words.next().unwrap_or(""), lineno)?;
                let hex = words.next().unwrap_or("");
                if hex.len() % 2 != 0 {
                    return Err(ListingParseError::BadImage { line: lineno });
                }
                let bytes = (0..hex.len() / 2)
                    .map(|j| u8::from_str_radix(&hex[2 * j..2 * j + 2], 16))
                    .collect::<Result<Vec<u8>, _>>()
                    .map_err(|_| ListingParseError::BadImage { line: lineno })?;
                decoder.add_memory(base, bytes);
            }
            Some("insn") => {
                let addr = parse_num(words.next().unwrap_or(""), lineno)?;
                let length = parse_num(words.next().unwrap_or(""), lineno)?;
                current = Some((addr, length, Vec::new()));
            }
            Some(other) => {
                return Err(ListingParseError::UnknownDirective {
                    line: lineno,
                    found: other.to_string(),
                });
            }
            None => {}
        }
    }
    if let Some((addr, length, ops)) = current.take() {
        if ops.is_empty() {
            decoder.add_unimplemented(addr, length);
        } else {
            decoder.add_instruction(addr, length, ops);
        }
    }
    Ok(Listing { decoder, functions })
}

fn parse_num(s: &str, line: usize) -> Result<u64, ListingParseError> {
    let err = || ListingParseError::BadNumber { line, found: s.to_string() };
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| err())
    } else {
        s.parse().map_err(|_| err())
    }
}

fn parse_varnode(s: &str, line: usize) -> Result<VarnodeData, ListingParseError> {
    let err = || ListingParseError::BadVarnode { line, found: s.to_string() };
    let inner = s
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(err)?;
    let mut parts = inner.split(',').map(str::trim);
    let space = match parts.next().ok_or_else(err)? {
        "const" | "constant" => SpaceKind::Constant,
        "register" | "reg" => SpaceKind::Register,
        "unique" => SpaceKind::Unique,
        "ram" => SpaceKind::Ram,
        _ => return Err(err()),
    };
    let offset = parse_num(parts.next().ok_or_else(err)?, line)?;
    let size = parse_num(parts.next().ok_or_else(err)?, line)? as i32;
    if parts.next().is_some() {
        return Err(err());
    }
    Ok(VarnodeData::new(space, offset, size))
}

fn parse_opcode(s: &str, line: usize) -> Result<Opcode, ListingParseError> {
    let opc = match s {
        "COPY" => Opcode::Copy,
        "LOAD" => Opcode::Load,
        "STORE" => Opcode::Store,
        "BRANCH" => Opcode::Branch,
        "CBRANCH" => Opcode::CBranch,
        "BRANCHIND" => Opcode::BranchInd,
        "CALL" => Opcode::Call,
        "CALLIND" => Opcode::CallInd,
        "RETURN" => Opcode::Return,
        "INT_EQUAL" => Opcode::IntEqual,
        "INT_NOTEQUAL" => Opcode::IntNotEqual,
        "INT_LESS" => Opcode::IntLess,
        "INT_SLESS" => Opcode::IntSLess,
        "INT_LESSEQUAL" => Opcode::IntLessEqual,
        "INT_SLESSEQUAL" => Opcode::IntSLessEqual,
        "INT_ADD" => Opcode::IntAdd,
        "INT_SUB" => Opcode::IntSub,
        "INT_MULT" => Opcode::IntMult,
        "INT_DIV" => Opcode::IntDiv,
        "INT_SDIV" => Opcode::IntSDiv,
        "INT_REM" => Opcode::IntRem,
        "INT_SREM" => Opcode::IntSRem,
        "INT_AND" => Opcode::IntAnd,
        "INT_OR" => Opcode::IntOr,
        "INT_XOR" => Opcode::IntXor,
        "INT_LEFT" => Opcode::IntLeft,
        "INT_RIGHT" => Opcode::IntRight,
        "INT_SRIGHT" => Opcode::IntSRight,
        "INT_ZEXT" => Opcode::IntZext,
        "INT_SEXT" => Opcode::IntSext,
        "INT_2COMP" => Opcode::Int2Comp,
        "INT_NEGATE" => Opcode::IntNegate,
        "BOOL_NEGATE" => Opcode::BoolNegate,
        "BOOL_AND" => Opcode::BoolAnd,
        "BOOL_OR" => Opcode::BoolOr,
        "BOOL_XOR" => Opcode::BoolXor,
        "SUBPIECE" => Opcode::SubPiece,
        "NOP" => Opcode::Nop,
        _ => return Err(ListingParseError::BadOpcode { line, found: s.to_string() }),
    };
    Ok(opc)
}

fn parse_op(line: &str, lineno: usize) -> Result<OpTemplate, ListingParseError> {
    let (output, rest) = match line.split_once('=') {
        // A '=' inside a varnode tuple cannot occur; the split is safe.
        Some((lhs, rhs)) if lhs.trim_start().starts_with('(') => {
            (Some(parse_varnode(lhs.trim(), lineno)?), rhs.trim())
        }
        _ => (None, line),
    };
    let mut words = rest.splitn(2, char::is_whitespace);
    let opcode = parse_opcode(words.next().unwrap_or(""), lineno)?;
    // Inputs are comma separated, but varnode tuples contain commas themselves, so strip the
    // blanks and split on the tuple boundary instead.
    let inputs = match words.next() {
        None => Vec::new(),
        Some(tail) => {
            let tail = tail.replace(char::is_whitespace, "");
            tail.split("),")
                .map(|p| {
                    let owned;
                    let p = if p.ends_with(')') {
                        p
                    } else {
                        owned = format!("{})", p);
                        &owned
                    };
                    parse_varnode(p, lineno)
                })
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(OpTemplate { opcode, output, inputs })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
; tiny two-instruction program
func example @ 0x1000
mem 0x2000 0102030405060708

insn 0x1000 4
  (register,0x0,4) = COPY (const,0x5,4)
insn 0x1004 4
  CBRANCH (ram,0x100c,4) , (register,0x20,1)
insn 0x1008 4
insn 0x100c 4
  RETURN (register,0x38,4)
";

    #[test]
    fn parses_functions_instructions_and_memory() {
        let listing = parse_listing(SAMPLE).expect("sample parses");
        assert_eq!(listing.functions, vec![("example".to_string(), 0x1000)]);
        use crate::decoder::{DecodeResult, PcodeDecoder};
        match listing.decoder.decode(0x1000) {
            DecodeResult::Ops { ops, length } => {
                assert_eq!(length, 4);
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].opcode, Opcode::Copy);
                assert_eq!(ops[0].output, Some(VarnodeData::register(0, 4)));
                assert_eq!(ops[0].inputs, vec![VarnodeData::constant(5, 4)]);
            }
            other => panic!("expected ops, got {:?}", other),
        }
        match listing.decoder.decode(0x1004) {
            DecodeResult::Ops { ops, .. } => {
                assert_eq!(ops[0].opcode, Opcode::CBranch);
                assert_eq!(ops[0].inputs.len(), 2);
            }
            other => panic!("expected ops, got {:?}", other),
        }
        // An insn block with no op lines means no semantics were exported.
        assert!(matches!(
            listing.decoder.decode(0x1008),
            DecodeResult::Unimplemented { length: 4 }
        ));
        assert_eq!(listing.decoder.read_word(0x2000, 4), Some(0x04030201));
    }

    #[test]
    fn reports_the_offending_line() {
        let err = parse_listing("insn 0x1000 4\n  (register,0x0,4) = FROB (const,0x1,4)\n")
            .expect_err("bad opcode");
        assert_eq!(err, ListingParseError::BadOpcode { line: 2, found: "FROB".into() });
    }
}
