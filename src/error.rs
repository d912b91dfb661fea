//! Error kinds and distinguished outcome codes of the engine.
//!
//! Analysis failures are contained per function (and per loop); only configuration problems are
//! fatal at startup. Contained failures additionally leave a flag on the affected
//! [`Funcdata`](crate::funcdata::Funcdata) or block so that later passes and the dump code can
//! report them without re-deriving the cause.

use thiserror::Error;

/// Errors that terminate analysis of the current function (or, for the two configuration
/// variants, the whole run at startup).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The entry address (or an address reached by flow) has no valid decode. The function is
    /// marked no-code and skipped.
    #[error("no valid instruction decode at {addr:#x}")]
    DecodeFailure { addr: u64 },

    /// Decoding exceeded the configured per-function instruction cap.
    #[error("function at {addr:#x} exceeds the instruction cap ({cap})")]
    InstructionCap { addr: u64, cap: usize },

    /// An explicit work-stack exceeded the configured depth bound.
    #[error("analysis walk exceeded the depth bound ({0})")]
    WalkDepth(usize),

    /// Invalid address-space or register configuration. Fatal at startup.
    #[error("invalid address-space configuration: {0}")]
    SpaceConfig(String),

    /// No decode backend was supplied. Fatal at startup.
    #[error("no decode backend configured")]
    NoDecoder,
}

/// Distinguished (non-error) outcomes of evaluating a single op on the value lattice.
///
/// These mirror the result codes of the per-op evaluation used both by the fixed-point
/// propagation and by the trace-guided unrolling: the caller dispatches on them rather than
/// treating them as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeOutcome {
    /// The op's output (if any) was evaluated; `changed` says whether its lattice value moved.
    Settled { changed: bool },
    /// A conditional branch whose controlling value folded to a constant. The caller should
    /// queue the untaken edge for pruning.
    ConstCbranch,
    /// A computed branch target became a known constant during trace evaluation.
    MeetCalcBranch,
    /// The value's computation depends on itself through an unmodeled path; its lattice value
    /// has been forced to bottom and evaluation of this op was abandoned.
    FreeSelf,
}
