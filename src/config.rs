//! A global store of knobs that bound and tune the analysis.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different analysis executions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the engine via
/// the global [`CONFIG`](static@CONFIG).
pub struct AnalysisConfig {
    /// Hard cap on the number of machine instructions decoded for a single function. Exceeding
    /// the cap aborts analysis for that function only, leaving it marked incomplete.
    pub max_instructions: usize,
    /// Upper bound on guided loop-unrolling iterations for a single dispatch loop. The residual
    /// loop is left intact once the bound is reached or the governing condition stops resolving.
    pub max_unroll: usize,
    /// Depth bound for the explicit work-stacks that replace recursion in the dominator-tree
    /// walks and the backward store search.
    pub max_walk_depth: usize,
    /// Use the complete (dominator-walk) liverange computation rather than the fast single-block
    /// approximation. The fast mode is sufficient for peephole rewrites but must not be used for
    /// interference reasoning.
    pub complete_liverange: bool,
    /// Allow an unresolvable ("top") store to be marked so that provably safe stores can be
    /// searched past it during the backward store query.
    pub topstore_mark: bool,
    /// How many def/use chain entries to print before the dump switches to an elision marker,
    /// when an omit-excess dump flag is set.
    pub udchain_limit: usize,
    /// Whether the per-op stack-depth annotation is printed in pcode dumps.
    pub dump_sp_depth: bool,
}

impl AnalysisConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe { INTERNAL_CONFIG_INITIALIZER.take() };
        init.flatten().unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineAnalysisConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<AnalysisConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global analysis configuration.
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_unroll: 64,
            max_walk_depth: 4096,
            complete_liverange: true,
            topstore_mark: false,
            udchain_limit: 16,
            dump_sp_depth: false,
        }
    }
}

/// Command-line-selectable tweaks to the analysis behavior. Each variant flips or bounds one
/// field of [`AnalysisConfig`] away from its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum CommandLineAnalysisConfig {
    DisableCompleteLiverange,
    EnableTopstoreMark,
    DumpSpDepth,
    SmallInstructionCap,
    TinyUnrollBound,
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(cmdline: Vec<CommandLineAnalysisConfig>) -> Self {
        let mut config = AnalysisConfig::default();
        for c in cmdline {
            match c {
                CommandLineAnalysisConfig::DisableCompleteLiverange => {
                    config.complete_liverange = false;
                }
                CommandLineAnalysisConfig::EnableTopstoreMark => {
                    config.topstore_mark = true;
                }
                CommandLineAnalysisConfig::DumpSpDepth => {
                    config.dump_sp_depth = true;
                }
                CommandLineAnalysisConfig::SmallInstructionCap => {
                    config.max_instructions = 10_000;
                }
                CommandLineAnalysisConfig::TinyUnrollBound => {
                    config.max_unroll = 4;
                }
            }
        }
        config
    }
}
