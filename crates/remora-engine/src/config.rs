//! Engine tunables.

pub use remora_ir::config::SolverConfig;

use crate::strategy::ExtensionStrategy;

/// Knobs of one proof run. The defaults match the bounds the engine was
/// tuned with; exceeding either iteration bound is a hard failure, not a
/// silent truncation.
#[derive(Debug, Clone)]
pub struct EngineSetup {
    /// Join iterations granted to a loop before giving up.
    pub loop_max_iterations: usize,
    /// Memoize macro invocations per outer proof iteration.
    pub macros_tabulate_invocations: bool,
    /// Outer interference fixpoint bound.
    pub proof_max_iterations: usize,
    /// Footprint extension strategy.
    pub footprint_strategy: ExtensionStrategy,
    /// Fold anticipated future updates into memory-write post images.
    pub use_future: bool,
    /// Emit each computed footprint in the block-structured dump format
    /// (diagnostics only).
    pub dump_footprints: bool,
}

impl Default for EngineSetup {
    fn default() -> Self {
        EngineSetup {
            loop_max_iterations: 23,
            macros_tabulate_invocations: true,
            proof_max_iterations: 7,
            footprint_strategy: ExtensionStrategy::GeneralWithCycleCheck,
            use_future: true,
            dump_footprints: false,
        }
    }
}
