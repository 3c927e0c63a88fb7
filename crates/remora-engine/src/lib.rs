#![doc = include_str!("../README.md")]

//! Linearizability proving engine.
//!
//! The pipeline per heap mutation: build a bounded flow graph around the
//! write, run the footprint fixpoint until every boundary edge is
//! provably flow-preserving, batch-check the structural and
//! specification conditions, and extract the post state plus the
//! externally visible heap effects. The outer fixpoint re-proves every
//! API function until the interference set stabilizes.

pub mod config;
pub mod dump;
pub mod error;
pub mod footprint;
pub mod proof;
pub mod solver;
pub mod strategy;

use remora_ir::config::SolverConfig;
use remora_ir::program::Program;
use tracing::error;

pub use crate::config::EngineSetup;
pub use crate::error::{Result, VerificationError};

/// Prove that every API function of `program` is linearizable.
///
/// `Ok(())` means the proof closed; every expected failure mode is
/// reported as a [`VerificationError`] naming the offending function,
/// edge, or iteration bound.
pub fn prove_linearizability(
    program: &Program,
    config: &dyn SolverConfig,
    setup: &EngineSetup,
) -> Result<()> {
    proof::ProofGenerator::new(program, config, setup).generate()
}

/// Boolean convenience wrapper around [`prove_linearizability`]; the
/// failure diagnostic is logged, never swallowed.
pub fn is_linearizable(program: &Program, config: &dyn SolverConfig, setup: &EngineSetup) -> bool {
    match prove_linearizability(program, config, setup) {
        Ok(()) => true,
        Err(err) => {
            error!(program = %program.name, "verification failed: {err}");
            false
        }
    }
}
