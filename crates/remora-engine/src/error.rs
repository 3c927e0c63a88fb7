use remora_smt::solver::SmtError;
use thiserror::Error;

/// Failure taxonomy of a verification run. Every variant is fatal to the
/// current run; none is silently swallowed.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// A boundary edge targets an address with no corresponding graph
    /// node; the change cannot be verified with the given node set.
    #[error("footprint unverifiable: boundary edge targets {address} which has no graph node")]
    FootprintUnverifiable { address: String },

    /// The update may introduce sharing or a cycle invisible to the
    /// local check.
    #[error("update at {address} cannot guarantee acyclicity")]
    AcyclicityViolated { address: String },

    /// A return path of the function lacks the required fulfillment
    /// after bounded retries.
    #[error("could not establish linearizability for function '{function}'")]
    LinearizationNotFound { function: String },

    /// The outer rely/guarantee fixpoint exceeded its iteration bound.
    #[error("proof does not stabilize within {iterations} interference iterations")]
    InterferenceNonStabilizing { iterations: usize },

    /// A loop join exceeded its iteration bound.
    #[error("loop does not stabilize within {iterations} join iterations")]
    LoopNonStabilizing { iterations: usize },

    /// The update violates a structural or specification invariant.
    #[error("unsafe update: {reason}")]
    UnsafeUpdate { reason: String },

    /// The program uses a construct the engine does not support.
    #[error("unsupported program: {reason}")]
    UnsupportedProgram { reason: String },

    /// A persistent solver "unknown" below the batching layer.
    #[error("solver failure: {0}")]
    Solver(#[from] SmtError),

    /// Broken internal expectation that is not a user-visible failure
    /// mode; indicates a bug.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl VerificationError {
    pub fn unsafe_update(reason: impl Into<String>) -> VerificationError {
        VerificationError::UnsafeUpdate {
            reason: reason.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> VerificationError {
        VerificationError::UnsupportedProgram {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> VerificationError {
        VerificationError::Internal {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VerificationError>;
