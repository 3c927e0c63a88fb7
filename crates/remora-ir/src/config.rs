//! The capability interface the engine consumes from the parsed-program
//! configuration.

use crate::logic::{ImplicationSet, MemoryAxiom};
use crate::program::{TypeId, VarId};
use crate::symbols::{Sort, SymbolId};

/// Structure-specific knowledge supplied by the verified program's
/// configuration: invariants and the flow edge/containment predicates.
///
/// Predicates are instantiated per resource. The `value` argument of
/// [`SolverConfig::outflow_contains`] and
/// [`SolverConfig::logically_contains`] is the first-order value probed
/// for membership; implementations typically receive
/// [`SymbolId::probe`](crate::symbols::SymbolId::probe) and the caller
/// substitutes the quantified variable for it.
pub trait SolverConfig {
    /// Sort of the members of second-order flow values.
    fn flow_sort(&self) -> Sort;

    /// Maximum depth up to which a flow footprint may be explored for an
    /// update of `field` on a node of type `ty`. Unrelated parts of a
    /// structure must not be pulled in for an unrelated field update.
    fn max_footprint_depth(&self, ty: TypeId, field: &str) -> usize;

    /// Invariant instantiated for every local node.
    fn local_node_invariant(&self, memory: &MemoryAxiom) -> ImplicationSet;

    /// Invariant instantiated for every shared node.
    fn shared_node_invariant(&self, memory: &MemoryAxiom) -> ImplicationSet;

    /// Invariant instantiated for a shared variable binding.
    fn shared_variable_invariant(&self, variable: VarId, value: SymbolId) -> ImplicationSet;

    /// Edge predicate: `value` is in the outflow of `memory` along
    /// `field` iff the returned set holds. The outflow is additionally
    /// constrained by the node's flow, i.e. it is precisely
    /// `{ v | v ∈ flow(memory) ∧ P(memory, v) }`.
    fn outflow_contains(&self, memory: &MemoryAxiom, field: &str, value: SymbolId)
        -> ImplicationSet;

    /// Containment predicate: `memory` logically contains `value`.
    fn logically_contains(&self, memory: &MemoryAxiom, value: SymbolId) -> ImplicationSet;
}
