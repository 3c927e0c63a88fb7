//! Specification encodings over a flow graph: logical containment,
//! purity, and insertion/deletion characterizations.

use remora_ir::flowgraph::{EMode, FlowGraph};
use remora_ir::symbols::SymbolId;

use crate::sorts::SmtSort;
use crate::terms::Term;

use super::Encoding;

impl<'a> Encoding<'a> {
    /// `key` is (or is not) logically in the structure: some node keeps
    /// it in its keyset and the containment predicate agrees.
    fn encode_contains(&self, graph: &FlowGraph, key: Term, mode: EMode, contained: bool) -> Term {
        let mut cases = Vec::new();
        for node in &graph.nodes {
            let in_keyset = self.flow_contains(node.keyset(mode), key.clone());
            let mut logically = self.encode_logically_contains(node, key.clone(), mode);
            if !contained {
                logically = logically.not();
            }
            cases.push(Term::and(vec![in_keyset, logically]));
        }
        Term::or(cases)
    }

    fn encode_contains_unchanged(&self, graph: &FlowGraph, key: Term) -> Term {
        let contained = self
            .encode_contains(graph, key.clone(), EMode::Pre, true)
            .eq(self.encode_contains(graph, key.clone(), EMode::Post, true));
        let absent = self
            .encode_contains(graph, key.clone(), EMode::Pre, false)
            .eq(self.encode_contains(graph, key, EMode::Post, false));
        Term::and(vec![contained, absent])
    }

    /// The update does not change the logical contents for any value.
    pub fn encode_is_pure(&self, graph: &FlowGraph) -> Term {
        let qv = self.fresh_qv();
        let qv_term = Term::var(qv.clone(), SmtSort::Int);
        Term::forall(
            qv,
            SmtSort::Int,
            self.encode_contains_unchanged(graph, qv_term),
        )
    }

    /// Every value other than `key` keeps its containment status.
    fn encode_others_unchanged(&self, graph: &FlowGraph, key: Term) -> Term {
        let qv = self.fresh_qv();
        let qv_term = Term::var(qv.clone(), SmtSort::Int);
        Term::forall(
            qv,
            SmtSort::Int,
            qv_term
                .clone()
                .neq(key)
                .implies(self.encode_contains_unchanged(graph, qv_term)),
        )
    }

    pub fn encode_contains_key(&self, graph: &FlowGraph, key: SymbolId) -> Term {
        let key = self.encode_symbol(key).term();
        self.encode_contains(graph, key, EMode::Pre, true)
    }

    pub fn encode_not_contains_key(&self, graph: &FlowGraph, key: SymbolId) -> Term {
        let key = self.encode_symbol(key).term();
        self.encode_contains(graph, key, EMode::Pre, false)
    }

    /// The update inserts exactly `key`.
    pub fn encode_is_insertion(&self, graph: &FlowGraph, key: SymbolId) -> Term {
        let key = self.encode_symbol(key).term();
        Term::and(vec![
            self.encode_contains(graph, key.clone(), EMode::Pre, false),
            self.encode_contains(graph, key.clone(), EMode::Post, true),
            self.encode_others_unchanged(graph, key),
        ])
    }

    /// The update deletes exactly `key`.
    pub fn encode_is_deletion(&self, graph: &FlowGraph, key: SymbolId) -> Term {
        let key = self.encode_symbol(key).term();
        Term::and(vec![
            self.encode_contains(graph, key.clone(), EMode::Pre, true),
            self.encode_contains(graph, key.clone(), EMode::Post, false),
            self.encode_others_unchanged(graph, key),
        ])
    }
}
