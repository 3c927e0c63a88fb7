//! Flow-graph encodings: per-node flow rules, outflow transfer, keyset
//! disjointness, and inflow uniqueness.

use remora_ir::flowgraph::{EMode, FlowGraph, FlowGraphNode, PointerField};
use remora_ir::symbols::SymbolId;

use crate::solver::SmtError;
use crate::sorts::SmtSort;
use crate::terms::Term;

use super::{EExpr, Encoding, Subst};

impl<'a> Encoding<'a> {
    /// Instantiate the configured edge predicate of `field` for `value`.
    pub fn encode_outflow_contains(
        &self,
        node: &FlowGraphNode,
        field: &str,
        value: Term,
        mode: EMode,
    ) -> Term {
        let memory = node.to_memory(mode);
        let probe = SymbolId::probe(self.config.flow_sort());
        let predicate = self.config.outflow_contains(&memory, field, probe);
        let mut subst = Subst::new();
        subst.insert(probe, value);
        self.encode_implication_set(&predicate, &subst)
    }

    /// Instantiate the configured containment predicate for `value`.
    pub fn encode_logically_contains(
        &self,
        node: &FlowGraphNode,
        value: Term,
        mode: EMode,
    ) -> Term {
        let memory = node.to_memory(mode);
        let probe = SymbolId::probe(self.config.flow_sort());
        let predicate = self.config.logically_contains(&memory, probe);
        let mut subst = Subst::new();
        subst.insert(probe, value);
        self.encode_implication_set(&predicate, &subst)
    }

    /// The configured node invariant, instantiated for the node's state
    /// and locality in `mode`.
    pub fn encode_node_invariant(&self, node: &FlowGraphNode, mode: EMode) -> Term {
        let memory = node.to_memory(mode);
        let invariant = if node.is_local(mode) {
            self.config.local_node_invariant(&memory)
        } else {
            self.config.shared_node_invariant(&memory)
        };
        self.encode_implication_set(&invariant, &Subst::new())
    }

    /// Outflow of one pointer field in one mode: the outflow is exactly
    /// the inflow filtered through the edge predicate, and whatever flows
    /// out arrives at the in-graph successor.
    pub fn encode_outflow(
        &self,
        graph: &FlowGraph,
        node: &FlowGraphNode,
        field: &PointerField,
        mode: EMode,
    ) -> Term {
        let mut rules = Vec::new();
        let mut rule = |inflow: SymbolId, outflow: SymbolId| {
            let qv = self.fresh_qv();
            let qv_term = Term::var(qv.clone(), SmtSort::Int);
            let sent = Term::and(vec![
                self.flow_contains(inflow, qv_term.clone()),
                self.encode_outflow_contains(node, field.name(), qv_term.clone(), mode),
            ]);
            rules.push(Term::forall(
                qv,
                SmtSort::Int,
                sent.eq(self.flow_contains(outflow, qv_term)),
            ));
        };
        rule(node.graph_inflow(mode), field.graph_outflow(mode));
        rule(node.all_inflow(mode), field.all_outflow(mode));

        if let Some(successor) = graph.node_at(field.value(mode)) {
            rules.push(self.flow_subset(field.graph_outflow(mode), successor.graph_inflow(mode)));
            rules.push(self.flow_subset(field.all_outflow(mode), successor.all_inflow(mode)));
        }
        Term::and(rules)
    }

    /// The per-node flow rule set tying graph-inflow, all-inflow, frame
    /// inflow, keysets, and outflows together.
    pub fn encode_flow_rules(&self, graph: &FlowGraph, node: &FlowGraphNode) -> Term {
        let qv = self.fresh_qv();
        let qv_term = Term::var(qv.clone(), SmtSort::Int);
        let mut rules = Vec::new();
        let mut rule = |premise: Term, conclusion: Term| {
            rules.push(premise.implies(conclusion));
        };

        let member = |flow: SymbolId| self.flow_contains(flow, qv_term.clone());
        let pre_graph = member(node.graph_inflow(EMode::Pre));
        let post_graph = member(node.graph_inflow(EMode::Post));
        let pre_all = member(node.all_inflow(EMode::Pre));
        let post_all = member(node.all_inflow(EMode::Post));
        let pre_key = member(node.keyset(EMode::Pre));
        let post_key = member(node.keyset(EMode::Post));
        let frame = member(node.frame_inflow);
        let pre_out = Term::or(
            node.pointer_fields
                .iter()
                .map(|field| member(field.all_outflow(EMode::Pre)))
                .collect(),
        );
        let post_out = Term::or(
            node.pointer_fields
                .iter()
                .map(|field| member(field.all_outflow(EMode::Post)))
                .collect(),
        );

        // graph inflow is part of all inflow
        rule(pre_graph.clone(), pre_all.clone());
        rule(post_graph.clone(), post_all.clone());

        // frame inflow is part of all inflow
        rule(frame.clone(), pre_all.clone());
        rule(frame.clone(), post_all.clone());

        // all inflow is either frame inflow or graph inflow
        rule(
            pre_all.clone(),
            Term::or(vec![pre_graph.clone(), frame.clone()]),
        );
        rule(
            post_all.clone(),
            Term::or(vec![post_graph.clone(), frame.clone()]),
        );

        // unchanged graph inflow keeps all inflow unchanged
        rule(
            pre_graph.clone().eq(post_graph.clone()),
            pre_all.clone().eq(post_all.clone()),
        );

        // keyset is the retained inflow: in the flow, not sent onward
        rule(
            pre_key.clone(),
            Term::and(vec![pre_all.clone(), pre_out.clone().not()]),
        );
        rule(
            post_key.clone(),
            Term::and(vec![post_all.clone(), post_out.clone().not()]),
        );
        rule(
            pre_all.clone(),
            Term::or(vec![pre_out.clone(), pre_key.clone()]),
        );
        rule(
            Term::and(vec![pre_all.clone(), pre_out.clone().not()]),
            pre_key.clone(),
        );
        rule(
            Term::and(vec![pre_all.clone(), pre_key.clone().not()]),
            pre_out.clone(),
        );
        rule(
            post_all.clone(),
            Term::or(vec![post_out.clone(), post_key.clone()]),
        );
        rule(
            Term::and(vec![post_all.clone(), post_out.clone().not()]),
            post_key.clone(),
        );
        rule(
            Term::and(vec![post_all.clone(), post_key.clone().not()]),
            post_out.clone(),
        );

        // graph inflow is due to in-graph predecessors; skipped when the
        // node's graph inflow coincides with its all inflow (the root)
        if node.all_inflow(EMode::Pre) != node.graph_inflow(EMode::Pre)
            && node.all_inflow(EMode::Post) != node.graph_inflow(EMode::Post)
        {
            for mode in EMode::BOTH {
                let incoming = Term::or(
                    graph
                        .incoming_edges(node, mode)
                        .into_iter()
                        .map(|(source, field)| {
                            member(graph.nodes[source].pointer_fields[field].graph_outflow(mode))
                        })
                        .collect(),
                );
                let graph_in = match mode {
                    EMode::Pre => pre_graph.clone(),
                    EMode::Post => post_graph.clone(),
                };
                rule(graph_in, incoming);
            }
        }

        Term::forall(qv, SmtSort::Int, Term::and(rules))
    }

    /// No value is in two nodes' keysets at once.
    pub fn encode_keyset_disjointness(&self, graph: &FlowGraph, mode: EMode) -> Term {
        let qv = self.fresh_qv();
        let qv_term = Term::var(qv.clone(), SmtSort::Int);
        let keysets = graph
            .nodes
            .iter()
            .map(|node| self.flow_contains(node.keyset(mode), qv_term.clone()))
            .collect();
        Term::forall(qv, SmtSort::Int, Term::at_most_one(keysets))
    }

    /// Per node, at most one incoming edge carries flow, and an in-graph
    /// contribution excludes a frame contribution.
    pub fn encode_inflow_uniqueness(&self, graph: &FlowGraph, mode: EMode) -> Term {
        let mut result = Vec::new();
        for node in &graph.nodes {
            let incoming = graph.incoming_edges(node, mode);
            if incoming.is_empty() {
                continue;
            }
            let carries: Vec<Term> = incoming
                .iter()
                .map(|(source, field)| {
                    self.flow_nonempty(graph.nodes[*source].pointer_fields[*field].graph_outflow(mode))
                })
                .collect();
            result.push(Term::at_most_one(carries.clone()));
            result.push(
                Term::or(carries).implies(self.flow_nonempty(node.frame_inflow).not()),
            );
        }
        Term::and(result)
    }

    /// The full graph premise: the pre-state with its derived knowledge,
    /// the pre-state flow sanity conditions, and every node's flow rules
    /// and outflow transfer in both modes.
    pub fn encode_graph(&self, graph: &FlowGraph) -> Term {
        if graph.nodes.is_empty() {
            return Term::bool(true);
        }
        let mut result = vec![
            self.encode_formula(&graph.pre.now, &Subst::new()),
            self.encode_invariants(&graph.pre.now),
            self.encode_acyclicity(&graph.pre.now),
            self.encode_ownership(&graph.pre.now),
            self.encode_keyset_disjointness(graph, EMode::Pre),
            self.encode_inflow_uniqueness(graph, EMode::Pre),
        ];
        for node in &graph.nodes {
            result.push(self.encode_flow_rules(graph, node));
            for field in &node.pointer_fields {
                result.push(self.encode_outflow(graph, node, field, EMode::Pre));
                result.push(self.encode_outflow(graph, node, field, EMode::Post));
            }
        }
        Term::and(result)
    }

    /// Encode the graph and add it as a premise.
    pub fn add_premise_graph(&mut self, graph: &FlowGraph) -> Result<(), SmtError> {
        let term = self.encode_graph(graph);
        self.add_premise(term)
    }

    /// Flow symbol of a node as an [`EExpr`], for strategy code that
    /// mixes applications and boolean structure.
    pub fn flow_expr(&self, flow: SymbolId) -> EExpr {
        self.encode_symbol(flow)
    }
}

#[cfg(test)]
mod tests {
    use indexmap::indexmap;
    use remora_ir::config::SolverConfig;
    use remora_ir::flowgraph::{FlowGraph, FlowGraphNode};
    use remora_ir::logic::{Annotation, Axiom, Formula, ImplicationSet, MemoryAxiom};
    use remora_ir::program::{
        BinaryOperator, NodeType, Program, TypeId, VarId, VariableDecl,
    };
    use remora_ir::symbols::{Sort, SymbolFactory, SymbolId};

    use super::super::Encoding;
    use crate::terms::Term;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct ChainConfig;

    impl SolverConfig for ChainConfig {
        fn flow_sort(&self) -> Sort {
            Sort::Data
        }
        fn max_footprint_depth(&self, _ty: TypeId, _field: &str) -> usize {
            2
        }
        fn local_node_invariant(&self, _memory: &MemoryAxiom) -> ImplicationSet {
            ImplicationSet::new()
        }
        fn shared_node_invariant(&self, _memory: &MemoryAxiom) -> ImplicationSet {
            ImplicationSet::new()
        }
        fn shared_variable_invariant(
            &self,
            _variable: VarId,
            _value: SymbolId,
        ) -> ImplicationSet {
            ImplicationSet::new()
        }
        fn outflow_contains(
            &self,
            memory: &MemoryAxiom,
            _field: &str,
            value: SymbolId,
        ) -> ImplicationSet {
            ImplicationSet::fact(Formula::with(vec![Axiom::stack(
                BinaryOperator::Gt,
                remora_ir::logic::SymbolicExpr::Symbol(value),
                remora_ir::logic::SymbolicExpr::Symbol(memory.field("val")),
            )]))
        }
        fn logically_contains(&self, memory: &MemoryAxiom, value: SymbolId) -> ImplicationSet {
            ImplicationSet::fact(Formula::with(vec![Axiom::eq(
                remora_ir::logic::SymbolicExpr::Symbol(value),
                remora_ir::logic::SymbolicExpr::Symbol(memory.field("val")),
            )]))
        }
    }

    fn chain_program() -> Program {
        Program {
            name: "chain".into(),
            types: vec![NodeType {
                name: "Node".into(),
                fields: indexmap! {
                    "val".to_string() => Sort::Data,
                    "next".to_string() => Sort::Ptr,
                },
            }],
            variables: Vec::new(),
            functions: Vec::new(),
        }
    }

    fn two_node_graph() -> FlowGraph {
        let mut factory = SymbolFactory::new();
        let null = factory.fresh_fo(Sort::Ptr);
        let tail_memory = MemoryAxiom {
            node: factory.fresh_fo(Sort::Ptr),
            node_type: TypeId(0),
            flow: factory.fresh_so(Sort::Data),
            fields: indexmap! {
                "val".to_string() => factory.fresh_fo(Sort::Data),
                "next".to_string() => null,
            },
        };
        let head_memory = MemoryAxiom {
            node: factory.fresh_fo(Sort::Ptr),
            node_type: TypeId(0),
            flow: factory.fresh_so(Sort::Data),
            fields: indexmap! {
                "val".to_string() => factory.fresh_fo(Sort::Data),
                "next".to_string() => tail_memory.node,
            },
        };
        let mut now = Formula::new();
        now.conjoin(Axiom::SharedMemory(head_memory.clone()));
        now.conjoin(Axiom::SharedMemory(tail_memory.clone()));

        let as_node = |memory: &MemoryAxiom, factory: &mut SymbolFactory| {
            FlowGraphNode::from_memory(memory, false, factory, Sort::Data, |name| name == "next")
        };
        let head = as_node(&head_memory, &mut factory);
        let tail = as_node(&tail_memory, &mut factory);
        FlowGraph {
            pre: Annotation::with_now(now),
            nodes: vec![head, tail],
        }
    }

    #[test]
    fn graph_inflow_is_within_all_inflow() -> TestResult {
        let program = chain_program();
        let config = ChainConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let graph = two_node_graph();
        encoding.add_premise_graph(&graph)?;

        for node in &graph.nodes {
            for mode in remora_ir::flowgraph::EMode::BOTH {
                let subset =
                    encoding.flow_subset(node.graph_inflow(mode), node.all_inflow(mode));
                assert!(
                    encoding.implies(&subset)?,
                    "graph inflow exceeds all inflow for {}",
                    node.address
                );
            }
        }
        Ok(())
    }

    #[test]
    fn outflow_reaches_the_successor() -> TestResult {
        let program = chain_program();
        let config = ChainConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let graph = two_node_graph();
        encoding.add_premise_graph(&graph)?;

        let head = &graph.nodes[0];
        let tail = &graph.nodes[1];
        let field = &head.pointer_fields[0];
        for mode in remora_ir::flowgraph::EMode::BOTH {
            let delivered =
                encoding.flow_subset(field.all_outflow(mode), tail.all_inflow(mode));
            assert!(encoding.implies(&delivered)?);
        }
        Ok(())
    }

    #[test]
    fn pure_graph_with_identical_modes_is_pure() -> TestResult {
        let program = chain_program();
        let config = ChainConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let mut graph = two_node_graph();
        for node in &mut graph.nodes {
            node.post_all_inflow = node.pre_all_inflow;
            node.post_graph_inflow = node.pre_graph_inflow;
            node.post_keyset = node.pre_keyset;
            for field in &mut node.pointer_fields {
                field.post_all_outflow = field.pre_all_outflow;
                field.post_graph_outflow = field.pre_graph_outflow;
            }
        }
        encoding.add_premise_graph(&graph)?;
        let pure = encoding.encode_is_pure(&graph);
        assert!(encoding.implies(&pure)?);
        Ok(())
    }

    #[test]
    fn keyset_disjointness_is_a_well_formed_term() -> TestResult {
        let program = chain_program();
        let config = ChainConfig;
        let encoding = Encoding::new(&program, &config)?;
        let graph = two_node_graph();
        let term = encoding.encode_keyset_disjointness(&graph, remora_ir::flowgraph::EMode::Pre);
        assert!(matches!(term, Term::Forall(..)));
        Ok(())
    }
}
