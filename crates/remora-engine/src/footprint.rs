//! Flow-graph construction and the footprint fixpoint.
//!
//! [`make_flow_footprint`] builds the bounded graph around one heap
//! write; [`make_pure_heap_graph`] covers a whole state for checks that
//! involve no write. [`compute_fixed_point`] then grows the footprint
//! until every boundary edge is provably flow-preserving, or reports
//! that no footprint within the graph suffices.

use std::collections::BTreeMap;

use remora_ir::config::SolverConfig;
use remora_ir::flowgraph::{EMode, FlowGraph, FlowGraphNode};
use remora_ir::logic::{Annotation, Axiom, SymbolicExpr};
use remora_ir::program::{MemoryWrite, Program, SimpleExpr, VarId};
use remora_ir::symbols::{Sort, SymbolFactory, SymbolId};
use remora_smt::encoding::Encoding;
use tracing::debug;

use crate::error::{Result, VerificationError};
use crate::strategy::{BoundaryEdge, EdgeSet, ExtensionStrategy, NodeSet};

/// Evaluate a stack expression to a symbol, materializing literals as
/// fresh bound symbols.
pub fn evaluate_simple(
    expr: &SimpleExpr,
    annotation: &mut Annotation,
    program: &Program,
    factory: &mut SymbolFactory,
) -> Result<SymbolId> {
    let literal = |annotation: &mut Annotation,
                   factory: &mut SymbolFactory,
                   sort: Sort,
                   value: SymbolicExpr| {
        let symbol = factory.fresh_fo(sort);
        annotation.conjoin(Axiom::eq(SymbolicExpr::Symbol(symbol), value));
        symbol
    };
    match expr {
        SimpleExpr::Var(variable) => {
            annotation
                .now
                .value_of(*variable)
                .ok_or_else(|| VerificationError::internal(format!(
                    "variable '{}' has no binding",
                    program.variable(*variable).name
                )))
        }
        SimpleExpr::True => Ok(literal(annotation, factory, Sort::Bool, SymbolicExpr::Bool(true))),
        SimpleExpr::False => {
            Ok(literal(annotation, factory, Sort::Bool, SymbolicExpr::Bool(false)))
        }
        SimpleExpr::Min => Ok(literal(annotation, factory, Sort::Data, SymbolicExpr::Min)),
        SimpleExpr::Max => Ok(literal(annotation, factory, Sort::Data, SymbolicExpr::Max)),
        SimpleExpr::Null => Ok(literal(annotation, factory, Sort::Ptr, SymbolicExpr::Null)),
    }
}

struct GraphBuilder<'a> {
    program: &'a Program,
    config: &'a dyn SolverConfig,
    factory: &'a mut SymbolFactory,
    /// `(address, field) -> written value`
    updates: BTreeMap<(SymbolId, String), SymbolId>,
}

impl<'a> GraphBuilder<'a> {
    fn node_from_resource(&mut self, graph: &FlowGraph, address: SymbolId) -> Option<FlowGraphNode> {
        let (local, memory) = graph.pre.now.memory_at(address)?;
        let layout = self.program.node_type(memory.node_type);
        let mut node = FlowGraphNode::from_memory(
            memory,
            local,
            self.factory,
            self.config.flow_sort(),
            |name| layout.field_sort(name) == Some(Sort::Ptr),
        );
        for ((target, field), value) in &self.updates {
            if *target != address {
                continue;
            }
            if let Some(slot) = node.field_mut(field) {
                slot.post_value = *value;
            }
        }
        Some(node)
    }

    /// Worklist expansion, bounded at `depth` hops from the root.
    fn expand(&mut self, graph: &mut FlowGraph, depth: usize) {
        let mut worklist: Vec<(usize, SymbolId)> = vec![(depth, graph.root().address)];
        while let Some((budget, address)) = worklist.pop() {
            if budget == 0 {
                continue;
            }
            let Some(index) = graph.position(address) else {
                continue;
            };
            let publish = !graph.nodes[index].post_local;
            let targets: Vec<SymbolId> = graph.nodes[index]
                .pointer_fields
                .iter()
                .flat_map(|field| EMode::BOTH.map(|mode| field.value(mode)))
                .collect();
            for target in targets {
                if let Some(existing) = graph.node_at_mut(target) {
                    if publish {
                        existing.post_local = false;
                    }
                    continue;
                }
                if let Some(mut node) = self.node_from_resource(graph, target) {
                    if publish {
                        node.post_local = false;
                    }
                    graph.nodes.push(node);
                    worklist.push((budget - 1, target));
                }
            }
        }
    }
}

/// Build the flow graph around one memory write, seeded at the written
/// node and grown by field-following up to the configured depth.
pub fn make_flow_footprint(
    mut pre: Annotation,
    write: &MemoryWrite,
    program: &Program,
    config: &dyn SolverConfig,
    factory: &mut SymbolFactory,
) -> Result<FlowGraph> {
    assert!(!write.lhs.is_empty(), "memory write without targets");
    assert_eq!(write.lhs.len(), write.rhs.len());
    pre.now.dedup();

    // resolve written values and collect the update map
    let mut updates: BTreeMap<(SymbolId, String), SymbolId> = BTreeMap::new();
    let mut depth = 0;
    for (dereference, expr) in write.lhs.iter().zip(&write.rhs) {
        let address = target_address(dereference.variable, &pre, program)?;
        let value = evaluate_simple(expr, &mut pre, program, factory)?;
        let node_type = program
            .variable(dereference.variable)
            .node_type
            .ok_or_else(|| VerificationError::unsupported("write through a non-pointer"))?;
        depth = depth.max(config.max_footprint_depth(node_type, &dereference.field));
        let previous = updates.insert((address, dereference.field.clone()), value);
        if previous.is_some() {
            return Err(VerificationError::unsupported(format!(
                "assignment updates field '{}' twice",
                dereference.field
            )));
        }
    }

    let root_address = target_address(write.lhs[0].variable, &pre, program)?;
    let mut graph = FlowGraph {
        pre,
        nodes: Vec::new(),
    };
    let mut builder = GraphBuilder {
        program,
        config,
        factory,
        updates,
    };

    let root = builder
        .node_from_resource(&graph, root_address)
        .ok_or_else(|| VerificationError::FootprintUnverifiable {
            address: root_address.to_string(),
        })?;
    graph.nodes.push(root);
    {
        let root = &mut graph.nodes[0];
        root.needed = true;
        // the root routes its whole inflow: graph and all inflow agree,
        // and the update leaves the inflow untouched
        root.pre_graph_inflow = root.pre_all_inflow;
        root.post_graph_inflow = root.pre_all_inflow;
        root.post_all_inflow = root.pre_all_inflow;
    }
    builder.expand(&mut graph, depth);

    // every written cell must be part of the graph and survive
    // minimization
    for (address, field) in builder.updates.keys() {
        match graph.node_at_mut(*address) {
            Some(node) => node.needed = true,
            None => {
                return Err(VerificationError::FootprintUnverifiable {
                    address: address.to_string(),
                })
            }
        }
        debug!(address = %address, field = %field, "write captured by footprint");
    }

    // cyclic flow graphs are not supported
    let root = graph.root();
    if !graph.incoming_edges(root, EMode::Pre).is_empty()
        || !graph.incoming_edges(root, EMode::Post).is_empty()
    {
        return Err(VerificationError::unsupported(
            "cyclic flow graphs are not supported",
        ));
    }

    Ok(graph)
}

fn target_address(variable: VarId, pre: &Annotation, program: &Program) -> Result<SymbolId> {
    pre.now.value_of(variable).ok_or_else(|| {
        VerificationError::internal(format!(
            "dereferenced variable '{}' has no binding",
            program.variable(variable).name
        ))
    })
}

/// Build a graph covering every memory resource of the annotation, with
/// identical pre and post state; used for whole-state properties.
pub fn make_pure_heap_graph(
    pre: Annotation,
    program: &Program,
    config: &dyn SolverConfig,
    factory: &mut SymbolFactory,
) -> FlowGraph {
    let mut nodes = Vec::new();
    for axiom in &pre.now.conjuncts {
        let (local, memory) = match axiom {
            Axiom::LocalMemory(memory) => (true, memory),
            Axiom::SharedMemory(memory) => (false, memory),
            _ => continue,
        };
        if nodes
            .iter()
            .any(|node: &FlowGraphNode| node.address == memory.node)
        {
            continue;
        }
        let layout = program.node_type(memory.node_type);
        let mut node = FlowGraphNode::from_memory(
            memory,
            local,
            factory,
            config.flow_sort(),
            |name| layout.field_sort(name) == Some(Sort::Ptr),
        );
        node.needed = true;
        // no write involved: pre and post coincide
        node.post_all_inflow = node.pre_all_inflow;
        node.post_graph_inflow = node.pre_graph_inflow;
        node.post_keyset = node.pre_keyset;
        for field in &mut node.pointer_fields {
            field.post_all_outflow = field.pre_all_outflow;
            field.post_graph_outflow = field.pre_graph_outflow;
        }
        nodes.push(node);
    }
    FlowGraph { pre, nodes }
}

/// Pointer edges leaving the footprint in at least one mode.
pub fn outgoing_edges(graph: &FlowGraph, footprint: &NodeSet) -> EdgeSet {
    let mut result = EdgeSet::new();
    for &index in footprint {
        let node = &graph.nodes[index];
        for (field_index, field) in node.pointer_fields.iter().enumerate() {
            let modes: &[EMode] = if field.has_update() {
                &EMode::BOTH
            } else {
                &[EMode::Pre]
            };
            for &mode in modes {
                let inside = graph
                    .position(field.value(mode))
                    .is_some_and(|target| footprint.contains(&target));
                if !inside {
                    result.insert(BoundaryEdge {
                        node: index,
                        field: field_index,
                        mode,
                    });
                }
            }
        }
    }
    result
}

/// Nodes whose pre and post field valuations differ.
pub fn changed_nodes(graph: &FlowGraph) -> NodeSet {
    graph
        .nodes
        .iter()
        .enumerate()
        .filter_map(|(index, node)| node.has_updated_fields().then_some(index))
        .collect()
}

/// Outcome of the footprint fixpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixpointOutcome {
    /// Every boundary edge of this footprint is provably
    /// flow-preserving.
    Footprint(NodeSet),
    /// A failing boundary edge targets an address with no corresponding
    /// graph node: the change is unverifiable with the given node set,
    /// and the caller must treat this as a hard error.
    MissingTarget(SymbolId),
}

impl FixpointOutcome {
    pub fn footprint(&self) -> Option<&NodeSet> {
        match self {
            FixpointOutcome::Footprint(nodes) => Some(nodes),
            FixpointOutcome::MissingTarget(_) => None,
        }
    }
}

/// Grow the footprint until every boundary edge is provably
/// flow-preserving under `strategy`.
pub fn compute_fixed_point(
    graph: &FlowGraph,
    strategy: ExtensionStrategy,
    program: &Program,
    config: &dyn SolverConfig,
) -> Result<FixpointOutcome> {
    if graph.nodes.is_empty() {
        return Ok(FixpointOutcome::Footprint(NodeSet::new()));
    }

    let mut encoding = Encoding::new(program, config).map_err(VerificationError::from)?;
    encoding.add_premise_with_knowledge(&graph.pre.now)?;
    let mut factory = SymbolFactory::avoiding(graph.symbols());

    let diff = changed_nodes(graph);
    let mut footprint = if diff.is_empty() {
        NodeSet::from([0])
    } else {
        diff.clone()
    };

    loop {
        let outgoing = outgoing_edges(graph, &footprint);
        let failing = strategy.failing_edges(
            &mut encoding,
            graph,
            &diff,
            &footprint,
            &outgoing,
            &mut factory,
        )?;
        if failing.is_empty() {
            debug!(nodes = footprint.len(), "footprint fixpoint reached");
            return Ok(FixpointOutcome::Footprint(footprint));
        }

        let mut grew = false;
        for edge in failing {
            let field = &graph.nodes[edge.node].pointer_fields[edge.field];
            for mode in EMode::BOTH {
                let target = field.value(mode);
                match graph.position(target) {
                    Some(index) => grew |= footprint.insert(index),
                    None => return Ok(FixpointOutcome::MissingTarget(target)),
                }
            }
        }
        if !grew {
            return Err(VerificationError::internal(
                "footprint extension made no progress",
            ));
        }
    }
}
