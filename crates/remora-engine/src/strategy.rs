//! Footprint extension strategies and the acyclicity side-condition.
//!
//! All strategies share one contract: given the current footprint and
//! its boundary edges, report the edges whose flow preservation cannot
//! (yet) be proven. They differ in cost and precision; none is assumed
//! equivalent to another, so each is independently selectable.

use std::collections::{BTreeMap, BTreeSet};

use remora_ir::flowgraph::{EMode, FlowGraph};
use remora_ir::symbols::{SymbolFactory, SymbolId};
use remora_smt::encoding::Encoding;
use remora_smt::solver::SmtError;
use remora_smt::terms::Term;

use crate::error::Result;

/// Footprint as a set of node indices into [`FlowGraph::nodes`].
pub type NodeSet = BTreeSet<usize>;

/// One boundary edge of the footprint, per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BoundaryEdge {
    pub node: usize,
    pub field: usize,
    pub mode: EMode,
}

pub type EdgeSet = BTreeSet<BoundaryEdge>;

/// Selectable footprint extension strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionStrategy {
    /// Per-footprint-node flow rules, boundary outflow compared
    /// extensionally.
    General,
    /// [`ExtensionStrategy::General`] plus the acyclicity
    /// side-condition; an acyclicity-unsafe footprint is forced to grow
    /// even if flow preservation alone would accept it.
    GeneralWithCycleCheck,
    /// Enumerate all simple paths from every footprint node to each
    /// boundary edge and compare a dummy value's membership.
    AllPathsFullSum,
    /// Paths starting at the changed nodes only.
    DiffPathsFullSum,
    /// Like [`ExtensionStrategy::DiffPathsFullSum`] but each path is
    /// matched against the other mode's paths individually instead of
    /// summing per edge.
    DiffPathsSingleSum,
}

impl ExtensionStrategy {
    pub const ALL: [ExtensionStrategy; 5] = [
        ExtensionStrategy::General,
        ExtensionStrategy::GeneralWithCycleCheck,
        ExtensionStrategy::AllPathsFullSum,
        ExtensionStrategy::DiffPathsFullSum,
        ExtensionStrategy::DiffPathsSingleSum,
    ];

    /// The edges of `outgoing` that currently fail the flow-preservation
    /// check for `footprint`.
    pub fn failing_edges(
        self,
        encoding: &mut Encoding,
        graph: &FlowGraph,
        diff: &NodeSet,
        footprint: &NodeSet,
        outgoing: &EdgeSet,
        factory: &mut SymbolFactory,
    ) -> Result<EdgeSet> {
        match self {
            ExtensionStrategy::General => general_method(encoding, graph, footprint, outgoing),
            ExtensionStrategy::GeneralWithCycleCheck => {
                let failing = general_method(encoding, graph, footprint, outgoing)?;
                if !failing.is_empty() {
                    return Ok(failing);
                }
                if maintains_acyclicity(encoding, graph, footprint)? {
                    Ok(failing)
                } else {
                    // force further extension
                    Ok(outgoing.clone())
                }
            }
            ExtensionStrategy::AllPathsFullSum => {
                path_method_full_sum(encoding, graph, footprint, footprint, outgoing, factory)
            }
            ExtensionStrategy::DiffPathsFullSum => {
                path_method_full_sum(encoding, graph, diff, footprint, outgoing, factory)
            }
            ExtensionStrategy::DiffPathsSingleSum => {
                path_method_single_sum(encoding, graph, diff, footprint, outgoing, factory)
            }
        }
    }
}

//
// General method
//

fn boundary_check(encoding: &Encoding, graph: &FlowGraph, edge: &BoundaryEdge) -> Term {
    let field = &graph.nodes[edge.node].pointer_fields[edge.field];
    if field.has_update() {
        encoding.flow_empty(field.all_outflow(edge.mode))
    } else {
        encoding.flow_equal(field.all_outflow(EMode::Pre), field.all_outflow(EMode::Post))
    }
}

fn general_method(
    encoding: &mut Encoding,
    graph: &FlowGraph,
    footprint: &NodeSet,
    outgoing: &EdgeSet,
) -> Result<EdgeSet> {
    encoding.push();
    let result = (|| -> std::result::Result<EdgeSet, SmtError> {
        // transfer function over the footprint
        for &index in footprint {
            let node = &graph.nodes[index];
            if node.pre_local {
                encoding.add_premise(encoding.flow_empty(node.frame_inflow))?;
            }
            encoding.add_premise(encoding.encode_flow_rules(graph, node))?;
            for field in &node.pointer_fields {
                for mode in EMode::BOTH {
                    encoding.add_premise(encoding.encode_outflow(graph, node, field, mode))?;
                }
            }
        }

        let edges: Vec<BoundaryEdge> = outgoing.iter().copied().collect();
        for edge in &edges {
            let check = boundary_check(encoding, graph, edge);
            encoding.add_check(check);
        }
        let verdicts = encoding.run_checks()?;
        Ok(edges
            .into_iter()
            .zip(verdicts)
            .filter_map(|(edge, preserved)| (!preserved).then_some(edge))
            .collect())
    })();
    encoding.pop();
    Ok(result?)
}

//
// Path enumeration methods
//

/// A simple path as a list of `(node index, pointer field index)` hops.
type Path = Vec<(usize, usize)>;

fn all_simple_paths(
    graph: &FlowGraph,
    footprint: &NodeSet,
    initial: &NodeSet,
    mode: EMode,
) -> Vec<Path> {
    let mut worklist: Vec<(Path, BTreeSet<usize>)> = Vec::new();
    for &index in initial {
        for field in 0..graph.nodes[index].pointer_fields.len() {
            worklist.push((vec![(index, field)], BTreeSet::new()));
        }
    }

    let mut result = Vec::new();
    while let Some((path, visited)) = worklist.pop() {
        let &(last_node, last_field) = path.last().expect("paths are non-empty");
        let target = graph.nodes[last_node].pointer_fields[last_field].value(mode);
        let successor = graph
            .nodes
            .iter()
            .position(|node| node.address == target);
        match successor {
            Some(next) if visited.contains(&next) => continue, // not simple
            Some(next) if footprint.contains(&next) => {
                for field in 0..graph.nodes[next].pointer_fields.len() {
                    let mut extended = path.clone();
                    extended.push((next, field));
                    let mut seen = visited.clone();
                    seen.insert(next);
                    worklist.push((extended, seen));
                }
            }
            _ => result.push(path), // leaves the footprint
        }
    }
    result
}

/// External inflow a path is fed from: the graph's root routes its whole
/// inflow, every other node contributes only its frame.
fn head_inflow(graph: &FlowGraph, index: usize) -> SymbolId {
    let node = &graph.nodes[index];
    if node.all_inflow(EMode::Pre) == node.graph_inflow(EMode::Pre) {
        node.all_inflow(EMode::Pre)
    } else {
        node.frame_inflow
    }
}

fn encode_path_sends(
    encoding: &Encoding,
    graph: &FlowGraph,
    path: &Path,
    symbol: SymbolId,
    mode: EMode,
) -> Term {
    let &(head, _) = match path.first() {
        Some(first) => first,
        None => return Term::bool(false),
    };
    if graph.nodes[head].pre_local {
        // footprint-private nodes receive nothing from outside
        return Term::bool(false);
    }
    let symbol_term = encoding.encode_symbol(symbol).term();
    let mut conjuncts = vec![encoding.flow_contains(head_inflow(graph, head), symbol_term.clone())];
    for &(node, field) in path {
        let node = &graph.nodes[node];
        conjuncts.push(encoding.encode_outflow_contains(
            node,
            node.pointer_fields[field].name(),
            symbol_term.clone(),
            mode,
        ));
    }
    Term::and(conjuncts)
}

fn dummy_symbol(encoding: &Encoding, factory: &mut SymbolFactory) -> SymbolId {
    factory.fresh_fo(encoding.config().flow_sort())
}

/// Paths whose final hop is the boundary edge *and* sends to the same
/// target in the path's own mode. An updated edge has no matching
/// counterpart in the other mode, which is what forces its targets into
/// the footprint.
fn paths_ending_at<'p>(
    graph: &'p FlowGraph,
    paths: &'p [Path],
    path_mode: EMode,
    edge: &BoundaryEdge,
    target: SymbolId,
) -> impl Iterator<Item = &'p Path> + 'p {
    let (node, field) = (edge.node, edge.field);
    paths.iter().filter(move |path| {
        *path.last().expect("paths are non-empty") == (node, field)
            && graph.nodes[node].pointer_fields[field].value(path_mode) == target
    })
}

fn path_method_full_sum(
    encoding: &mut Encoding,
    graph: &FlowGraph,
    initial: &NodeSet,
    footprint: &NodeSet,
    outgoing: &EdgeSet,
    factory: &mut SymbolFactory,
) -> Result<EdgeSet> {
    if footprint.is_empty() || outgoing.is_empty() {
        return Ok(EdgeSet::new());
    }
    let symbol = dummy_symbol(encoding, factory);
    let pre_paths = all_simple_paths(graph, footprint, initial, EMode::Pre);
    let post_paths = all_simple_paths(graph, footprint, initial, EMode::Post);

    let edges: Vec<BoundaryEdge> = outgoing.iter().copied().collect();
    for edge in &edges {
        let target = graph.nodes[edge.node].pointer_fields[edge.field].value(edge.mode);
        let sent_pre = Term::or(
            paths_ending_at(graph, &pre_paths, EMode::Pre, edge, target)
                .map(|path| encode_path_sends(encoding, graph, path, symbol, EMode::Pre))
                .collect(),
        );
        let sent_post = Term::or(
            paths_ending_at(graph, &post_paths, EMode::Post, edge, target)
                .map(|path| encode_path_sends(encoding, graph, path, symbol, EMode::Post))
                .collect(),
        );
        encoding.add_check(sent_pre.eq(sent_post));
    }
    let verdicts = encoding.run_checks()?;
    Ok(edges
        .into_iter()
        .zip(verdicts)
        .filter_map(|(edge, preserved)| (!preserved).then_some(edge))
        .collect())
}

fn path_method_single_sum(
    encoding: &mut Encoding,
    graph: &FlowGraph,
    initial: &NodeSet,
    footprint: &NodeSet,
    outgoing: &EdgeSet,
    factory: &mut SymbolFactory,
) -> Result<EdgeSet> {
    if footprint.is_empty() || outgoing.is_empty() {
        return Ok(EdgeSet::new());
    }
    let symbol = dummy_symbol(encoding, factory);
    let pre_paths = all_simple_paths(graph, footprint, initial, EMode::Pre);
    let post_paths = all_simple_paths(graph, footprint, initial, EMode::Post);
    let paths_of = |mode: EMode| match mode {
        EMode::Pre => &pre_paths,
        EMode::Post => &post_paths,
    };

    let edges: Vec<BoundaryEdge> = outgoing.iter().copied().collect();
    for edge in &edges {
        let mut checks = Vec::new();
        let other_mode = edge.mode.other();
        let target = graph.nodes[edge.node].pointer_fields[edge.field].value(edge.mode);
        for path in paths_ending_at(graph, paths_of(edge.mode), edge.mode, edge, target) {
            let sent = encode_path_sends(encoding, graph, path, symbol, edge.mode);
            let head = path.first().expect("paths are non-empty").0;
            let replacement = Term::or(
                paths_ending_at(graph, paths_of(other_mode), other_mode, edge, target)
                    .filter(|other| other.first().expect("paths are non-empty").0 == head)
                    .map(|other| encode_path_sends(encoding, graph, other, symbol, other_mode))
                    .collect(),
            );
            checks.push(sent.implies(replacement));
        }
        encoding.add_check(Term::and(checks));
    }
    let verdicts = encoding.run_checks()?;
    Ok(edges
        .into_iter()
        .zip(verdicts)
        .filter_map(|(edge, preserved)| (!preserved).then_some(edge))
        .collect())
}

//
// Acyclicity
//

/// Syntactic pointer reachability of the graph in one mode.
pub struct Reachability {
    reach: BTreeMap<SymbolId, BTreeSet<SymbolId>>,
}

impl Reachability {
    pub fn of(graph: &FlowGraph, mode: EMode) -> Reachability {
        let mut reach: BTreeMap<SymbolId, BTreeSet<SymbolId>> = BTreeMap::new();
        for node in &graph.nodes {
            let entry = reach.entry(node.address).or_default();
            for field in &node.pointer_fields {
                entry.insert(field.value(mode));
            }
        }
        loop {
            let mut changed = false;
            let addresses: Vec<SymbolId> = reach.keys().copied().collect();
            for address in addresses {
                let reached: Vec<SymbolId> = reach[&address].iter().copied().collect();
                for target in reached {
                    let transitive: Vec<SymbolId> = reach
                        .get(&target)
                        .map(|set| set.iter().copied().collect())
                        .unwrap_or_default();
                    let entry = reach.get_mut(&address).expect("present");
                    for next in transitive {
                        changed |= entry.insert(next);
                    }
                }
            }
            if !changed {
                return Reachability { reach };
            }
        }
    }

    pub fn is_reachable(&self, from: SymbolId, to: SymbolId) -> bool {
        self.reach
            .get(&from)
            .map(|set| set.contains(&to))
            .unwrap_or(false)
    }

    pub fn reachable(&self, from: SymbolId) -> impl Iterator<Item = SymbolId> + '_ {
        self.reach.get(&from).into_iter().flatten().copied()
    }
}

/// Whether accepting `footprint` cannot silently introduce sharing or a
/// cycle invisible to the local check: no footprint node reaches itself
/// after the update, every newly reached outside address was already
/// reachable (or stays unreachable, or is provably null), and a newly
/// reached footprint node must have been unreachable before.
pub fn maintains_acyclicity(
    encoding: &mut Encoding,
    graph: &FlowGraph,
    footprint: &NodeSet,
) -> Result<bool> {
    let pre_reach = Reachability::of(graph, EMode::Pre);
    let post_reach = Reachability::of(graph, EMode::Post);

    let node_index = |address: SymbolId| graph.nodes.iter().position(|n| n.address == address);
    let in_footprint =
        |address: SymbolId| node_index(address).is_some_and(|index| footprint.contains(&index));
    let unreachable_pre =
        |address: SymbolId| node_index(address).is_some_and(|index| graph.nodes[index].pre_local);

    let unreachability_maintained = |address: SymbolId| {
        if !unreachable_pre(address) {
            return false;
        }
        footprint.iter().all(|&index| {
            let node = &graph.nodes[index];
            node.address == address
                || node.pre_local
                || !post_reach.is_reachable(node.address, address)
        })
    };

    // no cycle inside the footprint
    for &index in footprint {
        let address = graph.nodes[index].address;
        if post_reach.is_reachable(address, address) {
            return Ok(false);
        }
    }

    // the footprint reaches no new non-footprint addresses
    for &index in footprint {
        let address = graph.nodes[index].address;
        for reached in post_reach.reachable(address) {
            if in_footprint(reached) {
                continue;
            }
            if pre_reach.is_reachable(address, reached) {
                continue;
            }
            if unreachability_maintained(address) {
                continue;
            }
            let is_null = encoding
                .implies(&encoding.encode_is_null(reached))
                ?;
            if !is_null {
                return Ok(false);
            }
        }
    }

    // newly reached footprint nodes must have been unreachable before
    for &index in footprint {
        let address = graph.nodes[index].address;
        for reached in post_reach.reachable(address) {
            if !in_footprint(reached) {
                continue;
            }
            if unreachable_pre(reached) {
                continue;
            }
            if pre_reach.is_reachable(address, reached) {
                continue;
            }
            return Ok(false);
        }
    }

    Ok(true)
}
