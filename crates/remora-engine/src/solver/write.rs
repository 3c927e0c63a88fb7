//! Post image of an atomic heap write.
//!
//! The pipeline: build the bounded flow graph, run the footprint
//! fixpoint, queue every safety and specification check into one batch,
//! dispatch the verdicts, minimize the footprint, then re-derive the
//! post-state memory and extract the externally visible effects.

use std::collections::BTreeMap;

use remora_ir::flowgraph::{EMode, FlowGraph};
use remora_ir::logic::{
    Annotation, Axiom, Formula, HeapEffect, MemoryAxiom, PostImage, Specification, SymbolicExpr,
};
use remora_ir::program::MemoryWrite;
use remora_ir::symbols::{Order, Sort, SymbolId};
use remora_smt::encoding::{CheckId, Encoding};
use tracing::debug;

use crate::error::{Result, VerificationError};
use crate::footprint::{compute_fixed_point, make_flow_footprint, FixpointOutcome};
use crate::strategy::Reachability;

use super::fulfillment::{queue_impure_spec_checks, queue_pure_spec_checks, SpecCheck};
use super::Solver;

/// What to do with the verdict of one queued check.
enum Action {
    /// The outflow along a boundary field changed; the named target must
    /// be part of the footprint.
    EnsureCovered { target: SymbolId },
    /// The named address must be null, otherwise acyclicity cannot be
    /// guaranteed.
    NullOrFail { address: SymbolId },
    /// Keyset disjointness after the update.
    KeysetDisjoint,
    /// Inflow uniqueness after the update.
    InflowUnique,
    /// Node invariant after the update.
    Invariant { address: SymbolId },
    /// The update is pure.
    Purity,
    /// A pure step decides an obligation.
    PureSpec(SpecCheck),
    /// The update itself realizes an obligation.
    ImpureSpec(SpecCheck),
    /// An outside cell is an alias of an inside cell.
    OutsideAlias { outside: SymbolId, inside: SymbolId },
    /// An outside cell is distinct from an inside cell.
    OutsideDistinct { outside: SymbolId, inside: SymbolId },
    /// A context fact holds for a symbol of the footprint.
    EffectContext { symbol: SymbolId, fact: Axiom },
}

impl<'a> Solver<'a> {
    pub(super) fn post_memory_write(
        &mut self,
        mut annotation: Annotation,
        write: &MemoryWrite,
        use_future: bool,
    ) -> Result<PostImage> {
        let deref_vars: Vec<_> = write.lhs.iter().map(|deref| deref.variable).collect();
        self.prepare_access(&mut annotation, &deref_vars)?;

        let mut graph = make_flow_footprint(
            annotation,
            write,
            self.program,
            self.config,
            &mut self.factory,
        )?;

        // the fixpoint decides how much of the heap the proof inspects
        let footprint = match compute_fixed_point(
            &graph,
            self.setup.footprint_strategy,
            self.program,
            self.config,
        )? {
            FixpointOutcome::Footprint(nodes) => nodes,
            FixpointOutcome::MissingTarget(address) => {
                return Err(VerificationError::FootprintUnverifiable {
                    address: address.to_string(),
                })
            }
        };
        for &index in &footprint {
            graph.nodes[index].needed = true;
        }
        if self.setup.dump_footprints {
            debug!(
                "\n{}",
                crate::dump::render_flow_graph(&graph, self.program)
            );
        }

        let obligations: Vec<(Specification, SymbolId)> =
            graph.pre.now.obligations().collect();

        let mut encoding = Encoding::new(self.program, self.config)?;
        encoding.add_premise_graph(&graph)?;

        self.check_publishing(&mut graph)?;
        let mut actions: Vec<(CheckId, Action)> = Vec::new();
        self.check_reachability(&graph, &mut encoding, &mut actions)?;
        queue_flow_coverage(&graph, &mut encoding, &mut actions);
        queue_flow_uniqueness(&graph, &mut encoding, &mut actions);
        queue_spec_checks(&graph, &obligations, &mut encoding, &mut actions);
        queue_invariant_checks(&graph, &mut encoding, &mut actions);
        queue_outside_checks(&graph, &mut encoding, &mut actions);
        queue_effect_context(&graph, &mut encoding, &mut actions);

        let verdicts = encoding.run_checks()?;
        let outcome = self.dispatch_actions(&mut graph, &obligations, actions, &verdicts)?;

        let effects = extract_effects(&graph, &outcome);
        let mut post = extract_post(graph, &outcome)?;
        if use_future {
            fold_future(&mut post, write);
        }

        debug!(effects = effects.len(), "memory write post image");
        Ok(PostImage {
            annotations: vec![post],
            effects,
        })
    }

    /// Publishing a local node makes it and its post-successors shared.
    fn check_publishing(&self, graph: &mut FlowGraph) -> Result<()> {
        let published: Vec<usize> = graph
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| (node.pre_local != node.post_local).then_some(index))
            .collect();
        for index in published {
            graph.nodes[index].needed = true;
            let targets: Vec<SymbolId> = graph.nodes[index]
                .pointer_fields
                .iter()
                .map(|field| field.value(EMode::Post))
                .collect();
            for target in targets {
                match graph.node_at_mut(target) {
                    Some(node) => node.needed = true,
                    None => {
                        return Err(VerificationError::unsafe_update(
                            "footprint too small to capture publishing",
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// Syntactic acyclicity of the updated region; addresses that might
    /// break it must be provably null.
    fn check_reachability(
        &self,
        graph: &FlowGraph,
        encoding: &mut Encoding,
        actions: &mut Vec<(CheckId, Action)>,
    ) -> Result<()> {
        let pre_reach = Reachability::of(graph, EMode::Pre);
        let post_reach = Reachability::of(graph, EMode::Post);

        for node in &graph.nodes {
            if post_reach.is_reachable(node.address, node.address) {
                return Err(VerificationError::AcyclicityViolated {
                    address: node.address.to_string(),
                });
            }
        }

        for node in &graph.nodes {
            if !node.has_updated_pointers() {
                continue;
            }
            for reached in post_reach.reachable(node.address) {
                if pre_reach.is_reachable(node.address, reached) {
                    continue;
                }
                if graph.contains(reached) {
                    continue;
                }
                let check = encoding.add_check(encoding.encode_is_null(reached));
                actions.push((check, Action::NullOrFail { address: reached }));
            }
        }
        Ok(())
    }

    fn dispatch_actions(
        &self,
        graph: &mut FlowGraph,
        obligations: &[(Specification, SymbolId)],
        actions: Vec<(CheckId, Action)>,
        verdicts: &[bool],
    ) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let mut is_pure = false;

        for (check, action) in &actions {
            let holds = verdicts[check.0];
            match action {
                Action::EnsureCovered { target } => {
                    if holds {
                        continue;
                    }
                    match graph.node_at_mut(*target) {
                        Some(node) => node.needed = true,
                        None => {
                            return Err(VerificationError::unsafe_update(format!(
                                "footprint does not cover address {target} whose inflow changed"
                            )))
                        }
                    }
                }
                Action::NullOrFail { address } => {
                    if !holds {
                        return Err(VerificationError::AcyclicityViolated {
                            address: address.to_string(),
                        });
                    }
                }
                Action::KeysetDisjoint => {
                    if !holds {
                        return Err(VerificationError::unsafe_update(
                            "keyset disjointness not guaranteed",
                        ));
                    }
                }
                Action::InflowUnique => {
                    if !holds {
                        return Err(VerificationError::unsafe_update(
                            "inflow uniqueness not guaranteed",
                        ));
                    }
                }
                Action::Invariant { address } => {
                    if !holds {
                        return Err(VerificationError::unsafe_update(format!(
                            "invariant of {address} is not maintained"
                        )));
                    }
                }
                Action::Purity => {
                    is_pure = holds;
                    debug!(pure = holds, "purity of heap update");
                }
                Action::PureSpec(spec) => {
                    if holds {
                        outcome.fulfillments.push(spec.return_value);
                    }
                }
                Action::ImpureSpec(spec) => {
                    if holds {
                        outcome.fulfillments.push(spec.return_value);
                    }
                }
                Action::OutsideAlias { outside, inside } => {
                    if holds {
                        outcome.aliases.insert(*outside, *inside);
                    }
                }
                Action::OutsideDistinct { outside, inside } => {
                    if holds {
                        outcome.distinct.entry(*outside).or_default().push(*inside);
                    }
                }
                Action::EffectContext { symbol, fact } => {
                    if holds {
                        outcome
                            .effect_context
                            .entry(*symbol)
                            .or_default()
                            .push(fact.clone());
                    }
                }
            }
        }

        // an impure update needs an obligation to justify it, and the
        // obligation must actually be discharged
        if is_pure {
            for &(spec, key) in obligations {
                outcome.obligations.push((spec, key));
            }
        } else {
            if obligations.is_empty() {
                return Err(VerificationError::unsafe_update(
                    "impure update without obligation",
                ));
            }
            if outcome.fulfillments.is_empty() {
                return Err(VerificationError::unsafe_update(
                    "impure update that does not satisfy the specification",
                ));
            }
        }
        Ok(outcome)
    }
}

#[derive(Default)]
struct WriteOutcome {
    /// Obligations carried into the post state.
    obligations: Vec<(Specification, SymbolId)>,
    /// Fulfillments earned by this step.
    fulfillments: Vec<bool>,
    /// Outside address -> proven alias inside the footprint.
    aliases: BTreeMap<SymbolId, SymbolId>,
    /// Outside address -> inside addresses proven distinct.
    distinct: BTreeMap<SymbolId, Vec<SymbolId>>,
    /// Facts that survive as effect context, per symbol.
    effect_context: BTreeMap<SymbolId, Vec<Axiom>>,
}

fn queue_flow_coverage(
    graph: &FlowGraph,
    encoding: &mut Encoding,
    actions: &mut Vec<(CheckId, Action)>,
) {
    for node in &graph.nodes {
        for field in &node.pointer_fields {
            let same_flow = encoding.flow_equal(
                field.all_outflow(EMode::Pre),
                field.all_outflow(EMode::Post),
            );
            for mode in EMode::BOTH {
                let target = field.value(mode);
                let unchanged_or_null = remora_smt::terms::Term::or(vec![
                    same_flow.clone(),
                    encoding.encode_is_null(target),
                ]);
                let check = encoding.add_check(unchanged_or_null);
                actions.push((check, Action::EnsureCovered { target }));
            }
        }
    }
}

fn queue_flow_uniqueness(
    graph: &FlowGraph,
    encoding: &mut Encoding,
    actions: &mut Vec<(CheckId, Action)>,
) {
    let disjoint = encoding.encode_keyset_disjointness(graph, EMode::Post);
    let check = encoding.add_check(disjoint);
    actions.push((check, Action::KeysetDisjoint));

    let unique = encoding.encode_inflow_uniqueness(graph, EMode::Post);
    let check = encoding.add_check(unique);
    actions.push((check, Action::InflowUnique));
}

fn queue_spec_checks(
    graph: &FlowGraph,
    obligations: &[(Specification, SymbolId)],
    encoding: &mut Encoding,
    actions: &mut Vec<(CheckId, Action)>,
) {
    let purity = encoding.encode_is_pure(graph);
    let check = encoding.add_check(purity);
    actions.push((check, Action::Purity));

    for &(spec, key) in obligations {
        for queued in queue_pure_spec_checks(encoding, graph, spec, key) {
            actions.push((queued.check, Action::PureSpec(queued)));
        }
        if let Some(queued) = queue_impure_spec_checks(encoding, graph, spec, key) {
            actions.push((queued.check, Action::ImpureSpec(queued)));
        }
    }
}

fn queue_invariant_checks(
    graph: &FlowGraph,
    encoding: &mut Encoding,
    actions: &mut Vec<(CheckId, Action)>,
) {
    for node in &graph.nodes {
        let invariant = encoding.encode_node_invariant(node, EMode::Post);
        let check = encoding.add_check(invariant);
        actions.push((
            check,
            Action::Invariant {
                address: node.address,
            },
        ));
    }
}

fn queue_outside_checks(
    graph: &FlowGraph,
    encoding: &mut Encoding,
    actions: &mut Vec<(CheckId, Action)>,
) {
    let outside: Vec<SymbolId> = graph
        .pre
        .now
        .shared_memory()
        .map(|memory| memory.node)
        .filter(|address| !graph.contains(*address))
        .collect();
    for node in &graph.nodes {
        let inside = node.address;
        for &out in &outside {
            let inside_term = encoding.encode_symbol(inside).term();
            let outside_term = encoding.encode_symbol(out).term();
            let alias = inside_term.clone().eq(outside_term.clone());
            let check = encoding.add_check(alias);
            actions.push((
                check,
                Action::OutsideAlias {
                    outside: out,
                    inside,
                },
            ));
            let distinct = inside_term.neq(outside_term);
            let check = encoding.add_check(distinct);
            actions.push((
                check,
                Action::OutsideDistinct {
                    outside: out,
                    inside,
                },
            ));
        }
    }
}

/// Sort-shaped candidate facts that can justify an effect's context.
fn context_generators(symbol: SymbolId) -> Vec<Axiom> {
    let this = SymbolicExpr::Symbol(symbol);
    match symbol.order {
        Order::Second => vec![
            Axiom::InflowEmptiness {
                flow: symbol,
                is_empty: true,
            },
            Axiom::InflowEmptiness {
                flow: symbol,
                is_empty: false,
            },
        ],
        Order::First => match symbol.sort {
            Sort::Bool => vec![
                Axiom::eq(this, SymbolicExpr::Bool(true)),
                Axiom::eq(this, SymbolicExpr::Bool(false)),
            ],
            Sort::Data => vec![
                Axiom::eq(this, SymbolicExpr::Min),
                Axiom::stack(remora_ir::program::BinaryOperator::Gt, this, SymbolicExpr::Min),
                Axiom::eq(this, SymbolicExpr::Max),
                Axiom::stack(remora_ir::program::BinaryOperator::Lt, this, SymbolicExpr::Max),
            ],
            Sort::Ptr => vec![
                Axiom::eq(this, SymbolicExpr::Null),
                Axiom::neq(this, SymbolicExpr::Null),
            ],
            _ => Vec::new(),
        },
    }
}

fn queue_effect_context(
    graph: &FlowGraph,
    encoding: &mut Encoding,
    actions: &mut Vec<(CheckId, Action)>,
) {
    let mut symbols: Vec<SymbolId> = Vec::new();
    for node in &graph.nodes {
        let memory = node.to_memory(EMode::Pre);
        for symbol in memory.symbols() {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
    }
    for symbol in symbols {
        for fact in context_generators(symbol) {
            let term = encoding.encode_axiom(&fact, &Default::default());
            let check = encoding.add_check(term);
            actions.push((check, Action::EffectContext { symbol, fact }));
        }
    }
}

/// One effect per needed shared node with a visible update.
fn extract_effects(graph: &FlowGraph, outcome: &WriteOutcome) -> Vec<HeapEffect> {
    let mut result = Vec::new();
    for node in &graph.nodes {
        if !node.needed || node.pre_local {
            continue;
        }
        if !node.has_updated_fields() {
            continue;
        }
        let pre = node.to_memory(EMode::Pre);
        let post = node.to_memory(EMode::Post);
        let mut context = Formula::new();
        for symbol in pre.symbols() {
            if let Some(facts) = outcome.effect_context.get(&symbol) {
                context.conjoin_all(facts.iter().cloned());
            }
        }
        context.dedup();
        result.push(HeapEffect { pre, post, context });
    }
    result
}

/// Re-derive the post-state annotation: needed nodes contribute their
/// post memory, untouched graph nodes keep their pre state, and outside
/// shared cells are havocked where an ambiguous inside update could have
/// hit them.
fn extract_post(mut graph: FlowGraph, outcome: &WriteOutcome) -> Result<Annotation> {
    let mut new_memory: Vec<Axiom> = Vec::new();
    let mut factory = remora_ir::symbols::SymbolFactory::avoiding(graph.symbols());

    // updated fields of needed inside nodes, for outside havoc
    let mut updated_inside: Vec<(SymbolId, Vec<String>, bool)> = Vec::new();
    for node in &graph.nodes {
        if !node.needed {
            continue;
        }
        let fields: Vec<String> = node
            .data_fields
            .iter()
            .filter(|field| field.has_update())
            .map(|field| field.name.clone())
            .chain(
                node.pointer_fields
                    .iter()
                    .filter(|field| field.has_update())
                    .map(|field| field.name().to_string()),
            )
            .collect();
        updated_inside.push((node.address, fields, node.has_updated_flow()));
    }

    for node in &graph.nodes {
        if node.needed {
            new_memory.push(node.to_axiom(EMode::Post));
        } else {
            // untouched by the update, keep the pre state
            new_memory.push(node.to_axiom(EMode::Pre));
        }
    }

    // local cells outside the graph survive untouched
    for memory in graph.pre.now.local_memory() {
        if !graph.contains(memory.node) {
            new_memory.push(Axiom::LocalMemory(memory.clone()));
        }
    }

    // outside shared cells
    let outside: Vec<MemoryAxiom> = graph
        .pre
        .now
        .shared_memory()
        .filter(|memory| !graph.contains(memory.node))
        .cloned()
        .collect();
    let mut equalities: Vec<Axiom> = Vec::new();
    for memory in outside {
        if let Some(inside) = outcome.aliases.get(&memory.node) {
            // covered by the inside node's post memory
            equalities.push(Axiom::eq(
                SymbolicExpr::Symbol(memory.node),
                SymbolicExpr::Symbol(*inside),
            ));
            continue;
        }
        let mut havocked = memory.clone();
        let distinct = outcome.distinct.get(&memory.node);
        for (inside, fields, flow_updated) in &updated_inside {
            let proven_distinct = distinct
                .map(|list| list.contains(inside))
                .unwrap_or(false);
            if proven_distinct {
                equalities.push(Axiom::neq(
                    SymbolicExpr::Symbol(memory.node),
                    SymbolicExpr::Symbol(*inside),
                ));
                continue;
            }
            // the update may have hit this cell: havoc the touched parts
            if *flow_updated {
                havocked.flow = factory.fresh(havocked.flow.sort, Order::Second);
            }
            for field in fields {
                if let Some(value) = havocked.fields.get_mut(field) {
                    *value = factory.fresh(value.sort, value.order);
                }
            }
        }
        new_memory.push(Axiom::SharedMemory(havocked));
    }

    // rebuild the state: resources are replaced wholesale
    let mut annotation = std::mem::take(&mut graph.pre);
    annotation.now.remove_conjuncts_if(|axiom| {
        matches!(
            axiom,
            Axiom::LocalMemory(_)
                | Axiom::SharedMemory(_)
                | Axiom::Obligation { .. }
                | Axiom::Fulfillment { .. }
        )
    });
    annotation.now.conjuncts.extend(new_memory);
    annotation.now.conjuncts.extend(equalities);
    for (spec, key) in &outcome.obligations {
        annotation.conjoin(Axiom::Obligation {
            spec: *spec,
            key: *key,
        });
    }
    for &return_value in &outcome.fulfillments {
        annotation.conjoin(Axiom::Fulfillment { return_value });
    }
    annotation.now.dedup();
    Ok(annotation)
}

/// Anticipated updates that just happened are folded in: their promised
/// post knowledge holds now and the pending marker is dropped.
fn fold_future(annotation: &mut Annotation, write: &MemoryWrite) {
    let mut folded = Vec::new();
    annotation.future.retain(|future| {
        if future.command == *write {
            folded.push(future.post.clone());
            false
        } else {
            true
        }
    });
    for post in folded {
        annotation.now.conjuncts.extend(post.conjuncts);
    }
    annotation.now.dedup();
}
