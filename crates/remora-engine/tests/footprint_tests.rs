//! Footprint construction and fixpoint behavior on list fragments.

mod common;

use common::{harness, unlink_state, unlink_write, ListConfig};
use proptest::prelude::*;
use remora_engine::footprint::{compute_fixed_point, make_flow_footprint, FixpointOutcome};
use remora_engine::strategy::{maintains_acyclicity, ExtensionStrategy, NodeSet};
use remora_ir::flowgraph::{FlowGraph, FlowGraphNode};
use remora_ir::logic::{Annotation, Axiom, Formula, MemoryAxiom, SymbolicExpr};
use remora_ir::program::BinaryOperator;
use remora_ir::symbols::{Sort, SymbolFactory};
use remora_smt::encoding::Encoding;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn unlink_graph(no_op: bool) -> Result<FlowGraph, Box<dyn std::error::Error>> {
    let (program, vars) = harness();
    let config = ListConfig;
    let mut factory = SymbolFactory::new();
    let (mut annotation, fragment) = unlink_state(&vars, &mut factory);
    if no_op {
        // y := mid turns `x.next := y` into `x.next := x.next`
        *annotation
            .now
            .value_of_mut(vars.y)
            .expect("y is bound") = fragment.mid;
    }
    let write = unlink_write(&vars);
    Ok(make_flow_footprint(
        annotation,
        &write,
        &program,
        &config,
        &mut factory,
    )?)
}

fn run_fixpoint(
    graph: &FlowGraph,
    strategy: ExtensionStrategy,
) -> Result<FixpointOutcome, Box<dyn std::error::Error>> {
    let (program, _) = harness();
    let config = ListConfig;
    Ok(compute_fixed_point(graph, strategy, &program, &config)?)
}

#[test]
fn no_op_write_needs_a_singleton_footprint() -> TestResult {
    let graph = unlink_graph(true)?;
    let outcome = run_fixpoint(&graph, ExtensionStrategy::General)?;
    let footprint = outcome.footprint().expect("fixpoint must succeed");
    assert_eq!(footprint.len(), 1, "no expansion needed for a no-op write");
    assert!(footprint.contains(&0), "the written node is the footprint");
    Ok(())
}

#[test]
fn unlink_footprint_covers_predecessor_and_successor() -> TestResult {
    let graph = unlink_graph(false)?;
    let outcome = run_fixpoint(&graph, ExtensionStrategy::GeneralWithCycleCheck)?;
    let footprint = outcome.footprint().expect("fixpoint must succeed");
    assert_eq!(footprint.len(), 3);
    Ok(())
}

#[test]
fn fixpoint_is_idempotent() -> TestResult {
    let graph = unlink_graph(false)?;
    let first = run_fixpoint(&graph, ExtensionStrategy::General)?;
    let second = run_fixpoint(&graph, ExtensionStrategy::General)?;
    let first = first.footprint().expect("fixpoint must succeed");
    let second = second.footprint().expect("fixpoint must succeed");
    assert_eq!(first.len(), second.len());
    Ok(())
}

#[test]
fn unordered_fragment_is_unverifiable() -> TestResult {
    let (program, vars) = harness();
    let config = ListConfig;
    let mut factory = SymbolFactory::new();
    let (mut annotation, fragment) = unlink_state(&vars, &mut factory);
    // drop the value ordering; the boundary edge can no longer be
    // proven flow-preserving and its target is outside the graph
    annotation.now.remove_conjuncts_if(|axiom| {
        matches!(
            axiom,
            Axiom::Stack {
                op: BinaryOperator::Lt,
                lhs: SymbolicExpr::Symbol(lhs),
                ..
            } if *lhs == fragment.mid_val || *lhs == fragment.root_val
        )
    });
    let write = unlink_write(&vars);
    let graph = make_flow_footprint(annotation, &write, &program, &config, &mut factory)?;
    let outcome = compute_fixed_point(&graph, ExtensionStrategy::General, &program, &config)?;
    assert!(
        matches!(outcome, FixpointOutcome::MissingTarget(_)),
        "expected an unverifiable footprint, got {outcome:?}"
    );
    Ok(())
}

#[test]
fn post_cycle_violates_acyclicity() -> TestResult {
    let (program, _) = harness();
    let config = ListConfig;
    let mut factory = SymbolFactory::new();

    let make_memory = |factory: &mut SymbolFactory, next| MemoryAxiom {
        node: factory.fresh_fo(Sort::Ptr),
        node_type: common::NODE,
        flow: factory.fresh_so(Sort::Data),
        fields: indexmap::indexmap! {
            "val".to_string() => factory.fresh_fo(Sort::Data),
            "marked".to_string() => factory.fresh_fo(Sort::Bool),
            "next".to_string() => next,
        },
    };
    let null = factory.fresh_fo(Sort::Ptr);
    let second_memory = make_memory(&mut factory, null);
    let first_memory = make_memory(&mut factory, second_memory.node);

    let as_node = |memory: &MemoryAxiom, factory: &mut SymbolFactory| {
        FlowGraphNode::from_memory(memory, false, factory, Sort::Data, |name| name == "next")
    };
    let first = as_node(&first_memory, &mut factory);
    let mut second = as_node(&second_memory, &mut factory);
    // the update closes a two-node cycle
    second
        .field_mut("next")
        .expect("next field")
        .post_value = first_memory.node;

    let mut now = Formula::new();
    now.conjoin(Axiom::SharedMemory(first_memory));
    now.conjoin(Axiom::SharedMemory(second_memory));
    let graph = FlowGraph {
        pre: Annotation::with_now(now),
        nodes: vec![first, second],
    };

    let mut encoding = Encoding::new(&program, &config)?;
    let footprint: NodeSet = [0, 1].into_iter().collect();
    assert!(!maintains_acyclicity(&mut encoding, &graph, &footprint)?);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4,
        .. ProptestConfig::default()
    })]

    /// Where every strategy terminates, the footprint sizes agree; none
    /// of the five is assumed semantically equivalent to another, only
    /// equally sized on these constraints.
    #[test]
    fn strategies_agree_on_footprint_size(no_op: bool) {
        let graph = unlink_graph(no_op).expect("graph construction");
        let mut sizes = Vec::new();
        for strategy in ExtensionStrategy::ALL {
            let outcome = run_fixpoint(&graph, strategy).expect("fixpoint run");
            sizes.push(outcome.footprint().map(NodeSet::len));
        }
        for window in sizes.windows(2) {
            prop_assert_eq!(window[0], window[1]);
        }
    }
}
