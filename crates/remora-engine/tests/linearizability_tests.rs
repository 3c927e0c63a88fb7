//! End-to-end behavior: post images of real updates and whole-program
//! proofs.

mod common;

use common::{contains_program, harness, unlink_state, unlink_write, ListConfig};
use remora_engine::config::EngineSetup;
use remora_engine::error::VerificationError;
use remora_engine::solver::Solver;
use remora_engine::{is_linearizable, prove_linearizability};
use remora_ir::program::Command;
use remora_ir::symbols::SymbolFactory;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn unlinking_a_marked_node_is_a_pure_update() -> TestResult {
    let (program, vars) = harness();
    let config = ListConfig;
    let setup = EngineSetup::default();
    let mut solver = Solver::new(&program, &config, &setup);

    let mut factory = SymbolFactory::new();
    let (annotation, fragment) = unlink_state(&vars, &mut factory);
    let write = unlink_write(&vars);

    let image = solver.post(annotation, &Command::MemoryWrite(write))?;

    // one resulting state in which the marked node is unlinked
    assert_eq!(image.annotations.len(), 1);
    let post = &image.annotations[0];
    let (_, root_memory) = post
        .now
        .memory_at(fragment.root)
        .expect("root cell survives");
    assert_eq!(root_memory.field("next"), fragment.end);
    assert_ne!(root_memory.field("next"), fragment.mid);

    // exactly one externally visible effect, touching only `next`
    assert_eq!(image.effects.len(), 1);
    let effect = &image.effects[0];
    assert_eq!(effect.pre.node, fragment.root);
    assert_eq!(effect.pre.field("next"), fragment.mid);
    assert_eq!(effect.post.field("next"), fragment.end);
    assert_eq!(effect.pre.field("val"), effect.post.field("val"));
    assert_eq!(effect.pre.field("marked"), effect.post.field("marked"));
    assert_eq!(effect.pre.flow, effect.post.flow);
    Ok(())
}

#[test]
fn contains_discharges_its_obligation() -> TestResult {
    let program = contains_program(false);
    let config = ListConfig;
    let setup = EngineSetup::default();
    prove_linearizability(&program, &config, &setup)?;
    assert!(is_linearizable(&program, &config, &setup));
    Ok(())
}

#[test]
fn broken_locate_fails_naming_the_function() {
    let program = contains_program(true);
    let config = ListConfig;
    let setup = EngineSetup::default();
    let result = prove_linearizability(&program, &config, &setup);
    match result {
        Err(VerificationError::LinearizationNotFound { function }) => {
            assert_eq!(function, "contains");
        }
        other => panic!("expected a linearizability failure, got {other:?}"),
    }
    assert!(!is_linearizable(&program, &config, &setup));
}

#[test]
fn every_strategy_verifies_the_unlink() -> TestResult {
    let (program, vars) = harness();
    let config = ListConfig;
    for strategy in remora_engine::strategy::ExtensionStrategy::ALL {
        let setup = EngineSetup {
            footprint_strategy: strategy,
            ..EngineSetup::default()
        };
        let mut solver = Solver::new(&program, &config, &setup);
        let mut factory = SymbolFactory::new();
        let (annotation, _) = unlink_state(&vars, &mut factory);
        let image = solver.post(annotation, &Command::MemoryWrite(unlink_write(&vars)))?;
        assert_eq!(image.effects.len(), 1);
    }
    Ok(())
}
