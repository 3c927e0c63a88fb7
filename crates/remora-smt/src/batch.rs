//! Adaptive batch implication.
//!
//! Many proof steps ask dozens of implication queries against one premise
//! set. Answering them one by one pays the solver setup cost per query;
//! this module batches them and picks among three strategies:
//!
//! 1. the backbone method: one witness variable per query, model-guided
//!    elimination, a handful of solver calls for the whole batch;
//! 2. sequential push/assert/check/pop per query;
//! 3. a parallel variant of 2 for large batches, with one independent
//!    solver per worker seeded by replaying the premise list.
//!
//! Some solver builds answer `unknown` to backbone-style queries; the
//! capability is probed once per process and the selection carried as
//! immutable state. A late regression demotes the owning encoding with a
//! one-time warning.

use std::sync::{Mutex, OnceLock};

use tracing::warn;

use crate::solver::{SatResult, SmtError, SmtSolver};
use crate::sorts::SmtSort;
use crate::terms::Term;

pub const BATCH_SIZE: usize = 16;
const PARALLEL_THRESHOLD: usize = 3 * BATCH_SIZE;

/// Which implication strategy the solver supports best.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCapability {
    /// Backbone method answers correctly.
    Backbone,
    /// Backbone came back `unknown`; stay with one-at-a-time.
    OneAtATime,
}

static PROBED: OnceLock<BatchCapability> = OnceLock::new();

/// Probe the backbone method once per process on a toy query set.
pub fn probe_capability() -> BatchCapability {
    *PROBED.get_or_init(|| {
        let mut solver = SmtSolver::new();
        let x = Term::var("probe!x", SmtSort::Int);
        if solver.assert(&x.clone().gt(Term::int(0))).is_err() {
            return BatchCapability::OneAtATime;
        }
        let queries = [x.clone().ge(Term::int(1)), x.lt(Term::int(0))];
        match compute_backbone(&mut solver, &queries) {
            Ok(_) => BatchCapability::Backbone,
            Err(_) => {
                warn!("solver cannot answer backbone queries; falling back to one-at-a-time implication checks");
                BatchCapability::OneAtATime
            }
        }
    })
}

/// Resolve a batch of implication queries against the premises currently
/// asserted on `solver` (also given as replayable `premises` for worker
/// seeding). Returns one answer per query, in order.
pub fn compute_implied(
    solver: &mut SmtSolver,
    premises: &[Term],
    queries: &[Term],
    capability: &mut BatchCapability,
) -> Result<Vec<bool>, SmtError> {
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    // an unsatisfiable premise set implies everything
    if solver.check() == SatResult::Unsat {
        return Ok(vec![true; queries.len()]);
    }

    if queries.len() > PARALLEL_THRESHOLD {
        return compute_parallel(premises, queries);
    }

    if *capability == BatchCapability::Backbone {
        match compute_backbone(solver, queries) {
            Ok(result) => return Ok(result),
            Err(SmtError::Unknown { .. }) => {
                warn!(
                    "backbone implication check returned unknown; \
                     permanently falling back to one-at-a-time checks"
                );
                *capability = BatchCapability::OneAtATime;
            }
            Err(other) => return Err(other),
        }
    }

    compute_sequential(solver, queries)
}

/// Strategy 1: witness booleans plus model-guided elimination.
///
/// Every query gets a witness `w_i == q_i`. As long as some candidate
/// remains, ask for a model refuting at least one candidate; witnesses
/// false in the model are definitely not implied. When no such model
/// exists the remaining candidates are all implied. Each round removes a
/// candidate, so the number of solver calls is bounded by the number of
/// non-implied queries plus one.
fn compute_backbone(solver: &mut SmtSolver, queries: &[Term]) -> Result<Vec<bool>, SmtError> {
    solver.push();
    let result = (|| {
        let witnesses: Vec<String> = (0..queries.len()).map(|i| format!("w!{i}")).collect();
        for (witness, query) in witnesses.iter().zip(queries) {
            let var = Term::var(witness.clone(), SmtSort::Bool);
            solver.assert(&var.eq(query.clone()))?;
        }

        let mut result = vec![false; queries.len()];
        let mut candidates: Vec<usize> = (0..queries.len()).collect();
        loop {
            let refute = Term::or(
                candidates
                    .iter()
                    .map(|&i| Term::var(witnesses[i].clone(), SmtSort::Bool).not())
                    .collect(),
            );
            solver.push();
            let asserted = solver.assert(&refute);
            let verdict = match asserted {
                Ok(()) => solver.check(),
                Err(err) => {
                    solver.pop();
                    return Err(err);
                }
            };
            match verdict {
                SatResult::Unsat => {
                    solver.pop();
                    for index in candidates {
                        result[index] = true;
                    }
                    return Ok(result);
                }
                SatResult::Unknown => {
                    solver.pop();
                    return Err(SmtError::unknown("computing implied consequences"));
                }
                SatResult::Sat => {
                    let before = candidates.len();
                    candidates.retain(|&i| solver.model_bool(&witnesses[i]) != Some(false));
                    solver.pop();
                    if candidates.is_empty() {
                        return Ok(result);
                    }
                    if candidates.len() == before {
                        // the model refuted no candidate; do not loop forever
                        return Err(SmtError::unknown("backbone made no progress"));
                    }
                }
            }
        }
    })();
    solver.pop();
    result
}

/// Strategy 2: one push/assert-negation/check/pop cycle per query.
fn compute_sequential(solver: &mut SmtSolver, queries: &[Term]) -> Result<Vec<bool>, SmtError> {
    let mut result = Vec::with_capacity(queries.len());
    for query in queries {
        result.push(solver.is_implied(query)?);
    }
    Ok(result)
}

struct Task {
    id: usize,
    query: Term,
}

/// Strategy 3: shuffled work items drained from a mutex-guarded pool by
/// workers that each own an independent solver seeded from the premise
/// list. Workers are joined before any result is visible, so the caller
/// stays synchronous.
fn compute_parallel(premises: &[Term], queries: &[Term]) -> Result<Vec<bool>, SmtError> {
    let mut tasks: Vec<Task> = queries
        .iter()
        .cloned()
        .enumerate()
        .map(|(id, query)| Task { id, query })
        .collect();
    shuffle(&mut tasks);

    let pool = Mutex::new(tasks);
    let results: Mutex<Vec<(usize, bool)>> = Mutex::new(Vec::with_capacity(queries.len()));
    let failure: Mutex<Option<SmtError>> = Mutex::new(None);

    let workers = std::thread::available_parallelism()
        .map(|n| 2 * n.get())
        .unwrap_or(8);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let mut solver = SmtSolver::new();
                for premise in premises {
                    if let Err(err) = solver.assert(premise) {
                        failure.lock().expect("poisoned failure lock").get_or_insert(err);
                        return;
                    }
                }
                loop {
                    let batch: Vec<Task> = {
                        let mut pool = pool.lock().expect("poisoned task pool");
                        let take = pool.len().min(BATCH_SIZE);
                        let offset = pool.len() - take;
                        pool.drain(offset..).collect()
                    };
                    if batch.is_empty() {
                        return;
                    }
                    let mut answers = Vec::with_capacity(batch.len());
                    for task in &batch {
                        match solver.is_implied(&task.query) {
                            Ok(implied) => answers.push((task.id, implied)),
                            Err(err) => {
                                failure.lock().expect("poisoned failure lock").get_or_insert(err);
                                return;
                            }
                        }
                    }
                    results
                        .lock()
                        .expect("poisoned result list")
                        .extend(answers);
                }
            });
        }
    });

    if let Some(err) = failure.into_inner().expect("poisoned failure lock") {
        return Err(err);
    }
    let mut answers = vec![false; queries.len()];
    for (id, implied) in results.into_inner().expect("poisoned result list") {
        answers[id] = implied;
    }
    Ok(answers)
}

/// Deterministic Fisher-Yates driven by splitmix64, so parallel runs are
/// reproducible.
fn shuffle(tasks: &mut [Task]) {
    let mut state: u64 = 0x9e3779b97f4a7c15;
    let mut next = || {
        state = state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    };
    for index in (1..tasks.len()).rev() {
        let other = (next() % (index as u64 + 1)) as usize;
        tasks.swap(index, other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn premise_set() -> Vec<Term> {
        let x = Term::var("x", SmtSort::Int);
        let y = Term::var("y", SmtSort::Int);
        vec![x.clone().gt(Term::int(10)), y.lt(x)]
    }

    fn query_set(n: usize) -> Vec<Term> {
        let x = Term::var("x", SmtSort::Int);
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    x.clone().gt(Term::int(5)) // implied
                } else {
                    x.clone().gt(Term::int(100)) // not implied
                }
            })
            .collect()
    }

    fn expected(n: usize) -> Vec<bool> {
        (0..n).map(|i| i % 2 == 0).collect()
    }

    fn seeded_solver(premises: &[Term]) -> Result<SmtSolver, SmtError> {
        let mut solver = SmtSolver::new();
        for premise in premises {
            solver.assert(premise)?;
        }
        Ok(solver)
    }

    #[test]
    fn backbone_matches_sequential_oracle() -> TestResult {
        let premises = premise_set();
        let queries = query_set(7);
        let mut solver = seeded_solver(&premises)?;
        let backbone = compute_backbone(&mut solver, &queries)?;
        let sequential = compute_sequential(&mut solver, &queries)?;
        assert_eq!(backbone, sequential);
        assert_eq!(backbone, expected(7));
        Ok(())
    }

    #[test]
    fn parallel_matches_sequential_oracle() -> TestResult {
        let premises = premise_set();
        let queries = query_set(PARALLEL_THRESHOLD + 5);
        let parallel = compute_parallel(&premises, &queries)?;
        assert_eq!(parallel, expected(PARALLEL_THRESHOLD + 5));
        Ok(())
    }

    #[test]
    fn unsat_premises_imply_everything() -> TestResult {
        let x = Term::var("x", SmtSort::Int);
        let premises = vec![x.clone().gt(Term::int(0)), x.clone().lt(Term::int(0))];
        let mut solver = seeded_solver(&premises)?;
        let mut capability = probe_capability();
        let result = compute_implied(
            &mut solver,
            &premises,
            &[x.gt(Term::int(100))],
            &mut capability,
        )?;
        assert_eq!(result, vec![true]);
        Ok(())
    }

    #[test]
    fn dispatch_handles_empty_query_set() -> TestResult {
        let mut solver = SmtSolver::new();
        let mut capability = probe_capability();
        let result = compute_implied(&mut solver, &[], &[], &mut capability)?;
        assert!(result.is_empty());
        Ok(())
    }

    #[test]
    fn probe_is_stable_across_calls() {
        assert_eq!(probe_capability(), probe_capability());
    }

    #[test]
    fn shuffle_is_deterministic_permutation() {
        let make = || -> Vec<Task> {
            (0..100)
                .map(|id| Task {
                    id,
                    query: Term::bool(true),
                })
                .collect()
        };
        let mut first = make();
        let mut second = make();
        shuffle(&mut first);
        shuffle(&mut second);
        let first_ids: Vec<usize> = first.iter().map(|t| t.id).collect();
        let second_ids: Vec<usize> = second.iter().map(|t| t.id).collect();
        assert_eq!(first_ids, second_ids);
        let mut sorted = first_ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_ne!(first_ids, sorted);
    }
}
