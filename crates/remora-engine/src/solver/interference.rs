//! The rely/guarantee half of the proof: recording heap effects and
//! folding them back into local reasoning.

use remora_ir::logic::{
    canonicalize_effect, rename_annotation, rename_effect, Annotation, Axiom, HeapEffect,
    PastPredicate, SymbolicExpr,
};
use remora_ir::symbols::{Order, SymbolId};
use remora_smt::encoding::{CheckId, Encoding};
use tracing::{debug, info};

use crate::error::Result;

use super::Solver;

/// The interferer is some other thread: its own thread id is an
/// arbitrary one, not ours.
fn replace_interferer_tid(effect: &mut HeapEffect) {
    for axiom in &mut effect.context.conjuncts {
        if let Axiom::Stack { lhs, rhs, .. } = axiom {
            if *lhs == SymbolicExpr::SelfTid {
                *lhs = SymbolicExpr::SomeTid;
            }
            if *rhs == SymbolicExpr::SelfTid {
                *rhs = SymbolicExpr::SomeTid;
            }
        }
    }
}

/// `premise` updates at least whatever `conclusion` updates; otherwise
/// it cannot subsume it.
fn update_subset(premise: &HeapEffect, conclusion: &HeapEffect) -> bool {
    if conclusion.updates_flow() && !premise.updates_flow() {
        return false;
    }
    conclusion
        .pre
        .fields
        .keys()
        .all(|field| !conclusion.updates_field(field) || premise.updates_field(field))
}

impl<'a> Solver<'a> {
    /// Record new effects into the engine-wide interference set.
    /// Returns whether the set actually grew; this drives the outer
    /// proof fixpoint.
    pub fn add_interference(&mut self, effects: Vec<HeapEffect>) -> Result<bool> {
        debug!(incoming = effects.len(), "adding interference");
        for effect in &effects {
            self.factory.avoid(effect.symbols());
        }

        // quick filter: drop no-ops and alpha-duplicates
        let mut seen: Vec<HeapEffect> = self
            .interference
            .iter()
            .map(|effect| {
                let mut canonical = effect.clone();
                canonicalize_effect(&mut canonical);
                canonical
            })
            .collect();
        let mut fresh: Vec<HeapEffect> = Vec::new();
        for mut effect in effects {
            if effect.is_empty() {
                continue;
            }
            replace_interferer_tid(&mut effect);
            let mut canonical = effect.clone();
            canonicalize_effect(&mut canonical);
            if seen.contains(&canonical) {
                continue;
            }
            seen.push(canonical);
            // keep stored effects symbol-disjoint from each other
            rename_effect(&mut effect, &mut self.factory);
            fresh.push(effect);
        }
        if fresh.is_empty() {
            return Ok(false);
        }

        // subsumption: drop effects implied by another recorded effect
        let combined: Vec<&HeapEffect> = self.interference.iter().chain(&fresh).collect();
        let old = self.interference.len();
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        for premise in 0..combined.len() {
            for conclusion in 0..combined.len() {
                if premise == conclusion || (premise < old && conclusion < old) {
                    continue;
                }
                if combined[premise].pre.node_type != combined[conclusion].pre.node_type {
                    continue;
                }
                if !update_subset(combined[premise], combined[conclusion]) {
                    continue;
                }
                pairs.push((premise, conclusion));
            }
        }

        let mut encoding = Encoding::new(self.program, self.config)?;
        let mut checks: Vec<(CheckId, usize, usize)> = Vec::new();
        for &(premise, conclusion) in &pairs {
            let check = queue_effect_implication(
                &mut encoding,
                combined[premise],
                combined[conclusion],
            );
            checks.push((check, premise, conclusion));
        }
        let verdicts = encoding.run_checks()?;

        let mut pruned = vec![false; combined.len()];
        for (check, premise, conclusion) in checks {
            if verdicts[check.0] && !pruned[premise] {
                pruned[conclusion] = true;
            }
        }

        let mut result: Vec<HeapEffect> = Vec::new();
        let mut grew = false;
        for (index, effect) in combined.into_iter().enumerate() {
            if pruned[index] {
                continue;
            }
            if index >= old {
                grew = true;
            }
            result.push(effect.clone());
        }
        if grew {
            info!(total = result.len(), "interference set grew");
        }
        self.interference = result;
        Ok(grew)
    }

    /// Re-apply every recorded effect as an additional nondeterministic
    /// environment transition until the state is stable against it.
    /// Cells invalidated by an effect are havocked and their previous
    /// contents kept as past knowledge.
    pub fn make_interference_stable(&mut self, mut annotation: Annotation) -> Result<Annotation> {
        self.factory.avoid(annotation.symbols());
        if self.interference.is_empty() {
            return Ok(annotation);
        }
        if annotation.now.shared_memory().next().is_none() {
            return Ok(annotation);
        }
        // keep the state's symbols apart from the recorded effects'
        rename_annotation(&mut annotation, &mut self.factory);
        self.improve_past(&mut annotation)?;

        let mut encoding = self.encoding_for(&annotation)?;

        // which cell does which effect possibly hit?
        struct Hit {
            check: CheckId,
            address: SymbolId,
            effect: usize,
        }
        let mut hits: Vec<Hit> = Vec::new();
        for (index, effect) in self.interference.iter().enumerate() {
            for memory in annotation.now.shared_memory() {
                if memory.node_type != effect.pre.node_type {
                    continue;
                }
                let matches = remora_smt::terms::Term::and(vec![
                    encoding.encode_memory_equality(memory, &effect.pre),
                    encoding.encode_formula(&effect.context, &Default::default()),
                ]);
                let interference_free = matches.implies(remora_smt::terms::Term::bool(false));
                hits.push(Hit {
                    check: encoding.add_check(interference_free),
                    address: memory.node,
                    effect: index,
                });
            }
        }
        let verdicts = encoding.run_checks()?;

        let mut invalidated: Vec<(SymbolId, usize)> = Vec::new();
        for hit in hits {
            if !verdicts[hit.check.0] {
                invalidated.push((hit.address, hit.effect));
            }
        }
        if invalidated.is_empty() {
            return Ok(annotation);
        }

        // havoc hit cells, keep their old state as history
        let mut snapshots: Vec<PastPredicate> = Vec::new();
        for axiom in &mut annotation.now.conjuncts {
            let Axiom::SharedMemory(memory) = axiom else {
                continue;
            };
            let hitting: Vec<usize> = invalidated
                .iter()
                .filter(|(address, _)| *address == memory.node)
                .map(|(_, effect)| *effect)
                .collect();
            if hitting.is_empty() {
                continue;
            }
            snapshots.push(PastPredicate {
                memory: memory.clone(),
            });
            for effect_index in hitting {
                let effect = &self.interference[effect_index];
                if effect.updates_flow() {
                    memory.flow = self.factory.fresh(memory.flow.sort, Order::Second);
                }
                let updated: Vec<String> = memory
                    .fields
                    .keys()
                    .filter(|field| effect.updates_field(field))
                    .cloned()
                    .collect();
                for field in updated {
                    let slot = memory.fields.get_mut(&field).expect("field exists");
                    *slot = self.factory.fresh(slot.sort, slot.order);
                }
            }
        }
        debug!(cells = snapshots.len(), "state destabilized by interference");
        annotation.past.extend(snapshots);
        Ok(annotation)
    }
}

/// Queue the check that `premise` subsumes `conclusion`: whenever the
/// same cell transition satisfies the conclusion's context, it also
/// satisfies the premise's.
fn queue_effect_implication(
    encoding: &mut Encoding,
    premise: &HeapEffect,
    conclusion: &HeapEffect,
) -> CheckId {
    use remora_smt::terms::Term;
    let subst = Default::default();
    let same_pre = encoding.encode_memory_equality(&premise.pre, &conclusion.pre);
    let same_post = encoding.encode_memory_equality(&premise.post, &conclusion.post);
    let premise_context = encoding.encode_formula(&premise.context, &subst);
    let conclusion_context = encoding.encode_formula(&conclusion.context, &subst);

    let implied =
        Term::and(vec![same_pre, same_post, conclusion_context]).implies(premise_context);
    encoding.add_check(implied)
}
