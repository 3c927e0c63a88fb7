//! Disjunctive abstraction: join and widening.

use remora_ir::logic::{Annotation, Axiom, MemoryAxiom, Specification};
use remora_ir::program::VarId;
use remora_ir::symbols::{Order, Sort, SymbolId};
use remora_smt::encoding::Encoding;
use remora_smt::terms::Term;
use tracing::debug;

use crate::error::Result;

use super::Solver;

impl<'a> Solver<'a> {
    /// Join a disjunction of states into one: branch-specific facts are
    /// dropped, kept is the intersection of a syntactic candidate set
    /// under per-branch implication.
    pub fn join(&mut self, mut annotations: Vec<Annotation>) -> Result<Annotation> {
        annotations.retain(|annotation| !annotation.now.conjuncts.is_empty());
        match annotations.len() {
            0 => return Ok(Annotation::new()),
            1 => return Ok(annotations.pop().expect("one annotation")),
            _ => {}
        }
        debug!(branches = annotations.len(), "joining annotations");
        for annotation in &annotations {
            self.factory.avoid(annotation.symbols());
        }

        // variables bound in every branch
        let common_vars: Vec<VarId> = annotations[0]
            .now
            .conjuncts
            .iter()
            .filter_map(|axiom| match axiom {
                Axiom::EqualsTo { variable, .. } => Some(*variable),
                _ => None,
            })
            .filter(|variable| {
                annotations
                    .iter()
                    .all(|annotation| annotation.now.value_of(*variable).is_some())
            })
            .collect();

        let mut joined = Annotation::new();
        // joined symbol -> per-branch counterpart
        let mut mappings: Vec<Vec<(SymbolId, SymbolId)>> =
            vec![Vec::new(); annotations.len()];

        for &variable in &common_vars {
            let sort = self.program.variable(variable).sort;
            let value = self.factory.fresh_fo(sort);
            joined.conjoin(Axiom::EqualsTo { variable, value });
            for (mapping, branch) in mappings.iter_mut().zip(&annotations) {
                let branch_value = branch.now.value_of(variable).expect("common variable");
                mapping.push((value, branch_value));
            }
        }

        // memory shared by every branch through a common pointer variable
        for &variable in &common_vars {
            if self.program.variable(variable).sort != Sort::Ptr {
                continue;
            }
            let cells: Option<Vec<(bool, &MemoryAxiom)>> = annotations
                .iter()
                .map(|branch| {
                    let address = branch.now.value_of(variable).expect("common variable");
                    branch.now.memory_at(address)
                })
                .collect();
            let Some(cells) = cells else { continue };
            let template = cells[0].1;
            if !cells.iter().all(|(local, memory)| {
                *local == cells[0].0 && memory.node_type == template.node_type
            }) {
                continue;
            }
            let joined_address = joined.now.value_of(variable).expect("just bound");
            if joined.now.memory_at(joined_address).is_some() {
                continue;
            }

            let flow = self.factory.fresh_so(self.config.flow_sort());
            let mut fields = indexmap::IndexMap::new();
            for (name, value) in &template.fields {
                fields.insert(name.clone(), self.factory.fresh(value.sort, value.order));
            }
            for (mapping, (_, memory)) in mappings.iter_mut().zip(&cells) {
                mapping.push((flow, memory.flow));
                for (name, value) in &fields {
                    mapping.push((*value, memory.fields[name]));
                }
            }
            let memory = MemoryAxiom {
                node: joined_address,
                node_type: template.node_type,
                flow,
                fields,
            };
            if cells[0].0 {
                joined.conjoin(Axiom::LocalMemory(memory));
            } else {
                joined.conjoin(Axiom::SharedMemory(memory));
            }
        }

        // obligations present in every branch
        for &variable in &common_vars {
            if self.program.variable(variable).sort != Sort::Data {
                continue;
            }
            for spec in [
                Specification::Contains,
                Specification::Insert,
                Specification::Delete,
            ] {
                let everywhere = annotations.iter().all(|branch| {
                    let key = branch.now.value_of(variable).expect("common variable");
                    branch
                        .now
                        .obligations()
                        .any(|(s, k)| s == spec && k == key)
                });
                if everywhere {
                    let key = joined.now.value_of(variable).expect("just bound");
                    joined.conjoin(Axiom::Obligation { spec, key });
                }
            }
        }

        // fulfillments guaranteed by every branch
        for value in [true, false] {
            let guaranteed = annotations
                .iter()
                .map(|branch| branch.now.fulfillments().filter(|&v| v == value).count())
                .min()
                .unwrap_or(0);
            for _ in 0..guaranteed {
                joined.conjoin(Axiom::Fulfillment {
                    return_value: value,
                });
            }
        }

        // facts implied by every branch, from a syntactic candidate set
        let candidates = self.stack_candidates(&joined);
        let mut surviving = vec![true; candidates.len()];
        for (branch, mapping) in annotations.iter().zip(&mappings) {
            let mut encoding = self.encoding_for(branch)?;
            self.bind_joined_symbols(&mut encoding, mapping)?;
            let queries: Vec<Term> = candidates
                .iter()
                .map(|axiom| encoding.encode_axiom(axiom, &Default::default()))
                .collect();
            for query in queries {
                encoding.add_check(query);
            }
            let implied = encoding.run_checks()?;
            for (slot, verdict) in surviving.iter_mut().zip(implied) {
                *slot &= verdict;
            }
        }
        for (axiom, keep) in candidates.into_iter().zip(surviving) {
            if keep {
                joined.conjoin(axiom);
            }
        }
        joined.now.dedup();
        Ok(joined)
    }

    fn bind_joined_symbols(
        &self,
        encoding: &mut Encoding,
        mapping: &[(SymbolId, SymbolId)],
    ) -> Result<()> {
        for &(joined, branch) in mapping {
            let premise = if joined.order == Order::Second {
                encoding.flow_equal(joined, branch)
            } else {
                encoding
                    .encode_symbol(joined)
                    .term()
                    .eq(encoding.encode_symbol(branch).term())
            };
            encoding.add_premise(premise)?;
        }
        Ok(())
    }

    /// Weaken a loop state so the join sequence terminates: resources
    /// survive, free-floating stack facts are re-derived from the old
    /// knowledge and capped to the candidate vocabulary.
    pub fn widen(&mut self, annotation: Annotation) -> Result<Annotation> {
        let referenced: Vec<SymbolId> = annotation
            .now
            .conjuncts
            .iter()
            .filter_map(|axiom| match axiom {
                Axiom::EqualsTo { value, .. } => Some(*value),
                _ => None,
            })
            .collect();

        let mut widened = Annotation::new();
        for axiom in &annotation.now.conjuncts {
            let keep = match axiom {
                Axiom::LocalMemory(_) => true,
                Axiom::SharedMemory(memory) => referenced.contains(&memory.node),
                Axiom::EqualsTo { .. } => true,
                Axiom::Obligation { .. } | Axiom::Fulfillment { .. } => true,
                _ => false,
            };
            if keep {
                widened.conjoin(axiom.clone());
            }
        }
        widened.past = annotation
            .past
            .iter()
            .filter(|past| referenced.contains(&past.memory.node))
            .cloned()
            .collect();
        widened.future = annotation.future.clone();

        // re-derive stack knowledge from the original state
        let mut encoding = self.encoding_for(&annotation)?;
        self.extend_stack(&mut widened, &mut encoding)?;
        widened.now.dedup();
        Ok(widened)
    }
}
