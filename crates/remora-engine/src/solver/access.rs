//! Memory materialization and stack saturation.

use remora_ir::logic::{Annotation, Axiom, MemoryAxiom, SymbolicExpr};
use remora_ir::program::VarId;
use remora_ir::symbols::{Order, Sort, SymbolId};
use remora_smt::encoding::Encoding;
use remora_smt::terms::Term;

use crate::error::{Result, VerificationError};

use super::Solver;

impl<'a> Solver<'a> {
    /// Make the memory behind the given pointer variables accessible:
    /// every provably non-null address that has no resource yet gets a
    /// fresh shared cell. Knowledge about the fresh cell comes from the
    /// configured invariants at encoding time.
    pub fn prepare_access(
        &mut self,
        annotation: &mut Annotation,
        variables: &[VarId],
    ) -> Result<()> {
        let mut addresses = Vec::new();
        for &variable in variables {
            if self.program.variable(variable).sort != Sort::Ptr {
                continue;
            }
            let address = annotation.now.value_of(variable).ok_or_else(|| {
                VerificationError::internal(format!(
                    "variable '{}' has no binding",
                    self.program.variable(variable).name
                ))
            })?;
            addresses.push((variable, address));
        }
        if addresses.is_empty() {
            return Ok(());
        }

        let mut encoding = self.encoding_for(annotation)?;
        let non_null =
            encoding.compute_non_null(addresses.iter().map(|(_, address)| *address).collect())?;

        for (variable, address) in addresses {
            if !non_null.contains(&address) {
                continue;
            }
            if annotation.now.memory_at(address).is_some() {
                continue;
            }
            let node_type = self
                .program
                .variable(variable)
                .node_type
                .ok_or_else(|| VerificationError::unsupported("dereference of an untyped pointer"))?;
            let layout = self.program.node_type(node_type);
            let mut fields = indexmap::IndexMap::new();
            for (name, sort) in &layout.fields {
                fields.insert(name.clone(), self.factory.fresh_fo(*sort));
            }
            annotation.conjoin(Axiom::SharedMemory(MemoryAxiom {
                node: address,
                node_type,
                flow: self.factory.fresh_so(self.config.flow_sort()),
                fields,
            }));
        }
        Ok(())
    }

    /// Candidate facts over the symbols of a state, used for saturation
    /// and join intersection.
    pub(crate) fn stack_candidates(&self, annotation: &Annotation) -> Vec<Axiom> {
        let mut symbols = annotation.now.symbols();
        symbols.sort();
        symbols.dedup();

        let firsts: Vec<SymbolId> = symbols
            .iter()
            .copied()
            .filter(|symbol| symbol.order == Order::First)
            .collect();
        let flows: Vec<SymbolId> = symbols
            .iter()
            .copied()
            .filter(|symbol| symbol.order == Order::Second)
            .collect();

        let mut candidates = Vec::new();
        for &symbol in &firsts {
            let this = SymbolicExpr::Symbol(symbol);
            match symbol.sort {
                Sort::Ptr => {
                    candidates.push(Axiom::eq(this, SymbolicExpr::Null));
                    candidates.push(Axiom::neq(this, SymbolicExpr::Null));
                }
                Sort::Data => {
                    candidates.push(Axiom::eq(this, SymbolicExpr::Min));
                    candidates.push(Axiom::stack(
                        remora_ir::program::BinaryOperator::Gt,
                        this,
                        SymbolicExpr::Min,
                    ));
                    candidates.push(Axiom::eq(this, SymbolicExpr::Max));
                    candidates.push(Axiom::stack(
                        remora_ir::program::BinaryOperator::Lt,
                        this,
                        SymbolicExpr::Max,
                    ));
                }
                Sort::Bool => {
                    candidates.push(Axiom::eq(this, SymbolicExpr::Bool(true)));
                    candidates.push(Axiom::eq(this, SymbolicExpr::Bool(false)));
                }
                _ => {}
            }
        }
        for (index, &first) in firsts.iter().enumerate() {
            for &second in firsts.iter().skip(index + 1) {
                if first.sort != second.sort {
                    continue;
                }
                let lhs = SymbolicExpr::Symbol(first);
                let rhs = SymbolicExpr::Symbol(second);
                candidates.push(Axiom::eq(lhs, rhs));
                candidates.push(Axiom::neq(lhs, rhs));
                if first.sort == Sort::Data {
                    candidates.push(Axiom::stack(
                        remora_ir::program::BinaryOperator::Lt,
                        lhs,
                        rhs,
                    ));
                    candidates.push(Axiom::stack(
                        remora_ir::program::BinaryOperator::Gt,
                        lhs,
                        rhs,
                    ));
                }
            }
        }
        for &flow in &flows {
            candidates.push(Axiom::InflowEmptiness {
                flow,
                is_empty: true,
            });
            candidates.push(Axiom::InflowEmptiness {
                flow,
                is_empty: false,
            });
            for &value in &firsts {
                if value.sort == self.config.flow_sort() {
                    candidates.push(Axiom::InflowContainsValue { flow, value });
                }
            }
        }
        candidates
    }

    /// Conjoin every candidate fact the current knowledge implies.
    pub(crate) fn extend_stack(
        &self,
        annotation: &mut Annotation,
        encoding: &mut Encoding,
    ) -> Result<()> {
        let candidates = self.stack_candidates(annotation);
        let fresh: Vec<Axiom> = candidates
            .into_iter()
            .filter(|candidate| !annotation.now.conjuncts.contains(candidate))
            .collect();
        let queries: Vec<Term> = fresh
            .iter()
            .map(|axiom| encoding.encode_axiom(axiom, &Default::default()))
            .collect();
        for query in queries {
            encoding.add_check(query);
        }
        let implied = encoding.run_checks()?;
        for (axiom, keep) in fresh.into_iter().zip(implied) {
            if keep {
                annotation.conjoin(axiom);
            }
        }
        Ok(())
    }
}
