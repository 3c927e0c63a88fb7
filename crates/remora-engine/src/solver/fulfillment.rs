//! Linearization-point detection: turning obligations into
//! fulfillments.

use remora_ir::flowgraph::FlowGraph;
use remora_ir::logic::{Annotation, Axiom, Formula, Specification};
use remora_ir::symbols::SymbolId;
use remora_smt::encoding::{CheckId, Encoding};

use crate::error::Result;
use crate::footprint::make_pure_heap_graph;

use super::Solver;

/// Queued specification checks: which fulfillment each verdict unlocks.
pub(crate) struct SpecCheck {
    pub check: CheckId,
    pub return_value: bool,
}

/// Queue the checks that discharge an obligation on a *pure* step: the
/// operation's outcome is already decided by the current contents.
pub(crate) fn queue_pure_spec_checks(
    encoding: &mut Encoding,
    graph: &FlowGraph,
    spec: Specification,
    key: SymbolId,
) -> Vec<SpecCheck> {
    let mut result = Vec::new();
    match spec {
        Specification::Contains => {
            let contained = encoding.encode_contains_key(graph, key);
            result.push(SpecCheck {
                check: encoding.add_check(contained),
                return_value: true,
            });
            let absent = encoding.encode_not_contains_key(graph, key);
            result.push(SpecCheck {
                check: encoding.add_check(absent),
                return_value: false,
            });
        }
        Specification::Insert => {
            // inserting a present key fails
            let contained = encoding.encode_contains_key(graph, key);
            result.push(SpecCheck {
                check: encoding.add_check(contained),
                return_value: false,
            });
        }
        Specification::Delete => {
            // deleting an absent key fails
            let absent = encoding.encode_not_contains_key(graph, key);
            result.push(SpecCheck {
                check: encoding.add_check(absent),
                return_value: false,
            });
        }
    }
    result
}

/// Queue the check that discharges an obligation on an *impure* step:
/// the update itself realizes the specified outcome.
pub(crate) fn queue_impure_spec_checks(
    encoding: &mut Encoding,
    graph: &FlowGraph,
    spec: Specification,
    key: SymbolId,
) -> Option<SpecCheck> {
    match spec {
        Specification::Contains => None,
        Specification::Insert => {
            let insertion = encoding.encode_is_insertion(graph, key);
            Some(SpecCheck {
                check: encoding.add_check(insertion),
                return_value: true,
            })
        }
        Specification::Delete => {
            let deletion = encoding.encode_is_deletion(graph, key);
            Some(SpecCheck {
                check: encoding.add_check(deletion),
                return_value: true,
            })
        }
    }
}

impl<'a> Solver<'a> {
    /// Attempt to instantiate a fulfillment for every pending obligation
    /// using current knowledge; inspects the present heap and every
    /// recorded past snapshot.
    pub fn try_add_fulfillment(&mut self, mut annotation: Annotation) -> Result<Annotation> {
        self.factory.avoid(annotation.symbols());
        let obligations: Vec<(Specification, SymbolId)> =
            annotation.now.obligations().collect();
        if obligations.is_empty() {
            return Ok(annotation);
        }

        let mut snapshots: Vec<Formula> = vec![annotation.now.clone()];
        for past in &annotation.past {
            let mut formula = Formula::new();
            formula.conjoin(Axiom::SharedMemory(past.memory.clone()));
            snapshots.push(formula);
        }

        let mut fulfillments = Vec::new();
        for snapshot in snapshots {
            let mut encoding = Encoding::new(self.program, self.config)?;
            encoding.add_premise_with_knowledge(&annotation.now)?;
            encoding.add_premise_formula(&snapshot)?;

            let graph = make_pure_heap_graph(
                Annotation::with_now(snapshot),
                self.program,
                self.config,
                &mut self.factory,
            );
            if graph.nodes.is_empty() {
                continue;
            }
            encoding.add_premise_graph(&graph)?;

            let mut queued = Vec::new();
            for &(spec, key) in &obligations {
                queued.extend(queue_pure_spec_checks(&mut encoding, &graph, spec, key));
            }
            let verdicts = encoding.run_checks()?;
            for check in queued {
                if verdicts[check.check.0] {
                    fulfillments.push(check.return_value);
                }
            }
        }

        for return_value in fulfillments {
            let fulfillment = Axiom::Fulfillment { return_value };
            if !annotation.now.conjuncts.contains(&fulfillment) {
                annotation.conjoin(fulfillment);
            }
        }
        Ok(annotation)
    }
}
