//! Translation of the data model into SMT constraints.
//!
//! An [`Encoding`] owns one solver, a scoped premise stack (mirrored as
//! replayable terms so parallel workers can seed independent solvers),
//! and a queue of batched implication checks. Construction probes the
//! batch capability once per process; the selection is immutable except
//! for the documented one-time demotion on a late solver regression.

mod graph;
mod spec;

use std::cell::Cell;
use std::collections::HashMap;

use remora_ir::config::SolverConfig;
use remora_ir::logic::{
    Annotation, Axiom, Formula, Implication, ImplicationSet, MemoryAxiom, SymbolicExpr,
};
use remora_ir::program::{BinaryOperator, Program, VarId};
use remora_ir::symbols::{Order, Sort, SymbolId};

use crate::batch::{self, BatchCapability};
use crate::solver::{SatResult, SmtError, SmtSolver};
use crate::sorts::SmtSort;
use crate::terms::{Term, MAX_VALUE, MIN_VALUE, NULL_VALUE};

/// Encoding of the executing thread's id.
const SELF_TID: i64 = 1;
/// Encoding of the "no owner" lock value.
const UNLOCKED: i64 = 0;
/// Constant naming an unspecified other thread.
const SOME_TID_NAME: &str = "tid!some";

/// Substitution of first-order symbols by terms, used to instantiate
/// configuration predicates under a quantifier.
pub type Subst = HashMap<SymbolId, Term>;

/// Either a boolean expression or a reference to a declared second-order
/// flow function. The two kinds do not mix: flow references support only
/// application and extensional equality, and forcing one through a
/// boolean combinator is a programming error that panics.
#[derive(Debug, Clone, PartialEq)]
pub enum EExpr {
    Term(Term),
    Flow(String),
}

impl EExpr {
    /// The boolean term behind this expression.
    ///
    /// Panics when applied to a flow function reference; that is an
    /// internal encoding error, never silently coerced.
    pub fn term(self) -> Term {
        match self {
            EExpr::Term(term) => term,
            EExpr::Flow(name) => panic!(
                "internal encoding error: flow function '{name}' used as a boolean expression"
            ),
        }
    }

    /// Membership application of a flow function.
    pub fn contains(&self, value: Term) -> Term {
        match self {
            EExpr::Flow(name) => Term::apply(name.clone(), value),
            EExpr::Term(_) => {
                panic!("internal encoding error: applied a boolean expression like a flow function")
            }
        }
    }
}

pub struct Encoding<'a> {
    program: &'a Program,
    config: &'a dyn SolverConfig,
    solver: SmtSolver,
    capability: BatchCapability,
    premises: Vec<Term>,
    scopes: Vec<usize>,
    checks: Vec<Term>,
    qv_counter: Cell<u32>,
}

/// Handle of a queued implication check; indexes the result vector of
/// [`Encoding::run_checks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckId(pub usize);

impl<'a> Encoding<'a> {
    pub fn new(program: &'a Program, config: &'a dyn SolverConfig) -> Result<Self, SmtError> {
        let mut encoding = Encoding {
            program,
            config,
            solver: SmtSolver::new(),
            capability: batch::probe_capability(),
            premises: Vec::new(),
            scopes: Vec::new(),
            checks: Vec::new(),
            qv_counter: Cell::new(0),
        };
        // "some other thread" is neither this thread nor the unlocked value
        let some_tid = Term::var(SOME_TID_NAME, SmtSort::Int);
        encoding.add_premise(some_tid.clone().neq(Term::int(SELF_TID)))?;
        encoding.add_premise(some_tid.neq(Term::int(UNLOCKED)))?;
        Ok(encoding)
    }

    pub fn config(&self) -> &'a dyn SolverConfig {
        self.config
    }

    //
    // Premises and scopes
    //

    pub fn add_premise(&mut self, term: Term) -> Result<(), SmtError> {
        self.solver.assert(&term)?;
        self.premises.push(term);
        Ok(())
    }

    pub fn add_premise_formula(&mut self, formula: &Formula) -> Result<(), SmtError> {
        let term = self.encode_formula(formula, &Subst::new());
        self.add_premise(term)
    }

    pub fn add_premise_implication_set(&mut self, set: &ImplicationSet) -> Result<(), SmtError> {
        let term = self.encode_implication_set(set, &Subst::new());
        self.add_premise(term)
    }

    /// Conjoin a formula together with every piece of derived knowledge:
    /// invariants, simple flow rules, ownership, and acyclicity.
    pub fn add_premise_with_knowledge(&mut self, formula: &Formula) -> Result<(), SmtError> {
        let term = self.encode_formula_with_knowledge(formula);
        self.add_premise(term)
    }

    pub fn push(&mut self) {
        self.solver.push();
        self.scopes.push(self.premises.len());
    }

    pub fn pop(&mut self) {
        self.solver.pop();
        if let Some(count) = self.scopes.pop() {
            self.premises.truncate(count);
        }
    }

    //
    // Queries
    //

    pub fn implies(&mut self, term: &Term) -> Result<bool, SmtError> {
        self.solver.is_implied(term)
    }

    pub fn implies_formula(&mut self, formula: &Formula) -> Result<bool, SmtError> {
        let term = self.encode_formula(formula, &Subst::new());
        self.implies(&term)
    }

    pub fn implies_implication_set(&mut self, set: &ImplicationSet) -> Result<bool, SmtError> {
        let term = self.encode_implication_set(set, &Subst::new());
        self.implies(&term)
    }

    pub fn implies_false(&mut self) -> Result<bool, SmtError> {
        Ok(self.solver.check() == SatResult::Unsat)
    }

    /// Queue an implication check for the next [`Encoding::run_checks`].
    pub fn add_check(&mut self, term: Term) -> CheckId {
        self.checks.push(term);
        CheckId(self.checks.len() - 1)
    }

    /// Resolve all queued checks in one adaptive batch. Results are
    /// indexed by the [`CheckId`]s handed out since the last run.
    pub fn run_checks(&mut self) -> Result<Vec<bool>, SmtError> {
        if self.checks.is_empty() {
            return Ok(Vec::new());
        }
        let queries = std::mem::take(&mut self.checks);
        batch::compute_implied(
            &mut self.solver,
            &self.premises,
            &queries,
            &mut self.capability,
        )
    }

    /// Filter `symbols` down to those provably non-null. Symbols that are
    /// not pointers are dropped.
    pub fn compute_non_null(
        &mut self,
        symbols: Vec<SymbolId>,
    ) -> Result<Vec<SymbolId>, SmtError> {
        let pointers: Vec<SymbolId> = symbols
            .into_iter()
            .filter(|symbol| symbol.sort == Sort::Ptr)
            .collect();
        let queries: Vec<Term> = pointers
            .iter()
            .map(|symbol| self.encode_non_null(*symbol))
            .collect();
        let implied = batch::compute_implied(
            &mut self.solver,
            &self.premises,
            &queries,
            &mut self.capability,
        )?;
        Ok(pointers
            .into_iter()
            .zip(implied)
            .filter_map(|(symbol, keep)| keep.then_some(symbol))
            .collect())
    }

    //
    // Symbols and expressions
    //

    pub(crate) fn fresh_qv(&self) -> String {
        let index = self.qv_counter.get();
        self.qv_counter.set(index + 1);
        format!("qv!{index}")
    }

    pub fn encode_symbol(&self, symbol: SymbolId) -> EExpr {
        match symbol.order {
            Order::First => EExpr::Term(Term::var(symbol.to_string(), SmtSort::from(symbol.sort))),
            Order::Second => EExpr::Flow(symbol.to_string()),
        }
    }

    fn first_order_term(&self, symbol: SymbolId, subst: &Subst) -> Term {
        if let Some(term) = subst.get(&symbol) {
            return term.clone();
        }
        assert!(
            !symbol.is_probe(),
            "internal encoding error: unsubstituted probe symbol"
        );
        assert_eq!(symbol.order, Order::First);
        Term::var(symbol.to_string(), SmtSort::from(symbol.sort))
    }

    /// Membership term `flow(value)`.
    pub fn flow_contains(&self, flow: SymbolId, value: Term) -> Term {
        assert_eq!(flow.order, Order::Second);
        Term::apply(flow.to_string(), value)
    }

    /// Extensional equality of two flow values.
    pub fn flow_equal(&self, lhs: SymbolId, rhs: SymbolId) -> Term {
        let qv = self.fresh_qv();
        let qv_term = Term::var(qv.clone(), SmtSort::Int);
        Term::forall(
            qv,
            SmtSort::Int,
            self.flow_contains(lhs, qv_term.clone())
                .eq(self.flow_contains(rhs, qv_term)),
        )
    }

    /// `lhs ⊆ rhs` for flow values.
    pub fn flow_subset(&self, lhs: SymbolId, rhs: SymbolId) -> Term {
        let qv = self.fresh_qv();
        let qv_term = Term::var(qv.clone(), SmtSort::Int);
        Term::forall(
            qv,
            SmtSort::Int,
            self.flow_contains(lhs, qv_term.clone())
                .implies(self.flow_contains(rhs, qv_term)),
        )
    }

    /// Emptiness of a flow value.
    pub fn flow_empty(&self, flow: SymbolId) -> Term {
        let qv = self.fresh_qv();
        let qv_term = Term::var(qv.clone(), SmtSort::Int);
        Term::forall(qv, SmtSort::Int, self.flow_contains(flow, qv_term).not())
    }

    pub fn flow_nonempty(&self, flow: SymbolId) -> Term {
        self.flow_empty(flow).not()
    }

    pub fn encode_variable(&self, variable: VarId) -> Term {
        let decl = self.program.variable(variable);
        Term::var(format!("__{}", decl.name), SmtSort::from(decl.sort))
    }

    pub fn encode_symbolic(&self, expr: &SymbolicExpr, subst: &Subst) -> Term {
        match expr {
            SymbolicExpr::Symbol(symbol) => self.first_order_term(*symbol, subst),
            SymbolicExpr::Bool(value) => Term::bool(*value),
            SymbolicExpr::Null => Term::int(NULL_VALUE),
            SymbolicExpr::Min => Term::int(MIN_VALUE),
            SymbolicExpr::Max => Term::int(MAX_VALUE),
            SymbolicExpr::SelfTid => Term::int(SELF_TID),
            SymbolicExpr::SomeTid => Term::var(SOME_TID_NAME, SmtSort::Int),
            SymbolicExpr::Unlocked => Term::int(UNLOCKED),
        }
    }

    pub fn encode_null(&self) -> Term {
        Term::int(NULL_VALUE)
    }

    pub fn encode_non_null(&self, symbol: SymbolId) -> Term {
        self.first_order_term(symbol, &Subst::new())
            .neq(self.encode_null())
    }

    pub fn encode_is_null(&self, symbol: SymbolId) -> Term {
        self.first_order_term(symbol, &Subst::new())
            .eq(self.encode_null())
    }

    //
    // Axioms and formulas
    //

    fn encode_comparison(&self, op: BinaryOperator, lhs: Term, rhs: Term) -> Term {
        match op {
            BinaryOperator::Eq => lhs.eq(rhs),
            BinaryOperator::Neq => lhs.neq(rhs),
            BinaryOperator::Lt => lhs.lt(rhs),
            BinaryOperator::Leq => lhs.le(rhs),
            BinaryOperator::Gt => lhs.gt(rhs),
            BinaryOperator::Geq => lhs.ge(rhs),
        }
    }

    pub fn encode_axiom(&self, axiom: &Axiom, subst: &Subst) -> Term {
        match axiom {
            Axiom::LocalMemory(memory) | Axiom::SharedMemory(memory) => {
                // a held resource is a non-null cell
                self.first_order_term(memory.node, subst)
                    .neq(self.encode_null())
            }
            Axiom::EqualsTo { variable, value } => self
                .encode_variable(*variable)
                .eq(self.first_order_term(*value, subst)),
            Axiom::Stack { op, lhs, rhs } => {
                let flow_side = |side: &SymbolicExpr| {
                    side.symbol().filter(|symbol| symbol.order == Order::Second)
                };
                match (flow_side(lhs), flow_side(rhs)) {
                    (Some(left), Some(right)) => match op {
                        BinaryOperator::Eq => self.flow_equal(left, right),
                        BinaryOperator::Neq => self.flow_equal(left, right).not(),
                        _ => panic!(
                            "internal encoding error: ordered comparison of flow values"
                        ),
                    },
                    (None, None) => self.encode_comparison(
                        *op,
                        self.encode_symbolic(lhs, subst),
                        self.encode_symbolic(rhs, subst),
                    ),
                    _ => panic!(
                        "internal encoding error: comparison of a flow value with an individual"
                    ),
                }
            }
            Axiom::InflowEmptiness { flow, is_empty } => {
                if *is_empty {
                    self.flow_empty(*flow)
                } else {
                    self.flow_nonempty(*flow)
                }
            }
            Axiom::InflowContainsValue { flow, value } => {
                self.flow_contains(*flow, self.first_order_term(*value, subst))
            }
            Axiom::InflowContainsRange { flow, low, high } => {
                let qv = self.fresh_qv();
                let qv_term = Term::var(qv.clone(), SmtSort::Int);
                let low = self.encode_symbolic(low, subst);
                let high = self.encode_symbolic(high, subst);
                Term::forall(
                    qv,
                    SmtSort::Int,
                    Term::and(vec![low.le(qv_term.clone()), qv_term.clone().le(high)])
                        .implies(self.flow_contains(*flow, qv_term)),
                )
            }
            Axiom::Obligation { .. } | Axiom::Fulfillment { .. } => Term::bool(true),
        }
    }

    /// Encode a separating conjunction. Separation is made explicit for
    /// local resources: a local address is distinct from every other
    /// memory address in the formula.
    pub fn encode_formula(&self, formula: &Formula, subst: &Subst) -> Term {
        let mut conjuncts: Vec<Term> = formula
            .conjuncts
            .iter()
            .map(|axiom| self.encode_axiom(axiom, subst))
            .collect();
        let all_memory: Vec<&MemoryAxiom> = formula.memory().collect();
        for local in formula.local_memory() {
            for other in &all_memory {
                if std::ptr::eq(local, *other) {
                    continue;
                }
                conjuncts.push(
                    self.first_order_term(local.node, subst)
                        .neq(self.first_order_term(other.node, subst)),
                );
            }
        }
        Term::and(conjuncts)
    }

    pub fn encode_implication(&self, implication: &Implication, subst: &Subst) -> Term {
        self.encode_formula(&implication.premise, subst)
            .implies(self.encode_formula(&implication.conclusion, subst))
    }

    pub fn encode_implication_set(&self, set: &ImplicationSet, subst: &Subst) -> Term {
        Term::and(
            set.implications
                .iter()
                .map(|implication| self.encode_implication(implication, subst))
                .collect(),
        )
    }

    /// Instantiate and encode every configured invariant for the
    /// resources of `formula`.
    pub fn encode_invariants(&self, formula: &Formula) -> Term {
        let mut result = Vec::new();
        for axiom in &formula.conjuncts {
            match axiom {
                Axiom::LocalMemory(memory) => {
                    let invariant = self.config.local_node_invariant(memory);
                    result.push(self.encode_implication_set(&invariant, &Subst::new()));
                }
                Axiom::SharedMemory(memory) => {
                    let invariant = self.config.shared_node_invariant(memory);
                    result.push(self.encode_implication_set(&invariant, &Subst::new()));
                }
                Axiom::EqualsTo { variable, value } => {
                    if self.program.variable(*variable).is_shared {
                        let invariant = self.config.shared_variable_invariant(*variable, *value);
                        result.push(self.encode_implication_set(&invariant, &Subst::new()));
                    }
                }
                _ => {}
            }
        }
        Term::and(result)
    }

    /// Syntactic reachability between memory resources of a formula.
    pub fn formula_reachability(&self, formula: &Formula) -> HashMap<SymbolId, Vec<SymbolId>> {
        let mut reach: HashMap<SymbolId, Vec<SymbolId>> = HashMap::new();
        for memory in formula.memory() {
            let targets: Vec<SymbolId> = memory
                .fields
                .values()
                .filter(|value| value.sort == Sort::Ptr)
                .copied()
                .collect();
            reach.entry(memory.node).or_default().extend(targets);
        }
        loop {
            let mut changed = false;
            let addresses: Vec<SymbolId> = reach.keys().copied().collect();
            for address in addresses {
                let reached = reach[&address].clone();
                let mut additions = Vec::new();
                for target in &reached {
                    if let Some(transitive) = reach.get(target) {
                        for next in transitive {
                            if !reach[&address].contains(next) && !additions.contains(next) {
                                additions.push(*next);
                            }
                        }
                    }
                }
                if !additions.is_empty() {
                    changed = true;
                    reach.get_mut(&address).expect("present").extend(additions);
                }
            }
            if !changed {
                return reach;
            }
        }
    }

    /// The heap described by a state has no cycles: every reachability
    /// chain consists of pairwise distinct addresses.
    pub fn encode_acyclicity(&self, formula: &Formula) -> Term {
        let reach = self.formula_reachability(formula);
        let mut result = Vec::new();
        for (address, reached) in &reach {
            let mut chain = vec![self.first_order_term(*address, &Subst::new())];
            chain.extend(
                reached
                    .iter()
                    .map(|symbol| self.first_order_term(*symbol, &Subst::new())),
            );
            for (index, first) in chain.iter().enumerate() {
                for second in chain.iter().skip(index + 1) {
                    result.push(first.clone().neq(second.clone()));
                }
            }
        }
        Term::and(result)
    }

    /// Local resources are owned: their addresses differ from every
    /// shared variable, shared address, and shared pointer field.
    pub fn encode_ownership(&self, formula: &Formula) -> Term {
        let mut result = Vec::new();
        for local in formula.local_memory() {
            let address = self.first_order_term(local.node, &Subst::new());
            for axiom in &formula.conjuncts {
                match axiom {
                    Axiom::EqualsTo { variable, .. }
                        if self.program.variable(*variable).is_shared =>
                    {
                        result.push(address.clone().neq(self.encode_variable(*variable)));
                    }
                    Axiom::SharedMemory(shared) => {
                        result.push(
                            address
                                .clone()
                                .neq(self.first_order_term(shared.node, &Subst::new())),
                        );
                        for value in shared.fields.values() {
                            if value.sort != Sort::Ptr {
                                continue;
                            }
                            result.push(
                                address
                                    .clone()
                                    .neq(self.first_order_term(*value, &Subst::new())),
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
        Term::and(result)
    }

    /// Point-to-point flow propagation between adjacent resources: a
    /// value in a node's flow that its edge predicate forwards is in the
    /// successor's flow.
    pub fn encode_simple_flow_rules(&self, formula: &Formula) -> Term {
        let flow_sort = self.config.flow_sort();
        let value_symbols: Vec<SymbolId> = {
            let mut symbols: Vec<SymbolId> = formula
                .symbols()
                .into_iter()
                .filter(|symbol| symbol.order == Order::First && symbol.sort == flow_sort)
                .collect();
            symbols.sort();
            symbols.dedup();
            symbols
        };

        let memories: Vec<&MemoryAxiom> = formula.memory().collect();
        let mut result = Vec::new();
        for memory in &memories {
            for (field, value) in &memory.fields {
                if value.sort != Sort::Ptr {
                    continue;
                }
                for other in &memories {
                    if std::ptr::eq(*memory, *other) || *value != other.node {
                        continue;
                    }
                    for symbol in &value_symbols {
                        let forwarded = self.config.outflow_contains(memory, field, *symbol);
                        let rule = Term::and(vec![
                            self.flow_contains(
                                memory.flow,
                                self.first_order_term(*symbol, &Subst::new()),
                            ),
                            self.encode_implication_set(&forwarded, &Subst::new()),
                        ])
                        .implies(self.flow_contains(
                            other.flow,
                            self.first_order_term(*symbol, &Subst::new()),
                        ));
                        result.push(rule);
                    }
                }
            }
        }
        Term::and(result)
    }

    pub fn encode_formula_with_knowledge(&self, formula: &Formula) -> Term {
        Term::and(vec![
            self.encode_formula(formula, &Subst::new()),
            self.encode_invariants(formula),
            self.encode_simple_flow_rules(formula),
            self.encode_ownership(formula),
            self.encode_acyclicity(formula),
        ])
    }

    pub fn encode_annotation_with_knowledge(&self, annotation: &Annotation) -> Term {
        self.encode_formula_with_knowledge(&annotation.now)
    }

    /// Cell-wise equality of two memory resources of the same layout.
    pub fn encode_memory_equality(&self, memory: &MemoryAxiom, other: &MemoryAxiom) -> Term {
        let mut result = vec![
            self.first_order_term(memory.node, &Subst::new())
                .eq(self.first_order_term(other.node, &Subst::new())),
            self.flow_equal(memory.flow, other.flow),
        ];
        for (field, value) in &memory.fields {
            let matching = other.fields[field];
            if value.order == Order::Second {
                result.push(self.flow_equal(*value, matching));
            } else {
                result.push(
                    self.first_order_term(*value, &Subst::new())
                        .eq(self.first_order_term(matching, &Subst::new())),
                );
            }
        }
        Term::and(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::{indexmap, IndexMap};
    use remora_ir::logic::Formula;
    use remora_ir::program::{NodeType, Program, TypeId, VariableDecl};
    use remora_ir::symbols::SymbolFactory;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct NoopConfig;

    impl SolverConfig for NoopConfig {
        fn flow_sort(&self) -> Sort {
            Sort::Data
        }
        fn max_footprint_depth(&self, _ty: TypeId, _field: &str) -> usize {
            1
        }
        fn local_node_invariant(&self, _memory: &MemoryAxiom) -> ImplicationSet {
            ImplicationSet::new()
        }
        fn shared_node_invariant(&self, _memory: &MemoryAxiom) -> ImplicationSet {
            ImplicationSet::new()
        }
        fn shared_variable_invariant(&self, _variable: VarId, _value: SymbolId) -> ImplicationSet {
            ImplicationSet::new()
        }
        fn outflow_contains(
            &self,
            _memory: &MemoryAxiom,
            _field: &str,
            _value: SymbolId,
        ) -> ImplicationSet {
            ImplicationSet::new()
        }
        fn logically_contains(&self, _memory: &MemoryAxiom, _value: SymbolId) -> ImplicationSet {
            ImplicationSet::new()
        }
    }

    fn test_program() -> Program {
        Program {
            name: "test".into(),
            types: vec![NodeType {
                name: "Node".into(),
                fields: indexmap! {
                    "val".to_string() => Sort::Data,
                    "next".to_string() => Sort::Ptr,
                },
            }],
            variables: vec![VariableDecl {
                name: "head".into(),
                sort: Sort::Ptr,
                node_type: Some(TypeId(0)),
                is_shared: true,
            }],
            functions: Vec::new(),
        }
    }

    fn memory(factory: &mut SymbolFactory) -> MemoryAxiom {
        let node = factory.fresh_fo(Sort::Ptr);
        let flow = factory.fresh_so(Sort::Data);
        let mut fields = IndexMap::new();
        fields.insert("val".to_string(), factory.fresh_fo(Sort::Data));
        fields.insert("next".to_string(), factory.fresh_fo(Sort::Ptr));
        MemoryAxiom {
            node,
            node_type: TypeId(0),
            flow,
            fields,
        }
    }

    #[test]
    fn resources_entail_non_null_addresses() -> TestResult {
        let program = test_program();
        let config = NoopConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let mut factory = SymbolFactory::new();
        let cell = memory(&mut factory);
        let address = cell.node;

        let mut formula = Formula::new();
        formula.conjoin(Axiom::SharedMemory(cell));
        encoding.add_premise_formula(&formula)?;
        assert!(encoding.implies(&encoding.encode_non_null(address))?);
        Ok(())
    }

    #[test]
    fn local_memory_is_separated() -> TestResult {
        let program = test_program();
        let config = NoopConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let mut factory = SymbolFactory::new();
        let local = memory(&mut factory);
        let shared = memory(&mut factory);
        let (local_addr, shared_addr) = (local.node, shared.node);

        let mut formula = Formula::new();
        formula.conjoin(Axiom::LocalMemory(local));
        formula.conjoin(Axiom::SharedMemory(shared));
        encoding.add_premise_formula(&formula)?;

        let distinct = encoding
            .encode_symbol(local_addr)
            .term()
            .neq(encoding.encode_symbol(shared_addr).term());
        assert!(encoding.implies(&distinct)?);
        Ok(())
    }

    #[test]
    fn inflow_range_entails_membership() -> TestResult {
        let program = test_program();
        let config = NoopConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let mut factory = SymbolFactory::new();
        let flow = factory.fresh_so(Sort::Data);
        let key = factory.fresh_fo(Sort::Data);

        let mut formula = Formula::new();
        formula.conjoin(Axiom::InflowContainsRange {
            flow,
            low: SymbolicExpr::Min,
            high: SymbolicExpr::Max,
        });
        encoding.add_premise_formula(&formula)?;

        let member =
            encoding.flow_contains(flow, encoding.encode_symbol(key).term());
        assert!(encoding.implies(&member)?);
        Ok(())
    }

    #[test]
    fn flow_expression_misuse_panics() {
        let program = test_program();
        let config = NoopConfig;
        let encoding = Encoding::new(&program, &config).expect("encoding");
        let mut factory = SymbolFactory::new();
        let flow = factory.fresh_so(Sort::Data);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            encoding.encode_symbol(flow).term()
        }));
        assert!(result.is_err());
    }

    #[test]
    fn scoped_premises_are_replayed_consistently() -> TestResult {
        let program = test_program();
        let config = NoopConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let x = Term::var("x", SmtSort::Int);
        encoding.add_premise(x.clone().gt(Term::int(0)))?;

        encoding.push();
        encoding.add_premise(x.clone().gt(Term::int(10)))?;
        assert!(encoding.implies(&x.clone().gt(Term::int(5)))?);
        encoding.pop();

        assert!(!encoding.implies(&x.gt(Term::int(5)))?);
        Ok(())
    }

    #[test]
    fn batched_checks_resolve_together() -> TestResult {
        let program = test_program();
        let config = NoopConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let x = Term::var("x", SmtSort::Int);
        encoding.add_premise(x.clone().gt(Term::int(3)))?;

        let yes = encoding.add_check(x.clone().gt(Term::int(0)));
        let no = encoding.add_check(x.clone().gt(Term::int(7)));
        let results = encoding.run_checks()?;
        assert!(results[yes.0]);
        assert!(!results[no.0]);
        Ok(())
    }

    #[test]
    fn compute_non_null_filters_pointers() -> TestResult {
        let program = test_program();
        let config = NoopConfig;
        let mut encoding = Encoding::new(&program, &config)?;
        let mut factory = SymbolFactory::new();
        let proven = factory.fresh_fo(Sort::Ptr);
        let unknown = factory.fresh_fo(Sort::Ptr);
        let data = factory.fresh_fo(Sort::Data);

        encoding.add_premise(encoding.encode_non_null(proven))?;
        let result = encoding.compute_non_null(vec![proven, unknown, data])?;
        assert_eq!(result, vec![proven]);
        Ok(())
    }
}
