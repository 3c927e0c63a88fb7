use std::collections::HashMap;

use thiserror::Error;
use z3::SatResult as Z3SatResult;

use crate::sorts::SmtSort;
use crate::terms::{Term, MAX_VALUE, MIN_VALUE};

/// Result of a satisfiability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatResult {
    Sat,
    Unsat,
    Unknown,
}

#[derive(Debug, Error)]
pub enum SmtError {
    /// The backend could not prove or disprove satisfiability.
    #[error("solver returned unknown while {context}")]
    Unknown { context: String },
    /// Sort confusion or malformed term; a programming error upstream.
    #[error("internal encoding error: {0}")]
    Internal(String),
}

impl SmtError {
    pub fn unknown(context: impl Into<String>) -> SmtError {
        SmtError::Unknown {
            context: context.into(),
        }
    }
}

enum Z3Term {
    Int(z3::ast::Int),
    Bool(z3::ast::Bool),
}

impl Z3Term {
    fn into_int(self) -> Result<z3::ast::Int, SmtError> {
        match self {
            Z3Term::Int(term) => Ok(term),
            Z3Term::Bool(_) => Err(SmtError::Internal("expected Int, got Bool".into())),
        }
    }

    fn into_bool(self) -> Result<z3::ast::Bool, SmtError> {
        match self {
            Z3Term::Bool(term) => Ok(term),
            Z3Term::Int(_) => Err(SmtError::Internal("expected Bool, got Int".into())),
        }
    }
}

/// One Z3 solver with lazy constant/function declaration.
///
/// Not reentrant: a solver instance owns exactly one context and must
/// not be shared across concurrent callers. The parallel batch layer
/// spawns one instance per worker instead.
pub struct SmtSolver {
    solver: z3::Solver,
    int_consts: HashMap<String, z3::ast::Int>,
    bool_consts: HashMap<String, z3::ast::Bool>,
    flow_funcs: HashMap<String, z3::FuncDecl>,
    /// Names declared per open scope; popped declarations are evicted so
    /// their implicit bound assertions are re-issued on redeclaration.
    scope_decls: Vec<Vec<String>>,
}

impl Default for SmtSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SmtSolver {
    pub fn new() -> Self {
        SmtSolver {
            solver: z3::Solver::new(),
            int_consts: HashMap::new(),
            bool_consts: HashMap::new(),
            flow_funcs: HashMap::new(),
            scope_decls: Vec::new(),
        }
    }

    fn record_declaration(&mut self, name: &str) {
        if let Some(scope) = self.scope_decls.last_mut() {
            scope.push(name.to_string());
        }
    }

    fn int_const(&mut self, name: &str, sort: SmtSort) -> z3::ast::Int {
        if let Some(existing) = self.int_consts.get(name) {
            return existing.clone();
        }
        let constant = z3::ast::Int::new_const(name);
        // Data constants live in the bounded key space.
        if sort == SmtSort::Data {
            self.solver
                .assert(&z3::ast::Int::from_i64(MIN_VALUE).le(&constant));
            self.solver
                .assert(&constant.le(&z3::ast::Int::from_i64(MAX_VALUE)));
        }
        self.int_consts.insert(name.to_string(), constant.clone());
        self.record_declaration(name);
        constant
    }

    fn bool_const(&mut self, name: &str) -> z3::ast::Bool {
        if let Some(existing) = self.bool_consts.get(name) {
            return existing.clone();
        }
        let constant = z3::ast::Bool::new_const(name);
        self.bool_consts.insert(name.to_string(), constant.clone());
        self.record_declaration(name);
        constant
    }

    fn flow_func(&mut self, name: &str) -> z3::FuncDecl {
        if let Some(existing) = self.flow_funcs.get(name) {
            return existing.clone();
        }
        let func = z3::FuncDecl::new(name, &[&z3::Sort::int()], &z3::Sort::bool());
        // Flow members live in the bounded key space as well.
        let qv = z3::ast::Int::new_const(format!("{name}!bound"));
        let member = func
            .apply(&[&qv])
            .as_bool()
            .expect("flow function ranges over Bool");
        let below = qv.lt(&z3::ast::Int::from_i64(MIN_VALUE));
        let above = qv.gt(&z3::ast::Int::from_i64(MAX_VALUE));
        let outside = z3::ast::Bool::or(&[&below, &above]);
        let rule = z3::ast::forall_const(&[&qv], &[], &outside.implies(&member.not()));
        self.solver.assert(&rule);
        self.flow_funcs.insert(name.to_string(), func.clone());
        self.record_declaration(name);
        func
    }

    fn translate(&mut self, term: &Term) -> Result<Z3Term, SmtError> {
        match term {
            Term::Var(name, sort) => match sort {
                SmtSort::Bool => Ok(Z3Term::Bool(self.bool_const(name))),
                SmtSort::Int | SmtSort::Data => Ok(Z3Term::Int(self.int_const(name, *sort))),
            },
            Term::IntLit(value) => Ok(Z3Term::Int(z3::ast::Int::from_i64(*value))),
            Term::BoolLit(value) => Ok(Z3Term::Bool(z3::ast::Bool::from_bool(*value))),
            Term::Eq(lhs, rhs) => {
                let lhs = self.translate(lhs)?;
                let rhs = self.translate(rhs)?;
                match (lhs, rhs) {
                    (Z3Term::Int(l), Z3Term::Int(r)) => Ok(Z3Term::Bool(l.eq(&r))),
                    (Z3Term::Bool(l), Z3Term::Bool(r)) => Ok(Z3Term::Bool(l.eq(&r))),
                    _ => Err(SmtError::Internal("sort mismatch in equality".into())),
                }
            }
            Term::Lt(lhs, rhs) => {
                let l = self.translate(lhs)?.into_int()?;
                let r = self.translate(rhs)?.into_int()?;
                Ok(Z3Term::Bool(l.lt(&r)))
            }
            Term::Le(lhs, rhs) => {
                let l = self.translate(lhs)?.into_int()?;
                let r = self.translate(rhs)?.into_int()?;
                Ok(Z3Term::Bool(l.le(&r)))
            }
            Term::Gt(lhs, rhs) => {
                let l = self.translate(lhs)?.into_int()?;
                let r = self.translate(rhs)?.into_int()?;
                Ok(Z3Term::Bool(l.gt(&r)))
            }
            Term::Ge(lhs, rhs) => {
                let l = self.translate(lhs)?.into_int()?;
                let r = self.translate(rhs)?.into_int()?;
                Ok(Z3Term::Bool(l.ge(&r)))
            }
            Term::And(terms) => {
                let bools = self.translate_bools(terms)?;
                let refs: Vec<&z3::ast::Bool> = bools.iter().collect();
                Ok(Z3Term::Bool(z3::ast::Bool::and(&refs)))
            }
            Term::Or(terms) => {
                let bools = self.translate_bools(terms)?;
                let refs: Vec<&z3::ast::Bool> = bools.iter().collect();
                Ok(Z3Term::Bool(z3::ast::Bool::or(&refs)))
            }
            Term::Not(inner) => {
                let inner = self.translate(inner)?.into_bool()?;
                Ok(Z3Term::Bool(inner.not()))
            }
            Term::Implies(lhs, rhs) => {
                let l = self.translate(lhs)?.into_bool()?;
                let r = self.translate(rhs)?.into_bool()?;
                Ok(Z3Term::Bool(l.implies(&r)))
            }
            Term::AtMostOne(terms) => {
                let bools = self.translate_bools(terms)?;
                let mut pairs = Vec::new();
                for (index, first) in bools.iter().enumerate() {
                    for second in bools.iter().skip(index + 1) {
                        pairs.push(z3::ast::Bool::and(&[first, second]).not());
                    }
                }
                let refs: Vec<&z3::ast::Bool> = pairs.iter().collect();
                Ok(Z3Term::Bool(z3::ast::Bool::and(&refs)))
            }
            Term::Apply(function, argument) => {
                let argument = self.translate(argument)?.into_int()?;
                let func = self.flow_func(function);
                let applied = func
                    .apply(&[&argument])
                    .as_bool()
                    .ok_or_else(|| SmtError::Internal("flow application is not Bool".into()))?;
                Ok(Z3Term::Bool(applied))
            }
            Term::Forall(binder, sort, body) => {
                let qv = self.int_const_unbounded(binder, *sort);
                let body = self.translate(body)?.into_bool()?;
                Ok(Z3Term::Bool(z3::ast::forall_const(&[&qv], &[], &body)))
            }
            Term::Exists(binder, sort, body) => {
                let qv = self.int_const_unbounded(binder, *sort);
                let body = self.translate(body)?.into_bool()?;
                Ok(Z3Term::Bool(z3::ast::exists_const(&[&qv], &[], &body)))
            }
        }
    }

    /// Bound variables are plain constants closed over by the quantifier;
    /// they must not pick up the global Data bounds.
    fn int_const_unbounded(&mut self, name: &str, sort: SmtSort) -> z3::ast::Int {
        debug_assert_ne!(sort, SmtSort::Bool, "quantified flow members are Int");
        if let Some(existing) = self.int_consts.get(name) {
            return existing.clone();
        }
        let constant = z3::ast::Int::new_const(name);
        self.int_consts.insert(name.to_string(), constant.clone());
        self.record_declaration(name);
        constant
    }

    fn translate_bools(&mut self, terms: &[Term]) -> Result<Vec<z3::ast::Bool>, SmtError> {
        terms
            .iter()
            .map(|term| self.translate(term).and_then(Z3Term::into_bool))
            .collect()
    }

    pub fn assert(&mut self, term: &Term) -> Result<(), SmtError> {
        let translated = self.translate(term)?.into_bool()?;
        self.solver.assert(&translated);
        Ok(())
    }

    pub fn push(&mut self) {
        self.solver.push();
        self.scope_decls.push(Vec::new());
    }

    pub fn pop(&mut self) {
        self.solver.pop(1);
        if let Some(declared) = self.scope_decls.pop() {
            for name in declared {
                self.int_consts.remove(&name);
                self.bool_consts.remove(&name);
                self.flow_funcs.remove(&name);
            }
        }
    }

    pub fn check(&mut self) -> SatResult {
        match self.solver.check() {
            Z3SatResult::Sat => SatResult::Sat,
            Z3SatResult::Unsat => SatResult::Unsat,
            Z3SatResult::Unknown => SatResult::Unknown,
        }
    }

    /// Whether the current assertions entail `term`.
    pub fn is_implied(&mut self, term: &Term) -> Result<bool, SmtError> {
        self.push();
        let result = (|| {
            self.assert(&term.clone().not())?;
            match self.check() {
                SatResult::Unsat => Ok(true),
                SatResult::Sat => Ok(false),
                SatResult::Unknown => Err(SmtError::unknown("checking implication")),
            }
        })();
        self.pop();
        result
    }

    /// Model value of a boolean constant after a `Sat` check, with model
    /// completion for don't-cares.
    pub fn model_bool(&self, name: &str) -> Option<bool> {
        let constant = self.bool_consts.get(name)?;
        let model = self.solver.get_model()?;
        model.eval::<z3::ast::Bool>(constant, true)?.as_bool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn basic_sat_and_unsat() -> TestResult {
        let mut solver = SmtSolver::new();
        let x = Term::var("x", SmtSort::Int);
        solver.assert(&x.clone().gt(Term::int(0)))?;
        assert_eq!(solver.check(), SatResult::Sat);

        solver.push();
        solver.assert(&x.lt(Term::int(0)))?;
        assert_eq!(solver.check(), SatResult::Unsat);
        solver.pop();
        assert_eq!(solver.check(), SatResult::Sat);
        Ok(())
    }

    #[test]
    fn implication_via_negation() -> TestResult {
        let mut solver = SmtSolver::new();
        let x = Term::var("x", SmtSort::Int);
        solver.assert(&x.clone().gt(Term::int(10)))?;
        assert!(solver.is_implied(&x.clone().gt(Term::int(5)))?);
        assert!(!solver.is_implied(&x.gt(Term::int(20)))?);
        Ok(())
    }

    #[test]
    fn data_constants_are_bounded() -> TestResult {
        let mut solver = SmtSolver::new();
        let key = Term::var("k", SmtSort::Data);
        assert!(solver.is_implied(&key.clone().le(Term::int(MAX_VALUE)))?);
        assert!(solver.is_implied(&key.ge(Term::int(MIN_VALUE)))?);
        Ok(())
    }

    #[test]
    fn popped_declarations_keep_their_bounds_on_redeclare() -> TestResult {
        let mut solver = SmtSolver::new();
        solver.push();
        let key = Term::var("k", SmtSort::Data);
        assert!(solver.is_implied(&key.clone().le(Term::int(MAX_VALUE)))?);
        solver.pop();
        // redeclared in the outer scope, bounds must be re-issued
        assert!(solver.is_implied(&key.le(Term::int(MAX_VALUE)))?);
        Ok(())
    }

    #[test]
    fn flow_membership_and_extensionality() -> TestResult {
        let mut solver = SmtSolver::new();
        let member = Term::apply("F0", Term::var("d0", SmtSort::Data));
        solver.assert(&member.clone())?;
        assert!(solver.is_implied(&member)?);

        // F0 and F1 agree everywhere -> membership transfers
        let qv = Term::var("q0", SmtSort::Int);
        let agree = Term::forall(
            "q0",
            SmtSort::Int,
            Term::apply("F0", qv.clone()).eq(Term::apply("F1", qv)),
        );
        solver.assert(&agree)?;
        assert!(solver.is_implied(&Term::apply("F1", Term::var("d0", SmtSort::Data)))?);
        Ok(())
    }

    #[test]
    fn flow_members_are_bounded() -> TestResult {
        let mut solver = SmtSolver::new();
        let out_of_range = Term::apply("F7", Term::int(MAX_VALUE + 1));
        assert!(solver.is_implied(&out_of_range.not())?);
        Ok(())
    }

    #[test]
    fn at_most_one_is_pairwise() -> TestResult {
        let mut solver = SmtSolver::new();
        let a = Term::var("a", SmtSort::Bool);
        let b = Term::var("b", SmtSort::Bool);
        let c = Term::var("c", SmtSort::Bool);
        solver.assert(&Term::at_most_one(vec![a.clone(), b.clone(), c.clone()]))?;
        solver.assert(&a)?;
        assert!(solver.is_implied(&b.clone().not())?);
        assert!(solver.is_implied(&c.not())?);
        Ok(())
    }

    #[test]
    fn model_bool_reports_witness_values() -> TestResult {
        let mut solver = SmtSolver::new();
        let a = Term::var("a", SmtSort::Bool);
        solver.assert(&a)?;
        assert_eq!(solver.check(), SatResult::Sat);
        assert_eq!(solver.model_bool("a"), Some(true));
        Ok(())
    }
}
