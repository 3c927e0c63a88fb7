//! Proof search: symbolic execution of every API function under the
//! current interference set, iterated until the interference stabilizes.

use std::collections::HashMap;

use remora_ir::config::SolverConfig;
use remora_ir::logic::{
    rename_annotation, Annotation, Axiom, HeapEffect, Specification, SymbolicExpr,
};
use remora_ir::program::{
    BinaryOperator, Command, Function, FunctionKind, Program, SimpleExpr, Statement, VarId,
};
use tracing::{debug, info};

use crate::config::EngineSetup;
use crate::error::{Result, VerificationError};
use crate::solver::Solver;

/// A state that reached a `return`, together with the returned
/// expressions (`None` for a fall-through in a void function).
type Returning<'a> = (Annotation, Option<&'a [SimpleExpr]>);

pub struct ProofGenerator<'a> {
    program: &'a Program,
    setup: &'a EngineSetup,
    solver: Solver<'a>,
    new_interference: Vec<HeapEffect>,
    current: Vec<Annotation>,
    breaking: Vec<Annotation>,
    returning: Vec<Returning<'a>>,
    inside_atomic: bool,
    /// Macro results per canonicalized entry state, cleared every outer
    /// iteration.
    macro_cache: HashMap<(String, String), (Vec<Annotation>, Vec<HeapEffect>)>,
}

impl<'a> ProofGenerator<'a> {
    pub fn new(program: &'a Program, config: &'a dyn SolverConfig, setup: &'a EngineSetup) -> Self {
        ProofGenerator {
            program,
            setup,
            solver: Solver::new(program, config, setup),
            new_interference: Vec::new(),
            current: Vec::new(),
            breaking: Vec::new(),
            returning: Vec::new(),
            inside_atomic: false,
            macro_cache: HashMap::new(),
        }
    }

    /// Run the outer fixpoint: prove every API function against the
    /// current interference set, fold the newly discovered effects in,
    /// and repeat until nothing grows.
    pub fn generate(&mut self) -> Result<()> {
        let program = self.program;
        for iteration in 0..self.setup.proof_max_iterations {
            info!(iteration, "proof iteration");
            self.macro_cache.clear();
            for function in program.api_functions() {
                self.prove_function(function)?;
            }
            let effects = std::mem::take(&mut self.new_interference);
            if !self.solver.add_interference(effects)? {
                info!("interference set is stable; proof complete");
                if let Ok(json) = crate::dump::effects_to_json(self.solver.interference()) {
                    debug!(interference = %json, "consolidated interference set");
                }
                return Ok(());
            }
        }
        Err(VerificationError::InterferenceNonStabilizing {
            iterations: self.setup.proof_max_iterations,
        })
    }

    //
    // Interface functions
    //

    fn prove_function(&mut self, function: &'a Function) -> Result<()> {
        info!(function = %function.name, "checking function");
        self.inside_atomic = false;
        self.current.clear();
        self.breaking.clear();
        self.returning.clear();

        let entry = self.entry_annotation(function)?;
        self.current.push(entry);
        self.execute(&function.body)?;

        // fall-through paths
        let leftover = std::mem::take(&mut self.current);
        if !leftover.is_empty() && !function.returns.is_empty() {
            return Err(VerificationError::unsupported(format!(
                "non-returning path through non-void function '{}'",
                function.name
            )));
        }
        for annotation in leftover {
            self.returning.push((annotation, None));
        }

        // prune unreachable return paths
        let mut reachable = Vec::new();
        for entry in std::mem::take(&mut self.returning) {
            if !self.solver.is_unsatisfiable(&entry.0)? {
                reachable.push(entry);
            }
        }

        if function.kind == FunctionKind::Maintenance {
            return Ok(());
        }

        for (annotation, returned) in reachable {
            if self.is_fulfilled(&annotation, returned)? {
                continue;
            }
            // one retry absorbs solver nondeterminism
            let mut improved = annotation;
            let mut discharged = false;
            for _ in 0..2 {
                self.solver.improve_past(&mut improved)?;
                improved = self.solver.try_add_fulfillment(improved)?;
                if self.is_fulfilled(&improved, returned)? {
                    discharged = true;
                    break;
                }
            }
            if !discharged {
                return Err(VerificationError::LinearizationNotFound {
                    function: function.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Entry state: shared variables and parameters bound, the search
    /// key bounded to the open key space, and the linearizability
    /// obligation attached (maintenance functions carry none).
    fn entry_annotation(&mut self, function: &'a Function) -> Result<Annotation> {
        let mut annotation = Annotation::new();
        annotation = self.solver.post_enter_program(annotation)?;
        annotation = self.solver.post_enter_function(annotation, function)?;

        if function.kind == FunctionKind::Maintenance {
            return Ok(annotation);
        }

        let spec = Specification::for_function(&function.name).ok_or_else(|| {
            VerificationError::unsupported(format!(
                "specification for function '{}' unknown, expected one of: \
                 'contains', 'insert', 'add', 'delete', 'remove'",
                function.name
            ))
        })?;
        let &[parameter] = &function.parameters[..] else {
            return Err(VerificationError::unsupported(format!(
                "expected one parameter to function '{}'",
                function.name
            )));
        };
        let key = annotation
            .now
            .value_of(parameter)
            .ok_or_else(|| VerificationError::internal("search key has no binding"))?;
        annotation.conjoin(Axiom::stack(
            BinaryOperator::Lt,
            SymbolicExpr::Min,
            SymbolicExpr::Symbol(key),
        ));
        annotation.conjoin(Axiom::stack(
            BinaryOperator::Lt,
            SymbolicExpr::Symbol(key),
            SymbolicExpr::Max,
        ));
        annotation.conjoin(Axiom::Obligation { spec, key });
        Ok(annotation)
    }

    fn is_fulfilled(
        &self,
        annotation: &Annotation,
        returned: Option<&[SimpleExpr]>,
    ) -> Result<bool> {
        let Some(expressions) = returned else {
            return Ok(true); // nothing to certify on a void return
        };
        let [expression] = expressions else {
            return Err(VerificationError::unsupported(
                "multi-value returns from API functions",
            ));
        };
        let value = match expression {
            SimpleExpr::True => true,
            SimpleExpr::False => false,
            SimpleExpr::Var(variable) => {
                let Some(symbol) = annotation.now.value_of(*variable) else {
                    return Err(VerificationError::internal("returned variable unbound"));
                };
                let literal = annotation.now.conjuncts.iter().find_map(|axiom| match axiom {
                    Axiom::Stack {
                        op: BinaryOperator::Eq,
                        lhs: SymbolicExpr::Symbol(s),
                        rhs: SymbolicExpr::Bool(b),
                    } if *s == symbol => Some(*b),
                    _ => None,
                });
                match literal {
                    Some(value) => value,
                    None => {
                        return Err(VerificationError::unsupported(
                            "cannot detect returned boolean value",
                        ))
                    }
                }
            }
            _ => {
                return Err(VerificationError::unsupported(
                    "cannot detect returned boolean value",
                ))
            }
        };
        Ok(annotation.now.fulfillments().any(|v| v == value))
    }

    //
    // Statements
    //

    fn execute(&mut self, statement: &'a Statement) -> Result<()> {
        match statement {
            Statement::Sequence(statements) => {
                for statement in statements {
                    self.execute(statement)?;
                }
                Ok(())
            }
            Statement::Scope(scope) => {
                self.transform(|solver, annotation| solver.post_enter_scope(annotation, scope))?;
                self.execute(&scope.body)?;
                self.transform(|solver, annotation| {
                    Ok(solver.post_leave_scope(annotation, scope))
                })
            }
            Statement::Atomic(body) => {
                let was_atomic = self.inside_atomic;
                self.inside_atomic = true;
                self.execute(body)?;
                self.inside_atomic = was_atomic;
                self.stabilize()
            }
            Statement::Choice(branches) => self.execute_choice(branches),
            Statement::Loop(body) => self.execute_loop(body),
            Statement::Command(command) => self.execute_command(command),
        }
    }

    fn execute_choice(&mut self, branches: &'a [Statement]) -> Result<()> {
        if branches.is_empty() {
            return Ok(());
        }
        let pre = std::mem::take(&mut self.current);
        let mut post = Vec::new();
        for branch in branches {
            self.current = pre.clone();
            self.execute(branch)?;
            post.append(&mut self.current);
        }
        self.current = post;
        Ok(())
    }

    fn execute_loop(&mut self, body: &'a Statement) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }

        // peel the first iteration
        let breaking_outer = std::mem::take(&mut self.breaking);
        self.execute(body)?;
        let first_breaking = std::mem::take(&mut self.breaking);
        let mut returning_outer = std::mem::take(&mut self.returning);
        let mut interference_outer = std::mem::take(&mut self.new_interference);

        // loop until the join stabilizes
        if !self.current.is_empty() {
            let mut join = self.solver.join(std::mem::take(&mut self.current))?;
            let mut iteration = 0;
            loop {
                if iteration >= self.setup.loop_max_iterations {
                    return Err(VerificationError::LoopNonStabilizing {
                        iterations: self.setup.loop_max_iterations,
                    });
                }
                iteration += 1;
                debug!(iteration, "loop join iteration");

                self.breaking.clear();
                self.returning.clear();
                self.new_interference.clear();
                self.current = vec![join.clone()];
                self.execute(body)?;
                self.current.push(join.clone());

                let mut next = self.solver.join(std::mem::take(&mut self.current))?;
                if iteration >= 3 {
                    // force convergence on slow loops
                    next = self.solver.widen(next)?;
                }
                if self.solver.implies(&next, &join)? {
                    break;
                }
                join = next;
            }
        }

        // the post-loop states are the break states
        self.current = first_breaking;
        self.current.append(&mut self.breaking);
        self.breaking = breaking_outer;
        returning_outer.append(&mut self.returning);
        self.returning = returning_outer;
        interference_outer.append(&mut self.new_interference);
        self.new_interference = interference_outer;
        Ok(())
    }

    fn execute_command(&mut self, command: &'a Command) -> Result<()> {
        match command {
            Command::Skip => Ok(()),
            Command::Break => {
                self.breaking.append(&mut self.current);
                Ok(())
            }
            Command::Return(expressions) => {
                for annotation in std::mem::take(&mut self.current) {
                    self.returning.push((annotation, Some(expressions)));
                }
                Ok(())
            }
            Command::Call {
                function,
                arguments,
                results,
            } => self.execute_macro(function, arguments, results),
            _ => {
                self.apply_post(command)?;
                if !is_right_mover(command) {
                    self.stabilize()?;
                }
                Ok(())
            }
        }
    }

    fn apply_post(&mut self, command: &Command) -> Result<()> {
        let mut next = Vec::new();
        for annotation in std::mem::take(&mut self.current) {
            let mut image = self.solver.post(annotation, command)?;
            next.append(&mut image.annotations);
            self.new_interference.append(&mut image.effects);
        }
        self.current = next;
        Ok(())
    }

    fn stabilize(&mut self) -> Result<()> {
        if self.inside_atomic || self.current.is_empty() {
            return Ok(());
        }
        let mut next = Vec::new();
        for annotation in std::mem::take(&mut self.current) {
            next.push(self.solver.make_interference_stable(annotation)?);
        }
        self.current = next;
        Ok(())
    }

    fn transform(
        &mut self,
        mut step: impl FnMut(&mut Solver<'a>, Annotation) -> Result<Annotation>,
    ) -> Result<()> {
        let mut next = Vec::new();
        for annotation in std::mem::take(&mut self.current) {
            next.push(step(&mut self.solver, annotation)?);
        }
        self.current = next;
        Ok(())
    }

    //
    // Macros
    //

    fn execute_macro(
        &mut self,
        name: &str,
        arguments: &'a [SimpleExpr],
        results: &[VarId],
    ) -> Result<()> {
        let callee = self.program.function(name).ok_or_else(|| {
            VerificationError::unsupported(format!("call to unknown function '{name}'"))
        })?;
        if callee.kind != FunctionKind::Macro {
            return Err(VerificationError::unsupported(format!(
                "call to non-macro function '{name}'"
            )));
        }

        let mut next = Vec::new();
        for mut annotation in std::mem::take(&mut self.current) {
            if self.setup.macros_tabulate_invocations {
                rename_annotation(&mut annotation, &mut self.solver.factory);
                let key = (name.to_string(), tabulation_key(&annotation)?);
                if let Some((cached_states, cached_effects)) = self.macro_cache.get(&key) {
                    debug!(name, "macro invocation served from the tabulation cache");
                    next.extend(cached_states.iter().cloned());
                    self.new_interference.extend(cached_effects.iter().cloned());
                    continue;
                }
                let interference_before = self.new_interference.len();
                let states =
                    self.run_macro_body(callee, annotation.clone(), arguments, results)?;
                let effects = self.new_interference[interference_before..].to_vec();
                self.macro_cache.insert(key, (states.clone(), effects));
                next.extend(states);
            } else {
                next.extend(self.run_macro_body(callee, annotation, arguments, results)?);
            }
        }
        self.current = next;
        Ok(())
    }

    /// Inline one macro invocation for one entry state.
    fn run_macro_body(
        &mut self,
        callee: &'a Function,
        annotation: Annotation,
        arguments: &'a [SimpleExpr],
        results: &[VarId],
    ) -> Result<Vec<Annotation>> {
        let breaking_outer = std::mem::take(&mut self.breaking);
        let returning_outer = std::mem::take(&mut self.returning);
        let current_outer = std::mem::take(&mut self.current);

        self.current = vec![annotation];
        self.transform(|solver, annotation| solver.post_enter_function(annotation, callee))?;
        self.apply_post(&Command::VariableAssignment {
            lhs: callee.parameters.clone(),
            rhs: arguments.to_vec(),
        })?;
        self.execute(&callee.body)?;

        // returned states resume the caller
        let mut resumed = Vec::new();
        for annotation in std::mem::take(&mut self.current) {
            resumed.push((annotation, None));
        }
        resumed.extend(std::mem::take(&mut self.returning));
        let mut finished = Vec::new();
        for (state, returned) in resumed {
            self.current = vec![state];
            if let (false, Some(expressions)) = (results.is_empty(), returned) {
                self.apply_post(&Command::VariableAssignment {
                    lhs: results.to_vec(),
                    rhs: expressions.to_vec(),
                })?;
            }
            self.transform(|solver, annotation| {
                Ok(solver.post_leave_function(annotation, callee))
            })?;
            finished.append(&mut self.current);
        }

        self.breaking = breaking_outer;
        self.returning = returning_outer;
        self.current = current_outer;
        Ok(finished)
    }
}

/// Commands that commute to the right of interference: they touch only
/// this thread's stack, so no stabilization is needed after them.
fn is_right_mover(command: &Command) -> bool {
    matches!(
        command,
        Command::Skip
            | Command::Break
            | Command::Return(_)
            | Command::Assume(_)
            | Command::Assert(_)
            | Command::Malloc { .. }
            | Command::VariableAssignment { .. }
    )
}

/// Canonical serialization of a state, the tabulation cache key.
fn tabulation_key(annotation: &Annotation) -> Result<String> {
    serde_json::to_string(annotation)
        .map_err(|err| VerificationError::internal(format!("cannot serialize state: {err}")))
}
