//! Abstract transfer: post images per command, joins, widening,
//! interference folding, and fulfillment search.

mod access;
mod fulfillment;
mod interference;
mod join;
mod write;

use remora_ir::config::SolverConfig;
use remora_ir::logic::{
    Annotation, Axiom, HeapEffect, PostImage, SymbolicExpr,
};
use remora_ir::program::{
    Command, Condition, Dereference, Function, Program, Scope, SimpleExpr, VarId,
};
use remora_ir::symbols::{Sort, SymbolFactory, SymbolId};
use remora_smt::encoding::Encoding;
use tracing::debug;

use crate::config::EngineSetup;
use crate::error::{Result, VerificationError};
use crate::footprint::evaluate_simple;

/// The per-command reasoning engine. Owns the run-wide symbol factory
/// and the recorded interference set.
pub struct Solver<'a> {
    pub(crate) program: &'a Program,
    pub(crate) config: &'a dyn SolverConfig,
    pub(crate) setup: &'a EngineSetup,
    pub(crate) factory: SymbolFactory,
    pub(crate) interference: Vec<HeapEffect>,
}

impl<'a> Solver<'a> {
    pub fn new(program: &'a Program, config: &'a dyn SolverConfig, setup: &'a EngineSetup) -> Self {
        Solver {
            program,
            config,
            setup,
            factory: SymbolFactory::new(),
            interference: Vec::new(),
        }
    }

    pub fn interference(&self) -> &[HeapEffect] {
        &self.interference
    }

    fn encoding_for(&self, annotation: &Annotation) -> Result<Encoding<'a>> {
        let mut encoding = Encoding::new(self.program, self.config)?;
        encoding.add_premise_with_knowledge(&annotation.now)?;
        Ok(encoding)
    }

    //
    // Scope transitions
    //

    /// Bind every shared variable on entering the program.
    pub fn post_enter_program(&mut self, mut annotation: Annotation) -> Result<Annotation> {
        let shared: Vec<VarId> = self.program.shared_variables().collect();
        for variable in shared {
            let sort = self.program.variable(variable).sort;
            let value = self.factory.fresh_fo(sort);
            annotation.conjoin(Axiom::EqualsTo { variable, value });
        }
        Ok(annotation)
    }

    /// Bind the parameters of a function on entry.
    pub fn post_enter_function(
        &mut self,
        mut annotation: Annotation,
        function: &Function,
    ) -> Result<Annotation> {
        for &variable in &function.parameters {
            let sort = self.program.variable(variable).sort;
            let value = self.factory.fresh_fo(sort);
            annotation.conjoin(Axiom::EqualsTo { variable, value });
        }
        Ok(annotation)
    }

    /// Bind the locals of a scope on entry.
    pub fn post_enter_scope(
        &mut self,
        mut annotation: Annotation,
        scope: &Scope,
    ) -> Result<Annotation> {
        for &variable in &scope.locals {
            let sort = self.program.variable(variable).sort;
            let value = self.factory.fresh_fo(sort);
            annotation.conjoin(Axiom::EqualsTo { variable, value });
        }
        Ok(annotation)
    }

    /// Discharge the bindings of a scope's locals on exit.
    pub fn post_leave_scope(&mut self, mut annotation: Annotation, scope: &Scope) -> Annotation {
        annotation.now.remove_conjuncts_if(|axiom| match axiom {
            Axiom::EqualsTo { variable, .. } => scope.locals.contains(variable),
            _ => false,
        });
        annotation
    }

    pub fn post_leave_function(
        &mut self,
        mut annotation: Annotation,
        function: &Function,
    ) -> Annotation {
        annotation.now.remove_conjuncts_if(|axiom| match axiom {
            Axiom::EqualsTo { variable, .. } => function.parameters.contains(variable),
            _ => false,
        });
        annotation
    }

    //
    // Dispatch
    //

    pub fn post(&mut self, annotation: Annotation, command: &Command) -> Result<PostImage> {
        // freshness against states built outside this solver
        self.factory.avoid(annotation.symbols());
        match command {
            Command::Skip => Ok(PostImage::of(annotation)),
            Command::Assume(condition) => self.post_assume(annotation, condition),
            Command::Assert(_) => Err(VerificationError::unsupported("assert commands")),
            Command::Malloc { lhs } => self.post_malloc(annotation, *lhs),
            Command::VariableAssignment { lhs, rhs } => {
                self.post_variable_assignment(annotation, lhs, rhs)
            }
            Command::MemoryRead { lhs, rhs } => self.post_memory_read(annotation, *lhs, rhs),
            Command::MemoryWrite(write) => {
                self.post_memory_write(annotation, write, self.setup.use_future)
            }
            Command::AcquireLock { lock } => self.post_lock(annotation, lock, true),
            Command::ReleaseLock { lock } => self.post_lock(annotation, lock, false),
            Command::Break | Command::Return(_) | Command::Call { .. } => Err(
                VerificationError::internal("control commands are handled by the proof generator"),
            ),
        }
    }

    //
    // Stack-only commands
    //

    fn symbolic_operand(
        &mut self,
        expr: &SimpleExpr,
        annotation: &Annotation,
    ) -> Result<SymbolicExpr> {
        Ok(match expr {
            SimpleExpr::Var(variable) => SymbolicExpr::Symbol(
                annotation.now.value_of(*variable).ok_or_else(|| {
                    VerificationError::internal(format!(
                        "variable '{}' has no binding",
                        self.program.variable(*variable).name
                    ))
                })?,
            ),
            SimpleExpr::True => SymbolicExpr::Bool(true),
            SimpleExpr::False => SymbolicExpr::Bool(false),
            SimpleExpr::Min => SymbolicExpr::Min,
            SimpleExpr::Max => SymbolicExpr::Max,
            SimpleExpr::Null => SymbolicExpr::Null,
        })
    }

    fn post_assume(&mut self, mut annotation: Annotation, condition: &Condition) -> Result<PostImage> {
        let lhs = self.symbolic_operand(&condition.lhs, &annotation)?;
        let rhs = self.symbolic_operand(&condition.rhs, &annotation)?;
        annotation.conjoin(Axiom::stack(condition.op, lhs, rhs));

        let mut encoding = self.encoding_for(&annotation)?;
        if encoding.implies_false()? {
            debug!("assume pruned an unreachable branch");
            return Ok(PostImage::unreachable());
        }
        // saturate with implied candidates
        self.extend_stack(&mut annotation, &mut encoding)?;
        Ok(PostImage::of(annotation))
    }

    fn post_malloc(&mut self, mut annotation: Annotation, lhs: VarId) -> Result<PostImage> {
        let decl = self.program.variable(lhs);
        if decl.is_shared {
            return Err(VerificationError::unsupported("allocation into a shared variable"));
        }
        let node_type = decl
            .node_type
            .ok_or_else(|| VerificationError::unsupported("allocation through a non-pointer"))?;
        let layout = self.program.node_type(node_type);

        let address = self.factory.fresh_fo(Sort::Ptr);
        let flow = self.factory.fresh_so(self.config.flow_sort());
        let mut fields = indexmap::IndexMap::new();
        for (name, sort) in &layout.fields {
            fields.insert(name.clone(), self.factory.fresh_fo(*sort));
        }
        let memory = remora_ir::logic::MemoryAxiom {
            node: address,
            node_type,
            flow,
            fields: fields.clone(),
        };

        // default-initialization knowledge
        annotation.conjoin(Axiom::neq(
            SymbolicExpr::Symbol(address),
            SymbolicExpr::Null,
        ));
        annotation.conjoin(Axiom::InflowEmptiness {
            flow,
            is_empty: true,
        });
        for value in fields.values() {
            match value.sort {
                Sort::Ptr => annotation.conjoin(Axiom::eq(
                    SymbolicExpr::Symbol(*value),
                    SymbolicExpr::Null,
                )),
                Sort::Bool => annotation.conjoin(Axiom::eq(
                    SymbolicExpr::Symbol(*value),
                    SymbolicExpr::Bool(false),
                )),
                Sort::Tid => annotation.conjoin(Axiom::eq(
                    SymbolicExpr::Symbol(*value),
                    SymbolicExpr::Unlocked,
                )),
                _ => {}
            }
        }
        // the fresh address is distinct from every known pointer
        let known: Vec<SymbolId> = annotation
            .now
            .symbols()
            .into_iter()
            .filter(|symbol| symbol.sort == Sort::Ptr && *symbol != address)
            .collect();
        for other in known {
            annotation.conjoin(Axiom::neq(
                SymbolicExpr::Symbol(address),
                SymbolicExpr::Symbol(other),
            ));
        }
        annotation.conjoin(Axiom::LocalMemory(memory));

        // now a plain variable assignment
        match annotation.now.value_of_mut(lhs) {
            Some(value) => *value = address,
            None => annotation.conjoin(Axiom::EqualsTo {
                variable: lhs,
                value: address,
            }),
        }
        Ok(PostImage::of(annotation))
    }

    fn post_variable_assignment(
        &mut self,
        mut annotation: Annotation,
        lhs: &[VarId],
        rhs: &[SimpleExpr],
    ) -> Result<PostImage> {
        assert_eq!(lhs.len(), rhs.len());
        // evaluate all right-hand sides before any rebinding
        let mut values = Vec::with_capacity(rhs.len());
        for expr in rhs {
            values.push(evaluate_simple(
                expr,
                &mut annotation,
                self.program,
                &mut self.factory,
            )?);
        }
        for (&variable, value) in lhs.iter().zip(values) {
            match annotation.now.value_of_mut(variable) {
                Some(slot) => *slot = value,
                None => annotation.conjoin(Axiom::EqualsTo { variable, value }),
            }
        }
        Ok(PostImage::of(annotation))
    }

    fn post_memory_read(
        &mut self,
        mut annotation: Annotation,
        lhs: VarId,
        rhs: &Dereference,
    ) -> Result<PostImage> {
        self.prepare_access(&mut annotation, std::slice::from_ref(&rhs.variable))?;
        let address = annotation.now.value_of(rhs.variable).ok_or_else(|| {
            VerificationError::internal(format!(
                "variable '{}' has no binding",
                self.program.variable(rhs.variable).name
            ))
        })?;
        let (_, memory) = annotation.now.memory_at(address).ok_or_else(|| {
            VerificationError::unsafe_update(format!(
                "dereference of potentially invalid address {address}"
            ))
        })?;
        let value = memory.field(&rhs.field);
        match annotation.now.value_of_mut(lhs) {
            Some(slot) => *slot = value,
            None => annotation.conjoin(Axiom::EqualsTo {
                variable: lhs,
                value,
            }),
        }
        Ok(PostImage::of(annotation))
    }

    /// Lock transitions are stack-only updates of the lock field; no
    /// footprint is needed because locks carry no flow.
    fn post_lock(
        &mut self,
        mut annotation: Annotation,
        lock: &Dereference,
        acquire: bool,
    ) -> Result<PostImage> {
        self.prepare_access(&mut annotation, std::slice::from_ref(&lock.variable))?;
        let address = annotation.now.value_of(lock.variable).ok_or_else(|| {
            VerificationError::internal("lock target has no binding")
        })?;
        let (is_local, memory) = annotation.now.memory_at(address).ok_or_else(|| {
            VerificationError::unsafe_update("lock access through an invalid address")
        })?;
        let old_value = memory.field(&lock.field);

        // the transition is enabled only from the matching owner state
        let required = if acquire {
            SymbolicExpr::Unlocked
        } else {
            SymbolicExpr::SelfTid
        };
        annotation.conjoin(Axiom::eq(SymbolicExpr::Symbol(old_value), required));
        let mut encoding = self.encoding_for(&annotation)?;
        if encoding.implies_false()? {
            return Ok(PostImage::unreachable());
        }

        let new_value = self.factory.fresh_fo(Sort::Tid);
        let owner = if acquire {
            SymbolicExpr::SelfTid
        } else {
            SymbolicExpr::Unlocked
        };
        annotation.conjoin(Axiom::eq(SymbolicExpr::Symbol(new_value), owner));

        let mut pre_memory = None;
        for axiom in &mut annotation.now.conjuncts {
            if let Axiom::LocalMemory(memory) | Axiom::SharedMemory(memory) = axiom {
                if memory.node == address {
                    pre_memory = Some(memory.clone());
                    *memory.fields.get_mut(&lock.field).expect("lock field") = new_value;
                    break;
                }
            }
        }
        let pre_memory =
            pre_memory.ok_or_else(|| VerificationError::internal("lock memory vanished"))?;

        let mut result = PostImage::of(annotation);
        if !is_local {
            let mut post_memory = pre_memory.clone();
            *post_memory.fields.get_mut(&lock.field).expect("lock field") = new_value;
            let mut context = remora_ir::logic::Formula::new();
            context.conjoin(Axiom::eq(SymbolicExpr::Symbol(old_value), required));
            context.conjoin(Axiom::eq(SymbolicExpr::Symbol(new_value), owner));
            result.effects.push(HeapEffect {
                pre: pre_memory,
                post: post_memory,
                context,
            });
        }
        Ok(result)
    }

    //
    // Entailments
    //

    pub fn is_unsatisfiable(&self, annotation: &Annotation) -> Result<bool> {
        let mut encoding = self.encoding_for(annotation)?;
        Ok(encoding.implies_false()?)
    }

    /// `premise` entails `conclusion`, relating states through their
    /// common program variables: the conclusion's symbols are aligned to
    /// the premise's via matching variable bindings and memory cells
    /// before the check.
    pub fn implies(&self, premise: &Annotation, conclusion: &Annotation) -> Result<bool> {
        let mut encoding = self.encoding_for(premise)?;
        if encoding.implies_false()? {
            return Ok(true);
        }

        let mut alignment: std::collections::HashMap<SymbolId, SymbolId> =
            std::collections::HashMap::new();
        for axiom in &conclusion.now.conjuncts {
            let Axiom::EqualsTo { variable, value } = axiom else {
                continue;
            };
            if let Some(bound) = premise.now.value_of(*variable) {
                alignment.insert(*value, bound);
            }
        }
        // propagate through matched cells until nothing new aligns
        loop {
            let mut additions = Vec::new();
            for memory in conclusion.now.memory() {
                let Some(&counterpart) = alignment.get(&memory.node) else {
                    continue;
                };
                let Some((_, matched)) = premise.now.memory_at(counterpart) else {
                    continue;
                };
                if memory.node_type != matched.node_type {
                    continue;
                }
                if !alignment.contains_key(&memory.flow) {
                    additions.push((memory.flow, matched.flow));
                }
                for (field, value) in &memory.fields {
                    if !alignment.contains_key(value) {
                        additions.push((*value, matched.fields[field]));
                    }
                }
            }
            if additions.is_empty() {
                break;
            }
            alignment.extend(additions);
        }

        let mut aligned = conclusion.now.clone();
        remora_ir::logic::substitute_formula(&mut aligned, &alignment);
        Ok(encoding.implies_formula(&aligned)?)
    }

    /// Drop past predicates that no longer talk about any address in
    /// play.
    pub fn prune_past(&self, annotation: &mut Annotation) {
        let referenced: Vec<SymbolId> = annotation
            .now
            .conjuncts
            .iter()
            .filter_map(|axiom| match axiom {
                Axiom::EqualsTo { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        annotation
            .past
            .retain(|past| referenced.contains(&past.memory.node));
    }

    /// Re-derive knowledge for past predicates from the current state;
    /// bounded, best-effort.
    pub fn improve_past(&mut self, annotation: &mut Annotation) -> Result<()> {
        self.prune_past(annotation);
        Ok(())
    }
}
