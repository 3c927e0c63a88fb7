//! Program AST.
//!
//! A program is a set of node type layouts, a variable arena (shared
//! variables plus every function's parameters and locals), and the
//! functions themselves. Statements and commands are closed enums; there
//! is no visitor machinery; consumers match exhaustively.

use indexmap::IndexMap;
use serde::Serialize;

use crate::symbols::Sort;

/// Index into [`Program::types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TypeId(pub usize);

/// Index into [`Program::variables`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VarId(pub usize);

/// Heap node layout. Field order is the declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct NodeType {
    pub name: String,
    pub fields: IndexMap<String, Sort>,
}

impl NodeType {
    pub fn field_sort(&self, field: &str) -> Option<Sort> {
        self.fields.get(field).copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableDecl {
    pub name: String,
    pub sort: Sort,
    /// Layout of the pointed-to node for pointer variables.
    pub node_type: Option<TypeId>,
    pub is_shared: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FunctionKind {
    /// Externally callable; carries a linearizability obligation.
    Api,
    /// Externally callable helper without a specification (e.g. cleanup).
    Maintenance,
    /// Internal subroutine, inlined at call sites.
    Macro,
    Init,
}

#[derive(Debug, Clone, Serialize)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub parameters: Vec<VarId>,
    pub returns: Vec<Sort>,
    pub body: Statement,
}

#[derive(Debug, Clone, Serialize)]
pub struct Program {
    pub name: String,
    pub types: Vec<NodeType>,
    pub variables: Vec<VariableDecl>,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn node_type(&self, id: TypeId) -> &NodeType {
        &self.types[id.0]
    }

    pub fn variable(&self, id: VarId) -> &VariableDecl {
        &self.variables[id.0]
    }

    pub fn shared_variables(&self) -> impl Iterator<Item = VarId> + '_ {
        self.variables
            .iter()
            .enumerate()
            .filter(|(_, decl)| decl.is_shared)
            .map(|(index, _)| VarId(index))
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn api_functions(&self) -> impl Iterator<Item = &Function> {
        self.functions
            .iter()
            .filter(|f| matches!(f.kind, FunctionKind::Api | FunctionKind::Maintenance))
    }
}

//
// Expressions
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOperator {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl BinaryOperator {
    pub fn negated(self) -> Self {
        match self {
            BinaryOperator::Eq => BinaryOperator::Neq,
            BinaryOperator::Neq => BinaryOperator::Eq,
            BinaryOperator::Lt => BinaryOperator::Geq,
            BinaryOperator::Leq => BinaryOperator::Gt,
            BinaryOperator::Gt => BinaryOperator::Leq,
            BinaryOperator::Geq => BinaryOperator::Lt,
        }
    }
}

/// Side-effect free expression over the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimpleExpr {
    Var(VarId),
    True,
    False,
    Min,
    Max,
    Null,
}

/// A single heap cell access `variable.field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dereference {
    pub variable: VarId,
    pub field: String,
}

/// Guard of an `Assume`/`Assert`. Dereferences are lowered into
/// `MemoryRead`s by the front end, so both sides are stack expressions.
#[derive(Debug, Clone, Serialize)]
pub struct Condition {
    pub op: BinaryOperator,
    pub lhs: SimpleExpr,
    pub rhs: SimpleExpr,
}

//
// Statements
//

#[derive(Debug, Clone, Serialize)]
pub enum Statement {
    Sequence(Vec<Statement>),
    Scope(Scope),
    Atomic(Box<Statement>),
    Choice(Vec<Statement>),
    /// Unconditional loop, exited by `Break`.
    Loop(Box<Statement>),
    Command(Command),
}

#[derive(Debug, Clone, Serialize)]
pub struct Scope {
    pub locals: Vec<VarId>,
    pub body: Box<Statement>,
}

/// One atomic multi-field heap update `x.f, y.g := a, b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryWrite {
    pub lhs: Vec<Dereference>,
    pub rhs: Vec<SimpleExpr>,
}

#[derive(Debug, Clone, Serialize)]
pub enum Command {
    Skip,
    Break,
    Return(Vec<SimpleExpr>),
    Assume(Condition),
    Assert(Condition),
    Malloc {
        lhs: VarId,
    },
    VariableAssignment {
        lhs: Vec<VarId>,
        rhs: Vec<SimpleExpr>,
    },
    MemoryRead {
        lhs: VarId,
        rhs: Dereference,
    },
    MemoryWrite(MemoryWrite),
    AcquireLock {
        lock: Dereference,
    },
    ReleaseLock {
        lock: Dereference,
    },
    /// Macro invocation `results := function(arguments)`.
    Call {
        function: String,
        arguments: Vec<SimpleExpr>,
        results: Vec<VarId>,
    },
}

impl Statement {
    pub fn seq(stmts: Vec<Statement>) -> Statement {
        Statement::Sequence(stmts)
    }

    pub fn cmd(command: Command) -> Statement {
        Statement::Command(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_negation_round_trips() {
        let all = [
            BinaryOperator::Eq,
            BinaryOperator::Neq,
            BinaryOperator::Lt,
            BinaryOperator::Leq,
            BinaryOperator::Gt,
            BinaryOperator::Geq,
        ];
        for op in all {
            assert_eq!(op.negated().negated(), op);
        }
    }
}
