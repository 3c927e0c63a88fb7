//! Shared fixture: a sorted, mark-based linked set fragment with the
//! flow configuration of a key-ordered list (the outflow along `next`
//! is the key range above the node's value).

use indexmap::indexmap;
use remora_engine::config::SolverConfig;
use remora_ir::logic::{
    Annotation, Axiom, Formula, ImplicationSet, MemoryAxiom, SymbolicExpr,
};
use remora_ir::program::{
    BinaryOperator, Command, Condition, Dereference, Function, FunctionKind, MemoryWrite,
    NodeType, Program, Scope, SimpleExpr, Statement, TypeId, VarId, VariableDecl,
};
use remora_ir::symbols::{Sort, SymbolFactory, SymbolId};

pub const NODE: TypeId = TypeId(0);

/// Variable ids of [`harness`].
pub struct ListVars {
    pub head: VarId,
    pub x: VarId,
    pub y: VarId,
}

/// A program skeleton with no functions, for driving the solver
/// directly: shared `head` and two scratch pointers.
pub fn harness() -> (Program, ListVars) {
    let program = Program {
        name: "list-harness".into(),
        types: vec![node_type()],
        variables: vec![
            VariableDecl {
                name: "head".into(),
                sort: Sort::Ptr,
                node_type: Some(NODE),
                is_shared: true,
            },
            VariableDecl {
                name: "x".into(),
                sort: Sort::Ptr,
                node_type: Some(NODE),
                is_shared: false,
            },
            VariableDecl {
                name: "y".into(),
                sort: Sort::Ptr,
                node_type: Some(NODE),
                is_shared: false,
            },
        ],
        functions: Vec::new(),
    };
    let vars = ListVars {
        head: VarId(0),
        x: VarId(1),
        y: VarId(2),
    };
    (program, vars)
}

fn node_type() -> NodeType {
    NodeType {
        name: "Node".into(),
        fields: indexmap! {
            "val".to_string() => Sort::Data,
            "marked".to_string() => Sort::Bool,
            "next".to_string() => Sort::Ptr,
        },
    }
}

/// The list flow configuration: data-sorted flow, `next` forwards all
/// keys above the node's value, a node logically contains its value
/// unless marked, and unmarked shared nodes keep their value in their
/// flow.
#[derive(Default)]
pub struct ListConfig;

impl SolverConfig for ListConfig {
    fn flow_sort(&self) -> Sort {
        Sort::Data
    }

    fn max_footprint_depth(&self, _ty: TypeId, field: &str) -> usize {
        if field == "next" {
            2
        } else {
            1
        }
    }

    fn local_node_invariant(&self, _memory: &MemoryAxiom) -> ImplicationSet {
        ImplicationSet::new()
    }

    fn shared_node_invariant(&self, memory: &MemoryAxiom) -> ImplicationSet {
        // an unmarked node is responsible for its own value
        let mut invariant = ImplicationSet::new();
        invariant.add(
            Formula::with(vec![Axiom::eq(
                SymbolicExpr::Symbol(memory.field("marked")),
                SymbolicExpr::Bool(false),
            )]),
            Formula::with(vec![Axiom::InflowContainsValue {
                flow: memory.flow,
                value: memory.field("val"),
            }]),
        );
        invariant
    }

    fn shared_variable_invariant(&self, _variable: VarId, value: SymbolId) -> ImplicationSet {
        ImplicationSet::fact(Formula::with(vec![Axiom::neq(
            SymbolicExpr::Symbol(value),
            SymbolicExpr::Null,
        )]))
    }

    fn outflow_contains(
        &self,
        memory: &MemoryAxiom,
        _field: &str,
        value: SymbolId,
    ) -> ImplicationSet {
        ImplicationSet::fact(Formula::with(vec![Axiom::stack(
            BinaryOperator::Gt,
            SymbolicExpr::Symbol(value),
            SymbolicExpr::Symbol(memory.field("val")),
        )]))
    }

    fn logically_contains(&self, memory: &MemoryAxiom, value: SymbolId) -> ImplicationSet {
        ImplicationSet::fact(Formula::with(vec![
            Axiom::eq(
                SymbolicExpr::Symbol(value),
                SymbolicExpr::Symbol(memory.field("val")),
            ),
            Axiom::eq(
                SymbolicExpr::Symbol(memory.field("marked")),
                SymbolicExpr::Bool(false),
            ),
        ]))
    }
}

/// Symbols of the three-node fragment built by [`unlink_state`].
pub struct Fragment {
    pub root: SymbolId,
    pub mid: SymbolId,
    pub end: SymbolId,
    pub root_val: SymbolId,
    pub mid_val: SymbolId,
    pub end_val: SymbolId,
    pub root_flow: SymbolId,
    pub null: SymbolId,
}

fn shared_node(
    factory: &mut SymbolFactory,
    val: SymbolId,
    marked: SymbolId,
    next: SymbolId,
) -> MemoryAxiom {
    MemoryAxiom {
        node: factory.fresh_fo(Sort::Ptr),
        node_type: NODE,
        flow: factory.fresh_so(Sort::Data),
        fields: indexmap! {
            "val".to_string() => val,
            "marked".to_string() => marked,
            "next".to_string() => next,
        },
    }
}

/// The two-hop list fragment `root -> mid -> end`, with `mid` marked
/// for removal, `root.val == MIN`, strictly increasing values, the
/// root's inflow covering the whole key space, and `x`/`y` bound to
/// `root`/`end`.
pub fn unlink_state(vars: &ListVars, factory: &mut SymbolFactory) -> (Annotation, Fragment) {
    let root_val = factory.fresh_fo(Sort::Data);
    let mid_val = factory.fresh_fo(Sort::Data);
    let end_val = factory.fresh_fo(Sort::Data);
    let unmarked = factory.fresh_fo(Sort::Bool);
    let marked = factory.fresh_fo(Sort::Bool);
    let end_unmarked = factory.fresh_fo(Sort::Bool);
    let null = factory.fresh_fo(Sort::Ptr);

    // leaf first, so each node can point at the next one
    let end = shared_node(factory, end_val, end_unmarked, null);
    let mid = shared_node(factory, mid_val, marked, end.node);
    let root = shared_node(factory, root_val, unmarked, mid.node);

    let fragment = Fragment {
        root: root.node,
        mid: mid.node,
        end: end.node,
        root_val,
        mid_val,
        end_val,
        root_flow: root.flow,
        null,
    };

    let mut now = Formula::new();
    now.conjoin(Axiom::EqualsTo {
        variable: vars.head,
        value: root.node,
    });
    now.conjoin(Axiom::EqualsTo {
        variable: vars.x,
        value: root.node,
    });
    now.conjoin(Axiom::EqualsTo {
        variable: vars.y,
        value: end.node,
    });
    now.conjoin(Axiom::eq(SymbolicExpr::Symbol(null), SymbolicExpr::Null));
    now.conjoin(Axiom::eq(
        SymbolicExpr::Symbol(root_val),
        SymbolicExpr::Min,
    ));
    now.conjoin(Axiom::stack(
        BinaryOperator::Lt,
        SymbolicExpr::Symbol(root_val),
        SymbolicExpr::Symbol(mid_val),
    ));
    now.conjoin(Axiom::stack(
        BinaryOperator::Lt,
        SymbolicExpr::Symbol(mid_val),
        SymbolicExpr::Symbol(end_val),
    ));
    now.conjoin(Axiom::stack(
        BinaryOperator::Lt,
        SymbolicExpr::Symbol(end_val),
        SymbolicExpr::Max,
    ));
    now.conjoin(Axiom::eq(
        SymbolicExpr::Symbol(unmarked),
        SymbolicExpr::Bool(false),
    ));
    now.conjoin(Axiom::eq(
        SymbolicExpr::Symbol(marked),
        SymbolicExpr::Bool(true),
    ));
    now.conjoin(Axiom::eq(
        SymbolicExpr::Symbol(end_unmarked),
        SymbolicExpr::Bool(false),
    ));
    // the root routes the whole key space
    now.conjoin(Axiom::InflowContainsRange {
        flow: root.flow,
        low: SymbolicExpr::Min,
        high: SymbolicExpr::Max,
    });
    now.conjoin(Axiom::SharedMemory(root));
    now.conjoin(Axiom::SharedMemory(mid));
    now.conjoin(Axiom::SharedMemory(end));

    (Annotation::with_now(now), fragment)
}

/// `x.next := y`; with [`unlink_state`], the unlink of `mid`.
pub fn unlink_write(vars: &ListVars) -> MemoryWrite {
    MemoryWrite {
        lhs: vec![Dereference {
            variable: vars.x,
            field: "next".into(),
        }],
        rhs: vec![SimpleExpr::Var(vars.y)],
    }
}

/// A `contains(key)` program: the atomic locate step reads the head's
/// value and mark bit, observes the key, and reports success. With
/// `broken` the value comparison is skipped, so the reported success is
/// unjustified.
pub fn contains_program(broken: bool) -> Program {
    let head = VarId(0);
    let key = VarId(1);
    let value = VarId(2);
    let mark = VarId(3);

    let mut steps = vec![
        Statement::cmd(Command::MemoryRead {
            lhs: value,
            rhs: Dereference {
                variable: head,
                field: "val".into(),
            },
        }),
        Statement::cmd(Command::MemoryRead {
            lhs: mark,
            rhs: Dereference {
                variable: head,
                field: "marked".into(),
            },
        }),
    ];
    if !broken {
        steps.push(Statement::cmd(Command::Assume(Condition {
            op: BinaryOperator::Eq,
            lhs: SimpleExpr::Var(value),
            rhs: SimpleExpr::Var(key),
        })));
    }
    steps.push(Statement::cmd(Command::Assume(Condition {
        op: BinaryOperator::Eq,
        lhs: SimpleExpr::Var(mark),
        rhs: SimpleExpr::False,
    })));
    steps.push(Statement::cmd(Command::Return(vec![SimpleExpr::True])));

    let body = Statement::Scope(Scope {
        locals: vec![value, mark],
        body: Box::new(Statement::Atomic(Box::new(Statement::seq(steps)))),
    });

    Program {
        name: if broken {
            "broken-contains".into()
        } else {
            "contains".into()
        },
        types: vec![node_type()],
        variables: vec![
            VariableDecl {
                name: "head".into(),
                sort: Sort::Ptr,
                node_type: Some(NODE),
                is_shared: true,
            },
            VariableDecl {
                name: "key".into(),
                sort: Sort::Data,
                node_type: None,
                is_shared: false,
            },
            VariableDecl {
                name: "v".into(),
                sort: Sort::Data,
                node_type: None,
                is_shared: false,
            },
            VariableDecl {
                name: "m".into(),
                sort: Sort::Bool,
                node_type: None,
                is_shared: false,
            },
        ],
        functions: vec![Function {
            name: "contains".into(),
            kind: FunctionKind::Api,
            parameters: vec![key],
            returns: vec![Sort::Bool],
            body,
        }],
    }
}
