//! Diagnostic renderings: the block-structured flow-graph dump and the
//! interference JSON export. Informal formats, not stable wire formats.

use std::fmt::Write as _;

use remora_ir::flowgraph::{EMode, FlowGraph};
use remora_ir::logic::{Axiom, HeapEffect, SymbolicExpr};
use remora_ir::program::{BinaryOperator, Program};

fn render_symbolic(expr: &SymbolicExpr) -> String {
    match expr {
        SymbolicExpr::Symbol(symbol) => symbol.to_string(),
        SymbolicExpr::Bool(value) => value.to_string(),
        SymbolicExpr::Null => "null".into(),
        SymbolicExpr::Min => "MIN".into(),
        SymbolicExpr::Max => "MAX".into(),
        SymbolicExpr::SelfTid => "self".into(),
        SymbolicExpr::SomeTid => "other".into(),
        SymbolicExpr::Unlocked => "unlocked".into(),
    }
}

fn render_operator(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Eq => "==",
        BinaryOperator::Neq => "!=",
        BinaryOperator::Lt => "<",
        BinaryOperator::Leq => "<=",
        BinaryOperator::Gt => ">",
        BinaryOperator::Geq => ">=",
    }
}

fn render_axiom(axiom: &Axiom, program: &Program) -> String {
    match axiom {
        Axiom::LocalMemory(memory) => format!("local {}", memory.node),
        Axiom::SharedMemory(memory) => format!("shared {}", memory.node),
        Axiom::EqualsTo { variable, value } => {
            format!("{} == {value}", program.variable(*variable).name)
        }
        Axiom::Stack { op, lhs, rhs } => format!(
            "{} {} {}",
            render_symbolic(lhs),
            render_operator(*op),
            render_symbolic(rhs)
        ),
        Axiom::InflowEmptiness { flow, is_empty } => {
            if *is_empty {
                format!("{flow} == \u{2205}")
            } else {
                format!("{flow} != \u{2205}")
            }
        }
        Axiom::InflowContainsValue { flow, value } => format!("{value} \u{2208} {flow}"),
        Axiom::InflowContainsRange { flow, low, high } => format!(
            "[{}, {}] \u{2286} {flow}",
            render_symbolic(low),
            render_symbolic(high)
        ),
        Axiom::Obligation { spec, key } => format!("OBL({spec:?}, {key})"),
        Axiom::Fulfillment { return_value } => format!("FUL({return_value})"),
    }
}

/// Render a flow graph in the block-structured dump format:
/// `graph { node[a]{ f = pre / post; } ... @constraint: ...; }`.
pub fn render_flow_graph(graph: &FlowGraph, program: &Program) -> String {
    let mut out = String::from("graph {\n");
    for node in &graph.nodes {
        let _ = write!(out, "  node[{}]", node.address);
        if node.needed {
            out.push('!');
        }
        out.push_str("{ ");
        let _ = write!(
            out,
            "flow = {} / {}; ",
            node.all_inflow(EMode::Pre),
            node.all_inflow(EMode::Post)
        );
        for field in &node.data_fields {
            let _ = write!(out, "{} = {} / {}; ", field.name, field.pre_value, field.post_value);
        }
        for field in &node.pointer_fields {
            let _ = write!(
                out,
                "{} = {} / {}; ",
                field.name(),
                field.value(EMode::Pre),
                field.value(EMode::Post)
            );
        }
        out.push_str("}\n");
    }
    for axiom in &graph.pre.now.conjuncts {
        let _ = writeln!(out, "  @constraint: {};", render_axiom(axiom, program));
    }
    out.push('}');
    out
}

/// Serialize the recorded interference set for offline inspection.
pub fn effects_to_json(effects: &[HeapEffect]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_ir::logic::{Annotation, Formula, MemoryAxiom};
    use remora_ir::program::{NodeType, TypeId, VariableDecl};
    use remora_ir::symbols::{Sort, SymbolFactory};

    fn tiny_program() -> Program {
        Program {
            name: "tiny".into(),
            types: vec![NodeType {
                name: "Node".into(),
                fields: indexmap::indexmap! {
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

    #[test]
    fn graph_dump_has_block_structure() {
        let program = tiny_program();
        let mut factory = SymbolFactory::new();
        let memory = MemoryAxiom {
            node: factory.fresh_fo(Sort::Ptr),
            node_type: TypeId(0),
            flow: factory.fresh_so(Sort::Data),
            fields: indexmap::indexmap! {
                "next".to_string() => factory.fresh_fo(Sort::Ptr),
            },
        };
        let mut now = Formula::new();
        now.conjoin(remora_ir::logic::Axiom::SharedMemory(memory.clone()));
        let node = remora_ir::flowgraph::FlowGraphNode::from_memory(
            &memory,
            false,
            &mut factory,
            Sort::Data,
            |_| true,
        );
        let graph = FlowGraph {
            pre: Annotation::with_now(now),
            nodes: vec![node],
        };

        let dump = render_flow_graph(&graph, &program);
        assert!(dump.starts_with("graph {"));
        assert!(dump.contains("node[p0]"));
        assert!(dump.contains("@constraint:"));
        assert!(dump.ends_with('}'));
    }

    #[test]
    fn effects_serialize_to_json() {
        let mut factory = SymbolFactory::new();
        let memory = MemoryAxiom {
            node: factory.fresh_fo(Sort::Ptr),
            node_type: TypeId(0),
            flow: factory.fresh_so(Sort::Data),
            fields: indexmap::indexmap! {
                "next".to_string() => factory.fresh_fo(Sort::Ptr),
            },
        };
        let effect = HeapEffect {
            pre: memory.clone(),
            post: memory,
            context: Formula::new(),
        };
        let json = effects_to_json(&[effect]).expect("serializable");
        assert!(json.contains("\"pre\""));
        assert!(json.contains("\"post\""));
    }
}
