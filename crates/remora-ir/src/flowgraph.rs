//! Flow-graph records.
//!
//! A [`FlowGraph`] is the bounded heap region a single command's proof
//! inspects: per node the pre/post field valuations plus the flow symbols
//! the encoding quantifies over. Keeping "everything flowing out"
//! (`all_*`) apart from "only what the abstracted subgraph routes"
//! (`graph_*`) is what allows the footprint fixpoint to stop early
//! instead of exploring the entire heap. `frame_inflow` names the inflow
//! contributed from outside the footprint.

use crate::logic::{Annotation, Axiom, MemoryAxiom};
use crate::program::TypeId;
use crate::symbols::{Sort, SymbolFactory, SymbolId};

/// Evaluation mode: before or after the update under scrutiny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EMode {
    Pre,
    Post,
}

impl EMode {
    pub const BOTH: [EMode; 2] = [EMode::Pre, EMode::Post];

    pub fn other(self) -> EMode {
        match self {
            EMode::Pre => EMode::Post,
            EMode::Post => EMode::Pre,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub sort: Sort,
    pub pre_value: SymbolId,
    pub post_value: SymbolId,
}

impl Field {
    pub fn value(&self, mode: EMode) -> SymbolId {
        match mode {
            EMode::Pre => self.pre_value,
            EMode::Post => self.post_value,
        }
    }

    pub fn has_update(&self) -> bool {
        self.pre_value != self.post_value
    }
}

#[derive(Debug, Clone)]
pub struct PointerField {
    pub field: Field,
    pub pre_all_outflow: SymbolId,
    pub pre_graph_outflow: SymbolId,
    pub post_all_outflow: SymbolId,
    pub post_graph_outflow: SymbolId,
}

impl PointerField {
    pub fn name(&self) -> &str {
        &self.field.name
    }

    pub fn value(&self, mode: EMode) -> SymbolId {
        self.field.value(mode)
    }

    pub fn has_update(&self) -> bool {
        self.field.has_update()
    }

    pub fn all_outflow(&self, mode: EMode) -> SymbolId {
        match mode {
            EMode::Pre => self.pre_all_outflow,
            EMode::Post => self.post_all_outflow,
        }
    }

    pub fn graph_outflow(&self, mode: EMode) -> SymbolId {
        match mode {
            EMode::Pre => self.pre_graph_outflow,
            EMode::Post => self.post_graph_outflow,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowGraphNode {
    pub address: SymbolId,
    pub node_type: TypeId,
    /// Whether the node must survive footprint minimization.
    pub needed: bool,
    pub pre_local: bool,
    pub post_local: bool,
    pub pre_all_inflow: SymbolId,
    pub pre_graph_inflow: SymbolId,
    pub pre_keyset: SymbolId,
    pub post_all_inflow: SymbolId,
    pub post_graph_inflow: SymbolId,
    pub post_keyset: SymbolId,
    pub frame_inflow: SymbolId,
    pub data_fields: Vec<Field>,
    pub pointer_fields: Vec<PointerField>,
}

impl FlowGraphNode {
    /// Build a node from a memory resource. The pre all-inflow is the
    /// resource's flow symbol; every other flow symbol is fresh, so the
    /// per-node-per-mode distinctness invariant holds by construction.
    pub fn from_memory(
        memory: &MemoryAxiom,
        local: bool,
        factory: &mut SymbolFactory,
        flow_sort: Sort,
        pointer_layout: impl Fn(&str) -> bool,
    ) -> FlowGraphNode {
        let mut data_fields = Vec::new();
        let mut pointer_fields = Vec::new();
        for (name, value) in &memory.fields {
            let field = Field {
                name: name.clone(),
                sort: value.sort,
                pre_value: *value,
                post_value: *value,
            };
            if pointer_layout(name) {
                pointer_fields.push(PointerField {
                    field,
                    pre_all_outflow: factory.fresh_so(flow_sort),
                    pre_graph_outflow: factory.fresh_so(flow_sort),
                    post_all_outflow: factory.fresh_so(flow_sort),
                    post_graph_outflow: factory.fresh_so(flow_sort),
                });
            } else {
                data_fields.push(field);
            }
        }
        FlowGraphNode {
            address: memory.node,
            node_type: memory.node_type,
            needed: false,
            pre_local: local,
            post_local: local,
            pre_all_inflow: memory.flow,
            pre_graph_inflow: factory.fresh_so(flow_sort),
            pre_keyset: factory.fresh_so(flow_sort),
            post_all_inflow: factory.fresh_so(flow_sort),
            post_graph_inflow: factory.fresh_so(flow_sort),
            post_keyset: factory.fresh_so(flow_sort),
            frame_inflow: factory.fresh_so(flow_sort),
            data_fields,
            pointer_fields,
        }
    }

    pub fn is_local(&self, mode: EMode) -> bool {
        match mode {
            EMode::Pre => self.pre_local,
            EMode::Post => self.post_local,
        }
    }

    pub fn all_inflow(&self, mode: EMode) -> SymbolId {
        match mode {
            EMode::Pre => self.pre_all_inflow,
            EMode::Post => self.post_all_inflow,
        }
    }

    pub fn graph_inflow(&self, mode: EMode) -> SymbolId {
        match mode {
            EMode::Pre => self.pre_graph_inflow,
            EMode::Post => self.post_graph_inflow,
        }
    }

    pub fn keyset(&self, mode: EMode) -> SymbolId {
        match mode {
            EMode::Pre => self.pre_keyset,
            EMode::Post => self.post_keyset,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.data_fields
            .iter()
            .find(|field| field.name == name)
            .or_else(|| {
                self.pointer_fields
                    .iter()
                    .map(|pointer| &pointer.field)
                    .find(|field| field.name == name)
            })
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        if let Some(field) = self.data_fields.iter_mut().find(|field| field.name == name) {
            return Some(field);
        }
        self.pointer_fields
            .iter_mut()
            .map(|pointer| &mut pointer.field)
            .find(|field| field.name == name)
    }

    pub fn has_updated_pointers(&self) -> bool {
        self.pointer_fields.iter().any(PointerField::has_update)
    }

    pub fn has_updated_fields(&self) -> bool {
        self.data_fields.iter().any(Field::has_update) || self.has_updated_pointers()
    }

    pub fn has_updated_flow(&self) -> bool {
        self.pre_all_inflow != self.post_all_inflow
    }

    /// Render the node back into a memory axiom for the given mode.
    pub fn to_memory(&self, mode: EMode) -> MemoryAxiom {
        let mut fields = indexmap::IndexMap::new();
        for field in &self.data_fields {
            fields.insert(field.name.clone(), field.value(mode));
        }
        for pointer in &self.pointer_fields {
            fields.insert(pointer.field.name.clone(), pointer.value(mode));
        }
        MemoryAxiom {
            node: self.address,
            node_type: self.node_type,
            flow: self.all_inflow(mode),
            fields,
        }
    }

    /// The node as a logic resource, honoring its locality in `mode`.
    pub fn to_axiom(&self, mode: EMode) -> Axiom {
        let memory = self.to_memory(mode);
        if self.is_local(mode) {
            Axiom::LocalMemory(memory)
        } else {
            Axiom::SharedMemory(memory)
        }
    }

    pub fn flow_symbols(&self) -> Vec<SymbolId> {
        let mut result = vec![
            self.pre_all_inflow,
            self.pre_graph_inflow,
            self.pre_keyset,
            self.post_all_inflow,
            self.post_graph_inflow,
            self.post_keyset,
            self.frame_inflow,
        ];
        for pointer in &self.pointer_fields {
            result.extend([
                pointer.pre_all_outflow,
                pointer.pre_graph_outflow,
                pointer.post_all_outflow,
                pointer.post_graph_outflow,
            ]);
        }
        result
    }
}

/// The bounded flow graph around an update (or around a whole state).
///
/// The graph exclusively owns its nodes and the annotation it was built
/// from; it is discarded as a whole once a post-image or footprint
/// computation completes.
#[derive(Debug)]
pub struct FlowGraph {
    pub pre: Annotation,
    pub nodes: Vec<FlowGraphNode>,
}

impl FlowGraph {
    /// The node the graph was seeded from.
    pub fn root(&self) -> &FlowGraphNode {
        &self.nodes[0]
    }

    pub fn node_at(&self, address: SymbolId) -> Option<&FlowGraphNode> {
        self.nodes.iter().find(|node| node.address == address)
    }

    pub fn node_at_mut(&mut self, address: SymbolId) -> Option<&mut FlowGraphNode> {
        self.nodes.iter_mut().find(|node| node.address == address)
    }

    pub fn position(&self, address: SymbolId) -> Option<usize> {
        self.nodes.iter().position(|node| node.address == address)
    }

    pub fn contains(&self, address: SymbolId) -> bool {
        self.node_at(address).is_some()
    }

    /// Pointer fields of graph nodes targeting `node` in `mode`, as
    /// `(source index, pointer field index)` pairs.
    pub fn incoming_edges(&self, node: &FlowGraphNode, mode: EMode) -> Vec<(usize, usize)> {
        let mut result = Vec::new();
        for (source_index, source) in self.nodes.iter().enumerate() {
            if source.address == node.address {
                continue;
            }
            for (field_index, pointer) in source.pointer_fields.iter().enumerate() {
                if pointer.value(mode) == node.address {
                    result.push((source_index, field_index));
                }
            }
        }
        result
    }

    pub fn symbols(&self) -> Vec<SymbolId> {
        let mut result = self.pre.symbols();
        for node in &self.nodes {
            result.push(node.address);
            result.extend(node.flow_symbols());
            for field in &node.data_fields {
                result.push(field.pre_value);
                result.push(field.post_value);
            }
            for pointer in &node.pointer_fields {
                result.push(pointer.field.pre_value);
                result.push(pointer.field.post_value);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::MemoryAxiom;
    use crate::symbols::Order;
    use indexmap::indexmap;

    fn sample_node(factory: &mut SymbolFactory) -> FlowGraphNode {
        let memory = MemoryAxiom {
            node: factory.fresh_fo(Sort::Ptr),
            node_type: TypeId(0),
            flow: factory.fresh_so(Sort::Data),
            fields: indexmap! {
                "val".to_string() => factory.fresh_fo(Sort::Data),
                "next".to_string() => factory.fresh_fo(Sort::Ptr),
            },
        };
        FlowGraphNode::from_memory(&memory, false, factory, Sort::Data, |name| name == "next")
    }

    #[test]
    fn node_flow_symbols_are_distinct_per_mode() {
        let mut factory = SymbolFactory::new();
        let node = sample_node(&mut factory);
        let symbols = node.flow_symbols();
        let mut unique = symbols.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(symbols.len(), unique.len());
        assert!(symbols.iter().all(|s| s.order == Order::Second));
    }

    #[test]
    fn to_memory_uses_mode_values() {
        let mut factory = SymbolFactory::new();
        let mut node = sample_node(&mut factory);
        let new_next = factory.fresh_fo(Sort::Ptr);
        node.field_mut("next").expect("next field").post_value = new_next;

        let pre = node.to_memory(EMode::Pre);
        let post = node.to_memory(EMode::Post);
        assert_ne!(pre.fields["next"], post.fields["next"]);
        assert_eq!(post.fields["next"], new_next);
        assert_eq!(pre.fields["val"], post.fields["val"]);
    }

    #[test]
    fn incoming_edges_respect_mode() {
        let mut factory = SymbolFactory::new();
        let mut first = sample_node(&mut factory);
        let second = sample_node(&mut factory);
        first.field_mut("next").expect("next field").pre_value = second.address;

        let graph = FlowGraph {
            pre: Annotation::new(),
            nodes: vec![first, second],
        };
        let target = graph.nodes[1].clone();
        assert_eq!(graph.incoming_edges(&target, EMode::Pre).len(), 1);
        assert_eq!(graph.incoming_edges(&target, EMode::Post).len(), 0);
    }
}
