//! Logic AST: symbolic states, resources, specification markers.
//!
//! An [`Annotation`] is a symbolic program state: `now` holds the current
//! heap and stack facts as a separating conjunction, `past` keeps
//! historical snapshots of shared cells, `future` anticipated updates.
//! Heap mutations are summarized as [`HeapEffect`]s for interference
//! reasoning.

use indexmap::IndexMap;
use serde::Serialize;

use crate::program::{BinaryOperator, MemoryWrite, TypeId, VarId};
use crate::symbols::{Sort, SymbolFactory, SymbolId};

/// Specification kind of an API operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Specification {
    Contains,
    Insert,
    Delete,
}

impl Specification {
    /// Infer the specification from a function name, the way the surface
    /// syntax spells set operations.
    pub fn for_function(name: &str) -> Option<Specification> {
        match name {
            "contains" => Some(Specification::Contains),
            "insert" | "add" => Some(Specification::Insert),
            "delete" | "remove" => Some(Specification::Delete),
            _ => None,
        }
    }
}

/// Symbolic stack expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymbolicExpr {
    Symbol(SymbolId),
    Bool(bool),
    Null,
    Min,
    Max,
    /// Thread id of the executing thread.
    SelfTid,
    /// Thread id of an unspecified other thread.
    SomeTid,
    /// The "no owner" value of a lock field.
    Unlocked,
}

impl SymbolicExpr {
    pub fn sort(&self) -> Sort {
        match self {
            SymbolicExpr::Symbol(symbol) => symbol.sort,
            SymbolicExpr::Bool(_) => Sort::Bool,
            SymbolicExpr::Null => Sort::Ptr,
            SymbolicExpr::Min | SymbolicExpr::Max => Sort::Data,
            SymbolicExpr::SelfTid | SymbolicExpr::SomeTid | SymbolicExpr::Unlocked => Sort::Tid,
        }
    }

    pub fn symbol(&self) -> Option<SymbolId> {
        match self {
            SymbolicExpr::Symbol(symbol) => Some(*symbol),
            _ => None,
        }
    }
}

/// One heap node: address, flow value, and field valuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryAxiom {
    pub node: SymbolId,
    pub node_type: TypeId,
    pub flow: SymbolId,
    pub fields: IndexMap<String, SymbolId>,
}

impl MemoryAxiom {
    pub fn field(&self, name: &str) -> SymbolId {
        self.fields[name]
    }

    pub fn symbols(&self) -> impl Iterator<Item = SymbolId> + '_ {
        [self.node, self.flow]
            .into_iter()
            .chain(self.fields.values().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Axiom {
    /// Footprint-private node, unreachable from outside this thread.
    LocalMemory(MemoryAxiom),
    /// Node of the globally reasoned-about heap.
    SharedMemory(MemoryAxiom),
    /// Binds a program variable to its symbolic value.
    EqualsTo { variable: VarId, value: SymbolId },
    Stack {
        op: BinaryOperator,
        lhs: SymbolicExpr,
        rhs: SymbolicExpr,
    },
    InflowEmptiness { flow: SymbolId, is_empty: bool },
    InflowContainsValue { flow: SymbolId, value: SymbolId },
    InflowContainsRange {
        flow: SymbolId,
        low: SymbolicExpr,
        high: SymbolicExpr,
    },
    /// Pending specification marker: the operation must eventually be
    /// shown to contain/insert/delete `key`.
    Obligation { spec: Specification, key: SymbolId },
    /// Discharged specification marker with the mandated return value.
    Fulfillment { return_value: bool },
}

impl Axiom {
    pub fn stack(op: BinaryOperator, lhs: SymbolicExpr, rhs: SymbolicExpr) -> Axiom {
        Axiom::Stack { op, lhs, rhs }
    }

    pub fn eq(lhs: SymbolicExpr, rhs: SymbolicExpr) -> Axiom {
        Axiom::stack(BinaryOperator::Eq, lhs, rhs)
    }

    pub fn neq(lhs: SymbolicExpr, rhs: SymbolicExpr) -> Axiom {
        Axiom::stack(BinaryOperator::Neq, lhs, rhs)
    }

    pub fn memory(&self) -> Option<&MemoryAxiom> {
        match self {
            Axiom::LocalMemory(memory) | Axiom::SharedMemory(memory) => Some(memory),
            _ => None,
        }
    }

    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            Axiom::LocalMemory(_)
                | Axiom::SharedMemory(_)
                | Axiom::Obligation { .. }
                | Axiom::Fulfillment { .. }
        )
    }

    fn visit_symbols(&self, visit: &mut impl FnMut(SymbolId)) {
        match self {
            Axiom::LocalMemory(memory) | Axiom::SharedMemory(memory) => {
                memory.symbols().for_each(visit)
            }
            Axiom::EqualsTo { value, .. } => visit(*value),
            Axiom::Stack { lhs, rhs, .. } => {
                if let Some(symbol) = lhs.symbol() {
                    visit(symbol);
                }
                if let Some(symbol) = rhs.symbol() {
                    visit(symbol);
                }
            }
            Axiom::InflowEmptiness { flow, .. } => visit(*flow),
            Axiom::InflowContainsValue { flow, value } => {
                visit(*flow);
                visit(*value);
            }
            Axiom::InflowContainsRange { flow, low, high } => {
                visit(*flow);
                if let Some(symbol) = low.symbol() {
                    visit(symbol);
                }
                if let Some(symbol) = high.symbol() {
                    visit(symbol);
                }
            }
            Axiom::Obligation { key, .. } => visit(*key),
            Axiom::Fulfillment { .. } => {}
        }
    }

    fn map_symbols(&mut self, map: &mut dyn FnMut(SymbolId) -> SymbolId) {
        fn map_expr(expr: &mut SymbolicExpr, map: &mut dyn FnMut(SymbolId) -> SymbolId) {
            if let SymbolicExpr::Symbol(symbol) = expr {
                *symbol = map(*symbol);
            }
        }
        match self {
            Axiom::LocalMemory(memory) | Axiom::SharedMemory(memory) => {
                memory.node = map(memory.node);
                memory.flow = map(memory.flow);
                for value in memory.fields.values_mut() {
                    *value = map(*value);
                }
            }
            Axiom::EqualsTo { value, .. } => *value = map(*value),
            Axiom::Stack { lhs, rhs, .. } => {
                map_expr(lhs, map);
                map_expr(rhs, map);
            }
            Axiom::InflowEmptiness { flow, .. } => *flow = map(*flow),
            Axiom::InflowContainsValue { flow, value } => {
                *flow = map(*flow);
                *value = map(*value);
            }
            Axiom::InflowContainsRange { flow, low, high } => {
                *flow = map(*flow);
                map_expr(low, map);
                map_expr(high, map);
            }
            Axiom::Obligation { key, .. } => *key = map(*key),
            Axiom::Fulfillment { .. } => {}
        }
    }
}

/// A separating conjunction of axioms, kept flat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Formula {
    pub conjuncts: Vec<Axiom>,
}

impl Formula {
    pub fn new() -> Formula {
        Formula::default()
    }

    pub fn with(conjuncts: Vec<Axiom>) -> Formula {
        Formula { conjuncts }
    }

    pub fn conjoin(&mut self, axiom: Axiom) {
        self.conjuncts.push(axiom);
    }

    pub fn conjoin_all<I: IntoIterator<Item = Axiom>>(&mut self, axioms: I) {
        self.conjuncts.extend(axioms);
    }

    pub fn remove_conjuncts_if(&mut self, predicate: impl Fn(&Axiom) -> bool) {
        self.conjuncts.retain(|axiom| !predicate(axiom));
    }

    /// Drop syntactic duplicates, keeping first occurrences.
    pub fn dedup(&mut self) {
        let mut seen: Vec<Axiom> = Vec::with_capacity(self.conjuncts.len());
        for axiom in self.conjuncts.drain(..) {
            if !seen.contains(&axiom) {
                seen.push(axiom);
            }
        }
        self.conjuncts = seen;
    }

    pub fn memory(&self) -> impl Iterator<Item = &MemoryAxiom> {
        self.conjuncts.iter().filter_map(Axiom::memory)
    }

    pub fn local_memory(&self) -> impl Iterator<Item = &MemoryAxiom> {
        self.conjuncts.iter().filter_map(|axiom| match axiom {
            Axiom::LocalMemory(memory) => Some(memory),
            _ => None,
        })
    }

    pub fn shared_memory(&self) -> impl Iterator<Item = &MemoryAxiom> {
        self.conjuncts.iter().filter_map(|axiom| match axiom {
            Axiom::SharedMemory(memory) => Some(memory),
            _ => None,
        })
    }

    /// The memory resource at `address`, with its locality, if present.
    pub fn memory_at(&self, address: SymbolId) -> Option<(bool, &MemoryAxiom)> {
        self.conjuncts.iter().find_map(|axiom| match axiom {
            Axiom::LocalMemory(memory) if memory.node == address => Some((true, memory)),
            Axiom::SharedMemory(memory) if memory.node == address => Some((false, memory)),
            _ => None,
        })
    }

    /// The symbolic value bound to a program variable.
    pub fn value_of(&self, variable: VarId) -> Option<SymbolId> {
        self.conjuncts.iter().find_map(|axiom| match axiom {
            Axiom::EqualsTo { variable: v, value } if *v == variable => Some(*value),
            _ => None,
        })
    }

    pub fn value_of_mut(&mut self, variable: VarId) -> Option<&mut SymbolId> {
        self.conjuncts.iter_mut().find_map(|axiom| match axiom {
            Axiom::EqualsTo { variable: v, value } if *v == variable => Some(value),
            _ => None,
        })
    }

    pub fn obligations(&self) -> impl Iterator<Item = (Specification, SymbolId)> + '_ {
        self.conjuncts.iter().filter_map(|axiom| match axiom {
            Axiom::Obligation { spec, key } => Some((*spec, *key)),
            _ => None,
        })
    }

    pub fn fulfillments(&self) -> impl Iterator<Item = bool> + '_ {
        self.conjuncts.iter().filter_map(|axiom| match axiom {
            Axiom::Fulfillment { return_value } => Some(*return_value),
            _ => None,
        })
    }

    pub fn symbols(&self) -> Vec<SymbolId> {
        let mut result = Vec::new();
        for axiom in &self.conjuncts {
            axiom.visit_symbols(&mut |symbol| result.push(symbol));
        }
        result
    }
}

/// A non-separating implication between two conjunctions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Implication {
    pub premise: Formula,
    pub conclusion: Formula,
}

/// A conjunction of implications, the shape invariants and edge
/// predicates are instantiated as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImplicationSet {
    pub implications: Vec<Implication>,
}

impl ImplicationSet {
    pub fn new() -> ImplicationSet {
        ImplicationSet::default()
    }

    pub fn add(&mut self, premise: Formula, conclusion: Formula) {
        self.implications.push(Implication {
            premise,
            conclusion,
        });
    }

    /// An implication set with a trivial premise.
    pub fn fact(conclusion: Formula) -> ImplicationSet {
        let mut result = ImplicationSet::new();
        result.add(Formula::new(), conclusion);
        result
    }

    pub fn symbols(&self) -> Vec<SymbolId> {
        let mut result = Vec::new();
        for implication in &self.implications {
            result.extend(implication.premise.symbols());
            result.extend(implication.conclusion.symbols());
        }
        result
    }
}

/// Historical snapshot of a shared cell, recorded when interference
/// invalidates current knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PastPredicate {
    pub memory: MemoryAxiom,
}

/// A guarded pending update, used to anticipate linearization points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuturePredicate {
    pub command: MemoryWrite,
    pub pre: Formula,
    pub post: Formula,
}

/// A symbolic program state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub now: Formula,
    pub past: Vec<PastPredicate>,
    pub future: Vec<FuturePredicate>,
}

impl Annotation {
    pub fn new() -> Annotation {
        Annotation::default()
    }

    pub fn with_now(now: Formula) -> Annotation {
        Annotation {
            now,
            past: Vec::new(),
            future: Vec::new(),
        }
    }

    pub fn conjoin(&mut self, axiom: Axiom) {
        self.now.conjoin(axiom);
    }

    pub fn symbols(&self) -> Vec<SymbolId> {
        let mut result = self.now.symbols();
        for past in &self.past {
            result.extend(past.memory.symbols());
        }
        for future in &self.future {
            result.extend(future.pre.symbols());
            result.extend(future.post.symbols());
        }
        result
    }
}

/// Abstract summary of one atomic shared-heap mutation, reusable as an
/// interference hypothesis by other threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapEffect {
    pub pre: MemoryAxiom,
    pub post: MemoryAxiom,
    /// Required but unaltered knowledge; not a frame.
    pub context: Formula,
}

impl HeapEffect {
    pub fn updates_flow(&self) -> bool {
        self.pre.flow != self.post.flow
    }

    pub fn updates_field(&self, field: &str) -> bool {
        self.pre.fields.get(field) != self.post.fields.get(field)
    }

    pub fn is_empty(&self) -> bool {
        !self.updates_flow()
            && self
                .pre
                .fields
                .keys()
                .all(|field| !self.updates_field(field))
    }

    pub fn symbols(&self) -> Vec<SymbolId> {
        let mut result: Vec<SymbolId> = self.pre.symbols().collect();
        result.extend(self.post.symbols());
        result.extend(self.context.symbols());
        result
    }
}

/// Result of one abstract transfer step: disjunctive successor states
/// plus the externally visible effects of the step.
#[derive(Debug, Clone, Default)]
pub struct PostImage {
    pub annotations: Vec<Annotation>,
    pub effects: Vec<HeapEffect>,
}

impl PostImage {
    /// The empty (unreachable) post image.
    pub fn unreachable() -> PostImage {
        PostImage::default()
    }

    pub fn of(annotation: Annotation) -> PostImage {
        PostImage {
            annotations: vec![annotation],
            effects: Vec::new(),
        }
    }
}

//
// Renaming
//

/// An on-demand symbol renaming: every distinct symbol encountered is
/// mapped to a fresh one of the same sort and order, in traversal order.
pub struct Renaming<'a> {
    factory: &'a mut SymbolFactory,
    mapping: IndexMap<SymbolId, SymbolId>,
}

impl<'a> Renaming<'a> {
    pub fn new(factory: &'a mut SymbolFactory) -> Self {
        Renaming {
            factory,
            mapping: IndexMap::new(),
        }
    }

    pub fn map(&mut self, symbol: SymbolId) -> SymbolId {
        if symbol.is_probe() {
            return symbol;
        }
        *self
            .mapping
            .entry(symbol)
            .or_insert_with(|| self.factory.fresh(symbol.sort, symbol.order))
    }
}

fn map_formula(formula: &mut Formula, map: &mut dyn FnMut(SymbolId) -> SymbolId) {
    for axiom in &mut formula.conjuncts {
        axiom.map_symbols(map);
    }
}

fn map_memory(memory: &mut MemoryAxiom, map: &mut dyn FnMut(SymbolId) -> SymbolId) {
    memory.node = map(memory.node);
    memory.flow = map(memory.flow);
    for value in memory.fields.values_mut() {
        *value = map(*value);
    }
}

/// Consistently rename every symbol of an annotation to fresh ones.
pub fn rename_annotation(annotation: &mut Annotation, factory: &mut SymbolFactory) {
    let mut renaming = Renaming::new(factory);
    let mut map = |symbol| renaming.map(symbol);
    map_formula(&mut annotation.now, &mut map);
    for past in &mut annotation.past {
        map_memory(&mut past.memory, &mut map);
    }
    for future in &mut annotation.future {
        map_formula(&mut future.pre, &mut map);
        map_formula(&mut future.post, &mut map);
    }
}

/// Consistently rename every symbol of an effect to fresh ones.
pub fn rename_effect(effect: &mut HeapEffect, factory: &mut SymbolFactory) {
    let mut renaming = Renaming::new(factory);
    let mut map = |symbol| renaming.map(symbol);
    map_memory(&mut effect.pre, &mut map);
    map_memory(&mut effect.post, &mut map);
    map_formula(&mut effect.context, &mut map);
}

/// Apply an explicit partial renaming to a formula; unmapped symbols are
/// left alone.
pub fn substitute_formula(
    formula: &mut Formula,
    mapping: &std::collections::HashMap<SymbolId, SymbolId>,
) {
    map_formula(formula, &mut |symbol| {
        mapping.get(&symbol).copied().unwrap_or(symbol)
    });
}

/// Rename an effect into canonical form: symbols are numbered from zero
/// in traversal order. Two α-equivalent effects canonicalize to
/// structurally equal values.
pub fn canonicalize_effect(effect: &mut HeapEffect) {
    let mut factory = SymbolFactory::new();
    rename_effect(effect, &mut factory);
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;

    fn memory(node: SymbolId, flow: SymbolId, next: SymbolId) -> MemoryAxiom {
        MemoryAxiom {
            node,
            node_type: TypeId(0),
            flow,
            fields: indexmap! { "next".to_string() => next },
        }
    }

    #[test]
    fn annotation_copy_is_structural() {
        let mut factory = SymbolFactory::new();
        let node = factory.fresh_fo(Sort::Ptr);
        let flow = factory.fresh_so(Sort::Data);
        let next = factory.fresh_fo(Sort::Ptr);

        let mut annotation = Annotation::new();
        annotation.conjoin(Axiom::SharedMemory(memory(node, flow, next)));
        annotation.conjoin(Axiom::neq(
            SymbolicExpr::Symbol(node),
            SymbolicExpr::Null,
        ));

        let copy = annotation.clone();
        assert_eq!(copy, annotation);

        // mutating the copy must not affect the original
        let mut copy = copy;
        rename_annotation(&mut copy, &mut factory);
        assert_ne!(copy, annotation);
        assert_eq!(annotation.now.conjuncts.len(), 2);
    }

    #[test]
    fn canonicalization_identifies_alpha_equivalent_effects() {
        let mut factory = SymbolFactory::new();
        let make = |factory: &mut SymbolFactory| {
            let node = factory.fresh_fo(Sort::Ptr);
            let flow = factory.fresh_so(Sort::Data);
            let old_next = factory.fresh_fo(Sort::Ptr);
            let new_next = factory.fresh_fo(Sort::Ptr);
            HeapEffect {
                pre: memory(node, flow, old_next),
                post: memory(node, flow, new_next),
                context: Formula::with(vec![Axiom::InflowEmptiness {
                    flow,
                    is_empty: false,
                }]),
            }
        };
        let mut first = make(&mut factory);
        let mut second = make(&mut factory);
        assert_ne!(first, second);

        canonicalize_effect(&mut first);
        canonicalize_effect(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_effect_detection() {
        let mut factory = SymbolFactory::new();
        let node = factory.fresh_fo(Sort::Ptr);
        let flow = factory.fresh_so(Sort::Data);
        let next = factory.fresh_fo(Sort::Ptr);
        let same = HeapEffect {
            pre: memory(node, flow, next),
            post: memory(node, flow, next),
            context: Formula::new(),
        };
        assert!(same.is_empty());

        let other = factory.fresh_fo(Sort::Ptr);
        let changed = HeapEffect {
            pre: memory(node, flow, next),
            post: memory(node, flow, other),
            context: Formula::new(),
        };
        assert!(!changed.is_empty());
        assert!(changed.updates_field("next"));
        assert!(!changed.updates_flow());
    }

    #[test]
    fn specification_from_function_name() {
        assert_eq!(
            Specification::for_function("contains"),
            Some(Specification::Contains)
        );
        assert_eq!(
            Specification::for_function("add"),
            Some(Specification::Insert)
        );
        assert_eq!(
            Specification::for_function("remove"),
            Some(Specification::Delete)
        );
        assert_eq!(Specification::for_function("rotate"), None);
    }
}
