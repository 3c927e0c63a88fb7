use std::fmt;

use serde::Serialize;

/// Value sorts of the object language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Sort {
    Void,
    Bool,
    Data,
    Ptr,
    Tid,
}

/// First-order symbols denote individual values, second-order symbols
/// denote set-like flow values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Order {
    First,
    Second,
}

/// An interned symbolic value.
///
/// Symbols are self-describing indices: two symbols are the same value
/// exactly when they compare equal, and a symbol never changes its sort
/// or order. Fresh symbols come from a [`SymbolFactory`] only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SymbolId {
    pub index: u32,
    pub sort: Sort,
    pub order: Order,
}

/// Reserved index for predicate probe symbols, see [`SymbolId::probe`].
const PROBE_INDEX: u32 = u32::MAX;

impl SymbolId {
    /// The distinguished placeholder symbol a [`crate::config::SolverConfig`]
    /// predicate is instantiated against. A factory never hands out this
    /// index, so substituting the probe cannot capture other symbols.
    pub fn probe(sort: Sort) -> Self {
        SymbolId {
            index: PROBE_INDEX,
            sort,
            order: Order::First,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.index == PROBE_INDEX
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_probe() {
            return write!(f, "?probe");
        }
        let prefix = match (self.order, self.sort) {
            (Order::Second, _) => "F",
            (Order::First, Sort::Void) => "v",
            (Order::First, Sort::Bool) => "b",
            (Order::First, Sort::Data) => "d",
            (Order::First, Sort::Ptr) => "p",
            (Order::First, Sort::Tid) => "t",
        };
        write!(f, "{prefix}{}", self.index)
    }
}

/// Issues fresh symbols.
///
/// Freshness is a monotonically increasing counter; seeding the factory
/// with [`SymbolFactory::avoiding`] (or [`SymbolFactory::avoid`]) moves
/// the counter past every symbol of an existing object, so renamings can
/// be built locally without a global registry.
#[derive(Debug, Default, Clone)]
pub struct SymbolFactory {
    next: u32,
}

impl SymbolFactory {
    pub fn new() -> Self {
        SymbolFactory::default()
    }

    pub fn avoiding<I: IntoIterator<Item = SymbolId>>(symbols: I) -> Self {
        let mut factory = SymbolFactory::new();
        factory.avoid(symbols);
        factory
    }

    pub fn avoid<I: IntoIterator<Item = SymbolId>>(&mut self, symbols: I) {
        for symbol in symbols {
            if symbol.is_probe() {
                continue;
            }
            self.next = self.next.max(symbol.index + 1);
        }
    }

    pub fn fresh(&mut self, sort: Sort, order: Order) -> SymbolId {
        let index = self.next;
        assert!(index < PROBE_INDEX, "symbol space exhausted");
        self.next += 1;
        SymbolId { index, sort, order }
    }

    /// Fresh first-order symbol.
    pub fn fresh_fo(&mut self, sort: Sort) -> SymbolId {
        self.fresh(sort, Order::First)
    }

    /// Fresh second-order (flow) symbol.
    pub fn fresh_so(&mut self, sort: Sort) -> SymbolId {
        self.fresh(sort, Order::Second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_symbols_are_distinct() {
        let mut factory = SymbolFactory::new();
        let a = factory.fresh_fo(Sort::Ptr);
        let b = factory.fresh_fo(Sort::Ptr);
        let c = factory.fresh_so(Sort::Data);
        assert_ne!(a, b);
        assert_ne!(a.index, c.index);
        assert_eq!(c.order, Order::Second);
    }

    #[test]
    fn avoiding_skips_existing_indices() {
        let mut factory = SymbolFactory::new();
        let taken: Vec<_> = (0..5).map(|_| factory.fresh_fo(Sort::Data)).collect();
        let mut other = SymbolFactory::avoiding(taken.iter().copied());
        let fresh = other.fresh_fo(Sort::Data);
        assert!(taken.iter().all(|t| t.index != fresh.index));
    }

    #[test]
    fn probe_symbol_is_never_issued_and_never_avoided() {
        let mut factory = SymbolFactory::avoiding([SymbolId::probe(Sort::Data)]);
        let fresh = factory.fresh_fo(Sort::Data);
        assert_eq!(fresh.index, 0);
        assert!(!fresh.is_probe());
    }

    #[test]
    fn display_is_sort_prefixed() {
        let mut factory = SymbolFactory::new();
        let p = factory.fresh_fo(Sort::Ptr);
        let flow = factory.fresh_so(Sort::Data);
        assert_eq!(p.to_string(), "p0");
        assert_eq!(flow.to_string(), "F1");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn avoiding_always_yields_unused_indices(
                indices in proptest::collection::vec(0u32..1000, 0..20)
            ) {
                let symbols: Vec<SymbolId> = indices
                    .iter()
                    .map(|&index| SymbolId {
                        index,
                        sort: Sort::Data,
                        order: Order::First,
                    })
                    .collect();
                let mut factory = SymbolFactory::avoiding(symbols.iter().copied());
                let fresh = factory.fresh_fo(Sort::Data);
                prop_assert!(symbols.iter().all(|s| s.index != fresh.index));
            }
        }
    }
}
