use crate::sorts::SmtSort;

/// Encoding of the null pointer.
pub const NULL_VALUE: i64 = 0;
/// Smallest representable data value.
pub const MIN_VALUE: i64 = -65536;
/// Largest representable data value.
pub const MAX_VALUE: i64 = 65536;

/// Abstract SMT term, solver-agnostic.
///
/// Second-order flow values appear only through [`Term::Apply`]: a flow
/// symbol is a declared `Int -> Bool` membership function, never a term
/// by itself. Quantifiers bind a named constant; binder names must be
/// unique per nesting (the encoding generates them from a counter).
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Constant reference by name.
    Var(String, SmtSort),
    IntLit(i64),
    BoolLit(bool),

    // Comparison
    Eq(Box<Term>, Box<Term>),
    Lt(Box<Term>, Box<Term>),
    Le(Box<Term>, Box<Term>),
    Gt(Box<Term>, Box<Term>),
    Ge(Box<Term>, Box<Term>),

    // Boolean logic
    And(Vec<Term>),
    Or(Vec<Term>),
    Not(Box<Term>),
    Implies(Box<Term>, Box<Term>),
    /// At most one of the operands holds.
    AtMostOne(Vec<Term>),

    /// Membership application of a declared flow function.
    Apply(String, Box<Term>),

    // Quantifiers over a named bound constant
    Forall(String, SmtSort, Box<Term>),
    Exists(String, SmtSort, Box<Term>),
}

impl Term {
    pub fn var(name: impl Into<String>, sort: SmtSort) -> Term {
        Term::Var(name.into(), sort)
    }

    pub fn int(value: i64) -> Term {
        Term::IntLit(value)
    }

    pub fn bool(value: bool) -> Term {
        Term::BoolLit(value)
    }

    pub fn eq(self, other: Term) -> Term {
        Term::Eq(Box::new(self), Box::new(other))
    }

    pub fn neq(self, other: Term) -> Term {
        self.eq(other).not()
    }

    pub fn lt(self, other: Term) -> Term {
        Term::Lt(Box::new(self), Box::new(other))
    }

    pub fn le(self, other: Term) -> Term {
        Term::Le(Box::new(self), Box::new(other))
    }

    pub fn gt(self, other: Term) -> Term {
        Term::Gt(Box::new(self), Box::new(other))
    }

    pub fn ge(self, other: Term) -> Term {
        Term::Ge(Box::new(self), Box::new(other))
    }

    pub fn and(terms: Vec<Term>) -> Term {
        match terms.len() {
            0 => Term::BoolLit(true),
            1 => terms.into_iter().next().expect("one conjunct"),
            _ => Term::And(terms),
        }
    }

    pub fn or(terms: Vec<Term>) -> Term {
        match terms.len() {
            0 => Term::BoolLit(false),
            1 => terms.into_iter().next().expect("one disjunct"),
            _ => Term::Or(terms),
        }
    }

    pub fn not(self) -> Term {
        Term::Not(Box::new(self))
    }

    pub fn implies(self, other: Term) -> Term {
        Term::Implies(Box::new(self), Box::new(other))
    }

    pub fn at_most_one(terms: Vec<Term>) -> Term {
        if terms.len() <= 1 {
            return Term::BoolLit(true);
        }
        Term::AtMostOne(terms)
    }

    pub fn apply(function: impl Into<String>, argument: Term) -> Term {
        Term::Apply(function.into(), Box::new(argument))
    }

    pub fn forall(binder: impl Into<String>, sort: SmtSort, body: Term) -> Term {
        Term::Forall(binder.into(), sort, Box::new(body))
    }

    pub fn exists(binder: impl Into<String>, sort: SmtSort, body: Term) -> Term {
        Term::Exists(binder.into(), sort, Box::new(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_junctions_collapse_to_literals() {
        assert_eq!(Term::and(vec![]), Term::BoolLit(true));
        assert_eq!(Term::or(vec![]), Term::BoolLit(false));
        assert_eq!(Term::at_most_one(vec![]), Term::BoolLit(true));
    }

    #[test]
    fn singleton_junctions_unwrap() {
        let inner = Term::var("x", SmtSort::Bool);
        assert_eq!(Term::and(vec![inner.clone()]), inner);
        assert_eq!(Term::or(vec![inner.clone()]), inner);
    }
}
