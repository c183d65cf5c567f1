//! The opaque expression objects attached to configuration declarations.
//!
//! The configuration language frontend is an external collaborator; by the
//! time a configuration reaches this engine its expressions have been
//! lowered to this small AST. The engine needs exactly two things from an
//! expression: static reference analysis (for dependency edges) and
//! evaluation against a scope (done in `eval`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::addrs::Reference;
use crate::value::Value;

/// A lowered configuration expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A constant value.
    Literal(Value),
    /// A reference to another addressable object.
    Ref(Reference),
    /// Attribute access on the result of another expression.
    GetAttr(Box<Expr>, String),
    /// String concatenation of the operands, in order.
    Concat(Vec<Expr>),
    /// A list constructor.
    Tuple(Vec<Expr>),
    /// An object constructor.
    Object(BTreeMap<String, Expr>),
}

impl Expr {
    /// A literal expression.
    #[must_use]
    pub const fn lit(value: Value) -> Self {
        Self::Literal(value)
    }

    /// A literal string expression.
    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Self::Literal(Value::string(s))
    }

    /// A literal integer expression.
    #[must_use]
    pub fn int(n: i64) -> Self {
        Self::Literal(Value::int(n))
    }

    /// A reference expression.
    #[must_use]
    pub const fn reference(r: Reference) -> Self {
        Self::Ref(r)
    }

    /// Attribute access on this expression.
    #[must_use]
    pub fn attr(self, name: impl Into<String>) -> Self {
        Self::GetAttr(Box::new(self), name.into())
    }

    /// An empty object expression.
    #[must_use]
    pub const fn empty_object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Collects every reference appearing anywhere in this expression.
    ///
    /// This is the static analysis used to compute dependency edges, so it
    /// must be complete: a missed reference means a missed edge and a
    /// possible use of unevaluated data at walk time.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references(&self, refs: &mut Vec<Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(r) => refs.push(r.clone()),
            Self::GetAttr(base, _) => base.collect_references(refs),
            Self::Concat(items) | Self::Tuple(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Self::Object(entries) => {
                for value in entries.values() {
                    value.collect_references(refs);
                }
            }
        }
    }
}

/// The repetition argument of a resource or module call declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repetition {
    /// No repetition: exactly one instance with no key.
    Single,
    /// `count = <expr>`: integer-indexed instances.
    Count(Expr),
    /// `for_each = <expr>`: string-keyed instances.
    ForEach(Expr),
}

impl Repetition {
    /// The references of the repetition expression, if any.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        match self {
            Self::Single => Vec::new(),
            Self::Count(expr) | Self::ForEach(expr) => expr.references(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::Resource;

    #[test]
    fn test_reference_collection() {
        let expr = Expr::Object(
            [
                (
                    String::from("name"),
                    Expr::Concat(vec![
                        Expr::str("web-"),
                        Expr::reference(Reference::InputVariable(String::from("suffix"))),
                    ]),
                ),
                (
                    String::from("upstream"),
                    Expr::reference(Reference::Resource(Resource::managed("test_thing", "base")))
                        .attr("id"),
                ),
            ]
            .into(),
        );

        let refs = expr.references();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&Reference::InputVariable(String::from("suffix"))));
        assert!(refs
            .iter()
            .any(|r| r.resource() == Some(&Resource::managed("test_thing", "base"))));
    }

    #[test]
    fn test_literal_has_no_references() {
        assert!(Expr::int(3).references().is_empty());
        assert!(Repetition::Single.references().is_empty());
    }
}
