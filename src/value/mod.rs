//! The typed value model used by the evaluator and the change records.
//!
//! Values carry an orthogonal annotation set alongside the underlying
//! data: a sensitivity mark, and an "unknown" variant with optional
//! refinements (facts known about a value before the value itself is).
//! Combinators propagate annotations through composition so that, for
//! example, concatenating a known prefix with an unknown suffix yields an
//! unknown string refined with that prefix.

mod marks;

pub use marks::{Marks, Refinement};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A typed value with its annotation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    /// The underlying data, or an unknown placeholder.
    pub kind: ValueKind,
    /// Annotations riding along with the value.
    #[serde(default, skip_serializing_if = "Marks::is_empty")]
    pub marks: Marks,
}

/// The underlying data of a [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// An explicit null.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. Stored as f64; integral values round-trip exactly within
    /// the 53-bit mantissa, which covers every count/index in practice.
    Number(f64),
    /// A string.
    String(String),
    /// An ordered sequence.
    List(Vec<Value>),
    /// A string-keyed mapping, also used for object values.
    Map(BTreeMap<String, Value>),
    /// A value that cannot be known until a later round, with whatever
    /// refinements are already established.
    Unknown(Refinement),
}

impl Value {
    /// An unmarked null.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            kind: ValueKind::Null,
            marks: Marks::none(),
        }
    }

    /// An unmarked boolean.
    #[must_use]
    pub const fn bool(b: bool) -> Self {
        Self {
            kind: ValueKind::Bool(b),
            marks: Marks::none(),
        }
    }

    /// An unmarked integer number.
    #[must_use]
    pub fn int(n: i64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        Self {
            kind: ValueKind::Number(n as f64),
            marks: Marks::none(),
        }
    }

    /// An unmarked string.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(s.into()),
            marks: Marks::none(),
        }
    }

    /// An unmarked list.
    #[must_use]
    pub const fn list(items: Vec<Self>) -> Self {
        Self {
            kind: ValueKind::List(items),
            marks: Marks::none(),
        }
    }

    /// An unmarked map/object.
    #[must_use]
    pub const fn map(entries: BTreeMap<String, Self>) -> Self {
        Self {
            kind: ValueKind::Map(entries),
            marks: Marks::none(),
        }
    }

    /// A wholly-unknown value with no refinements.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            kind: ValueKind::Unknown(Refinement::none()),
            marks: Marks::none(),
        }
    }

    /// An unknown value with the given refinements.
    #[must_use]
    pub const fn unknown_refined(refinement: Refinement) -> Self {
        Self {
            kind: ValueKind::Unknown(refinement),
            marks: Marks::none(),
        }
    }

    /// Returns this value with the sensitive mark added.
    #[must_use]
    pub fn mark_sensitive(mut self) -> Self {
        self.marks.sensitive = true;
        self
    }

    /// Returns this value with another value's marks unioned in.
    #[must_use]
    pub fn with_marks_from(mut self, other: &Self) -> Self {
        self.marks = self.marks.union(&other.marks);
        self
    }

    /// Returns true if this value itself is unknown (not recursing into
    /// collections).
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self.kind, ValueKind::Unknown(_))
    }

    /// Returns true if this value or any nested value is unknown.
    #[must_use]
    pub fn has_unknown(&self) -> bool {
        match &self.kind {
            ValueKind::Unknown(_) => true,
            ValueKind::List(items) => items.iter().any(Self::has_unknown),
            ValueKind::Map(entries) => entries.values().any(Self::has_unknown),
            _ => false,
        }
    }

    /// Returns true if this value or any nested value is marked sensitive.
    #[must_use]
    pub fn has_sensitive(&self) -> bool {
        if self.marks.sensitive {
            return true;
        }
        match &self.kind {
            ValueKind::List(items) => items.iter().any(Self::has_sensitive),
            ValueKind::Map(entries) => entries.values().any(Self::has_sensitive),
            _ => false,
        }
    }

    /// Returns true if this value is null.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    /// The boolean content, if this is a known boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self.kind {
            ValueKind::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// The string content, if this is a known string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric content as a non-negative integer, if representable.
    /// This is the shape required of `count` values.
    #[must_use]
    pub fn as_count(&self) -> Option<u64> {
        match self.kind {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            ValueKind::Number(n) if n >= 0.0 && n.fract() == 0.0 => Some(n as u64),
            _ => None,
        }
    }

    /// The map content, if this is a known map/object.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match &self.kind {
            ValueKind::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// The list content, if this is a known list.
    #[must_use]
    pub const fn as_list(&self) -> Option<&Vec<Self>> {
        match &self.kind {
            ValueKind::List(items) => Some(items),
            _ => None,
        }
    }

    /// Looks up an attribute of an object value. Unknown objects yield an
    /// unknown attribute carrying the object's marks, so downstream
    /// expressions keep their annotations.
    #[must_use]
    pub fn get_attr(&self, name: &str) -> Option<Self> {
        match &self.kind {
            ValueKind::Map(entries) => entries
                .get(name)
                .map(|v| v.clone().with_marks_from(self)),
            ValueKind::Unknown(_) => Some(Self {
                kind: ValueKind::Unknown(Refinement::none()),
                marks: self.marks,
            }),
            _ => None,
        }
    }

    /// Concatenates string operands, propagating marks and unknowns.
    ///
    /// When a prefix of the operands is known and a later operand is
    /// unknown, the result is unknown refined with the known prefix, so
    /// downstream comparisons against that prefix can still resolve.
    #[must_use]
    pub fn concat(operands: &[Self]) -> Self {
        let mut marks = Marks::none();
        let mut prefix = String::new();
        let mut known = true;

        for operand in operands {
            marks = marks.union(&operand.marks);
            if !known {
                continue;
            }
            match &operand.kind {
                ValueKind::String(s) => prefix.push_str(s),
                ValueKind::Unknown(r) => {
                    if let Some(p) = &r.string_prefix {
                        prefix.push_str(p);
                    }
                    known = false;
                }
                // Non-string operands are rendered through Display.
                other => prefix.push_str(&render_scalar(other)),
            }
        }

        let kind = if known {
            ValueKind::String(prefix)
        } else {
            ValueKind::Unknown(Refinement::with_string_prefix(prefix))
        };
        Self { kind, marks }
    }

    /// Builds a list value from element values. Element marks stay on the
    /// elements; an unknown element does not make the whole list unknown.
    #[must_use]
    pub const fn collect_list(items: Vec<Self>) -> Self {
        Self::list(items)
    }
}

fn render_scalar(kind: &ValueKind) -> String {
    match kind {
        ValueKind::Null => String::from("null"),
        ValueKind::Bool(b) => b.to_string(),
        ValueKind::Number(n) => {
            if n.fract() == 0.0 {
                format!("{n:.0}")
            } else {
                n.to_string()
            }
        }
        ValueKind::String(s) => s.clone(),
        _ => String::from("<complex>"),
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.marks.sensitive {
            return write!(f, "(sensitive value)");
        }
        match &self.kind {
            ValueKind::Unknown(_) => write!(f, "(known after apply)"),
            ValueKind::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ValueKind::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                write!(f, "}}")
            }
            other => write!(f, "{}", render_scalar(other)),
        }
    }
}
