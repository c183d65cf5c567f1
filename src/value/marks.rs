//! Value annotations: sensitivity marks and unknown-value refinements.

use serde::{Deserialize, Serialize};

/// The annotation set carried by every value.
///
/// Marks are unioned, never cleared, as values flow through expression
/// composition: a result derived from a sensitive operand is sensitive.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Marks {
    /// The value must not be displayed in plain output.
    #[serde(default)]
    pub sensitive: bool,
}

impl Marks {
    /// The empty mark set.
    #[must_use]
    pub const fn none() -> Self {
        Self { sensitive: false }
    }

    /// Returns the union of two mark sets.
    #[must_use]
    pub const fn union(self, other: &Self) -> Self {
        Self {
            sensitive: self.sensitive || other.sensitive,
        }
    }

    /// Returns true if no marks are set. Used to omit the field from
    /// serialized values.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.sensitive
    }
}

/// Facts established about an unknown value before the value itself is
/// known. Downstream expressions can sometimes produce a known result
/// from a refined unknown, e.g. a prefix comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Refinement {
    /// The value is a string known to start with this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_prefix: Option<String>,
    /// The value is known to be non-null once resolved.
    #[serde(default)]
    pub non_null: bool,
}

impl Refinement {
    /// No refinements.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            string_prefix: None,
            non_null: false,
        }
    }

    /// An unknown string with a known prefix. Implies non-null.
    #[must_use]
    pub const fn with_string_prefix(prefix: String) -> Self {
        Self {
            string_prefix: Some(prefix),
            non_null: true,
        }
    }

    /// An unknown value known to be non-null.
    #[must_use]
    pub const fn non_null() -> Self {
        Self {
            string_prefix: None,
            non_null: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_union() {
        let sensitive = Marks { sensitive: true };
        let plain = Marks::none();
        assert!(plain.union(&sensitive).sensitive);
        assert!(sensitive.union(&plain).sensitive);
        assert!(!plain.union(&plain).sensitive);
    }

    #[test]
    fn test_refinement_prefix_implies_non_null() {
        let refinement = Refinement::with_string_prefix(String::from("web-"));
        assert!(refinement.non_null);
        assert_eq!(refinement.string_prefix.as_deref(), Some("web-"));
    }
}
