//! Error types and diagnostics for the lattice engine.
//!
//! This module provides a comprehensive error hierarchy for all phases of
//! a plan/apply round (configuration analysis, graph construction, graph
//! walking, expression evaluation, and provider calls), plus the structured
//! [`Diagnostics`] list through which node-level problems are reported to
//! the caller without aborting the walk.

use thiserror::Error;

use crate::addrs::{AbsResourceInstance, ConfigResource, Target};

/// The main error type for the lattice engine.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Graph construction or validation errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Expression evaluation errors.
    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    /// Provider (resource plugin) errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// The walk was cancelled before completion.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Generic internal error. These indicate a bug in the engine itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors, detected statically during graph build.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A repetition expression evaluated to an invalid value.
    #[error("Invalid {argument} value for {resource}: {message}")]
    InvalidRepetition {
        /// Which repetition argument was invalid (`count` or `for_each`).
        argument: &'static str,
        /// The resource or module call carrying the repetition.
        resource: String,
        /// Description of the problem.
        message: String,
    },

    /// A named target matched no configuration or state object.
    #[error("Target {target} matches no resource or module in configuration or state")]
    UnknownTarget {
        /// The unmatched target.
        target: Target,
    },

    /// A reference names an object that does not exist.
    #[error("Reference to undeclared object {reference} in {module}")]
    UndeclaredReference {
        /// Display form of the reference.
        reference: String,
        /// The module containing the reference.
        module: String,
    },

    /// Circular dependency in configuration.
    #[error("Circular dependency detected: {cycle}")]
    CircularDependency {
        /// Display form of the cycle, in visit order.
        cycle: String,
    },
}

/// Graph construction and walk errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A cycle survived the static transform checks and was detected at
    /// walk time. This is a bug in an earlier transform.
    #[error("Cycle detected during walk: {cycle}; this is a bug in lattice, please report it")]
    WalkTimeCycle {
        /// Display form of the cycle.
        cycle: String,
    },
}

/// Expression evaluation errors.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The referenced object exists but the value has the wrong type.
    #[error("Invalid value for {reference}: {message}")]
    WrongType {
        /// Display form of the reference.
        reference: String,
        /// Description of the type mismatch.
        message: String,
    },

    /// The referenced object has not been evaluated yet. Appears only when
    /// a reference edge was missed, so it is an internal error.
    #[error("{reference} has not been evaluated yet; this is a bug in lattice, please report it")]
    NotYetEvaluated {
        /// Display form of the reference.
        reference: String,
    },

    /// A reference names an object with no declaration and no state.
    #[error("Reference to nonexistent object {reference}")]
    NonexistentObject {
        /// Display form of the reference.
        reference: String,
    },
}

/// Provider (resource plugin) errors. A deferral response is not an error
/// and is represented separately in the provider response types.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No provider is configured for the given resource.
    #[error("No provider configuration for {resource}")]
    NoProvider {
        /// The resource missing a provider.
        resource: ConfigResource,
    },

    /// The provider returned an application-level failure.
    #[error("Provider '{provider}' failed during {operation} of {instance}: {message}")]
    CallFailed {
        /// Provider name.
        provider: String,
        /// Which operation failed (read, plan, apply, import).
        operation: &'static str,
        /// The instance being operated on.
        instance: AbsResourceInstance,
        /// Error message from the provider.
        message: String,
    },

    /// The provider deferred a change in a round where deferrals were
    /// explicitly disallowed by the caller.
    #[error("Provider '{provider}' deferred changes for {instance} when deferrals were not allowed")]
    DeferralNotAllowed {
        /// Provider name.
        provider: String,
        /// The instance whose change was deferred.
        instance: AbsResourceInstance,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A lock operation failed for a reason other than contention.
    #[error("State lock error: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another operation.
    #[error("State is locked by another operation (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },
}

/// Result type alias for lattice operations.
pub type Result<T> = std::result::Result<T, LatticeError>;

impl LatticeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Fatal problem; the overall operation cannot succeed.
    Error,
    /// Surfaced to the user but non-fatal.
    Warning,
}

/// A single structured diagnostic.
///
/// Node-level failures during a graph walk become diagnostics attached to
/// the walk result rather than panics or early returns, so that unrelated
/// subtrees still complete and every problem is reported at once.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    /// Severity of the diagnostic.
    pub severity: Severity,
    /// Short one-line summary.
    pub summary: String,
    /// Longer free-form detail text.
    pub detail: String,
    /// Source address context, when the problem is attributable to a
    /// particular configuration object.
    pub address: Option<String>,
}

/// An ordered collection of diagnostics.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Diagnostics {
    diags: Vec<Diagnostic>,
}

impl Diagnostic {
    /// Creates an error diagnostic.
    #[must_use]
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            address: None,
        }
    }

    /// Creates a warning diagnostic.
    #[must_use]
    pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            address: None,
        }
    }

    /// Attaches an address context to the diagnostic.
    #[must_use]
    pub fn with_address(mut self, address: impl std::fmt::Display) -> Self {
        self.address = Some(address.to_string());
        self
    }
}

impl Diagnostics {
    /// Creates an empty diagnostics collection.
    #[must_use]
    pub const fn new() -> Self {
        Self { diags: Vec::new() }
    }

    /// Appends one diagnostic.
    pub fn push(&mut self, diag: Diagnostic) {
        self.diags.push(diag);
    }

    /// Appends an error built from any lattice error value.
    pub fn push_error(&mut self, err: &LatticeError) {
        self.diags
            .push(Diagnostic::error("Operation failed", err.to_string()));
    }

    /// Absorbs all diagnostics from another collection.
    pub fn extend(&mut self, other: Self) {
        self.diags.extend(other.diags);
    }

    /// Returns true if any diagnostic has error severity.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diags.iter().any(|d| d.severity == Severity::Error)
    }

    /// Returns true if the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    /// Returns the number of diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.diags.len()
    }

    /// Iterates over all diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diags.iter()
    }

    /// Returns only the warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&Diagnostic> {
        self.diags
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .collect()
    }

    /// Returns only the errors.
    #[must_use]
    pub fn errors(&self) -> Vec<&Diagnostic> {
        self.diags
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect()
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diags.into_iter()
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diag: Diagnostic) -> Self {
        Self { diags: vec![diag] }
    }
}

impl From<LatticeError> for Diagnostics {
    fn from(err: LatticeError) -> Self {
        let mut diags = Self::new();
        diags.push_error(&err);
        diags
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for diag in &self.diags {
            let tag = match diag.severity {
                Severity::Error => "Error",
                Severity::Warning => "Warning",
            };
            writeln!(f, "{tag}: {}", diag.summary)?;
            if !diag.detail.is_empty() {
                writeln!(f, "  {}", diag.detail)?;
            }
        }
        Ok(())
    }
}
