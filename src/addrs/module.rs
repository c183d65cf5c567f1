//! Module addresses: static configuration paths and expanded instances.

use serde::{Deserialize, Serialize};

use super::InstanceKey;

/// A static module path within the configuration tree, not yet expanded
/// into instances. The root module is the empty path.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ModulePath(Vec<String>);

/// One step of a [`ModuleInstance`]: a module call name plus the instance
/// key selected by that call's repetition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleStep {
    /// The module call name.
    pub call: String,
    /// The instance key within that call's expansion.
    pub key: InstanceKey,
}

/// A fully-expanded module instance address. The root module instance is
/// the empty sequence.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ModuleInstance(Vec<ModuleStep>);

/// A module address whose prefix is fully expanded but whose remaining
/// call steps have unknown instance keys.
///
/// Represents the set of every module instance that could exist under the
/// unresolved calls once their repetition becomes known.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartialExpandedModule {
    /// The known, fully-expanded prefix.
    pub known_prefix: ModuleInstance,
    /// Call names whose instance keys are not yet known, in nesting order.
    pub unexpanded_calls: Vec<String>,
}

impl ModulePath {
    /// The root module path.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns the path of a child module call.
    #[must_use]
    pub fn child(&self, call: impl Into<String>) -> Self {
        let mut steps = self.0.clone();
        steps.push(call.into());
        Self(steps)
    }

    /// Returns true if this is the root module.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The call names making up this path.
    #[must_use]
    pub fn steps(&self) -> &[String] {
        &self.0
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }
}

impl ModuleInstance {
    /// The root module instance.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns the instance of a child module call under this instance.
    #[must_use]
    pub fn child(&self, call: impl Into<String>, key: InstanceKey) -> Self {
        let mut steps = self.0.clone();
        steps.push(ModuleStep {
            call: call.into(),
            key,
        });
        Self(steps)
    }

    /// Returns true if this is the root module instance.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The steps making up this instance address.
    #[must_use]
    pub fn steps(&self) -> &[ModuleStep] {
        &self.0
    }

    /// The parent module instance, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// The final call step, or `None` for the root.
    #[must_use]
    pub fn last_step(&self) -> Option<&ModuleStep> {
        self.0.last()
    }

    /// The static module path this instance belongs to, with keys stripped.
    #[must_use]
    pub fn module_path(&self) -> ModulePath {
        ModulePath(self.0.iter().map(|s| s.call.clone()).collect())
    }

    /// Returns true if `self` is a prefix of (or equal to) `other`.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl PartialExpandedModule {
    /// Wraps a module instance whose next child call has unknown expansion.
    #[must_use]
    pub fn new(known_prefix: ModuleInstance, unexpanded_calls: Vec<String>) -> Self {
        Self {
            known_prefix,
            unexpanded_calls,
        }
    }

    /// The static module path covered by this partial address.
    #[must_use]
    pub fn module_path(&self) -> ModulePath {
        let mut steps: Vec<String> = self
            .known_prefix
            .steps()
            .iter()
            .map(|s| s.call.clone())
            .collect();
        steps.extend(self.unexpanded_calls.iter().cloned());
        ModulePath(steps)
    }

    /// Returns true if the given fully-expanded module instance falls
    /// within the set this partial address represents.
    #[must_use]
    pub fn matches_instance(&self, instance: &ModuleInstance) -> bool {
        let total = self.known_prefix.steps().len() + self.unexpanded_calls.len();
        if instance.steps().len() != total {
            return false;
        }
        if !self.known_prefix.is_ancestor_of(instance) {
            return false;
        }
        let rest = &instance.steps()[self.known_prefix.steps().len()..];
        rest.iter()
            .zip(self.unexpanded_calls.iter())
            .all(|(step, call)| step.call == *call)
    }
}

impl std::fmt::Display for ModulePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        let parts: Vec<String> = self.0.iter().map(|c| format!("module.{c}")).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl std::fmt::Display for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for step in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "module.{}{}", step.call, step.key)?;
            first = false;
        }
        Ok(())
    }
}

impl std::fmt::Display for PartialExpandedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = self.known_prefix.is_root();
        if !first {
            write!(f, "{}", self.known_prefix)?;
        }
        for call in &self.unexpanded_calls {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "module.{call}[\"*\"]")?;
            first = false;
        }
        Ok(())
    }
}
