//! Typed addresses for modules, resources, and their expanded instances.
//!
//! Every other part of the engine keys its bookkeeping on these types, so
//! they are totally ordered (for deterministic display and iteration) and
//! hashable (for graph-node and map keys).

mod module;
mod resource;

pub use module::{ModuleInstance, ModulePath, ModuleStep, PartialExpandedModule};
pub use resource::{
    AbsResource, AbsResourceInstance, ConfigResource, PartialExpandedResource, Resource,
    ResourceMode, Target,
};

use serde::{Deserialize, Serialize};

/// The key identifying one instance of a resource or module call after
/// repetition is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKey {
    /// No repetition: the declaration produces exactly one instance.
    NoKey,
    /// A `count` index.
    Index(u64),
    /// A `for_each` string key.
    Key(String),
    /// A placeholder for "some member of an as-yet-unknown expansion".
    Wildcard,
}

impl InstanceKey {
    /// Returns true if this is the wildcard key.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }

    fn sort_rank(&self) -> u8 {
        match self {
            Self::NoKey => 0,
            Self::Index(_) => 1,
            Self::Key(_) => 2,
            Self::Wildcard => 3,
        }
    }
}

impl Ord for InstanceKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Self::Index(a), Self::Index(b)) => a.cmp(b),
            (Self::Key(a), Self::Key(b)) => a.cmp(b),
            _ => self.sort_rank().cmp(&other.sort_rank()),
        }
    }
}

impl PartialOrd for InstanceKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoKey => Ok(()),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => write!(f, "[{k:?}]"),
            Self::Wildcard => write!(f, "[\"*\"]"),
        }
    }
}

/// A reference from a configuration expression to another addressable
/// object, relative to the module containing the expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    /// A managed or data resource in the same module.
    Resource(Resource),
    /// A specific instance of a resource in the same module.
    ResourceInstance(Resource, InstanceKey),
    /// An input variable of the containing module.
    InputVariable(String),
    /// A local value of the containing module.
    LocalValue(String),
    /// The outputs object of a child module call.
    ModuleCall(String),
    /// `count.index` inside a counted declaration.
    CountIndex,
    /// `each.key` inside a for_each declaration.
    EachKey,
    /// `each.value` inside a for_each declaration.
    EachValue,
    /// A `path.*` builtin (module, root, cwd).
    PathAttr(String),
    /// A `lattice.*` builtin (currently just `workspace`).
    EngineAttr(String),
}

impl Reference {
    /// Returns the resource this reference points at, if it is a resource
    /// reference of either form.
    #[must_use]
    pub const fn resource(&self) -> Option<&Resource> {
        match self {
            Self::Resource(r) | Self::ResourceInstance(r, _) => Some(r),
            _ => None,
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resource(r) => write!(f, "{r}"),
            Self::ResourceInstance(r, key) => write!(f, "{r}{key}"),
            Self::InputVariable(name) => write!(f, "var.{name}"),
            Self::LocalValue(name) => write!(f, "local.{name}"),
            Self::ModuleCall(name) => write!(f, "module.{name}"),
            Self::CountIndex => write!(f, "count.index"),
            Self::EachKey => write!(f, "each.key"),
            Self::EachValue => write!(f, "each.value"),
            Self::PathAttr(attr) => write!(f, "path.{attr}"),
            Self::EngineAttr(attr) => write!(f, "lattice.{attr}"),
        }
    }
}
