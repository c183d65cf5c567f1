//! Resource addresses: configuration-level, expanded, and partial-expanded.

use serde::{Deserialize, Serialize};

use super::module::{ModuleInstance, ModulePath, PartialExpandedModule};
use super::InstanceKey;

/// Whether a resource is managed (create/update/delete through a provider)
/// or a read-only data source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    /// A managed resource.
    Managed,
    /// A data source, read but never created or destroyed.
    Data,
}

/// A resource declaration address relative to its containing module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resource {
    /// Managed or data.
    pub mode: ResourceMode,
    /// The resource type, e.g. `test_thing`.
    pub r#type: String,
    /// The resource name within its module.
    pub name: String,
}

/// A resource declaration address qualified by its static module path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigResource {
    /// Static path of the containing module.
    pub module: ModulePath,
    /// The resource within that module.
    pub resource: Resource,
}

/// A resource address qualified by a fully-expanded module instance, but
/// not yet expanded into its own instances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsResource {
    /// The containing module instance.
    pub module: ModuleInstance,
    /// The resource within that module instance.
    pub resource: Resource,
}

/// The address of one concrete resource instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsResourceInstance {
    /// The containing resource.
    pub resource: AbsResource,
    /// The instance key selected by the resource's repetition.
    pub key: InstanceKey,
}

/// A resource address under an unresolved expansion prefix: either its
/// own repetition is unknown, or some containing module call's is.
///
/// Represents the unbounded set of instances that might exist once the
/// unknown repetition values become known.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartialExpandedResource {
    /// The module prefix, itself possibly partial.
    pub module: PartialExpandedModule,
    /// The resource under that prefix.
    pub resource: Resource,
}

/// A user-supplied target restricting a plan or apply to a subset of the
/// graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Every resource under a module instance (and its descendants).
    Module(ModuleInstance),
    /// Every instance of one resource.
    Resource(AbsResource),
    /// One specific resource instance.
    ResourceInstance(AbsResourceInstance),
}

impl Resource {
    /// Creates a managed resource address.
    #[must_use]
    pub fn managed(r#type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Managed,
            r#type: r#type.into(),
            name: name.into(),
        }
    }

    /// Creates a data source address.
    #[must_use]
    pub fn data(r#type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Data,
            r#type: r#type.into(),
            name: name.into(),
        }
    }

    /// Qualifies this resource with a module instance.
    #[must_use]
    pub fn absolute(&self, module: ModuleInstance) -> AbsResource {
        AbsResource {
            module,
            resource: self.clone(),
        }
    }

    /// Qualifies this resource with a static module path.
    #[must_use]
    pub fn in_module(&self, module: ModulePath) -> ConfigResource {
        ConfigResource {
            module,
            resource: self.clone(),
        }
    }
}

impl ConfigResource {
    /// Returns true if the given expanded resource belongs to this
    /// configuration-level declaration.
    #[must_use]
    pub fn matches(&self, abs: &AbsResource) -> bool {
        self.resource == abs.resource && self.module == abs.module.module_path()
    }
}

impl AbsResource {
    /// Returns the instance address for the given key.
    #[must_use]
    pub fn instance(&self, key: InstanceKey) -> AbsResourceInstance {
        AbsResourceInstance {
            resource: self.clone(),
            key,
        }
    }

    /// Strips the instance keys to get the configuration-level address.
    #[must_use]
    pub fn config_resource(&self) -> ConfigResource {
        ConfigResource {
            module: self.module.module_path(),
            resource: self.resource.clone(),
        }
    }
}

impl AbsResourceInstance {
    /// Strips the instance keys to get the configuration-level address.
    #[must_use]
    pub fn config_resource(&self) -> ConfigResource {
        self.resource.config_resource()
    }
}

impl PartialExpandedResource {
    /// A partial address for a resource whose own repetition is unknown,
    /// under a fully-known module instance.
    #[must_use]
    pub fn for_resource(module: ModuleInstance, resource: Resource) -> Self {
        Self {
            module: PartialExpandedModule::new(module, Vec::new()),
            resource,
        }
    }

    /// A partial address for a resource under a partial-expanded module.
    #[must_use]
    pub const fn under_module(module: PartialExpandedModule, resource: Resource) -> Self {
        Self { module, resource }
    }

    /// The configuration-level address this partial address covers.
    #[must_use]
    pub fn config_resource(&self) -> ConfigResource {
        ConfigResource {
            module: self.module.module_path(),
            resource: self.resource.clone(),
        }
    }

    /// Returns true if the given concrete instance falls within the set
    /// this partial address represents.
    #[must_use]
    pub fn matches_instance(&self, instance: &AbsResourceInstance) -> bool {
        if instance.resource.resource != self.resource {
            return false;
        }
        if self.module.unexpanded_calls.is_empty() {
            // Module fully known; only the resource's own keys are unknown.
            instance.resource.module == self.module.known_prefix
        } else {
            self.module.matches_instance(&instance.resource.module)
        }
    }
}

impl Target {
    /// Returns true if the given resource instance is selected by this
    /// target.
    #[must_use]
    pub fn matches_instance(&self, instance: &AbsResourceInstance) -> bool {
        match self {
            Self::Module(module) => module.is_ancestor_of(&instance.resource.module),
            Self::Resource(resource) => *resource == instance.resource,
            Self::ResourceInstance(target) => target == instance,
        }
    }

    /// Returns true if the given unexpanded resource could produce
    /// instances selected by this target.
    #[must_use]
    pub fn matches_resource(&self, resource: &AbsResource) -> bool {
        match self {
            Self::Module(module) => module.is_ancestor_of(&resource.module),
            Self::Resource(target) => target == resource,
            Self::ResourceInstance(target) => target.resource == *resource,
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            ResourceMode::Managed => write!(f, "{}.{}", self.r#type, self.name),
            ResourceMode::Data => write!(f, "data.{}.{}", self.r#type, self.name),
        }
    }
}

impl std::fmt::Display for ConfigResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.module.is_root() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.module, self.resource)
        }
    }
}

impl std::fmt::Display for AbsResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.module.is_root() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.module, self.resource)
        }
    }
}

impl std::fmt::Display for AbsResourceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.resource, self.key)
    }
}

impl std::fmt::Display for PartialExpandedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let module = self.module.to_string();
        if module.is_empty() {
            write!(f, "{}[\"*\"]", self.resource)
        } else {
            write!(f, "{module}.{}[\"*\"]", self.resource)
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Module(module) => write!(f, "{module}"),
            Self::Resource(resource) => write!(f, "{resource}"),
            Self::ResourceInstance(instance) => write!(f, "{instance}"),
        }
    }
}
