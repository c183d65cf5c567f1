//! The static configuration tree consumed from the language frontend.
//!
//! A [`Config`] is a tree of modules, each declaring resources, data
//! sources, outputs, variables, locals, provider configurations, module
//! calls, and removed blocks. Declarations carry opaque [`Expr`] objects
//! that the evaluator resolves at walk time; this module itself performs
//! no evaluation.

mod expr;

pub use expr::{Expr, Repetition};

use std::collections::BTreeMap;

use crate::addrs::{ConfigResource, InstanceKey, ModulePath, Reference, Resource};
use crate::value::Value;

/// A complete configuration: the root module and everything below it.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// The root module of the tree.
    pub root: Module,
}

/// One module's declarations.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Resource and data source declarations, keyed by display address.
    pub resources: BTreeMap<String, ResourceConfig>,
    /// Child module calls, keyed by call name.
    pub module_calls: BTreeMap<String, ModuleCall>,
    /// Output value declarations, keyed by name.
    pub outputs: BTreeMap<String, OutputConfig>,
    /// Input variable declarations, keyed by name.
    pub variables: BTreeMap<String, VariableConfig>,
    /// Local value definitions, keyed by name.
    pub locals: BTreeMap<String, Expr>,
    /// Provider configurations, keyed by provider name.
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Removed blocks: resources withdrawn from configuration with an
    /// explicit instruction about what to do with their state.
    pub removed: Vec<RemovedBlock>,
    /// Import blocks: existing remote objects to adopt into state on
    /// the next plan. Honored in the root module only.
    pub imports: Vec<ImportTarget>,
}

/// A resource or data source declaration.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// The declared address within the module.
    pub resource: Resource,
    /// The repetition argument.
    pub repetition: Repetition,
    /// The body configuration, an object expression.
    pub config: Expr,
    /// Name of the provider configuration this resource uses.
    pub provider: String,
    /// Lifecycle arguments.
    pub lifecycle: Lifecycle,
    /// Explicit dependencies beyond those found by reference analysis.
    pub depends_on: Vec<Reference>,
    /// Conditions checked before planning the resource.
    pub preconditions: Vec<Condition>,
    /// Conditions checked after applying the resource.
    pub postconditions: Vec<Condition>,
}

/// Lifecycle arguments of a resource declaration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lifecycle {
    /// Replace by creating the new object before destroying the old one.
    pub create_before_destroy: bool,
}

/// A custom condition attached to a resource or output.
#[derive(Debug, Clone)]
pub struct Condition {
    /// The boolean expression to check.
    pub condition: Expr,
    /// Message reported when the condition fails.
    pub error_message: String,
}

/// A child module call.
#[derive(Debug, Clone)]
pub struct ModuleCall {
    /// The call name.
    pub name: String,
    /// The repetition argument of the call itself.
    pub repetition: Repetition,
    /// Input expressions passed to the child, keyed by variable name.
    pub inputs: BTreeMap<String, Expr>,
    /// The called module's declarations.
    pub module: Module,
}

/// An output value declaration.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// The output name.
    pub name: String,
    /// The value expression.
    pub value: Expr,
    /// Force the sensitive mark on the resulting value.
    pub sensitive: bool,
}

/// An input variable declaration.
#[derive(Debug, Clone)]
pub struct VariableConfig {
    /// The variable name.
    pub name: String,
    /// Default value used when the caller supplies none.
    pub default: Option<Value>,
    /// Mark supplied values as sensitive.
    pub sensitive: bool,
}

/// A provider configuration block.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// The provider name, e.g. `test`.
    pub name: String,
    /// The provider's own configuration body.
    pub config: Expr,
}

/// A removed block: the named resource is no longer managed here.
#[derive(Debug, Clone)]
pub struct RemovedBlock {
    /// The withdrawn resource, relative to the containing module.
    pub from: Resource,
    /// Destroy the remote object (`true`, the default) or merely forget
    /// it from state (`false`).
    pub destroy: bool,
}

/// An import block: adopt an existing remote object into state under
/// the given instance address when the next plan runs.
#[derive(Debug, Clone)]
pub struct ImportTarget {
    /// The resource the object is bound to, in the root module.
    pub to: Resource,
    /// The instance key under that resource.
    pub key: InstanceKey,
    /// The provider-specific identifier of the remote object.
    pub id: String,
}

impl Config {
    /// Creates a configuration with the given root module.
    #[must_use]
    pub const fn new(root: Module) -> Self {
        Self { root }
    }

    /// Looks up the module at a static path, if it exists.
    #[must_use]
    pub fn module_at(&self, path: &ModulePath) -> Option<&Module> {
        let mut module = &self.root;
        for call in path.steps() {
            module = &module.module_calls.get(call)?.module;
        }
        Some(module)
    }

    /// Looks up a resource declaration by configuration address.
    #[must_use]
    pub fn resource(&self, addr: &ConfigResource) -> Option<&ResourceConfig> {
        self.module_at(&addr.module)?
            .resources
            .get(&addr.resource.to_string())
    }

    /// Visits every module path in the tree, parents before children.
    pub fn walk_modules<F>(&self, mut visit: F)
    where
        F: FnMut(&ModulePath, &Module),
    {
        fn recurse<F>(path: &ModulePath, module: &Module, visit: &mut F)
        where
            F: FnMut(&ModulePath, &Module),
        {
            visit(path, module);
            for (name, call) in &module.module_calls {
                recurse(&path.child(name.clone()), &call.module, visit);
            }
        }
        recurse(&ModulePath::root(), &self.root, &mut visit);
    }

    /// Returns every resource declaration in the tree with its static
    /// module path, in deterministic order.
    #[must_use]
    pub fn all_resources(&self) -> Vec<(ConfigResource, ResourceConfig)> {
        let mut out = Vec::new();
        self.walk_modules(|path, module| {
            for rc in module.resources.values() {
                out.push((rc.resource.in_module(path.clone()), rc.clone()));
            }
        });
        out
    }
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource declaration.
    pub fn add_resource(&mut self, rc: ResourceConfig) {
        self.resources.insert(rc.resource.to_string(), rc);
    }

    /// Adds a module call.
    pub fn add_module_call(&mut self, call: ModuleCall) {
        self.module_calls.insert(call.name.clone(), call);
    }

    /// Adds an output declaration.
    pub fn add_output(&mut self, output: OutputConfig) {
        self.outputs.insert(output.name.clone(), output);
    }

    /// Adds a variable declaration.
    pub fn add_variable(&mut self, variable: VariableConfig) {
        self.variables.insert(variable.name.clone(), variable);
    }

    /// Adds an import block.
    pub fn add_import(&mut self, import: ImportTarget) {
        self.imports.push(import);
    }

    /// Returns the removed block covering a resource, if declared.
    #[must_use]
    pub fn removed_block(&self, resource: &Resource) -> Option<&RemovedBlock> {
        self.removed.iter().find(|r| r.from == *resource)
    }
}

impl ResourceConfig {
    /// Creates a managed resource declaration with defaults: no
    /// repetition, an empty body, the `test` provider, default lifecycle.
    #[must_use]
    pub fn managed(r#type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource: Resource::managed(r#type, name),
            repetition: Repetition::Single,
            config: Expr::empty_object(),
            provider: String::from("test"),
            lifecycle: Lifecycle::default(),
            depends_on: Vec::new(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
        }
    }

    /// Creates a data source declaration with defaults.
    #[must_use]
    pub fn data(r#type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource: Resource::data(r#type, name),
            ..Self::managed("", "")
        }
    }

    /// Sets the repetition argument.
    #[must_use]
    pub fn with_repetition(mut self, repetition: Repetition) -> Self {
        self.repetition = repetition;
        self
    }

    /// Sets the body configuration.
    #[must_use]
    pub fn with_config(mut self, config: Expr) -> Self {
        self.config = config;
        self
    }

    /// Enables create-before-destroy replacement ordering.
    #[must_use]
    pub const fn with_create_before_destroy(mut self) -> Self {
        self.lifecycle.create_before_destroy = true;
        self
    }

    /// Every reference this declaration makes: repetition, body, and
    /// explicit depends_on, deduplicated.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        let mut refs = self.repetition.references();
        refs.extend(self.config.references());
        for condition in self.preconditions.iter().chain(&self.postconditions) {
            refs.extend(condition.condition.references());
        }
        refs.extend(self.depends_on.iter().cloned());
        refs.sort();
        refs.dedup();
        refs
    }
}

impl ModuleCall {
    /// Creates a single-instance module call.
    #[must_use]
    pub fn new(name: impl Into<String>, module: Module) -> Self {
        Self {
            name: name.into(),
            repetition: Repetition::Single,
            inputs: BTreeMap::new(),
            module,
        }
    }

    /// Sets the repetition argument of the call.
    #[must_use]
    pub fn with_repetition(mut self, repetition: Repetition) -> Self {
        self.repetition = repetition;
        self
    }

    /// Adds an input expression.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.inputs.insert(name.into(), expr);
        self
    }

    /// References made by the call's repetition and inputs, in the scope
    /// of the calling module.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        let mut refs = self.repetition.references();
        for expr in self.inputs.values() {
            refs.extend(expr.references());
        }
        refs.sort();
        refs.dedup();
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{InstanceKey, ModuleInstance};

    fn config_with_child() -> Config {
        let mut child = Module::new();
        child.add_resource(ResourceConfig::managed("test_thing", "inner"));

        let mut root = Module::new();
        root.add_resource(ResourceConfig::managed("test_thing", "outer"));
        root.add_module_call(ModuleCall::new("child", child));
        Config::new(root)
    }

    #[test]
    fn test_module_lookup() {
        let config = config_with_child();
        assert!(config.module_at(&ModulePath::root()).is_some());
        assert!(config.module_at(&ModulePath::root().child("child")).is_some());
        assert!(config.module_at(&ModulePath::root().child("missing")).is_none());
    }

    #[test]
    fn test_all_resources_order() {
        let config = config_with_child();
        let addrs: Vec<String> = config
            .all_resources()
            .iter()
            .map(|(addr, _)| addr.to_string())
            .collect();
        assert_eq!(addrs, vec!["test_thing.outer", "module.child.test_thing.inner"]);
    }

    #[test]
    fn test_resource_lookup_by_config_address() {
        let config = config_with_child();
        let addr = Resource::managed("test_thing", "inner")
            .in_module(ModulePath::root().child("child"));
        assert!(config.resource(&addr).is_some());

        let wrong = Resource::managed("test_thing", "inner").in_module(ModulePath::root());
        assert!(config.resource(&wrong).is_none());
    }

    #[test]
    fn test_resource_references_dedup() {
        let rc = ResourceConfig::managed("test_thing", "a")
            .with_repetition(Repetition::Count(Expr::reference(Reference::InputVariable(
                String::from("n"),
            ))))
            .with_config(Expr::Object(
                [(
                    String::from("n_again"),
                    Expr::reference(Reference::InputVariable(String::from("n"))),
                )]
                .into(),
            ));
        assert_eq!(rc.references().len(), 1);
    }

    #[test]
    fn test_config_resource_matches_abs() {
        let addr = Resource::managed("test_thing", "inner")
            .in_module(ModulePath::root().child("child"));
        let abs = Resource::managed("test_thing", "inner").absolute(
            ModuleInstance::root().child("child", InstanceKey::Index(0)),
        );
        assert!(addr.matches(&abs));
    }
}
