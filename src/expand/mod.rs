//! The instance expander: the single source of truth for how modules
//! and resources expand into instances during a round.
//!
//! Expansion decisions are registered as the graph walk evaluates
//! count/for_each expressions, then queried by everything downstream.
//! One algorithm serves both fully-known and partly-unknown rounds: an
//! unknown repetition value is registered as [`Expansion::Unknown`],
//! and queries report the affected address prefixes as partial-expanded
//! rather than guessing instance keys.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::trace;

use crate::addrs::{
    AbsResource, AbsResourceInstance, InstanceKey, ModuleInstance, PartialExpandedModule,
    PartialExpandedResource, Resource,
};
use crate::value::Value;

/// How one module call or resource expands into instances.
#[derive(Debug, Clone, PartialEq)]
pub enum Expansion {
    /// No repetition argument: exactly one instance with no key.
    Single,
    /// `count = n`: instances keyed `[0]` through `[n-1]`.
    Count(u64),
    /// `for_each`: one instance per map entry, keyed by string.
    ForEach(BTreeMap<String, Value>),
    /// The repetition value is not yet known this round.
    Unknown,
}

impl Expansion {
    /// The instance keys this expansion produces, in canonical order,
    /// or `None` when the expansion is unknown.
    #[must_use]
    pub fn keys(&self) -> Option<Vec<InstanceKey>> {
        match self {
            Self::Single => Some(vec![InstanceKey::NoKey]),
            Self::Count(n) => Some((0..*n).map(InstanceKey::Index).collect()),
            Self::ForEach(entries) => {
                Some(entries.keys().cloned().map(InstanceKey::Key).collect())
            }
            Self::Unknown => None,
        }
    }

    /// The repetition symbols available inside one instance's
    /// expressions.
    #[must_use]
    pub fn repetition_for(&self, key: &InstanceKey) -> RepetitionData {
        match (self, key) {
            (Self::Count(_), InstanceKey::Index(i)) => RepetitionData {
                count_index: Some(Value::int(*i as i64)),
                ..RepetitionData::default()
            },
            (Self::ForEach(entries), InstanceKey::Key(k)) => RepetitionData {
                each_key: Some(Value::string(k.clone())),
                each_value: entries.get(k).cloned(),
                ..RepetitionData::default()
            },
            _ => RepetitionData::default(),
        }
    }
}

/// Values for `count.index`, `each.key`, and `each.value` in the scope
/// of one instance. All absent outside a repetition context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepetitionData {
    pub count_index: Option<Value>,
    pub each_key: Option<Value>,
    pub each_value: Option<Value>,
}

impl RepetitionData {
    /// Placeholder data used when planning a whole unexpanded prefix:
    /// every repetition symbol is an unknown value.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            count_index: Some(Value::unknown()),
            each_key: Some(Value::unknown()),
            each_value: Some(Value::unknown()),
        }
    }
}

#[derive(Debug, Default)]
struct Registered {
    /// Keyed by parent module instance and call name.
    modules: BTreeMap<(ModuleInstance, String), Expansion>,
    resources: BTreeMap<AbsResource, Expansion>,
}

/// Registry of expansion decisions for one round.
///
/// Registration happens exactly once per module call instance or
/// resource; the graph's ordering guarantees registration precedes
/// every query.
#[derive(Debug, Default)]
pub struct Expander {
    inner: Mutex<Registered>,
}

impl Expander {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers how a module call expands under one instance of its
    /// parent module.
    pub fn set_module_expansion(
        &self,
        parent: &ModuleInstance,
        call: &str,
        expansion: Expansion,
    ) {
        trace!(module = %parent, call, ?expansion, "registering module expansion");
        self.lock()
            .modules
            .insert((parent.clone(), call.to_string()), expansion);
    }

    /// Registers how a resource expands under one module instance.
    pub fn set_resource_expansion(&self, resource: &AbsResource, expansion: Expansion) {
        trace!(resource = %resource, ?expansion, "registering resource expansion");
        self.lock().resources.insert(resource.clone(), expansion);
    }

    /// All fully-known instances of the module at `path`, in key order.
    /// Prefixes cut off by an unknown expansion are excluded; see
    /// [`Expander::unknown_module_prefixes`].
    #[must_use]
    pub fn expand_module(&self, path: &[String]) -> Vec<ModuleInstance> {
        let inner = self.lock();
        let mut current = vec![ModuleInstance::root()];
        for call in path {
            let mut next = Vec::new();
            for parent in current {
                let expansion = inner.modules.get(&(parent.clone(), call.clone()));
                if let Some(keys) = expansion.and_then(Expansion::keys) {
                    for key in keys {
                        next.push(parent.child(call.clone(), key));
                    }
                }
            }
            current = next;
        }
        current
    }

    /// The partial-expanded prefixes of the module at `path`: for every
    /// known instance chain that hits an unknown call expansion, the
    /// known prefix plus the remaining unexpanded call names.
    #[must_use]
    pub fn unknown_module_prefixes(&self, path: &[String]) -> Vec<PartialExpandedModule> {
        let inner = self.lock();
        let mut prefixes = Vec::new();
        let mut current = vec![ModuleInstance::root()];
        for (depth, call) in path.iter().enumerate() {
            let mut next = Vec::new();
            for parent in current {
                match inner.modules.get(&(parent.clone(), call.clone())) {
                    Some(Expansion::Unknown) => {
                        prefixes.push(PartialExpandedModule::new(
                            parent,
                            path[depth..].to_vec(),
                        ));
                    }
                    Some(expansion) => {
                        if let Some(keys) = expansion.keys() {
                            for key in keys {
                                next.push(parent.child(call.clone(), key));
                            }
                        }
                    }
                    // Not registered at all: the enclosing expansion
                    // was itself unknown and already reported.
                    None => {}
                }
            }
            current = next;
        }
        prefixes
    }

    /// The instance keys of one resource, or `None` when its own
    /// expansion is unknown.
    #[must_use]
    pub fn resource_instance_keys(&self, resource: &AbsResource) -> Option<Vec<InstanceKey>> {
        self.lock().resources.get(resource).and_then(Expansion::keys)
    }

    /// Expands a resource configuration into its fully-known instance
    /// addresses plus the partial-expanded prefixes that remain
    /// undecidable this round.
    #[must_use]
    pub fn expand_resource(
        &self,
        module_path: &[String],
        resource: &Resource,
    ) -> (Vec<AbsResourceInstance>, Vec<PartialExpandedResource>) {
        let mut instances = Vec::new();
        let mut partials = Vec::new();

        for module in self.expand_module(module_path) {
            let abs = resource.absolute(module.clone());
            match self.resource_instance_keys(&abs) {
                Some(keys) => {
                    for key in keys {
                        instances.push(abs.instance(key));
                    }
                }
                None => {
                    partials.push(PartialExpandedResource::for_resource(
                        module,
                        resource.clone(),
                    ));
                }
            }
        }
        for prefix in self.unknown_module_prefixes(module_path) {
            partials.push(PartialExpandedResource::under_module(
                prefix,
                resource.clone(),
            ));
        }

        (instances, partials)
    }

    /// The repetition symbols in scope for one resource instance.
    #[must_use]
    pub fn resource_repetition_data(
        &self,
        resource: &AbsResource,
        key: &InstanceKey,
    ) -> RepetitionData {
        self.lock()
            .resources
            .get(resource)
            .map(|e| e.repetition_for(key))
            .unwrap_or_default()
    }

    /// The repetition symbols in scope for expressions inside one
    /// module call, e.g. its input arguments.
    #[must_use]
    pub fn module_repetition_data(
        &self,
        parent: &ModuleInstance,
        call: &str,
        key: &InstanceKey,
    ) -> RepetitionData {
        self.lock()
            .modules
            .get(&(parent.clone(), call.to_string()))
            .map(|e| e.repetition_for(key))
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registered> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
