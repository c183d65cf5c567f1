//! Expression evaluation against the live data of a walk.
//!
//! Evaluation happens in two phases: every reference the expression
//! makes is resolved asynchronously (consulting planned changes first,
//! then state), then the expression tree is folded synchronously over
//! the resolved values. Unknown and sensitive marks propagate through
//! every combinator.

mod changes;

pub use changes::PlannedChangeRegistry;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::addrs::{AbsResource, InstanceKey, ModuleInstance, Reference};
use crate::config::{Config, Expr};
use crate::error::{Diagnostic, Diagnostics, EvalError, LatticeError};
use crate::expand::{Expander, RepetitionData};
use crate::state::SyncState;
use crate::value::Value;

/// The lexical position an expression is evaluated in: which module
/// instance, and which repetition symbols are in scope.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub module: ModuleInstance,
    pub repetition: RepetitionData,
}

impl Scope {
    #[must_use]
    pub fn in_module(module: ModuleInstance) -> Self {
        Self {
            module,
            repetition: RepetitionData::default(),
        }
    }

    #[must_use]
    pub fn with_repetition(mut self, repetition: RepetitionData) -> Self {
        self.repetition = repetition;
        self
    }
}

/// Results of already-visited named value nodes, keyed by module
/// instance and name.
#[derive(Debug, Default)]
pub struct NamedValues {
    variables: Mutex<BTreeMap<(ModuleInstance, String), Value>>,
    locals: Mutex<BTreeMap<(ModuleInstance, String), Value>>,
    outputs: Mutex<BTreeMap<(ModuleInstance, String), Value>>,
}

impl NamedValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_variable(&self, module: ModuleInstance, name: impl Into<String>, value: Value) {
        lock(&self.variables).insert((module, name.into()), value);
    }

    pub fn set_local(&self, module: ModuleInstance, name: impl Into<String>, value: Value) {
        lock(&self.locals).insert((module, name.into()), value);
    }

    pub fn set_output(&self, module: ModuleInstance, name: impl Into<String>, value: Value) {
        lock(&self.outputs).insert((module, name.into()), value);
    }

    #[must_use]
    pub fn variable(&self, module: &ModuleInstance, name: &str) -> Option<Value> {
        lock(&self.variables)
            .get(&(module.clone(), name.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn local(&self, module: &ModuleInstance, name: &str) -> Option<Value> {
        lock(&self.locals)
            .get(&(module.clone(), name.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn output(&self, module: &ModuleInstance, name: &str) -> Option<Value> {
        lock(&self.outputs)
            .get(&(module.clone(), name.to_string()))
            .cloned()
    }

    /// The root module's outputs, for plan assembly.
    #[must_use]
    pub fn root_outputs(&self) -> BTreeMap<String, Value> {
        lock(&self.outputs)
            .iter()
            .filter(|((module, _), _)| module.is_root())
            .map(|((_, name), value)| (name.clone(), value.clone()))
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Everything evaluation can consult, shared across the walk.
pub struct EvalData {
    pub config: Arc<Config>,
    pub state: SyncState,
    pub expander: Arc<Expander>,
    pub named: NamedValues,
    pub changes: PlannedChangeRegistry,
    pub workspace: String,
}

impl EvalData {
    #[must_use]
    pub fn new(config: Arc<Config>, state: SyncState, expander: Arc<Expander>) -> Self {
        Self {
            config,
            state,
            expander,
            named: NamedValues::new(),
            changes: PlannedChangeRegistry::new(),
            workspace: String::from("default"),
        }
    }
}

/// Evaluates one expression in a scope.
pub async fn evaluate(expr: &Expr, scope: &Scope, data: &EvalData) -> Result<Value, Diagnostics> {
    let mut resolved: BTreeMap<Reference, Value> = BTreeMap::new();
    let mut diags = Diagnostics::new();
    for reference in expr.references() {
        if resolved.contains_key(&reference) {
            continue;
        }
        match resolve_reference(&reference, scope, data).await {
            Ok(value) => {
                trace!(reference = %reference, value = %value, "resolved reference");
                resolved.insert(reference, value);
            }
            Err(err) => diags.push_error(&err),
        }
    }
    if diags.has_errors() {
        return Err(diags);
    }
    fold(expr, &resolved)
}

/// Folds an expression over already-resolved references.
fn fold(expr: &Expr, resolved: &BTreeMap<Reference, Value>) -> Result<Value, Diagnostics> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ref(reference) => resolved.get(reference).cloned().ok_or_else(|| {
            Diagnostics::from(LatticeError::Eval(EvalError::NotYetEvaluated {
                reference: reference.to_string(),
            }))
        }),
        Expr::GetAttr(base, name) => {
            let base = fold(base, resolved)?;
            base.get_attr(name).ok_or_else(|| {
                Diagnostic::error(
                    "Unsupported attribute",
                    format!("This value has no attribute named {name:?}."),
                )
                .into()
            })
        }
        Expr::Concat(items) => {
            let values = items
                .iter()
                .map(|item| fold(item, resolved))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::concat(&values))
        }
        Expr::Tuple(items) => {
            let values = items
                .iter()
                .map(|item| fold(item, resolved))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::collect_list(values))
        }
        Expr::Object(entries) => {
            let mut out = BTreeMap::new();
            for (key, item) in entries {
                out.insert(key.clone(), fold(item, resolved)?);
            }
            Ok(Value::map(out))
        }
    }
}

async fn resolve_reference(
    reference: &Reference,
    scope: &Scope,
    data: &EvalData,
) -> crate::error::Result<Value> {
    match reference {
        Reference::Resource(resource) => {
            resolve_resource(&resource.absolute(scope.module.clone()), data).await
        }
        Reference::ResourceInstance(resource, key) => {
            resolve_instance(&resource.absolute(scope.module.clone()), key, data).await
        }
        Reference::InputVariable(name) => {
            data.named.variable(&scope.module, name).ok_or_else(|| {
                LatticeError::Eval(EvalError::NotYetEvaluated {
                    reference: reference.to_string(),
                })
            })
        }
        Reference::LocalValue(name) => {
            data.named.local(&scope.module, name).ok_or_else(|| {
                LatticeError::Eval(EvalError::NotYetEvaluated {
                    reference: reference.to_string(),
                })
            })
        }
        Reference::ModuleCall(name) => resolve_module_call(name, scope, data),
        Reference::CountIndex => scope.repetition.count_index.clone().ok_or_else(|| {
            LatticeError::Eval(EvalError::WrongType {
                reference: reference.to_string(),
                message: String::from("count.index is only available inside a counted declaration"),
            })
        }),
        Reference::EachKey => scope.repetition.each_key.clone().ok_or_else(|| {
            LatticeError::Eval(EvalError::WrongType {
                reference: reference.to_string(),
                message: String::from("each.key is only available inside a for_each declaration"),
            })
        }),
        Reference::EachValue => scope.repetition.each_value.clone().ok_or_else(|| {
            LatticeError::Eval(EvalError::WrongType {
                reference: reference.to_string(),
                message: String::from("each.value is only available inside a for_each declaration"),
            })
        }),
        Reference::PathAttr(attr) => match attr.as_str() {
            "module" => Ok(Value::string(scope.module.module_path().to_string())),
            "root" | "cwd" => Ok(Value::string(".")),
            other => Err(LatticeError::Eval(EvalError::NonexistentObject {
                reference: format!("path.{other}"),
            })),
        },
        Reference::EngineAttr(attr) => match attr.as_str() {
            "workspace" => Ok(Value::string(data.workspace.clone())),
            other => Err(LatticeError::Eval(EvalError::NonexistentObject {
                reference: format!("lattice.{other}"),
            })),
        },
    }
}

/// The whole-resource value: a single object, a list, or a map of
/// instance values according to the registered expansion.
async fn resolve_resource(abs: &AbsResource, data: &EvalData) -> crate::error::Result<Value> {
    let Some(keys) = data.expander.resource_instance_keys(abs) else {
        // Expansion unknown this round; the resource value is wholly
        // unknown.
        return Ok(Value::unknown());
    };

    if keys == [InstanceKey::NoKey] {
        return resolve_instance(abs, &InstanceKey::NoKey, data).await;
    }
    if keys.iter().all(|k| matches!(k, InstanceKey::Index(_))) {
        let mut items = Vec::with_capacity(keys.len());
        for key in &keys {
            items.push(resolve_instance(abs, key, data).await?);
        }
        return Ok(Value::collect_list(items));
    }
    let mut entries = BTreeMap::new();
    for key in &keys {
        if let InstanceKey::Key(k) = key {
            entries.insert(k.clone(), resolve_instance(abs, key, data).await?);
        }
    }
    Ok(Value::map(entries))
}

async fn resolve_instance(
    abs: &AbsResource,
    key: &InstanceKey,
    data: &EvalData,
) -> crate::error::Result<Value> {
    let addr = abs.instance(key.clone());
    if let Some(value) = data.changes.planned_value(&addr) {
        return Ok(value);
    }
    if data.changes.action(&addr).is_some() {
        // Planned for destruction; referencing it is a configuration
        // error surfaced at the referrer.
        return Err(LatticeError::Eval(EvalError::NonexistentObject {
            reference: addr.to_string(),
        }));
    }
    let stored = data.state.read(|state| state.instance(&addr).map(|o| o.value.clone())).await;
    match stored {
        Some(value) => Ok(value),
        // Known expansion but not yet planned nor in state: the value
        // is pending, e.g. during a refresh-only walk.
        None => Ok(Value::unknown()),
    }
}

/// The outputs object of a child module call: a single object, list,
/// or map of per-instance output objects.
fn resolve_module_call(
    name: &str,
    scope: &Scope,
    data: &EvalData,
) -> crate::error::Result<Value> {
    let child_path = {
        let mut path = scope.module.module_path();
        path = path.child(name);
        path
    };
    let Some(module) = data.config.module_at(&child_path) else {
        return Err(LatticeError::Eval(EvalError::NonexistentObject {
            reference: format!("module.{name}"),
        }));
    };
    let output_names: Vec<&String> = module.outputs.keys().collect();

    let outputs_object = |instance: &ModuleInstance| -> Value {
        let mut entries = BTreeMap::new();
        for output in &output_names {
            let value = data
                .named
                .output(instance, output)
                .unwrap_or_else(Value::unknown);
            entries.insert((*output).clone(), value);
        }
        Value::map(entries)
    };

    // Instances of the call under this specific parent instance.
    let prefix = &scope.module;
    let all = data.expander.expand_module(child_path.steps());
    let mine: Vec<&ModuleInstance> = all
        .iter()
        .filter(|mi| prefix.is_ancestor_of(mi))
        .collect();

    if !data
        .expander
        .unknown_module_prefixes(child_path.steps())
        .is_empty()
    {
        return Ok(Value::unknown());
    }

    let keys: Vec<&InstanceKey> = mine
        .iter()
        .filter_map(|mi| mi.steps().last().map(|s| &s.key))
        .collect();
    if keys.len() == 1 && *keys[0] == InstanceKey::NoKey {
        return Ok(outputs_object(mine[0]));
    }
    if keys.iter().all(|k| matches!(k, InstanceKey::Index(_))) {
        return Ok(Value::collect_list(
            mine.iter().map(|mi| outputs_object(mi)).collect(),
        ));
    }
    let mut entries = BTreeMap::new();
    for mi in &mine {
        if let Some(InstanceKey::Key(k)) = mi.steps().last().map(|s| s.key.clone()) {
            entries.insert(k, outputs_object(mi));
        }
    }
    Ok(Value::map(entries))
}
