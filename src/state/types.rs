//! State types for tracking deployed resource instances.
//!
//! These types record what the engine believes exists in the real world,
//! used for diffing against configuration and for idempotent operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::addrs::{AbsResource, AbsResourceInstance, ConfigResource};
use crate::value::Value;

/// Status of a recorded resource instance object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    /// The object exists and its last apply completed successfully.
    Ready,
    /// The object exists but a previous apply failed partway, so its
    /// actual remote state is suspect. Tainted objects are replaced on
    /// the next plan.
    Tainted,
    /// A planned placeholder written during planning, never persisted.
    Planned,
}

/// The state-side record of a single deployed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceObject {
    /// The object's attribute values.
    pub value: Value,
    /// Current status.
    pub status: ObjectStatus,
    /// Replacement ordering recorded at last apply, so destroy-time
    /// ordering is correct even if configuration has since changed.
    pub create_before_destroy: bool,
    /// Resources this object depended on when it was created, recorded
    /// so destroy ordering works without the original configuration.
    pub dependencies: Vec<ConfigResource>,
    /// Opaque provider-private data carried between plan and apply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub private: Vec<u8>,
}

/// Identifier of a deposed object: the old object of a create-before-
/// destroy replacement, kept in state until its destroy completes.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeposedKey(String);

/// The complete recorded state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "StateSnapshot", into = "StateSnapshot")]
pub struct State {
    instances: BTreeMap<AbsResourceInstance, ResourceInstanceObject>,
    deposed: BTreeMap<AbsResourceInstance, BTreeMap<DeposedKey, ResourceInstanceObject>>,
    outputs: BTreeMap<String, Value>,
}

/// Wire form of [`State`]: map keys flattened into record lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateSnapshot {
    instances: Vec<InstanceRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    deposed: Vec<DeposedRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceRecord {
    addr: AbsResourceInstance,
    object: ResourceInstanceObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeposedRecord {
    addr: AbsResourceInstance,
    key: DeposedKey,
    object: ResourceInstanceObject,
}

impl ResourceInstanceObject {
    /// Creates a ready object with the given value.
    #[must_use]
    pub const fn ready(value: Value) -> Self {
        Self {
            value,
            status: ObjectStatus::Ready,
            create_before_destroy: false,
            dependencies: Vec::new(),
            private: Vec::new(),
        }
    }

    /// Returns this object marked tainted.
    #[must_use]
    pub const fn tainted(mut self) -> Self {
        self.status = ObjectStatus::Tainted;
        self
    }

    /// Returns true if a replace of this object must create first.
    #[must_use]
    pub const fn is_create_before_destroy(&self) -> bool {
        self.create_before_destroy
    }
}

impl DeposedKey {
    /// Generates a fresh deposed key.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..8].to_string())
    }
}

impl Default for DeposedKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeposedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl State {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no objects are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.deposed.is_empty()
    }

    /// The recorded root module output values.
    #[must_use]
    pub const fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Records one root module output value. Null removes the output.
    pub fn set_output(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if value.is_null() {
            self.outputs.remove(&name);
        } else {
            self.outputs.insert(name, value);
        }
    }

    /// Gets the current object for an instance.
    #[must_use]
    pub fn instance(&self, addr: &AbsResourceInstance) -> Option<&ResourceInstanceObject> {
        self.instances.get(addr)
    }

    /// Sets the current object for an instance.
    pub fn set_instance(&mut self, addr: AbsResourceInstance, object: ResourceInstanceObject) {
        self.instances.insert(addr, object);
    }

    /// Removes the current object for an instance, returning it.
    pub fn remove_instance(
        &mut self,
        addr: &AbsResourceInstance,
    ) -> Option<ResourceInstanceObject> {
        self.instances.remove(addr)
    }

    /// Marks an existing instance tainted. No-op if absent.
    pub fn taint_instance(&mut self, addr: &AbsResourceInstance) {
        if let Some(object) = self.instances.get_mut(addr) {
            object.status = ObjectStatus::Tainted;
        }
    }

    /// Moves the current object of an instance into a deposed slot,
    /// returning the key. Used when a create-before-destroy replacement
    /// has created the new object but not yet destroyed the old one.
    pub fn depose_instance(&mut self, addr: &AbsResourceInstance) -> Option<DeposedKey> {
        let object = self.instances.remove(addr)?;
        let key = DeposedKey::new();
        self.deposed
            .entry(addr.clone())
            .or_default()
            .insert(key.clone(), object);
        Some(key)
    }

    /// Gets a deposed object.
    #[must_use]
    pub fn deposed_instance(
        &self,
        addr: &AbsResourceInstance,
        key: &DeposedKey,
    ) -> Option<&ResourceInstanceObject> {
        self.deposed.get(addr)?.get(key)
    }

    /// Removes a deposed object after its destroy completes.
    pub fn remove_deposed(
        &mut self,
        addr: &AbsResourceInstance,
        key: &DeposedKey,
    ) -> Option<ResourceInstanceObject> {
        let slots = self.deposed.get_mut(addr)?;
        let object = slots.remove(key);
        if slots.is_empty() {
            self.deposed.remove(addr);
        }
        object
    }

    /// All current instance addresses, in address order.
    #[must_use]
    pub fn all_instance_addrs(&self) -> Vec<AbsResourceInstance> {
        self.instances.keys().cloned().collect()
    }

    /// All current instances of one configuration-level resource, across
    /// every module instance it was expanded under.
    #[must_use]
    pub fn instances_of(
        &self,
        addr: &ConfigResource,
    ) -> Vec<(AbsResourceInstance, &ResourceInstanceObject)> {
        self.instances
            .iter()
            .filter(|(k, _)| k.config_resource() == *addr)
            .map(|(k, v)| (k.clone(), v))
            .collect()
    }

    /// All current instances of one expanded resource.
    #[must_use]
    pub fn instances_of_resource(
        &self,
        addr: &AbsResource,
    ) -> Vec<(AbsResourceInstance, &ResourceInstanceObject)> {
        self.instances
            .iter()
            .filter(|(k, _)| k.resource == *addr)
            .map(|(k, v)| (k.clone(), v))
            .collect()
    }
}

impl From<StateSnapshot> for State {
    fn from(snapshot: StateSnapshot) -> Self {
        let mut state = Self::new();
        for record in snapshot.instances {
            state.instances.insert(record.addr, record.object);
        }
        for record in snapshot.deposed {
            state
                .deposed
                .entry(record.addr)
                .or_default()
                .insert(record.key, record.object);
        }
        state.outputs = snapshot.outputs;
        state
    }
}

impl From<State> for StateSnapshot {
    fn from(state: State) -> Self {
        Self {
            instances: state
                .instances
                .into_iter()
                .map(|(addr, object)| InstanceRecord { addr, object })
                .collect(),
            deposed: state
                .deposed
                .into_iter()
                .flat_map(|(addr, slots)| {
                    slots.into_iter().map(move |(key, object)| DeposedRecord {
                        addr: addr.clone(),
                        key,
                        object,
                    })
                })
                .collect(),
            outputs: state.outputs,
        }
    }
}
