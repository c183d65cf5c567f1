//! Registry of the changes planned so far in the current round.
//!
//! Dependent expressions must see the value an object will have after
//! apply, not the stale stored one, so every planned change is
//! registered here as soon as its node finishes and consulted before
//! state during reference resolution.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::addrs::AbsResourceInstance;
use crate::plan::{Action, ResourceInstanceChange};
use crate::value::Value;

#[derive(Debug, Default)]
pub struct PlannedChangeRegistry {
    changes: Mutex<BTreeMap<AbsResourceInstance, ResourceInstanceChange>>,
}

impl PlannedChangeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the planned change for one instance, replacing any
    /// earlier record for the same address.
    pub fn register(&self, change: ResourceInstanceChange) {
        self.lock().insert(change.addr.clone(), change);
    }

    /// The value the instance will have after this plan is applied, if
    /// a change was planned for it. Destroyed instances resolve to
    /// `None` here and must not be referenced.
    #[must_use]
    pub fn planned_value(&self, addr: &AbsResourceInstance) -> Option<Value> {
        let changes = self.lock();
        let change = changes.get(addr)?;
        match change.action {
            Action::Delete | Action::Forget => None,
            _ => Some(change.after.clone()),
        }
    }

    /// The planned action for one instance, if any.
    #[must_use]
    pub fn action(&self, addr: &AbsResourceInstance) -> Option<Action> {
        self.lock().get(addr).map(|c| c.action)
    }

    /// Drains all recorded changes in address order.
    #[must_use]
    pub fn take_changes(&self) -> Vec<ResourceInstanceChange> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<AbsResourceInstance, ResourceInstanceChange>> {
        self.changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{InstanceKey, ModuleInstance, Resource};

    fn addr(name: &str, key: InstanceKey) -> AbsResourceInstance {
        Resource::managed("test_thing", name)
            .absolute(ModuleInstance::root())
            .instance(key)
    }

    #[test]
    fn test_planned_value_prefers_after() {
        let registry = PlannedChangeRegistry::new();
        let a = addr("a", InstanceKey::NoKey);
        registry.register(ResourceInstanceChange::new(
            a.clone(),
            "test",
            Action::Update,
            Value::int(1),
            Value::int(2),
        ));
        assert_eq!(registry.planned_value(&a), Some(Value::int(2)));
    }

    #[test]
    fn test_deleted_instance_has_no_value() {
        let registry = PlannedChangeRegistry::new();
        let a = addr("a", InstanceKey::NoKey);
        registry.register(ResourceInstanceChange::new(
            a.clone(),
            "test",
            Action::Delete,
            Value::int(1),
            Value::null(),
        ));
        assert_eq!(registry.planned_value(&a), None);
        assert_eq!(registry.action(&a), Some(Action::Delete));
    }

    #[test]
    fn test_take_changes_sorted() {
        let registry = PlannedChangeRegistry::new();
        for key in [InstanceKey::Index(1), InstanceKey::Index(0)] {
            registry.register(ResourceInstanceChange::new(
                addr("a", key),
                "test",
                Action::Create,
                Value::null(),
                Value::unknown(),
            ));
        }
        let changes = registry.take_changes();
        assert_eq!(changes[0].addr.key, InstanceKey::Index(0));
        assert_eq!(changes[1].addr.key, InstanceKey::Index(1));
        assert!(registry.take_changes().is_empty());
    }
}
