//! Deferral tracking for changes that cannot be computed this round.
//!
//! A prospective resource action is classified as resolved (normal
//! plan/apply proceeds), intrinsically deferred (its own inputs are
//! unknowable: unknown count/for_each, unknown provider configuration, or
//! an explicit provider-side deferral), or prerequisite-deferred (some
//! upstream dependency is itself deferred, so proceeding would consume
//! placeholder data). The tracker records every deferral for a single
//! plan round; any recorded deferral forces the plan's completeness flag
//! to false.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::addrs::{ConfigResource, PartialExpandedResource};
use crate::plan::{DeferredResourceInstanceChange, ResourceInstanceChange};

/// Why a change could not be computed this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredReason {
    /// The resource's own count/for_each value is not yet known.
    InstanceCountUnknown,
    /// The resource's provider configuration is not yet known.
    ProviderConfigUnknown,
    /// An upstream dependency is itself deferred.
    DeferredPrereq,
    /// The provider explicitly deferred this change.
    ResourceDeferredByProvider,
    /// An upstream dependency is absent entirely this round.
    AbsentPrereq,
}

impl std::fmt::Display for DeferredReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InstanceCountUnknown => "instance count unknown",
            Self::ProviderConfigUnknown => "provider configuration unknown",
            Self::DeferredPrereq => "deferred prerequisite",
            Self::ResourceDeferredByProvider => "resource deferred by provider",
            Self::AbsentPrereq => "absent prerequisite",
        };
        write!(f, "{s}")
    }
}

/// Per-plan bookkeeping of deferred changes.
///
/// Deferral is one-directional within a round: once a resource is
/// recorded here it stays deferred, and anything depending on it must
/// check [`DeferralTracker::should_defer`] before visiting its own
/// provider.
#[derive(Debug)]
pub struct DeferralTracker {
    deferrals_allowed: bool,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Configuration-level resources with at least one deferral, used
    /// for fast dependency checks.
    deferred_resources: BTreeSet<ConfigResource>,
    /// The deferred changes accumulated this round.
    changes: Vec<DeferredResourceInstanceChange>,
    /// Set when an external (caller-provided) dependency was deferred,
    /// which also makes the plan incomplete.
    external_deferred: bool,
}

impl DeferralTracker {
    /// Creates a tracker for one plan round.
    #[must_use]
    pub fn new(deferrals_allowed: bool) -> Self {
        Self {
            deferrals_allowed,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns true if the caller permits deferred changes this round.
    /// When false, a node that would defer must surface a hard error
    /// instead.
    #[must_use]
    pub const fn deferrals_allowed(&self) -> bool {
        self.deferrals_allowed
    }

    /// Records the deferral of one concrete instance change.
    pub fn report_instance_deferred(
        &self,
        change: ResourceInstanceChange,
        reason: DeferredReason,
    ) {
        debug!(addr = %change.addr, %reason, "deferring resource instance change");
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.deferred_resources.insert(change.addr.config_resource());
        inner
            .changes
            .push(DeferredResourceInstanceChange::for_instance(reason, change));
    }

    /// Records the deferral of an entire partial-expanded resource
    /// prefix.
    pub fn report_partial_expanded_deferred(
        &self,
        partial: PartialExpandedResource,
        change: ResourceInstanceChange,
        reason: DeferredReason,
    ) {
        debug!(addr = %partial, %reason, "deferring partial-expanded resource");
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.deferred_resources.insert(partial.config_resource());
        inner
            .changes
            .push(DeferredResourceInstanceChange::for_partial(reason, partial, change));
    }

    /// Records that a dependency outside this configuration was
    /// deferred by the caller.
    pub fn report_external_dependency_deferred(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.external_deferred = true;
    }

    /// Returns true if any of the given configuration-level dependencies
    /// has a recorded deferral, meaning the asking node must defer too.
    #[must_use]
    pub fn should_defer(&self, dependencies: &[ConfigResource]) -> bool {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.external_deferred {
            return true;
        }
        dependencies
            .iter()
            .any(|dep| inner.deferred_resources.contains(dep))
    }

    /// Returns true if anything at all was deferred this round.
    #[must_use]
    pub fn have_any_deferrals(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.external_deferred || !inner.changes.is_empty()
    }

    /// Drains the recorded deferred changes, sorted by display address
    /// for deterministic output.
    #[must_use]
    pub fn take_deferred_changes(&self) -> Vec<DeferredResourceInstanceChange> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut changes = std::mem::take(&mut inner.changes);
        changes.sort_by_key(DeferredResourceInstanceChange::display_addr);
        changes
    }
}
