//! The plan model: the set of proposed changes produced by one planning
//! round, rich enough to render, serialize, and later apply.

mod checks;

pub use checks::{CheckResults, CheckStatus, ConfigCheckResults, ObjectCheckResult, SharedCheckResults};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::addrs::{AbsResourceInstance, PartialExpandedResource};
use crate::defer::DeferredReason;
use crate::value::Value;

/// What will be done to a resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    Create,
    /// Deferred data source read, resolved during apply.
    Read,
    Update,
    Delete,
    /// Replace, destroying the existing object first.
    DeleteThenCreate,
    /// Replace, creating the new object before destroying the old one.
    CreateThenDelete,
    /// Discard from state without destroying the remote object.
    Forget,
}

impl Action {
    /// Returns true for both replacement orderings.
    #[must_use]
    pub const fn is_replace(self) -> bool {
        matches!(self, Self::DeleteThenCreate | Self::CreateThenDelete)
    }

    /// Returns true if applying this action creates a new object.
    #[must_use]
    pub const fn creates(self) -> bool {
        matches!(self, Self::Create | Self::DeleteThenCreate | Self::CreateThenDelete)
    }

    /// Returns true if applying this action destroys an existing
    /// object.
    #[must_use]
    pub const fn destroys(self) -> bool {
        matches!(self, Self::Delete | Self::DeleteThenCreate | Self::CreateThenDelete)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::DeleteThenCreate => "replace (delete then create)",
            Self::CreateThenDelete => "replace (create then delete)",
            Self::Forget => "forget",
        };
        write!(f, "{s}")
    }
}

/// Extra context for why an action was chosen, for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionReason {
    /// A change to an attribute that cannot be updated in place.
    ReplaceBecauseCannotUpdate,
    /// The object is marked tainted from a failed earlier create.
    ReplaceBecauseTainted,
    /// The user forced replacement of this address.
    ReplaceByRequest,
    /// No configuration block declares this resource any more.
    DeleteBecauseNoResourceConfig,
    /// The containing module instance no longer exists.
    DeleteBecauseNoModule,
    /// The instance key falls outside the resource's current
    /// count/for_each.
    DeleteBecauseWrongRepetition,
    /// A removed block asked for the object to be discarded, not
    /// destroyed.
    ForgetBecauseRemoved,
}

/// One proposed change to one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceChange {
    pub addr: AbsResourceInstance,
    /// Where this instance lived at the end of the previous round.
    /// Differs from `addr` after a move; equal otherwise.
    pub prev_run_addr: AbsResourceInstance,
    /// Name of the provider responsible for this change.
    pub provider: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_reason: Option<ActionReason>,
    pub before: Value,
    pub after: Value,
    /// Attribute paths that forced a replacement, empty otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_replace: Vec<String>,
    /// The remote object id an import block binds to this instance;
    /// applying the change adopts the object before anything else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importing: Option<String>,
}

impl ResourceInstanceChange {
    #[must_use]
    pub fn new(
        addr: AbsResourceInstance,
        provider: impl Into<String>,
        action: Action,
        before: Value,
        after: Value,
    ) -> Self {
        Self {
            prev_run_addr: addr.clone(),
            addr,
            provider: provider.into(),
            action,
            action_reason: None,
            before,
            after,
            required_replace: Vec::new(),
            importing: None,
        }
    }

    #[must_use]
    pub fn with_importing(mut self, id: impl Into<String>) -> Self {
        self.importing = Some(id.into());
        self
    }

    #[must_use]
    pub const fn with_reason(mut self, reason: ActionReason) -> Self {
        self.action_reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_required_replace(mut self, paths: Vec<String>) -> Self {
        self.required_replace = paths;
        self
    }
}

impl std::fmt::Display for ResourceInstanceChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.addr, self.action)
    }
}

/// A change that could not be finalized this round and is carried in
/// the plan for a later one. The address may be partial-expanded, with
/// wildcard keys standing in for instance keys not yet decidable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredResourceInstanceChange {
    pub reason: DeferredReason,
    /// Present when the deferral covers a whole unexpanded prefix
    /// rather than one concrete instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialExpandedResource>,
    pub change: ResourceInstanceChange,
}

impl DeferredResourceInstanceChange {
    #[must_use]
    pub const fn for_instance(reason: DeferredReason, change: ResourceInstanceChange) -> Self {
        Self {
            reason,
            partial: None,
            change,
        }
    }

    #[must_use]
    pub const fn for_partial(
        reason: DeferredReason,
        partial: PartialExpandedResource,
        change: ResourceInstanceChange,
    ) -> Self {
        Self {
            reason,
            partial: Some(partial),
            change,
        }
    }

    /// The address to show for this deferral, preferring the
    /// partial-expanded form when one exists.
    #[must_use]
    pub fn display_addr(&self) -> String {
        match &self.partial {
            Some(partial) => partial.to_string(),
            None => self.change.addr.to_string(),
        }
    }
}

/// A proposed change to a root module output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChange {
    pub name: String,
    pub action: Action,
    pub before: Value,
    pub after: Value,
    pub sensitive: bool,
}

/// The planning mode requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Converge real infrastructure towards the configuration.
    #[default]
    Normal,
    /// Only reconcile state with remote objects; propose no changes.
    RefreshOnly,
    /// Plan the destruction of everything in state.
    Destroy,
}

/// The full result of one planning round.
///
/// `complete` is false when anything was deferred, in which case
/// applying this plan converges only partially and another plan/apply
/// round is needed. `errored` plans must not be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub mode: PlanMode,
    pub complete: bool,
    pub errored: bool,
    /// The root module input variables this plan was created with.
    /// Applying with different values is rejected.
    pub variables: BTreeMap<String, Value>,
    /// Changes needed to reach the desired configuration, sorted by
    /// address.
    pub changes: Vec<ResourceInstanceChange>,
    /// Differences between the previous state and what refresh found,
    /// reported separately from configuration-driven changes.
    pub drift: Vec<ResourceInstanceChange>,
    pub deferred: Vec<DeferredResourceInstanceChange>,
    pub output_changes: Vec<OutputChange>,
    pub checks: CheckResults,
    pub timestamp: DateTime<Utc>,
}

impl Plan {
    /// Returns true if applying this plan would do nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| c.action == Action::NoOp)
            && self.output_changes.iter().all(|c| c.action == Action::NoOp)
    }

    /// Returns true if this plan may be applied.
    #[must_use]
    pub const fn applyable(&self) -> bool {
        !self.errored
    }

    /// The changes whose action is not a no-op, in address order.
    #[must_use]
    pub fn real_changes(&self) -> Vec<&ResourceInstanceChange> {
        self.changes.iter().filter(|c| c.action != Action::NoOp).collect()
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (mut create, mut update, mut delete, mut replace) = (0usize, 0usize, 0usize, 0usize);
        for change in &self.changes {
            match change.action {
                Action::Create => create += 1,
                Action::Update => update += 1,
                Action::Delete => delete += 1,
                a if a.is_replace() => replace += 1,
                _ => {}
            }
        }
        write!(
            f,
            "plan: {create} to create, {update} to update, {replace} to replace, {delete} to destroy"
        )?;
        if !self.complete {
            write!(f, " (incomplete: {} deferred)", self.deferred.len())?;
        }
        Ok(())
    }
}
