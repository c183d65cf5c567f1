//! Results of custom condition checks, grouped by configuration object.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Aggregate outcome of one check or group of checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    /// The check expression could not be evaluated at all.
    Error,
    /// Not determinable this round, e.g. the condition refers to a
    /// value known only after apply.
    Unknown,
}

impl CheckStatus {
    /// Combines two statuses into the aggregate for their container.
    /// Error dominates Fail, Fail dominates Unknown, Unknown dominates
    /// Pass.
    #[must_use]
    pub const fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Error, _) | (_, Self::Error) => Self::Error,
            (Self::Fail, _) | (_, Self::Fail) => Self::Fail,
            (Self::Unknown, _) | (_, Self::Unknown) => Self::Unknown,
            (Self::Pass, Self::Pass) => Self::Pass,
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Outcome for one dynamic object (one resource instance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCheckResult {
    pub status: CheckStatus,
    /// The configured error messages of failed conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_messages: Vec<String>,
}

/// Outcomes for all dynamic objects of one configuration object, keyed
/// by instance address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCheckResults {
    pub objects: BTreeMap<String, ObjectCheckResult>,
}

impl ConfigCheckResults {
    /// The aggregate status over every object. An object set that is
    /// still empty (expansion deferred) aggregates to unknown.
    #[must_use]
    pub fn status(&self) -> CheckStatus {
        self.objects
            .values()
            .map(|o| o.status)
            .reduce(CheckStatus::combine)
            .unwrap_or(CheckStatus::Unknown)
    }
}

/// All check results for one plan round, keyed by the configuration
/// address of the checkable object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResults {
    pub configs: BTreeMap<String, ConfigCheckResults>,
}

impl CheckResults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the dynamic objects expected for a configuration
    /// object, each starting at unknown until reported on.
    pub fn register_expected_object(&mut self, config_addr: &str, object_addr: &str) {
        self.configs
            .entry(config_addr.to_string())
            .or_default()
            .objects
            .entry(object_addr.to_string())
            .or_insert(ObjectCheckResult {
                status: CheckStatus::Unknown,
                failure_messages: Vec::new(),
            });
    }

    /// Records the outcome of one condition for one object, combining
    /// with any earlier outcome for the same object.
    pub fn report(
        &mut self,
        config_addr: &str,
        object_addr: &str,
        status: CheckStatus,
        failure_message: Option<String>,
    ) {
        let entry = self
            .configs
            .entry(config_addr.to_string())
            .or_default()
            .objects
            .entry(object_addr.to_string())
            .or_insert(ObjectCheckResult {
                status: CheckStatus::Pass,
                failure_messages: Vec::new(),
            });
        entry.status = if entry.failure_messages.is_empty()
            && matches!(entry.status, CheckStatus::Unknown)
        {
            // First report replaces the registration placeholder.
            status
        } else {
            entry.status.combine(status)
        };
        if let Some(message) = failure_message {
            entry.failure_messages.push(message);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Shared, lock-guarded check results for use during a concurrent walk.
#[derive(Debug, Default)]
pub struct SharedCheckResults {
    inner: Mutex<CheckResults>,
}

impl SharedCheckResults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_expected_object(&self, config_addr: &str, object_addr: &str) {
        self.lock().register_expected_object(config_addr, object_addr);
    }

    pub fn report(
        &self,
        config_addr: &str,
        object_addr: &str,
        status: CheckStatus,
        failure_message: Option<String>,
    ) {
        self.lock()
            .report(config_addr, object_addr, status, failure_message);
    }

    /// Takes the accumulated results out of the shared wrapper.
    #[must_use]
    pub fn into_results(self) -> CheckResults {
        self.inner
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Copies the results accumulated so far.
    #[must_use]
    pub fn snapshot(&self) -> CheckResults {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CheckResults> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_combine_precedence() {
        assert_eq!(CheckStatus::Pass.combine(CheckStatus::Fail), CheckStatus::Fail);
        assert_eq!(CheckStatus::Fail.combine(CheckStatus::Error), CheckStatus::Error);
        assert_eq!(CheckStatus::Pass.combine(CheckStatus::Unknown), CheckStatus::Unknown);
        assert_eq!(CheckStatus::Pass.combine(CheckStatus::Pass), CheckStatus::Pass);
    }

    #[test]
    fn test_per_object_results_are_distinct() {
        let mut results = CheckResults::new();
        results.register_expected_object("test_thing.a", "test_thing.a[0]");
        results.register_expected_object("test_thing.a", "test_thing.a[1]");
        results.report("test_thing.a", "test_thing.a[0]", CheckStatus::Pass, None);
        results.report(
            "test_thing.a",
            "test_thing.a[1]",
            CheckStatus::Fail,
            Some("size must be positive".to_string()),
        );

        let config = &results.configs["test_thing.a"];
        assert_eq!(config.objects["test_thing.a[0]"].status, CheckStatus::Pass);
        assert_eq!(config.objects["test_thing.a[1]"].status, CheckStatus::Fail);
        assert_eq!(config.status(), CheckStatus::Fail);
    }

    #[test]
    fn test_unreported_object_stays_unknown() {
        let mut results = CheckResults::new();
        results.register_expected_object("test_thing.a", "test_thing.a");
        assert_eq!(results.configs["test_thing.a"].status(), CheckStatus::Unknown);
    }
}
