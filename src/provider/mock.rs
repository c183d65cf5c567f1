//! An in-memory provider used by the engine's own tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::defer::DeferredReason;
use crate::error::{LatticeError, ProviderError, Result};
use crate::value::{Value, ValueKind};

use super::{
    ApplyResourceChangeRequest, ApplyResourceChangeResponse, ImportResourceStateRequest,
    ImportResourceStateResponse, PlanResourceChangeRequest, PlanResourceChangeResponse, Provider,
    ReadDataSourceRequest, ReadDataSourceResponse, ReadResourceRequest, ReadResourceResponse,
};

/// A scripted provider for tests.
///
/// Planning echoes the proposed value, carries forward the prior `id`
/// attribute when one exists, and marks a fresh `id` as unknown
/// otherwise. Applying resolves every remaining unknown to a generated
/// string. Every call is appended to an operation log so tests can
/// assert on ordering.
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    ids: AtomicU64,
    log: Mutex<Vec<String>>,
    requires_replace: Vec<String>,
    defer_reason: Option<DeferredReason>,
    data_values: BTreeMap<String, Value>,
    read_overrides: Mutex<BTreeMap<String, Option<Value>>>,
    fail_applies: Mutex<BTreeSet<String>>,
    delay: Option<Duration>,
}

impl MockProvider {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ids: AtomicU64::new(1),
            log: Mutex::new(Vec::new()),
            requires_replace: Vec::new(),
            defer_reason: None,
            data_values: BTreeMap::new(),
            read_overrides: Mutex::new(BTreeMap::new()),
            fail_applies: Mutex::new(BTreeSet::new()),
            delay: None,
        }
    }

    /// Attribute names whose changes force a replacement.
    #[must_use]
    pub fn with_requires_replace(mut self, attrs: &[&str]) -> Self {
        self.requires_replace = attrs.iter().map(ToString::to_string).collect();
        self
    }

    /// Makes every plan and read request come back deferred.
    #[must_use]
    pub fn with_deferred(mut self, reason: DeferredReason) -> Self {
        self.defer_reason = Some(reason);
        self
    }

    /// Fixes the value returned for a data source address.
    #[must_use]
    pub fn with_data_value(mut self, addr: impl Into<String>, value: Value) -> Self {
        self.data_values.insert(addr.into(), value);
        self
    }

    /// Sleeps this long inside every call, to exercise concurrency.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Scripts the next refresh of `addr` to return `value` instead of
    /// the stored one. `None` reports the object as gone upstream.
    pub fn script_read(&self, addr: impl Into<String>, value: Option<Value>) {
        self.read_overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(addr.into(), value);
    }

    /// Scripts the next apply of `addr` to fail with a provider error.
    pub fn script_apply_failure(&self, addr: impl Into<String>) {
        self.fail_applies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(addr.into());
    }

    /// The operations performed so far, in call order, as
    /// `"operation address"` strings.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn record(&self, operation: &str, addr: &str) {
        trace!(provider = %self.name, operation, addr, "mock provider call");
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(format!("{operation} {addr}"));
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_id(&self) -> String {
        format!("{}-{}", self.name, self.ids.fetch_add(1, Ordering::Relaxed))
    }

    /// Replaces every unknown portion of `value` with a generated
    /// string, recursing through collections.
    fn resolve_unknowns(&self, value: Value) -> Value {
        let Value { kind, marks } = value;
        let kind = match kind {
            ValueKind::Unknown(refinement) => {
                let prefix = refinement.string_prefix.unwrap_or_default();
                ValueKind::String(format!("{prefix}{}", self.next_id()))
            }
            ValueKind::List(items) => ValueKind::List(
                items.into_iter().map(|v| self.resolve_unknowns(v)).collect(),
            ),
            ValueKind::Map(entries) => ValueKind::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, self.resolve_unknowns(v)))
                    .collect(),
            ),
            other => other,
        };
        Value { kind, marks }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_resource(&self, req: ReadResourceRequest) -> Result<ReadResourceResponse> {
        self.pause().await;
        let addr = req.addr.to_string();
        self.record("read", &addr);
        if let Some(reason) = self.defer_reason {
            return Ok(ReadResourceResponse {
                value: Some(req.prior),
                private: req.private,
                deferred: Some(reason),
            });
        }
        let scripted = self
            .read_overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&addr);
        let value = match scripted {
            Some(v) => v,
            None => Some(req.prior),
        };
        Ok(ReadResourceResponse {
            value,
            private: req.private,
            deferred: None,
        })
    }

    async fn plan_resource_change(
        &self,
        req: PlanResourceChangeRequest,
    ) -> Result<PlanResourceChangeResponse> {
        self.pause().await;
        self.record("plan", &req.addr.to_string());
        if let Some(reason) = self.defer_reason {
            return Ok(PlanResourceChangeResponse {
                planned: Value::unknown(),
                requires_replace: Vec::new(),
                private: Vec::new(),
                deferred: Some(reason),
            });
        }

        // Echo the proposed configuration and add the computed id,
        // preserved from the prior object when there is one.
        let mut planned = req.proposed.clone();
        let id = match &req.prior {
            Some(prior) => prior.get_attr("id").unwrap_or_else(Value::unknown),
            None => Value::unknown(),
        };
        if let ValueKind::Map(entries) = &mut planned.kind {
            entries.insert("id".to_string(), id);
        }

        // Replacement is required when a replace-forcing attribute
        // changed between the prior and proposed values.
        let mut requires_replace = Vec::new();
        if let Some(prior) = &req.prior {
            for attr in &self.requires_replace {
                let before = prior.get_attr(attr);
                let after = req.proposed.get_attr(attr);
                if before != after {
                    requires_replace.push(attr.clone());
                }
            }
        }

        Ok(PlanResourceChangeResponse {
            planned,
            requires_replace,
            private: Vec::new(),
            deferred: None,
        })
    }

    async fn apply_resource_change(
        &self,
        req: ApplyResourceChangeRequest,
    ) -> Result<ApplyResourceChangeResponse> {
        self.pause().await;
        let addr = req.addr.to_string();
        self.record("apply", &addr);
        let scripted_failure = self
            .fail_applies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&addr);
        if scripted_failure {
            return Err(LatticeError::Provider(ProviderError::CallFailed {
                provider: self.name.clone(),
                operation: "apply",
                instance: req.addr,
                message: String::from("scripted failure"),
            }));
        }
        let value = req.planned.map(|planned| self.resolve_unknowns(planned));
        Ok(ApplyResourceChangeResponse {
            value,
            private: req.private,
        })
    }

    async fn read_data_source(
        &self,
        req: ReadDataSourceRequest,
    ) -> Result<ReadDataSourceResponse> {
        self.pause().await;
        let addr = req.addr.to_string();
        self.record("read_data", &addr);
        if let Some(reason) = self.defer_reason {
            return Ok(ReadDataSourceResponse {
                value: Value::unknown(),
                deferred: Some(reason),
            });
        }
        let value = self
            .data_values
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| req.config);
        Ok(ReadDataSourceResponse {
            value,
            deferred: None,
        })
    }

    async fn import_resource_state(
        &self,
        req: ImportResourceStateRequest,
    ) -> Result<ImportResourceStateResponse> {
        self.pause().await;
        self.record("import", &format!("{}[{}]", req.type_name, req.id));
        let mut entries = BTreeMap::new();
        entries.insert("id".to_string(), Value::string(req.id));
        Ok(ImportResourceStateResponse {
            value: Value::map(entries),
            private: Vec::new(),
            deferred: None,
        })
    }
}
