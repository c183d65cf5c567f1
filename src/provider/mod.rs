//! The provider contract.
//!
//! Providers are the pluggable boundary where resource semantics live.
//! The engine only ever talks to them through [`Provider`], and every
//! call happens without any state lock held so a slow provider cannot
//! stall unrelated work.

mod mock;

pub use mock::MockProvider;

use async_trait::async_trait;

use crate::addrs::AbsResourceInstance;
use crate::defer::DeferredReason;
use crate::error::Result;
use crate::value::Value;

/// Request to refresh one remote object against its stored value.
#[derive(Debug, Clone)]
pub struct ReadResourceRequest {
    pub addr: AbsResourceInstance,
    /// The value recorded at the end of the previous round.
    pub prior: Value,
    /// Opaque provider-private data carried alongside the object.
    pub private: Vec<u8>,
    pub provider_config: Value,
}

/// Outcome of a refresh.
#[derive(Debug, Clone)]
pub struct ReadResourceResponse {
    /// The current remote value, or `None` if the object no longer
    /// exists upstream.
    pub value: Option<Value>,
    pub private: Vec<u8>,
    /// Set when the provider cannot refresh yet and asks for the whole
    /// change to be postponed to a later round.
    pub deferred: Option<DeferredReason>,
}

/// Request to compute the planned new value for one instance.
#[derive(Debug, Clone)]
pub struct PlanResourceChangeRequest {
    pub addr: AbsResourceInstance,
    /// Prior value, absent when the instance does not exist yet.
    pub prior: Option<Value>,
    /// The desired value as written in configuration, possibly with
    /// unknown portions.
    pub proposed: Value,
    pub provider_config: Value,
}

/// Outcome of planning one instance change.
#[derive(Debug, Clone)]
pub struct PlanResourceChangeResponse {
    /// The value the object is expected to have after apply. Unknown
    /// portions are resolved during apply.
    pub planned: Value,
    /// Attribute paths whose pending changes cannot be applied in
    /// place, forcing a replacement.
    pub requires_replace: Vec<String>,
    pub private: Vec<u8>,
    pub deferred: Option<DeferredReason>,
}

/// Request to carry out a previously planned change. A `None` planned
/// value means destroy.
#[derive(Debug, Clone)]
pub struct ApplyResourceChangeRequest {
    pub addr: AbsResourceInstance,
    pub prior: Option<Value>,
    pub planned: Option<Value>,
    pub private: Vec<u8>,
    pub provider_config: Value,
}

/// Outcome of an apply. A `None` value means the object no longer
/// exists (destroy succeeded).
#[derive(Debug, Clone)]
pub struct ApplyResourceChangeResponse {
    pub value: Option<Value>,
    pub private: Vec<u8>,
}

/// Request to read a data source.
#[derive(Debug, Clone)]
pub struct ReadDataSourceRequest {
    pub addr: AbsResourceInstance,
    pub config: Value,
    pub provider_config: Value,
}

/// Outcome of a data source read.
#[derive(Debug, Clone)]
pub struct ReadDataSourceResponse {
    pub value: Value,
    pub deferred: Option<DeferredReason>,
}

/// Request to import an existing remote object into management.
#[derive(Debug, Clone)]
pub struct ImportResourceStateRequest {
    pub type_name: String,
    pub id: String,
    pub provider_config: Value,
}

/// Outcome of an import.
#[derive(Debug, Clone)]
pub struct ImportResourceStateResponse {
    pub value: Value,
    pub private: Vec<u8>,
    pub deferred: Option<DeferredReason>,
}

/// The operations every provider must implement.
///
/// All methods take `&self`; implementations are shared across
/// concurrent graph walks and must be internally synchronized.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Refreshes one managed object against its remote system.
    async fn read_resource(&self, req: ReadResourceRequest) -> Result<ReadResourceResponse>;

    /// Computes the planned new value for one instance.
    async fn plan_resource_change(
        &self,
        req: PlanResourceChangeRequest,
    ) -> Result<PlanResourceChangeResponse>;

    /// Carries out a planned change, returning the final value.
    async fn apply_resource_change(
        &self,
        req: ApplyResourceChangeRequest,
    ) -> Result<ApplyResourceChangeResponse>;

    /// Reads a data source.
    async fn read_data_source(&self, req: ReadDataSourceRequest)
        -> Result<ReadDataSourceResponse>;

    /// Imports an existing remote object.
    async fn import_resource_state(
        &self,
        req: ImportResourceStateRequest,
    ) -> Result<ImportResourceStateResponse>;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn read_resource(&self, req: ReadResourceRequest) -> Result<ReadResourceResponse> {
        (**self).read_resource(req).await
    }

    async fn plan_resource_change(
        &self,
        req: PlanResourceChangeRequest,
    ) -> Result<PlanResourceChangeResponse> {
        (**self).plan_resource_change(req).await
    }

    async fn apply_resource_change(
        &self,
        req: ApplyResourceChangeRequest,
    ) -> Result<ApplyResourceChangeResponse> {
        (**self).apply_resource_change(req).await
    }

    async fn read_data_source(
        &self,
        req: ReadDataSourceRequest,
    ) -> Result<ReadDataSourceResponse> {
        (**self).read_data_source(req).await
    }

    async fn import_resource_state(
        &self,
        req: ImportResourceStateRequest,
    ) -> Result<ImportResourceStateResponse> {
        (**self).import_resource_state(req).await
    }
}
