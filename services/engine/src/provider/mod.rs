//! Virtualization providers.
//!
//! A provider creates, configures and destroys resources in exactly one
//! area. All provider operations are idempotent against the per-blueprint
//! mapping from resource id to backend object id, which the provider
//! records through a [`ProvisionCheckpoint`] the moment the backend returns
//! it. Destroying something that was never recorded is a logged no-op.
//!
//! ## Components
//!
//! - [`VirtualizationProvider`]: the contract blueprints drive.
//! - [`backend::InfraBackend`]: the thin per-cloud API surface.
//! - [`generic::BackendProvider`]: the provider logic over any backend.
//! - [`memory`]: an in-memory backend used for development and tests.
//! - [`registry::ProviderRegistry`]: area to provider resolution.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use lcm_id::{AreaId, BlueprintId, ResourceId};
use thiserror::Error;

use crate::cancel::CancelSignal;
use crate::resources::{Configurator, NetResource, VmResource};

pub mod backend;
pub mod cloudinit;
pub mod generic;
pub mod memory;
pub mod native;
pub mod playbook;
pub mod probe;
pub mod registry;

pub use backend::InfraBackend;
pub use generic::{BackendProvider, ProviderSettings};
pub use memory::{InMemoryBackend, InMemoryProviderFactory};
pub use native::NativeConfigurators;
pub use registry::{AreaConfig, AreaResolver, ProviderFactory, ProviderRegistry, StaticAreas};

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("image '{0}' not found and no download URL was given")]
    ImageNotFound(String),

    #[error("expected exactly one public network, found {0}")]
    AmbiguousPublicNetwork(usize),

    #[error("timed out after {elapsed:?} waiting for {what}")]
    ReadinessTimeout { what: String, elapsed: Duration },

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("VM '{0}' has not been created")]
    NotCreated(String),

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("server {server} has {ports} ports but {networks} networks were requested")]
    PortMismatch {
        server: String,
        ports: usize,
        networks: usize,
    },

    #[error("area {0} is not configured")]
    UnknownArea(AreaId),

    #[error("no native configurator registered as '{0}'")]
    UnknownNativeEntry(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("backend error: {0}")]
    Backend(String),
}

/// Access to the backend-id mapping of the blueprint being provisioned.
///
/// Implementations persist the mapping on every change, so a crash right
/// after a backend object was created still leaves the object reachable by
/// a later destroy.
#[async_trait]
pub trait ProvisionCheckpoint: Send + Sync {
    fn blueprint_id(&self) -> BlueprintId;

    fn backend_id(&self, resource: &ResourceId) -> Option<String>;

    async fn record_backend_id(
        &mut self,
        resource: &ResourceId,
        backend_id: &str,
    ) -> Result<(), ProviderError>;

    async fn forget_backend_id(&mut self, resource: &ResourceId) -> Result<(), ProviderError>;

    fn cancel_signal(&self) -> &CancelSignal;
}

/// Operations a blueprint can request for one area.
#[async_trait]
pub trait VirtualizationProvider: Send + Sync {
    fn area(&self) -> AreaId;

    /// Create the VM, then fill in its interfaces, access IP and guest
    /// interface names and mark it created.
    async fn create_vm(
        &self,
        vm: &mut VmResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError>;

    /// Apply one configurator to a created VM, returning the facts or result
    /// it produced.
    async fn configure_vm(
        &self,
        configurator: &Configurator,
        vm: &VmResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<serde_json::Value, ProviderError>;

    async fn destroy_vm(
        &self,
        vm: &VmResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError>;

    /// Create the network and its subnet. The network id is recorded
    /// before the subnet is created.
    async fn create_net(
        &self,
        net: &NetResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError>;

    async fn destroy_net(
        &self,
        net: &NetResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError>;

    /// Release everything this provider allocated during its lifetime.
    async fn final_cleanup(&self) -> Result<(), ProviderError>;
}

/// Run `fut` unless the signal fires first.
pub async fn until_cancelled<T, F>(signal: &CancelSignal, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    if signal.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }
    tokio::select! {
        result = fut => result,
        _ = signal.cancelled() => Err(ProviderError::Cancelled),
    }
}
