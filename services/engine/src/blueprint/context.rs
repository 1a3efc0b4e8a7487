//! What a blueprint sees while one of its operations runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lcm_id::{BlueprintId, ResourceId};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::instance::BlueprintInstance;
use super::BlueprintError;
use crate::cancel::CancelSignal;
use crate::provider::{ProviderError, ProviderRegistry, ProvisionCheckpoint};
use crate::resources::{Resource, VmResource};
use crate::state::BlueprintStore;

/// Deploys and drives other blueprints on behalf of a parent.
#[async_trait]
pub trait ChildBlueprints: Send + Sync {
    /// Create a blueprint and wait for its DAY0 to finish.
    ///
    /// A child whose DAY0 failed is destroyed before the error is returned.
    async fn deploy(&self, blueprint_type: &str, payload: Value)
        -> Result<BlueprintId, BlueprintError>;

    /// Run a named operation on a child and wait for its result.
    async fn call(
        &self,
        id: &BlueprintId,
        operation: &str,
        args: Value,
    ) -> Result<Value, BlueprintError>;

    /// Destroy a child and wait for the teardown to finish.
    async fn destroy(&self, id: &BlueprintId) -> Result<(), BlueprintError>;
}

/// For contexts that cannot reach a manager.
#[derive(Debug, Default)]
pub struct NoChildren;

#[async_trait]
impl ChildBlueprints for NoChildren {
    async fn deploy(&self, blueprint_type: &str, _: Value) -> Result<BlueprintId, BlueprintError> {
        Err(BlueprintError::Failed(format!(
            "cannot deploy child '{blueprint_type}' without a manager"
        )))
    }

    async fn call(&self, id: &BlueprintId, _: &str, _: Value) -> Result<Value, BlueprintError> {
        Err(BlueprintError::Child {
            id: id.to_string(),
            detail: "no manager".to_string(),
        })
    }

    async fn destroy(&self, id: &BlueprintId) -> Result<(), BlueprintError> {
        Err(BlueprintError::Child {
            id: id.to_string(),
            detail: "no manager".to_string(),
        })
    }
}

/// Persists the backend-id mapping through the store on every change.
struct InstanceCheckpoint<'a> {
    instance: &'a mut BlueprintInstance,
    store: &'a dyn BlueprintStore,
    cancel: &'a CancelSignal,
}

impl InstanceCheckpoint<'_> {
    async fn save(&mut self) -> Result<(), ProviderError> {
        self.instance.updated_at = Utc::now();
        self.store
            .save(&*self.instance)
            .await
            .map_err(|e| ProviderError::Backend(format!("persisting backend id mapping: {e}")))
    }
}

#[async_trait]
impl<'a> ProvisionCheckpoint for InstanceCheckpoint<'a> {
    fn blueprint_id(&self) -> BlueprintId {
        self.instance.id
    }

    fn backend_id(&self, resource: &ResourceId) -> Option<String> {
        self.instance.backend_ids.get(resource).cloned()
    }

    async fn record_backend_id(
        &mut self,
        resource: &ResourceId,
        backend_id: &str,
    ) -> Result<(), ProviderError> {
        self.instance
            .backend_ids
            .insert(*resource, backend_id.to_string());
        self.save().await
    }

    async fn forget_backend_id(&mut self, resource: &ResourceId) -> Result<(), ProviderError> {
        self.instance.backend_ids.remove(resource);
        self.save().await
    }

    fn cancel_signal(&self) -> &CancelSignal {
        self.cancel
    }
}

/// Per-blueprint view of the engine: the instance document, the store,
/// the providers and the parent-child link.
pub struct BlueprintContext {
    instance: BlueprintInstance,
    store: Arc<dyn BlueprintStore>,
    providers: Arc<ProviderRegistry>,
    children: Arc<dyn ChildBlueprints>,
    cancel: CancelSignal,
}

impl BlueprintContext {
    pub fn new(
        instance: BlueprintInstance,
        store: Arc<dyn BlueprintStore>,
        providers: Arc<ProviderRegistry>,
        children: Arc<dyn ChildBlueprints>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            instance,
            store,
            providers,
            children,
            cancel,
        }
    }

    pub fn id(&self) -> BlueprintId {
        self.instance.id
    }

    pub fn instance(&self) -> &BlueprintInstance {
        &self.instance
    }

    pub(crate) fn instance_mut(&mut self) -> &mut BlueprintInstance {
        &mut self.instance
    }

    pub fn store(&self) -> &Arc<dyn BlueprintStore> {
        &self.store
    }

    pub fn children(&self) -> Arc<dyn ChildBlueprints> {
        self.children.clone()
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    fn checkpoint(&mut self) -> InstanceCheckpoint<'_> {
        InstanceCheckpoint {
            instance: &mut self.instance,
            store: self.store.as_ref(),
            cancel: &self.cancel,
        }
    }

    /// Write the instance document to the store.
    pub async fn persist(&mut self) -> Result<(), BlueprintError> {
        self.instance.updated_at = Utc::now();
        self.store.save(&self.instance).await?;
        Ok(())
    }

    /// Add a resource to the registry. Nothing is created yet.
    pub fn register(&mut self, resource: impl Into<Resource>) -> Result<ResourceId, BlueprintError> {
        let resource = resource.into();
        debug!(blueprint = %self.instance.id, kind = resource.kind(), id = %resource.id(), "Resource registered");
        Ok(self.instance.resources.register(resource)?)
    }

    pub fn vm(&self, id: &ResourceId) -> Result<&VmResource, BlueprintError> {
        Ok(self.instance.resources.vm(id)?)
    }

    /// Create a registered VM. Already created VMs are left alone.
    pub async fn create_vm(&mut self, id: &ResourceId) -> Result<(), BlueprintError> {
        let mut vm = self.instance.resources.vm(id)?.clone();
        if vm.created {
            debug!(vm = %vm.name, "VM already created");
            return Ok(());
        }
        let provider = self.providers.get(vm.area).await?;

        let result = {
            let mut checkpoint = self.checkpoint();
            provider.create_vm(&mut vm, &mut checkpoint).await
        };

        // Whatever the provider filled in before failing is kept.
        self.instance.resources.replace(vm.into())?;
        self.persist().await?;
        Ok(result?)
    }

    /// Apply a registered configurator to its target VM.
    pub async fn configure(&mut self, configurator: &ResourceId) -> Result<Value, BlueprintError> {
        let cfg = self.instance.resources.configurator(configurator)?.clone();
        let vm = self.instance.resources.vm(&cfg.target)?.clone();
        let provider = self.providers.get(vm.area).await?;

        let mut checkpoint = self.checkpoint();
        Ok(provider.configure_vm(&cfg, &vm, &mut checkpoint).await?)
    }

    /// Destroy a VM, then drop it and its configurators from the registry.
    pub async fn destroy_vm(&mut self, id: &ResourceId) -> Result<(), BlueprintError> {
        let vm = self.instance.resources.vm(id)?.clone();
        let provider = self.providers.get(vm.area).await?;
        {
            let mut checkpoint = self.checkpoint();
            provider.destroy_vm(&vm, &mut checkpoint).await?;
        }

        for cfg in self.instance.resources.configurators_of(id) {
            self.instance.resources.deregister(&cfg);
        }
        self.instance.resources.deregister(id);
        self.persist().await?;
        info!(blueprint = %self.instance.id, vm = %vm.name, "VM removed");
        Ok(())
    }

    pub async fn create_net(&mut self, id: &ResourceId) -> Result<(), BlueprintError> {
        let net = self.instance.resources.net(id)?.clone();
        let provider = self.providers.get(net.area).await?;
        let mut checkpoint = self.checkpoint();
        Ok(provider.create_net(&net, &mut checkpoint).await?)
    }

    /// Destroy a network, then drop it from the registry.
    pub async fn destroy_net(&mut self, id: &ResourceId) -> Result<(), BlueprintError> {
        let net = self.instance.resources.net(id)?.clone();
        let provider = self.providers.get(net.area).await?;
        {
            let mut checkpoint = self.checkpoint();
            provider.destroy_net(&net, &mut checkpoint).await?;
        }
        self.instance.resources.deregister(id);
        self.persist().await
    }

    /// Drop a configurator from the registry.
    pub async fn remove_configurator(&mut self, id: &ResourceId) -> Result<(), BlueprintError> {
        self.instance.resources.configurator(id)?;
        self.instance.resources.deregister(id);
        self.persist().await
    }

    /// Replace a registered resource with an updated copy.
    pub fn update_resource(&mut self, resource: impl Into<Resource>) -> Result<(), BlueprintError> {
        Ok(self.instance.resources.replace(resource.into())?)
    }

    /// Destroy every registered resource: VMs (with their configurators)
    /// newest first, then networks newest first.
    ///
    /// A failing resource stays registered and the remaining ones are still
    /// attempted; the first failure is returned.
    pub async fn destroy_all(&mut self) -> Result<(), BlueprintError> {
        let ordered: Vec<(ResourceId, &'static str)> = self
            .instance
            .resources
            .all()
            .iter()
            .rev()
            .map(|r| (*r.id(), r.kind()))
            .collect();

        let mut first_error = None;
        for kind in ["vm", "net"] {
            for (id, _) in ordered.iter().filter(|(_, k)| *k == kind) {
                let result = match kind {
                    "vm" => self.destroy_vm(id).await,
                    _ => self.destroy_net(id).await,
                };
                if let Err(e) = result {
                    warn!(blueprint = %self.instance.id, resource = %id, error = %e, "Failed to destroy resource");
                    first_error.get_or_insert(e);
                }
            }
        }

        // Configurators whose VM is already gone.
        for (id, _) in ordered.iter().filter(|(_, k)| *k == "configurator") {
            self.instance.resources.deregister(id);
        }
        self.persist().await?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn set_protected(&mut self, protected: bool) -> Result<bool, BlueprintError> {
        self.instance.protected = protected;
        self.persist().await?;
        Ok(protected)
    }
}
