//! `vm_topology`: a set of networks and VMs in one area.
//!
//! DAY0 registers every requested network, VM and configurator before
//! creating anything, then creates the networks, then each VM followed by
//! its configurators in request order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lcm_id::{AreaId, ResourceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::blueprint::{Blueprint, BlueprintContext, BlueprintError, BlueprintType};
use crate::resources::{
    Configurator, ConfiguratorKind, NetResource, VmCredentials, VmFlavor, VmImage, VmResource,
};

pub const TYPE_NAME: &str = "vm_topology";

/// A network to create.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub cidr: String,
}

/// A VM to create, with the configuration to apply once it is up.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub image: VmImage,
    #[serde(default)]
    pub flavor: VmFlavor,
    pub credentials: VmCredentials,
    pub management_network: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub floating_ip: bool,
    #[serde(default)]
    pub configure: Vec<ConfiguratorKind>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTopology {
    pub area: AreaId,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub vms: Vec<VmSpec>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveVm {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct AddedVm {
    pub name: String,
    pub access_ip: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VmTopology {
    area: Option<AreaId>,
    nets: BTreeMap<String, ResourceId>,
    vms: BTreeMap<String, ResourceId>,

    /// Result of the last configurator run on each VM.
    facts: BTreeMap<String, Value>,
}

impl VmTopology {
    fn area(&self) -> Result<AreaId, BlueprintError> {
        self.area
            .ok_or_else(|| BlueprintError::Failed("topology has not been deployed".to_string()))
    }

    /// Register a VM and its configurators. Nothing is created.
    fn register_vm(
        &mut self,
        ctx: &mut BlueprintContext,
        area: AreaId,
        spec: VmSpec,
    ) -> Result<(ResourceId, Vec<ResourceId>), BlueprintError> {
        if self.vms.contains_key(&spec.name) {
            return Err(BlueprintError::Failed(format!(
                "VM '{}' already exists in this topology",
                spec.name
            )));
        }

        let vm = VmResource::new(
            area,
            spec.name.clone(),
            spec.image,
            spec.credentials,
            spec.management_network,
        )
        .with_flavor(spec.flavor)
        .with_networks(spec.networks)
        .with_floating_ip(spec.floating_ip);
        let vm_id = ctx.register(vm)?;
        self.vms.insert(spec.name, vm_id);

        let configurators = spec
            .configure
            .into_iter()
            .map(|kind| {
                ctx.register(Configurator {
                    id: ResourceId::new(),
                    target: vm_id,
                    kind,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((vm_id, configurators))
    }

    async fn bring_up(
        &mut self,
        ctx: &mut BlueprintContext,
        vm: &ResourceId,
        configurators: &[ResourceId],
    ) -> Result<(), BlueprintError> {
        ctx.create_vm(vm).await?;
        let name = ctx.vm(vm)?.name.clone();
        for cfg in configurators {
            let facts = ctx.configure(cfg).await?;
            self.facts.insert(name.clone(), facts);
        }
        Ok(())
    }

    async fn add_vm(
        &mut self,
        ctx: &mut BlueprintContext,
        spec: VmSpec,
    ) -> Result<AddedVm, BlueprintError> {
        let area = self.area()?;
        let name = spec.name.clone();
        let (vm, configurators) = self.register_vm(ctx, area, spec)?;
        ctx.persist().await?;

        self.bring_up(ctx, &vm, &configurators).await?;
        info!(blueprint_id = %ctx.id(), vm = %name, "VM added to topology");
        Ok(AddedVm {
            access_ip: ctx.vm(&vm)?.access_ip.clone(),
            name,
        })
    }

    async fn remove_vm(
        &mut self,
        ctx: &mut BlueprintContext,
        request: RemoveVm,
    ) -> Result<Vec<String>, BlueprintError> {
        let id = *self.vms.get(&request.name).ok_or_else(|| {
            BlueprintError::Failed(format!("no VM named '{}'", request.name))
        })?;
        ctx.destroy_vm(&id).await?;
        self.vms.remove(&request.name);
        self.facts.remove(&request.name);
        Ok(self.vms.keys().cloned().collect())
    }

    fn access_ips(&self, ctx: &BlueprintContext) -> BTreeMap<String, Option<String>> {
        self.vms
            .iter()
            .map(|(name, id)| {
                let ip = ctx.vm(id).ok().and_then(|vm| vm.access_ip.clone());
                (name.clone(), ip)
            })
            .collect()
    }
}

#[async_trait]
impl Blueprint for VmTopology {
    type Create = CreateTopology;

    async fn create(
        &mut self,
        ctx: &mut BlueprintContext,
        request: CreateTopology,
    ) -> Result<(), BlueprintError> {
        let area = request.area;
        self.area = Some(area);

        let mut nets = Vec::with_capacity(request.networks.len());
        for spec in request.networks {
            let id = ctx.register(NetResource::new(area, spec.name.clone(), spec.cidr))?;
            self.nets.insert(spec.name, id);
            nets.push(id);
        }
        let mut vms = Vec::with_capacity(request.vms.len());
        for spec in request.vms {
            vms.push(self.register_vm(ctx, area, spec)?);
        }
        ctx.persist().await?;

        for net in &nets {
            ctx.create_net(net).await?;
        }
        for (vm, configurators) in &vms {
            self.bring_up(ctx, vm, configurators).await?;
        }
        Ok(())
    }
}

pub fn blueprint_type() -> BlueprintType {
    BlueprintType::builder::<VmTopology>(TYPE_NAME)
        .route::<VmSpec, AddedVm, _>("/add_vm", |bp, ctx, spec| Box::pin(bp.add_vm(ctx, spec)))
        .route::<RemoveVm, Vec<String>, _>("/del_vm", |bp, ctx, request| {
            Box::pin(bp.remove_vm(ctx, request))
        })
        .operation::<(), BTreeMap<String, Option<String>>, _>("access_ips", |bp, ctx, ()| {
            Box::pin(async move { Ok::<_, BlueprintError>(bp.access_ips(ctx)) })
        })
        .build()
}
