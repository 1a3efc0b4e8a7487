//! `router`: one routing VM in an area.

use async_trait::async_trait;
use lcm_id::{AreaId, ResourceId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::blueprint::{Blueprint, BlueprintContext, BlueprintError, BlueprintType};
use crate::provider::playbook::PlaybookSpec;
use crate::resources::{Configurator, VmCredentials, VmImage, VmResource};

pub const TYPE_NAME: &str = "router";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRouter {
    pub area: AreaId,
    #[serde(default = "default_name")]
    pub name: String,
    pub image: VmImage,
    pub credentials: VmCredentials,
    pub management_network: String,
    #[serde(default)]
    pub networks: Vec<String>,
}

fn default_name() -> String {
    "router".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub cidr: String,
    pub via: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Router {
    vm: Option<ResourceId>,
    routes: Vec<Route>,
}

fn forwarding_playbook() -> PlaybookSpec {
    PlaybookSpec::new("Enable IP forwarding")
        .shell("Enable forwarding now", "sysctl -w net.ipv4.ip_forward=1")
        .task(json!({
            "name": "Persist forwarding",
            "ansible.builtin.lineinfile": {
                "path": "/etc/sysctl.conf",
                "line": "net.ipv4.ip_forward=1",
            },
        }))
}

fn route_playbook(route: &Route) -> PlaybookSpec {
    PlaybookSpec::new(format!("Route {}", route.cidr)).shell(
        "Install route",
        format!("ip route replace {} via {}", route.cidr, route.via),
    )
}

impl Router {
    fn vm_id(&self) -> Result<ResourceId, BlueprintError> {
        self.vm
            .ok_or_else(|| BlueprintError::Failed("router VM has not been created".to_string()))
    }

    async fn add_route(
        &mut self,
        ctx: &mut BlueprintContext,
        route: Route,
    ) -> Result<Vec<Route>, BlueprintError> {
        let vm = self.vm_id()?;
        let cfg = ctx.register(Configurator::ansible(vm, route_playbook(&route)))?;
        ctx.configure(&cfg).await?;

        self.routes.retain(|r| r.cidr != route.cidr);
        info!(blueprint_id = %ctx.id(), cidr = %route.cidr, via = %route.via, "Route installed");
        self.routes.push(route);
        Ok(self.routes.clone())
    }

    fn info(&self, ctx: &BlueprintContext) -> Result<Value, BlueprintError> {
        let vm = ctx.vm(&self.vm_id()?)?;
        Ok(json!({
            "name": vm.name,
            "access_ip": vm.access_ip,
            "interfaces": vm.network_interfaces,
            "routes": self.routes,
        }))
    }
}

#[async_trait]
impl Blueprint for Router {
    type Create = CreateRouter;

    async fn create(
        &mut self,
        ctx: &mut BlueprintContext,
        request: CreateRouter,
    ) -> Result<(), BlueprintError> {
        let vm = VmResource::new(
            request.area,
            request.name,
            request.image,
            request.credentials,
            request.management_network,
        )
        .with_networks(request.networks);
        let vm = ctx.register(vm)?;
        self.vm = Some(vm);
        let forwarding = ctx.register(Configurator::ansible(vm, forwarding_playbook()))?;
        ctx.persist().await?;

        ctx.create_vm(&vm).await?;
        ctx.configure(&forwarding).await?;
        Ok(())
    }
}

pub fn blueprint_type() -> BlueprintType {
    BlueprintType::builder::<Router>(TYPE_NAME)
        .operation::<Route, Vec<Route>, _>("add_route", |bp, ctx, route| {
            Box::pin(bp.add_route(ctx, route))
        })
        .operation::<(), Value, _>("info", |bp, ctx, ()| {
            Box::pin(async move { bp.info(ctx) })
        })
        .build()
}
