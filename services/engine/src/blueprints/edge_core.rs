//! `edge_core`: a router and a data plane per edge area, kept in line with
//! the desired area list by reconciliation.
//!
//! Each area gets a `router` child unless the area names an external router,
//! then a `dataplane` child routed through it. A changed data-plane config is
//! pushed to the existing child with its `update` operation; removed areas
//! are torn down. External routers are never destroyed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lcm_id::{AreaId, BlueprintId};
use lcm_reconcile::{reconcile, EdgeReconciler, ReconcileReport, SpecHash};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{dataplane, router};
use crate::blueprint::{Blueprint, BlueprintContext, BlueprintError, BlueprintType, ChildBlueprints};
use crate::resources::{VmCredentials, VmImage};

pub const TYPE_NAME: &str = "edge_core";

/// Desired shape of one edge area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeArea {
    pub area: AreaId,
    pub management_network: String,
    #[serde(default)]
    pub networks: Vec<String>,

    /// Address of a router that already exists in the area.
    #[serde(default)]
    pub external_router: Option<String>,

    /// Data-plane config for the area.
    #[serde(default)]
    pub dataplane: Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateEdgeCore {
    pub image: VmImage,
    pub credentials: VmCredentials,
    #[serde(default)]
    pub areas: Vec<EdgeArea>,
}

/// Children deployed for one area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDeployment {
    /// Router child; `None` when the area uses an external router.
    pub router: Option<BlueprintId>,
    pub router_ip: Option<String>,
    pub dataplane: BlueprintId,

    /// Data-plane config last applied.
    pub applied: Value,
}

/// What one reconciliation pass did, by area.
#[derive(Debug, Default, Serialize)]
pub struct AreasReport {
    pub deployed: Vec<AreaId>,
    pub updated: Vec<AreaId>,
    pub unchanged: Vec<AreaId>,
    pub removed: Vec<AreaId>,
}

impl From<ReconcileReport<AreaId>> for AreasReport {
    fn from(report: ReconcileReport<AreaId>) -> Self {
        Self {
            deployed: report.deployed,
            updated: report.updated,
            unchanged: report.unchanged,
            removed: report.removed,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EdgeCore {
    image: Option<VmImage>,
    credentials: Option<VmCredentials>,
    desired: BTreeMap<AreaId, EdgeArea>,
    deployed: BTreeMap<AreaId, EdgeDeployment>,
}

struct EdgeOps<'a> {
    children: Arc<dyn ChildBlueprints>,
    image: &'a VmImage,
    credentials: &'a VmCredentials,
}

impl EdgeOps<'_> {
    async fn deploy_router(
        &self,
        area: &AreaId,
        desired: &EdgeArea,
    ) -> Result<(BlueprintId, Option<String>), BlueprintError> {
        let request = router::CreateRouter {
            area: *area,
            name: format!("router-{area}"),
            image: self.image.clone(),
            credentials: self.credentials.clone(),
            management_network: desired.management_network.clone(),
            networks: desired.networks.clone(),
        };
        let id = self
            .children
            .deploy(router::TYPE_NAME, serde_json::to_value(request)?)
            .await?;
        let info = self.children.call(&id, "info", Value::Null).await?;
        let ip = info["access_ip"].as_str().map(str::to_string);
        Ok((id, ip))
    }
}

#[async_trait]
impl<'a> EdgeReconciler for EdgeOps<'a> {
    type Area = AreaId;
    type Desired = EdgeArea;
    type Deployed = EdgeDeployment;
    type Config = Value;
    type Error = BlueprintError;

    fn target_config(&self, _area: &AreaId, desired: &EdgeArea) -> Result<Value, BlueprintError> {
        Ok(desired.dataplane.clone())
    }

    fn applied_config<'d>(&self, deployed: &'d EdgeDeployment) -> &'d Value {
        &deployed.applied
    }

    async fn deploy(
        &mut self,
        area: &AreaId,
        desired: &EdgeArea,
        config: Value,
    ) -> Result<EdgeDeployment, BlueprintError> {
        let (router, router_ip) = match &desired.external_router {
            Some(ip) => (None, Some(ip.clone())),
            None => {
                let (id, ip) = self.deploy_router(area, desired).await?;
                (Some(id), ip)
            }
        };

        let request = dataplane::CreateDataplane {
            area: *area,
            name: format!("dataplane-{area}"),
            image: self.image.clone(),
            credentials: self.credentials.clone(),
            management_network: desired.management_network.clone(),
            networks: desired.networks.clone(),
            router: router_ip.clone(),
            config: config.clone(),
        };
        let deployed = match serde_json::to_value(request) {
            Ok(payload) => self.children.deploy(dataplane::TYPE_NAME, payload).await,
            Err(e) => Err(e.into()),
        };
        let dataplane = match deployed {
            Ok(id) => id,
            Err(e) => {
                // Do not leave a router behind for an area that failed.
                if let Some(router) = router {
                    if let Err(te) = self.children.destroy(&router).await {
                        warn!(area = %area, router = %router, error = %te, "Failed to remove router");
                    }
                }
                return Err(e);
            }
        };

        info!(area = %area, config = %SpecHash::from_json(&config), "Edge area deployed");
        Ok(EdgeDeployment {
            router,
            router_ip,
            dataplane,
            applied: config,
        })
    }

    async fn update(
        &mut self,
        area: &AreaId,
        deployed: &mut EdgeDeployment,
        config: Value,
    ) -> Result<(), BlueprintError> {
        self.children
            .call(&deployed.dataplane, "update", json!({ "config": config }))
            .await?;
        info!(area = %area, config = %SpecHash::from_json(&config), "Edge area updated");
        deployed.applied = config;
        Ok(())
    }

    async fn teardown(
        &mut self,
        area: &AreaId,
        deployed: &EdgeDeployment,
    ) -> Result<(), BlueprintError> {
        self.children.destroy(&deployed.dataplane).await?;
        if let Some(router) = &deployed.router {
            self.children.destroy(router).await?;
        }
        info!(area = %area, "Edge area removed");
        Ok(())
    }
}

impl EdgeCore {
    async fn converge(&mut self, ctx: &mut BlueprintContext) -> Result<AreasReport, BlueprintError> {
        let (Some(image), Some(credentials)) = (&self.image, &self.credentials) else {
            return Err(BlueprintError::Failed("edge core has not been deployed".to_string()));
        };
        let mut ops = EdgeOps {
            children: ctx.children(),
            image,
            credentials,
        };
        let report = reconcile(&mut ops, &self.desired, &mut self.deployed)
            .await
            .map_err(|e| BlueprintError::Reconcile(e.to_string()))?;
        Ok(report.into())
    }

    /// Key a request batch by area. The whole batch is checked before the
    /// desired map is touched.
    fn batch(
        areas: Vec<EdgeArea>,
        check: impl Fn(&AreaId) -> Result<(), BlueprintError>,
    ) -> Result<BTreeMap<AreaId, EdgeArea>, BlueprintError> {
        let mut batch = BTreeMap::new();
        for area in areas {
            check(&area.area)?;
            let id = area.area;
            if batch.insert(id, area).is_some() {
                return Err(BlueprintError::Failed(format!("area {id} is listed twice")));
            }
        }
        Ok(batch)
    }

    async fn add_areas(
        &mut self,
        ctx: &mut BlueprintContext,
        areas: Vec<EdgeArea>,
    ) -> Result<AreasReport, BlueprintError> {
        let batch = Self::batch(areas, |area| {
            if self.desired.contains_key(area) {
                return Err(BlueprintError::Failed(format!("area {area} is already present")));
            }
            Ok(())
        })?;
        self.desired.extend(batch);
        self.converge(ctx).await
    }

    async fn remove_areas(
        &mut self,
        ctx: &mut BlueprintContext,
        areas: Vec<AreaId>,
    ) -> Result<AreasReport, BlueprintError> {
        for area in &areas {
            self.desired.remove(area);
        }
        self.converge(ctx).await
    }

    async fn update_areas(
        &mut self,
        ctx: &mut BlueprintContext,
        areas: Vec<EdgeArea>,
    ) -> Result<AreasReport, BlueprintError> {
        let batch = Self::batch(areas, |area| {
            if !self.desired.contains_key(area) {
                return Err(BlueprintError::Failed(format!("area {area} is not present")));
            }
            Ok(())
        })?;
        self.desired.extend(batch);
        self.converge(ctx).await
    }

    /// Replace the whole desired area list.
    async fn set_areas(
        &mut self,
        ctx: &mut BlueprintContext,
        areas: Vec<EdgeArea>,
    ) -> Result<AreasReport, BlueprintError> {
        self.desired = Self::batch(areas, |_| Ok(()))?;
        self.converge(ctx).await
    }
}

#[async_trait]
impl Blueprint for EdgeCore {
    type Create = CreateEdgeCore;

    async fn create(
        &mut self,
        ctx: &mut BlueprintContext,
        request: CreateEdgeCore,
    ) -> Result<(), BlueprintError> {
        self.image = Some(request.image);
        self.credentials = Some(request.credentials);
        self.add_areas(ctx, request.areas).await.map(drop)
    }

    async fn destroy(&mut self, ctx: &mut BlueprintContext) -> Result<(), BlueprintError> {
        self.desired.clear();
        if self.image.is_some() {
            self.converge(ctx).await?;
        }
        ctx.destroy_all().await
    }
}

pub fn blueprint_type() -> BlueprintType {
    BlueprintType::builder::<EdgeCore>(TYPE_NAME)
        .route::<Vec<EdgeArea>, AreasReport, _>("/areas/add", |bp, ctx, areas| {
            Box::pin(bp.add_areas(ctx, areas))
        })
        .route::<Vec<AreaId>, AreasReport, _>("/areas/del", |bp, ctx, areas| {
            Box::pin(bp.remove_areas(ctx, areas))
        })
        .route::<Vec<EdgeArea>, AreasReport, _>("/areas/update", |bp, ctx, areas| {
            Box::pin(bp.update_areas(ctx, areas))
        })
        .route::<Vec<EdgeArea>, AreasReport, _>("/areas/set", |bp, ctx, areas| {
            Box::pin(bp.set_areas(ctx, areas))
        })
        .operation::<(), BTreeMap<AreaId, EdgeDeployment>, _>("deployed", |bp, _, ()| {
            Box::pin(async move { Ok::<_, BlueprintError>(bp.deployed.clone()) })
        })
        .build()
}
