//! `dataplane`: one data-plane VM whose configuration is pushed with a
//! playbook and can be replaced later with `update`.

use async_trait::async_trait;
use lcm_id::{AreaId, ResourceId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::blueprint::{Blueprint, BlueprintContext, BlueprintError, BlueprintType};
use crate::provider::playbook::PlaybookSpec;
use crate::resources::{Configurator, ConfiguratorKind, VmCredentials, VmImage, VmResource};

pub const TYPE_NAME: &str = "dataplane";

const CONFIG_PATH: &str = "/etc/dataplane/config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDataplane {
    pub area: AreaId,
    #[serde(default = "default_name")]
    pub name: String,
    pub image: VmImage,
    pub credentials: VmCredentials,
    pub management_network: String,
    #[serde(default)]
    pub networks: Vec<String>,

    /// Next hop for traffic leaving the area.
    #[serde(default)]
    pub router: Option<String>,

    #[serde(default)]
    pub config: Value,
}

fn default_name() -> String {
    "dataplane".to_string()
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfig {
    pub config: Value,
}

#[derive(Debug, Serialize)]
pub struct Applied {
    pub generation: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Dataplane {
    vm: Option<ResourceId>,
    configurator: Option<ResourceId>,
    router: Option<String>,
    config: Value,
    generation: u32,
}

/// Write the config, point the default route at the router and restart
/// the service.
fn config_playbook(config: &Value, router: Option<&str>) -> Result<PlaybookSpec, BlueprintError> {
    let content = serde_json::to_string_pretty(config)?;
    let mut playbook = PlaybookSpec::new("Configure data plane").task(json!({
        "name": "Write data-plane config",
        "ansible.builtin.copy": {
            "dest": CONFIG_PATH,
            "content": content,
            "mode": "0644",
        },
    }));
    if let Some(router) = router {
        playbook = playbook.shell(
            "Route through the area router",
            format!("ip route replace default via {router}"),
        );
    }
    Ok(playbook.shell("Restart data plane", "systemctl restart dataplane"))
}

impl Dataplane {
    async fn update(
        &mut self,
        ctx: &mut BlueprintContext,
        request: UpdateConfig,
    ) -> Result<Applied, BlueprintError> {
        let (Some(vm), Some(cfg_id)) = (self.vm, self.configurator) else {
            return Err(BlueprintError::Failed(
                "data plane has not been deployed".to_string(),
            ));
        };

        let playbook = config_playbook(&request.config, self.router.as_deref())?;
        ctx.update_resource(Configurator {
            id: cfg_id,
            target: vm,
            kind: ConfiguratorKind::Ansible { playbook },
        })?;
        ctx.configure(&cfg_id).await?;

        self.config = request.config;
        self.generation += 1;
        info!(blueprint_id = %ctx.id(), generation = self.generation, "Data-plane config applied");
        Ok(Applied {
            generation: self.generation,
        })
    }
}

#[async_trait]
impl Blueprint for Dataplane {
    type Create = CreateDataplane;

    async fn create(
        &mut self,
        ctx: &mut BlueprintContext,
        request: CreateDataplane,
    ) -> Result<(), BlueprintError> {
        let playbook = config_playbook(&request.config, request.router.as_deref())?;
        let vm = VmResource::new(
            request.area,
            request.name,
            request.image,
            request.credentials,
            request.management_network,
        )
        .with_networks(request.networks);

        let vm = ctx.register(vm)?;
        let cfg = ctx.register(Configurator::ansible(vm, playbook))?;
        self.vm = Some(vm);
        self.configurator = Some(cfg);
        self.router = request.router;
        self.config = request.config;
        ctx.persist().await?;

        ctx.create_vm(&vm).await?;
        ctx.configure(&cfg).await?;
        Ok(())
    }
}

pub fn blueprint_type() -> BlueprintType {
    BlueprintType::builder::<Dataplane>(TYPE_NAME)
        .operation::<UpdateConfig, Applied, _>("update", |bp, ctx, request| {
            Box::pin(bp.update(ctx, request))
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_playbook_routes_only_with_router() {
        let config = json!({"upf": {"dnn": "internet"}});

        let without = config_playbook(&config, None).unwrap();
        assert_eq!(without.tasks.len(), 2);

        let with = config_playbook(&config, Some("10.0.0.1")).unwrap();
        assert_eq!(with.tasks.len(), 3);
        assert_eq!(
            with.tasks[1]["ansible.builtin.shell"],
            "ip route replace default via 10.0.0.1"
        );
        assert!(with.tasks[0]["ansible.builtin.copy"]["content"]
            .as_str()
            .unwrap()
            .contains("internet"));
    }
}
