//! Provider logic shared by every backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lcm_id::AreaId;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::backend::{AddressKind, FlavorSpec, ImageInfo, InfraBackend, ServerInfo, ServerRequest};
use super::cloudinit::CloudInit;
use super::native::NativeConfigurators;
use super::playbook::{
    parse_interfaces_mac, PlaybookRun, PlaybookRunner, PlaybookSpec, INTERFACES_MAC_FACT,
};
use super::probe::{wait_until_reachable, ManagementProbe, ManagementTarget};
use super::registry::AreaConfig;
use super::{until_cancelled, ProviderError, ProvisionCheckpoint, VirtualizationProvider};
use crate::cancel::CancelSignal;
use crate::resources::{
    Configurator, ConfiguratorKind, InterfaceAddress, NetResource, NetworkInterface, VmResource,
};

/// Timing knobs of a provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Upper bound on waiting for the management port.
    pub ssh_timeout: Duration,
    /// Delay between management port attempts.
    pub ssh_retry_interval: Duration,
    pub ssh_port: u16,
    /// Upper bound on backend waits (image import, server boot).
    pub backend_timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            ssh_timeout: Duration::from_secs(300),
            ssh_retry_interval: Duration::from_secs(5),
            ssh_port: 22,
            backend_timeout: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
struct NetRecord {
    network_id: String,
    subnet_id: String,
}

/// Objects allocated by this provider instance.
#[derive(Debug, Default)]
struct SessionData {
    /// Flavor name to backend id.
    flavors: BTreeMap<String, String>,
    /// Network name to backend ids.
    networks: BTreeMap<String, NetRecord>,
}

/// [`VirtualizationProvider`] over an [`InfraBackend`].
pub struct BackendProvider<B> {
    area: AreaConfig,
    backend: Arc<B>,
    probe: Arc<dyn ManagementProbe>,
    runner: Arc<dyn PlaybookRunner>,
    natives: Arc<NativeConfigurators>,
    settings: ProviderSettings,
    session: Mutex<SessionData>,
}

impl<B: InfraBackend> BackendProvider<B> {
    pub fn new(
        area: AreaConfig,
        backend: Arc<B>,
        probe: Arc<dyn ManagementProbe>,
        runner: Arc<dyn PlaybookRunner>,
        natives: Arc<NativeConfigurators>,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            area,
            backend,
            probe,
            runner,
            natives,
            settings,
            session: Mutex::new(SessionData::default()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Bound a backend wait by the backend timeout and the cancel signal.
    async fn wait_backend<T, F>(
        &self,
        what: &str,
        cancel: &CancelSignal,
        fut: F,
    ) -> Result<T, ProviderError>
    where
        F: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let timeout = self.settings.backend_timeout;
        until_cancelled(cancel, async {
            tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| ProviderError::ReadinessTimeout {
                    what: what.to_string(),
                    elapsed: timeout,
                })?
        })
        .await
    }

    async fn resolve_image(
        &self,
        vm: &VmResource,
        cancel: &CancelSignal,
    ) -> Result<ImageInfo, ProviderError> {
        if let Some(image) = self.backend.find_image(&vm.image.name).await? {
            return Ok(image);
        }
        let url = vm
            .image
            .url
            .as_deref()
            .ok_or_else(|| ProviderError::ImageNotFound(vm.image.name.clone()))?;
        info!(image = %vm.image.name, %url, "Importing image");
        self.wait_backend(
            &format!("import of image {}", vm.image.name),
            cancel,
            self.backend.import_image(&vm.image.name, url),
        )
        .await
    }

    /// Flavors are named after the VM and reused within this session.
    async fn resolve_flavor(&self, vm: &VmResource) -> Result<String, ProviderError> {
        let name = format!("Flavor_{}", vm.name);
        let mut session = self.session.lock().await;

        if session.flavors.contains_key(&name) {
            return self.backend.find_flavor(&name).await?.ok_or_else(|| {
                ProviderError::Backend(format!("flavor {name} allocated earlier is gone"))
            });
        }

        let id = self
            .backend
            .create_flavor(&FlavorSpec {
                name: name.clone(),
                memory_mb: vm.flavor.memory_mb,
                vcpu_count: vm.flavor.vcpu_count,
                storage_gb: vm.flavor.storage_gb,
            })
            .await?;
        session.flavors.insert(name, id.clone());
        Ok(id)
    }

    async fn floating_network(&self, vm: &VmResource) -> Result<Option<String>, ProviderError> {
        if !(self.area.use_floating_ip || vm.require_floating_ip) {
            return Ok(None);
        }
        let mut networks = self.backend.floating_networks().await?;
        if networks.len() != 1 {
            return Err(ProviderError::AmbiguousPublicNetwork(networks.len()));
        }
        Ok(networks.pop())
    }

    async fn fill_interfaces(
        &self,
        vm: &mut VmResource,
        server: &ServerInfo,
    ) -> Result<(), ProviderError> {
        let mut cidrs = HashMap::new();
        for network in vm.attached_networks() {
            let subnet = self.backend.first_subnet(&network).await?;
            cidrs.insert(network, subnet.cidr);
        }

        let mut fixed = BTreeMap::new();
        let mut floating = BTreeMap::new();
        for address in &server.addresses {
            let entry = InterfaceAddress {
                ip: address.addr.clone(),
                mac: address.mac.to_ascii_lowercase(),
                cidr: cidrs.get(&address.network).cloned().unwrap_or_default(),
            };
            match address.kind {
                AddressKind::Fixed => fixed.insert(address.network.clone(), entry),
                AddressKind::Floating => floating.insert(address.network.clone(), entry),
            };
        }

        vm.network_interfaces = fixed
            .into_iter()
            .map(|(network, fixed)| {
                let floating = floating.remove(&network);
                (
                    network,
                    NetworkInterface {
                        fixed,
                        floating,
                        interface_name: None,
                    },
                )
            })
            .collect();
        Ok(())
    }

    async fn disable_port_security(
        &self,
        vm: &VmResource,
        server_id: &str,
    ) -> Result<(), ProviderError> {
        let ports = self.backend.server_ports(server_id).await?;
        let networks = vm.attached_networks().len();
        if ports.len() != networks {
            return Err(ProviderError::PortMismatch {
                server: server_id.to_string(),
                ports: ports.len(),
                networks,
            });
        }
        for port in &ports {
            self.backend.disable_port_security(port).await?;
        }
        Ok(())
    }

    fn management_target(&self, vm: &VmResource) -> Result<ManagementTarget, ProviderError> {
        let host = vm
            .access_ip
            .clone()
            .ok_or_else(|| ProviderError::NotCreated(vm.name.clone()))?;
        Ok(ManagementTarget {
            host,
            port: self.settings.ssh_port,
            username: vm.credentials.username.clone(),
            password: vm.credentials.password.clone(),
        })
    }

    /// Wait for the management port, then run the playbook.
    async fn run_playbook(
        &self,
        vm: &VmResource,
        playbook: &PlaybookSpec,
        checkpoint: &dyn ProvisionCheckpoint,
    ) -> Result<serde_json::Map<String, Value>, ProviderError> {
        let target = self.management_target(vm)?;
        let cancel = checkpoint.cancel_signal();

        wait_until_reachable(
            self.probe.as_ref(),
            &target,
            self.settings.ssh_timeout,
            self.settings.ssh_retry_interval,
            cancel,
        )
        .await?;

        let run = PlaybookRun {
            name: format!("{}_{}", checkpoint.blueprint_id(), vm.name),
            host: target.host,
            username: target.username,
            password: target.password,
            playbook: playbook
                .render()
                .map_err(|e| ProviderError::ConfigurationFailed(format!("rendering playbook: {e}")))?,
        };
        let report = until_cancelled(cancel, self.runner.run(&run)).await?;
        if report.failed {
            return Err(ProviderError::ConfigurationFailed(format!(
                "playbook '{}' failed on {}",
                playbook.name, vm.name
            )));
        }
        Ok(report.facts)
    }

    /// Best-effort removal of a network that could not be completed.
    /// Returns whether it is gone.
    async fn discard_network(&self, network_id: &str) -> bool {
        match self.backend.delete_network(network_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%network_id, error = %e, "Failed to remove incomplete network");
                false
            }
        }
    }

    /// Discover the guest name of every interface by matching MACs.
    async fn discover_interface_names(
        &self,
        vm: &mut VmResource,
        checkpoint: &dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError> {
        let facts = self
            .run_playbook(vm, &PlaybookSpec::interface_discovery(), checkpoint)
            .await?;
        let listing = facts
            .get(INTERFACES_MAC_FACT)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let by_mac: HashMap<String, String> = parse_interfaces_mac(listing).into_iter().collect();

        for (network, iface) in vm.network_interfaces.iter_mut() {
            let name = by_mac.get(&iface.fixed.mac).ok_or_else(|| {
                ProviderError::ConfigurationFailed(format!(
                    "no guest interface with MAC {} (network {network})",
                    iface.fixed.mac
                ))
            })?;
            iface.interface_name = Some(name.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl<B: InfraBackend> VirtualizationProvider for BackendProvider<B> {
    fn area(&self) -> AreaId {
        self.area.area
    }

    #[instrument(skip_all, fields(area = %self.area.area, vm = %vm.name))]
    async fn create_vm(
        &self,
        vm: &mut VmResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError> {
        let cancel = checkpoint.cancel_signal().clone();

        let image = self.resolve_image(vm, &cancel).await?;
        let flavor_id = self.resolve_flavor(vm).await?;
        let user_data = CloudInit::with_password(&vm.credentials.password)
            .render()
            .map_err(|e| ProviderError::Backend(format!("rendering cloud-init: {e}")))?;
        let floating_network = self.floating_network(vm).await?;

        let request = ServerRequest {
            name: vm.name.clone(),
            image_id: image.id,
            flavor_id,
            networks: vm.attached_networks(),
            floating_network,
            nat_destination: vm.management_network.clone(),
            user_data,
        };
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let server_id = self.backend.create_server(&request).await?;
        if let Err(e) = checkpoint.record_backend_id(&vm.id, &server_id).await {
            warn!(%server_id, error = %e, "Cannot record server, deleting it");
            if let Err(delete) = self.backend.delete_server(&server_id).await {
                warn!(%server_id, error = %delete, "Failed to delete unrecorded server");
            }
            return Err(e);
        }
        info!(%server_id, "Server submitted");

        let server = self
            .wait_backend(
                &format!("server {}", vm.name),
                &cancel,
                self.backend.wait_server_active(&server_id),
            )
            .await?;
        info!(%server_id, "Server active");

        self.fill_interfaces(vm, &server).await?;
        vm.access_ip = server
            .access_ipv4
            .clone()
            .filter(|ip| !ip.is_empty())
            .or_else(|| vm.resolve_access_ip());

        self.disable_port_security(vm, &server.id).await?;
        self.discover_interface_names(vm, checkpoint).await?;

        vm.created = true;
        Ok(())
    }

    #[instrument(skip_all, fields(area = %self.area.area, vm = %vm.name, configurator = %configurator.id))]
    async fn configure_vm(
        &self,
        configurator: &Configurator,
        vm: &VmResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<Value, ProviderError> {
        if !vm.created {
            return Err(ProviderError::NotCreated(vm.name.clone()));
        }
        match &configurator.kind {
            ConfiguratorKind::Ansible { playbook } => {
                let facts = self.run_playbook(vm, playbook, checkpoint).await?;
                Ok(Value::Object(facts))
            }
            ConfiguratorKind::Native { entry, args } => self.natives.run(entry, vm, args),
        }
    }

    #[instrument(skip_all, fields(area = %self.area.area, vm = %vm.name))]
    async fn destroy_vm(
        &self,
        vm: &VmResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError> {
        let Some(server_id) = checkpoint.backend_id(&vm.id) else {
            warn!(resource = %vm.id, "No backend object recorded for VM, nothing to destroy");
            return Ok(());
        };
        let cancel = checkpoint.cancel_signal().clone();
        self.wait_backend(
            &format!("deletion of server {server_id}"),
            &cancel,
            self.backend.delete_server(&server_id),
        )
        .await?;
        checkpoint.forget_backend_id(&vm.id).await?;
        info!(%server_id, "Server destroyed");
        Ok(())
    }

    #[instrument(skip_all, fields(area = %self.area.area, net = %net.name))]
    async fn create_net(
        &self,
        net: &NetResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError> {
        if let Some(network_id) = checkpoint.backend_id(&net.id) {
            debug!(%network_id, "Network already created");
            return Ok(());
        }
        let mut session = self.session.lock().await;

        if self.backend.network_exists(&net.name).await? {
            return Err(ProviderError::AlreadyExists {
                kind: "network",
                name: net.name.clone(),
            });
        }
        if self.backend.subnet_with_cidr_exists(&net.cidr).await? {
            return Err(ProviderError::AlreadyExists {
                kind: "subnet",
                name: net.cidr.clone(),
            });
        }

        let network_id = self.backend.create_network(&net.name).await?;
        if let Err(e) = checkpoint.record_backend_id(&net.id, &network_id).await {
            self.discard_network(&network_id).await;
            return Err(e);
        }

        let subnet_name = format!("{}_subnet", net.name);
        let subnet_id = match self
            .backend
            .create_subnet(&network_id, &subnet_name, &net.cidr)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(%network_id, error = %e, "Subnet creation failed, removing network");
                if self.discard_network(&network_id).await {
                    checkpoint.forget_backend_id(&net.id).await?;
                }
                return Err(e);
            }
        };
        session.networks.insert(
            net.name.clone(),
            NetRecord {
                network_id,
                subnet_id,
            },
        );
        info!(cidr = %net.cidr, "Network created");
        Ok(())
    }

    #[instrument(skip_all, fields(area = %self.area.area, net = %net.name))]
    async fn destroy_net(
        &self,
        net: &NetResource,
        checkpoint: &mut dyn ProvisionCheckpoint,
    ) -> Result<(), ProviderError> {
        let Some(network_id) = checkpoint.backend_id(&net.id) else {
            warn!(resource = %net.id, "No backend object recorded for network, nothing to destroy");
            return Ok(());
        };
        let mut session = self.session.lock().await;

        for subnet_id in self.backend.network_subnets(&network_id).await? {
            self.backend.delete_subnet(&subnet_id).await?;
        }
        self.backend.delete_network(&network_id).await?;
        checkpoint.forget_backend_id(&net.id).await?;
        session
            .networks
            .retain(|_, record| record.network_id != network_id);
        info!(%network_id, "Network destroyed");
        Ok(())
    }

    #[instrument(skip_all, fields(area = %self.area.area))]
    async fn final_cleanup(&self) -> Result<(), ProviderError> {
        let mut session = self.session.lock().await;
        let mut failures = Vec::new();

        for (name, id) in std::mem::take(&mut session.flavors) {
            if let Err(e) = self.backend.delete_flavor(&id).await {
                warn!(flavor = %name, error = %e, "Failed to delete flavor");
                failures.push(format!("flavor {name}: {e}"));
            }
        }

        let networks = std::mem::take(&mut session.networks);
        for (name, record) in &networks {
            if let Err(e) = self.backend.delete_subnet(&record.subnet_id).await {
                warn!(network = %name, error = %e, "Failed to delete subnet");
                failures.push(format!("subnet of {name}: {e}"));
            }
        }
        for (name, record) in &networks {
            if let Err(e) = self.backend.delete_network(&record.network_id).await {
                warn!(network = %name, error = %e, "Failed to delete network");
                failures.push(format!("network {name}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::Backend(failures.join("; ")))
        }
    }
}
