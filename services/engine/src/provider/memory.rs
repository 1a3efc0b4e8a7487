//! In-memory backend for development mode and tests.
//!
//! [`InMemoryBackend`] simulates the cloud API, the guests' management port
//! and the playbook runner at once, and records every call it receives.
//! Addresses are allocated deterministically from the subnet CIDR.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lcm_id::AreaId;
use serde_json::{Map, Value};
use tracing::debug;

use super::backend::{
    AddressKind, FlavorSpec, ImageInfo, InfraBackend, ServerAddress, ServerInfo, ServerRequest,
    SubnetInfo,
};
use super::generic::{BackendProvider, ProviderSettings};
use super::native::NativeConfigurators;
use super::playbook::{PlaybookReport, PlaybookRun, PlaybookRunner, INTERFACES_MAC_FACT};
use super::probe::{ManagementProbe, ManagementTarget};
use super::registry::{AreaConfig, ProviderFactory};
use super::{ProviderError, VirtualizationProvider};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub op: &'static str,
    pub target: String,
}

#[derive(Debug, Clone)]
struct SubnetRow {
    network_id: String,
    cidr: String,
}

#[derive(Debug, Clone)]
struct ServerRow {
    name: String,
    ports: Vec<String>,
    addresses: Vec<ServerAddress>,
    access_ipv4: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    images: BTreeMap<String, String>,
    flavors: BTreeMap<String, FlavorSpec>,
    floating_networks: Vec<String>,
    /// Network id to name.
    networks: BTreeMap<String, String>,
    subnets: BTreeMap<String, SubnetRow>,
    servers: BTreeMap<String, ServerRow>,
    insecure_ports: BTreeSet<String>,
    calls: Vec<BackendCall>,
    fail_ops: HashMap<&'static str, String>,
    failing_playbooks: BTreeSet<String>,
    playbook_runs: Vec<PlaybookRun>,
    unreachable: bool,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn record(&mut self, op: &'static str, target: &str) -> Result<(), ProviderError> {
        self.calls.push(BackendCall {
            op,
            target: target.to_string(),
        });
        match self.fail_ops.remove(op) {
            Some(message) => Err(ProviderError::Backend(message)),
            None => Ok(()),
        }
    }

    fn network_id(&self, name: &str) -> Option<String> {
        self.networks
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| id.clone())
    }

    fn subnet_of(&self, network_id: &str) -> Option<(String, SubnetRow)> {
        self.subnets
            .iter()
            .find(|(_, row)| row.network_id == network_id)
            .map(|(id, row)| (id.clone(), row.clone()))
    }
}

/// Host address number `host` inside an IPv4 `/24`-style CIDR.
fn host_address(cidr: &str, host: u64) -> String {
    let last = (host % 250 + 4).to_string();
    let base = cidr.split('/').next().unwrap_or(cidr);
    let mut octets: Vec<&str> = base.split('.').collect();
    if let Some(slot) = octets.last_mut() {
        *slot = &last;
    }
    octets.join(".")
}

/// Simulated cloud.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    boot_delay: Mutex<Option<Duration>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with one image, a management network and one public
    /// network, enough to run the built-in blueprints.
    pub fn dev() -> Self {
        Self::new()
            .with_image("ubuntu2204")
            .with_network("mgmt", "10.0.0.0/24")
            .with_floating_network("public")
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_image(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            let id = state.next("img");
            state.images.insert(name.to_string(), id);
        }
        self
    }

    pub fn with_network(self, name: &str, cidr: &str) -> Self {
        {
            let mut state = self.lock();
            let network_id = state.next("net");
            let subnet_id = state.next("subnet");
            state.networks.insert(network_id.clone(), name.to_string());
            state.subnets.insert(
                subnet_id,
                SubnetRow {
                    network_id,
                    cidr: cidr.to_string(),
                },
            );
        }
        self
    }

    pub fn with_floating_network(self, name: &str) -> Self {
        self.lock().floating_networks.push(name.to_string());
        self
    }

    /// Make the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: &'static str, message: &str) {
        self.lock().fail_ops.insert(op, message.to_string());
    }

    /// Make every playbook run named `play` report failure.
    pub fn fail_playbook(&self, play: &str) {
        self.lock().failing_playbooks.insert(play.to_string());
    }

    /// Make submitted servers take `delay` to become active.
    pub fn set_boot_delay(&self, delay: Option<Duration>) {
        *self.boot_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Refuse management-port connections.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn server_count(&self) -> usize {
        self.lock().servers.len()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.lock().servers.values().map(|s| s.name.clone()).collect()
    }

    pub fn flavor_names(&self) -> Vec<String> {
        self.lock().flavors.values().map(|f| f.name.clone()).collect()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.lock().networks.values().cloned().collect()
    }

    pub fn insecure_port_count(&self) -> usize {
        self.lock().insecure_ports.len()
    }

    pub fn playbook_runs(&self) -> Vec<PlaybookRun> {
        self.lock().playbook_runs.clone()
    }

    /// `<iface>: <mac>` listing as the guest owning `host` would print it.
    fn guest_interfaces(&self, host: &str) -> Option<String> {
        let state = self.lock();
        let server = state
            .servers
            .values()
            .find(|s| s.addresses.iter().any(|a| a.addr == host))?;
        let lines: Vec<String> = server
            .addresses
            .iter()
            .filter(|a| a.kind == AddressKind::Fixed)
            .enumerate()
            .map(|(i, a)| format!("ens{}: {}", i + 3, a.mac))
            .collect();
        Some(lines.join("\n"))
    }
}

#[async_trait]
impl InfraBackend for InMemoryBackend {
    async fn find_image(&self, name: &str) -> Result<Option<ImageInfo>, ProviderError> {
        let mut state = self.lock();
        state.record("find_image", name)?;
        Ok(state.images.get(name).map(|id| ImageInfo {
            id: id.clone(),
            name: name.to_string(),
        }))
    }

    async fn import_image(&self, name: &str, url: &str) -> Result<ImageInfo, ProviderError> {
        let mut state = self.lock();
        state.record("import_image", url)?;
        let id = state.next("img");
        state.images.insert(name.to_string(), id.clone());
        Ok(ImageInfo {
            id,
            name: name.to_string(),
        })
    }

    async fn find_flavor(&self, name: &str) -> Result<Option<String>, ProviderError> {
        let mut state = self.lock();
        state.record("find_flavor", name)?;
        Ok(state
            .flavors
            .iter()
            .find(|(_, spec)| spec.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_flavor(&self, spec: &FlavorSpec) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.record("create_flavor", &spec.name)?;
        let id = state.next("flavor");
        state.flavors.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn delete_flavor(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.record("delete_flavor", id)?;
        state.flavors.remove(id);
        Ok(())
    }

    async fn floating_networks(&self) -> Result<Vec<String>, ProviderError> {
        let mut state = self.lock();
        state.record("floating_networks", "")?;
        Ok(state.floating_networks.clone())
    }

    async fn create_server(&self, request: &ServerRequest) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.record("create_server", &request.name)?;

        let id = state.next("server");
        let mut ports = Vec::new();
        let mut addresses = Vec::new();
        for network in &request.networks {
            let network_id = state
                .network_id(network)
                .ok_or_else(|| ProviderError::Backend(format!("network {network} not found")))?;
            let (_, subnet) = state
                .subnet_of(&network_id)
                .ok_or_else(|| ProviderError::Backend(format!("network {network} has no subnet")))?;
            state.next_id += 1;
            let n = state.next_id;
            let mac = format!("fa:16:3e:{:02x}:{:02x}:{:02x}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff);
            ports.push(format!("port-{n:04}"));
            addresses.push(ServerAddress {
                network: network.clone(),
                addr: host_address(&subnet.cidr, n),
                mac,
                kind: AddressKind::Fixed,
            });
        }

        let mut access_ipv4 = None;
        if request.floating_network.is_some() {
            let mac = addresses
                .iter()
                .find(|a| a.network == request.nat_destination)
                .map(|a| a.mac.clone())
                .unwrap_or_default();
            state.next_id += 1;
            let floating = host_address("203.0.113.0/24", state.next_id);
            addresses.push(ServerAddress {
                network: request.nat_destination.clone(),
                addr: floating.clone(),
                mac,
                kind: AddressKind::Floating,
            });
            access_ipv4 = Some(floating);
        }

        let row = ServerRow {
            name: request.name.clone(),
            ports,
            addresses,
            access_ipv4,
        };
        state.servers.insert(id.clone(), row);
        debug!(server_id = %id, name = %request.name, "Simulated server submitted");
        Ok(id)
    }

    async fn wait_server_active(&self, id: &str) -> Result<ServerInfo, ProviderError> {
        let delay = *self.boot_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.record("wait_server_active", id)?;
        let server = state
            .servers
            .get(id)
            .ok_or_else(|| ProviderError::Backend(format!("server {id} not found")))?;
        Ok(ServerInfo {
            id: id.to_string(),
            addresses: server.addresses.clone(),
            access_ipv4: server.access_ipv4.clone(),
        })
    }

    async fn delete_server(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.record("delete_server", id)?;
        if let Some(server) = state.servers.remove(id) {
            for port in server.ports {
                state.insecure_ports.remove(&port);
            }
        }
        Ok(())
    }

    async fn first_subnet(&self, network: &str) -> Result<SubnetInfo, ProviderError> {
        let mut state = self.lock();
        state.record("first_subnet", network)?;
        let network_id = state
            .network_id(network)
            .ok_or_else(|| ProviderError::Backend(format!("network {network} not found")))?;
        let (id, row) = state
            .subnet_of(&network_id)
            .ok_or_else(|| ProviderError::Backend(format!("network {network} has no subnet")))?;
        Ok(SubnetInfo { id, cidr: row.cidr })
    }

    async fn server_ports(&self, server_id: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.lock();
        state.record("server_ports", server_id)?;
        state
            .servers
            .get(server_id)
            .map(|s| s.ports.clone())
            .ok_or_else(|| ProviderError::Backend(format!("server {server_id} not found")))
    }

    async fn disable_port_security(&self, port_id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.record("disable_port_security", port_id)?;
        state.insecure_ports.insert(port_id.to_string());
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, ProviderError> {
        let mut state = self.lock();
        state.record("network_exists", name)?;
        Ok(state.network_id(name).is_some())
    }

    async fn subnet_with_cidr_exists(&self, cidr: &str) -> Result<bool, ProviderError> {
        let mut state = self.lock();
        state.record("subnet_with_cidr_exists", cidr)?;
        Ok(state.subnets.values().any(|s| s.cidr == cidr))
    }

    async fn create_network(&self, name: &str) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.record("create_network", name)?;
        let id = state.next("net");
        state.networks.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn create_subnet(
        &self,
        network_id: &str,
        name: &str,
        cidr: &str,
    ) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.record("create_subnet", name)?;
        let id = state.next("subnet");
        state.subnets.insert(
            id.clone(),
            SubnetRow {
                network_id: network_id.to_string(),
                cidr: cidr.to_string(),
            },
        );
        Ok(id)
    }

    async fn network_subnets(&self, network_id: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.lock();
        state.record("network_subnets", network_id)?;
        Ok(state
            .subnets
            .iter()
            .filter(|(_, row)| row.network_id == network_id)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn delete_subnet(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.record("delete_subnet", id)?;
        state.subnets.remove(id);
        Ok(())
    }

    async fn delete_network(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.record("delete_network", id)?;
        state.networks.remove(id);
        Ok(())
    }
}

#[async_trait]
impl ManagementProbe for InMemoryBackend {
    async fn try_connect(&self, target: &ManagementTarget) -> Result<(), String> {
        if self.lock().unreachable {
            return Err(format!("{}:{} refused connection", target.host, target.port));
        }
        Ok(())
    }
}

#[async_trait]
impl PlaybookRunner for InMemoryBackend {
    async fn run(&self, run: &PlaybookRun) -> Result<PlaybookReport, ProviderError> {
        let doc: Value = serde_json::from_str(&run.playbook)
            .map_err(|e| ProviderError::ConfigurationFailed(format!("bad playbook: {e}")))?;
        let play_name = doc[0]["name"].as_str().unwrap_or_default().to_string();

        let fact_names: Vec<String> = doc[0]["tasks"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|task| task.get("ansible.builtin.set_fact")?.as_object())
            .flat_map(|facts| facts.keys().filter(|k| *k != "cacheable").cloned())
            .collect();

        let mut facts = Map::new();
        for fact in fact_names {
            let value = if fact == INTERFACES_MAC_FACT {
                self.guest_interfaces(&run.host).unwrap_or_default()
            } else {
                String::new()
            };
            facts.insert(fact, Value::String(value));
        }

        let mut state = self.lock();
        state.playbook_runs.push(run.clone());
        Ok(PlaybookReport {
            failed: state.failing_playbooks.contains(&play_name),
            facts,
        })
    }
}

/// Builds [`BackendProvider`]s over one [`InMemoryBackend`] per area.
pub struct InMemoryProviderFactory {
    settings: ProviderSettings,
    natives: Arc<NativeConfigurators>,
    backends: Mutex<BTreeMap<AreaId, Arc<InMemoryBackend>>>,
}

impl InMemoryProviderFactory {
    pub fn new(settings: ProviderSettings, natives: Arc<NativeConfigurators>) -> Self {
        Self {
            settings,
            natives,
            backends: Mutex::new(BTreeMap::new()),
        }
    }

    /// Use `backend` for `area` instead of a fresh [`InMemoryBackend::dev`].
    pub fn with_backend(self, area: AreaId, backend: Arc<InMemoryBackend>) -> Self {
        self.backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(area, backend);
        self
    }

    pub fn backend(&self, area: AreaId) -> Arc<InMemoryBackend> {
        self.backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(area)
            .or_insert_with(|| Arc::new(InMemoryBackend::dev()))
            .clone()
    }
}

#[async_trait]
impl ProviderFactory for InMemoryProviderFactory {
    async fn build(
        &self,
        area: &AreaConfig,
    ) -> Result<Arc<dyn VirtualizationProvider>, ProviderError> {
        let backend = self.backend(area.area);
        Ok(Arc::new(BackendProvider::new(
            area.clone(),
            backend.clone(),
            backend.clone(),
            backend,
            self.natives.clone(),
            self.settings.clone(),
        )))
    }
}
