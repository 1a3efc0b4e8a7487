//! Backend API surface consumed by [`super::BackendProvider`].
//!
//! One method per backend call the provider needs. Image import and server
//! deletion return once the backend reports the action finished. A server
//! boot is split in two: `create_server` returns the id as soon as the
//! backend accepted the request, `wait_server_active` waits for the boot.
//!
//! Deleting an object that no longer exists succeeds.

use async_trait::async_trait;

use super::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub name: String,
}

/// Machine-size template to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlavorSpec {
    pub name: String,
    pub memory_mb: u32,
    pub vcpu_count: u32,
    pub storage_gb: u32,
}

/// Parameters of a server boot.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    /// Networks to attach, management first.
    pub networks: Vec<String>,
    /// Pool to allocate a floating address from, if any.
    pub floating_network: Option<String>,
    /// Fixed network the floating address is bound to.
    pub nat_destination: String,
    pub user_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Fixed,
    Floating,
}

/// One address entry as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub network: String,
    pub addr: String,
    pub mac: String,
    pub kind: AddressKind,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: String,
    pub addresses: Vec<ServerAddress>,
    /// Address the backend itself designates for access, if any.
    pub access_ipv4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetInfo {
    pub id: String,
    pub cidr: String,
}

/// Per-cloud API used by the generic provider.
#[async_trait]
pub trait InfraBackend: Send + Sync + 'static {
    async fn find_image(&self, name: &str) -> Result<Option<ImageInfo>, ProviderError>;

    /// Register an image and import it from `url`.
    async fn import_image(&self, name: &str, url: &str) -> Result<ImageInfo, ProviderError>;

    async fn find_flavor(&self, name: &str) -> Result<Option<String>, ProviderError>;

    async fn create_flavor(&self, spec: &FlavorSpec) -> Result<String, ProviderError>;

    async fn delete_flavor(&self, id: &str) -> Result<(), ProviderError>;

    /// Names of external networks a floating address can come from.
    async fn floating_networks(&self) -> Result<Vec<String>, ProviderError>;

    /// Submit a server boot. Returns the server id without waiting.
    async fn create_server(&self, request: &ServerRequest) -> Result<String, ProviderError>;

    /// Wait until a submitted server is active.
    async fn wait_server_active(&self, id: &str) -> Result<ServerInfo, ProviderError>;

    /// Delete a server and wait until it is gone.
    async fn delete_server(&self, id: &str) -> Result<(), ProviderError>;

    /// First subnet of a network.
    async fn first_subnet(&self, network: &str) -> Result<SubnetInfo, ProviderError>;

    /// Port ids of a server, one per attached network.
    async fn server_ports(&self, server_id: &str) -> Result<Vec<String>, ProviderError>;

    async fn disable_port_security(&self, port_id: &str) -> Result<(), ProviderError>;

    async fn network_exists(&self, name: &str) -> Result<bool, ProviderError>;

    async fn subnet_with_cidr_exists(&self, cidr: &str) -> Result<bool, ProviderError>;

    async fn create_network(&self, name: &str) -> Result<String, ProviderError>;

    /// Create a subnet with DHCP enabled and no gateway.
    async fn create_subnet(
        &self,
        network_id: &str,
        name: &str,
        cidr: &str,
    ) -> Result<String, ProviderError>;

    /// Subnet ids of a network.
    async fn network_subnets(&self, network_id: &str) -> Result<Vec<String>, ProviderError>;

    async fn delete_subnet(&self, id: &str) -> Result<(), ProviderError>;

    async fn delete_network(&self, id: &str) -> Result<(), ProviderError>;
}
