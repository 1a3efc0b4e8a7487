//! Resource model.
//!
//! A blueprint owns a set of resources: virtual machines, networks and
//! configurators. Every resource is tagged with the area it lives in and a
//! globally unique [`ResourceId`]. Resources are plain data; providers mutate
//! a VM only to fill in what the backend reports after creation.

use std::collections::BTreeMap;

use lcm_id::{AreaId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::provider::playbook::PlaybookSpec;

/// Image a VM boots from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmImage {
    /// Image name as registered in the backend catalogue.
    pub name: String,

    /// Download URL used to import the image when the backend lacks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl VmImage {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
        }
    }
}

/// Machine size of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFlavor {
    pub memory_mb: u32,
    pub vcpu_count: u32,
    pub storage_gb: u32,
}

impl Default for VmFlavor {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            vcpu_count: 2,
            storage_gb: 16,
        }
    }
}

/// Login credentials injected into the guest at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCredentials {
    pub username: String,
    pub password: String,
}

/// One address on a VM interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub ip: String,
    pub mac: String,
    /// CIDR of the subnet the address belongs to.
    pub cidr: String,
}

/// Addresses the backend reported for one attached network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub fixed: InterfaceAddress,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating: Option<InterfaceAddress>,

    /// Interface name inside the guest (e.g. `ens3`), discovered after boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
}

/// A virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmResource {
    pub id: ResourceId,
    pub area: AreaId,
    pub name: String,
    pub image: VmImage,
    #[serde(default)]
    pub flavor: VmFlavor,
    pub credentials: VmCredentials,

    /// Network used to reach the VM for configuration.
    pub management_network: String,

    #[serde(default)]
    pub additional_networks: Vec<String>,

    #[serde(default)]
    pub require_floating_ip: bool,

    /// Filled by the provider, keyed by network name.
    #[serde(default)]
    pub network_interfaces: BTreeMap<String, NetworkInterface>,

    /// Address used to reach the VM for configuration.
    #[serde(default)]
    pub access_ip: Option<String>,

    /// True only after the provider reported successful creation.
    #[serde(default)]
    pub created: bool,
}

impl VmResource {
    /// Describe a VM that has not been created yet.
    pub fn new(
        area: AreaId,
        name: impl Into<String>,
        image: VmImage,
        credentials: VmCredentials,
        management_network: impl Into<String>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            area,
            name: name.into(),
            image,
            flavor: VmFlavor::default(),
            credentials,
            management_network: management_network.into(),
            additional_networks: Vec::new(),
            require_floating_ip: false,
            network_interfaces: BTreeMap::new(),
            access_ip: None,
            created: false,
        }
    }

    pub fn with_flavor(mut self, flavor: VmFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_networks(mut self, networks: impl IntoIterator<Item = String>) -> Self {
        self.additional_networks.extend(networks);
        self
    }

    pub fn with_floating_ip(mut self, required: bool) -> Self {
        self.require_floating_ip = required;
        self
    }

    /// Management network first, then additional networks in order.
    pub fn attached_networks(&self) -> Vec<String> {
        std::iter::once(self.management_network.clone())
            .chain(self.additional_networks.iter().cloned())
            .collect()
    }

    /// Floating address of the management interface if present, else its
    /// fixed address.
    pub fn resolve_access_ip(&self) -> Option<String> {
        let mgmt = self.network_interfaces.get(&self.management_network)?;
        Some(
            mgmt.floating
                .as_ref()
                .map(|addr| addr.ip.clone())
                .unwrap_or_else(|| mgmt.fixed.ip.clone()),
        )
    }
}

/// A virtual network with a single subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetResource {
    pub id: ResourceId,
    pub area: AreaId,
    pub name: String,
    pub cidr: String,
}

impl NetResource {
    pub fn new(area: AreaId, name: impl Into<String>, cidr: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            area,
            name: name.into(),
            cidr: cidr.into(),
        }
    }
}

/// How a configurator applies its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfiguratorKind {
    /// Rendered to a playbook and run against the VM's access IP.
    Ansible { playbook: PlaybookSpec },

    /// Handled in-process by a registered entry point.
    Native {
        entry: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

/// A unit of configuration applied to one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configurator {
    pub id: ResourceId,
    pub target: ResourceId,
    #[serde(flatten)]
    pub kind: ConfiguratorKind,
}

impl Configurator {
    pub fn ansible(target: ResourceId, playbook: PlaybookSpec) -> Self {
        Self {
            id: ResourceId::new(),
            target,
            kind: ConfiguratorKind::Ansible { playbook },
        }
    }

    pub fn native(target: ResourceId, entry: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: ResourceId::new(),
            target,
            kind: ConfiguratorKind::Native {
                entry: entry.into(),
                args,
            },
        }
    }
}

/// Any resource a blueprint can own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    Vm(VmResource),
    Net(NetResource),
    Configurator(Configurator),
}

impl Resource {
    pub fn id(&self) -> &ResourceId {
        match self {
            Self::Vm(vm) => &vm.id,
            Self::Net(net) => &net.id,
            Self::Configurator(cfg) => &cfg.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vm(_) => "vm",
            Self::Net(_) => "net",
            Self::Configurator(_) => "configurator",
        }
    }
}

impl From<VmResource> for Resource {
    fn from(vm: VmResource) -> Self {
        Self::Vm(vm)
    }
}

impl From<NetResource> for Resource {
    fn from(net: NetResource) -> Self {
        Self::Net(net)
    }
}

impl From<Configurator> for Resource {
    fn from(cfg: Configurator) -> Self {
        Self::Configurator(cfg)
    }
}
