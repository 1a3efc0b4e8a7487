//! Ordered set of the resources a blueprint owns.

use lcm_id::ResourceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::{Configurator, NetResource, Resource, VmResource};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("resource {0} is already registered")]
    Duplicate(ResourceId),

    #[error("resource {0} is not registered")]
    NotFound(ResourceId),

    #[error("resource {id} is a {actual}, expected a {expected}")]
    WrongKind {
        id: ResourceId,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Resources in registration order.
///
/// Persisted as part of the blueprint document; a resource stays in the
/// registry until it has been successfully destroyed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRegistry {
    resources: Vec<Resource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: Resource) -> Result<ResourceId, RegistryError> {
        let id = *resource.id();
        if self.contains(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.resources.push(resource);
        Ok(id)
    }

    /// Remove a resource. Removing an absent id is a no-op.
    pub fn deregister(&mut self, id: &ResourceId) -> Option<Resource> {
        let index = self.resources.iter().position(|r| r.id() == id)?;
        Some(self.resources.remove(index))
    }

    /// Replace a registered resource with an updated copy.
    pub fn replace(&mut self, resource: Resource) -> Result<(), RegistryError> {
        let slot = self
            .resources
            .iter_mut()
            .find(|r| r.id() == resource.id())
            .ok_or(RegistryError::NotFound(*resource.id()))?;
        *slot = resource;
        Ok(())
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.iter().any(|r| r.id() == id)
    }

    pub fn get(&self, id: &ResourceId) -> Result<&Resource, RegistryError> {
        self.resources
            .iter()
            .find(|r| r.id() == id)
            .ok_or(RegistryError::NotFound(*id))
    }

    pub fn vm(&self, id: &ResourceId) -> Result<&VmResource, RegistryError> {
        match self.get(id)? {
            Resource::Vm(vm) => Ok(vm),
            other => Err(wrong_kind(id, "vm", other)),
        }
    }

    pub fn net(&self, id: &ResourceId) -> Result<&NetResource, RegistryError> {
        match self.get(id)? {
            Resource::Net(net) => Ok(net),
            other => Err(wrong_kind(id, "net", other)),
        }
    }

    pub fn configurator(&self, id: &ResourceId) -> Result<&Configurator, RegistryError> {
        match self.get(id)? {
            Resource::Configurator(cfg) => Ok(cfg),
            other => Err(wrong_kind(id, "configurator", other)),
        }
    }

    /// Ids of the configurators targeting `vm`.
    pub fn configurators_of(&self, vm: &ResourceId) -> Vec<ResourceId> {
        self.resources
            .iter()
            .filter_map(|r| match r {
                Resource::Configurator(cfg) if &cfg.target == vm => Some(cfg.id),
                _ => None,
            })
            .collect()
    }

    pub fn all(&self) -> &[Resource] {
        &self.resources
    }

    pub fn vms(&self) -> impl Iterator<Item = &VmResource> {
        self.resources.iter().filter_map(|r| match r {
            Resource::Vm(vm) => Some(vm),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

fn wrong_kind(id: &ResourceId, expected: &'static str, actual: &Resource) -> RegistryError {
    RegistryError::WrongKind {
        id: *id,
        expected,
        actual: actual.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{VmCredentials, VmImage};
    use lcm_id::AreaId;

    fn vm(name: &str) -> VmResource {
        VmResource::new(
            AreaId::new(0),
            name,
            VmImage::named("img"),
            VmCredentials {
                username: "u".into(),
                password: "p".into(),
            },
            "mgmt",
        )
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let mut registry = ResourceRegistry::new();
        let vm = vm("a");
        registry.register(vm.clone().into()).unwrap();
        let err = registry.register(vm.into()).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister_absent_is_noop() {
        let mut registry = ResourceRegistry::new();
        registry.register(vm("a").into()).unwrap();
        assert!(registry.deregister(&ResourceId::new()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_order_is_preserved() {
        let mut registry = ResourceRegistry::new();
        let a = registry.register(vm("a").into()).unwrap();
        let net = registry
            .register(NetResource::new(AreaId::new(0), "data", "10.1.0.0/24").into())
            .unwrap();
        let b = registry.register(vm("b").into()).unwrap();
        let ids: Vec<_> = registry.all().iter().map(|r| *r.id()).collect();
        assert_eq!(ids, vec![a, net, b]);
    }

    #[test]
    fn test_typed_lookup_checks_kind() {
        let mut registry = ResourceRegistry::new();
        let net = registry
            .register(NetResource::new(AreaId::new(0), "data", "10.1.0.0/24").into())
            .unwrap();
        assert!(registry.net(&net).is_ok());
        assert!(matches!(
            registry.vm(&net),
            Err(RegistryError::WrongKind { expected: "vm", actual: "net", .. })
        ));
    }

    #[test]
    fn test_replace_updates_in_place() {
        let mut registry = ResourceRegistry::new();
        let mut a = vm("a");
        let id = registry.register(a.clone().into()).unwrap();
        a.created = true;
        registry.replace(a.into()).unwrap();
        assert!(registry.vm(&id).unwrap().created);
    }

    #[test]
    fn test_configurators_of_filters_by_target() {
        let mut registry = ResourceRegistry::new();
        let a = registry.register(vm("a").into()).unwrap();
        let b = registry.register(vm("b").into()).unwrap();
        let cfg = registry
            .register(Configurator::native(a, "noop", serde_json::Value::Null).into())
            .unwrap();
        registry
            .register(Configurator::native(b, "noop", serde_json::Value::Null).into())
            .unwrap();
        assert_eq!(registry.configurators_of(&a), vec![cfg]);
    }
}
