//! Built-in blueprint types.
//!
//! - `vm_topology`: networks and VMs in one area
//! - `router`: one routing VM
//! - `dataplane`: one data-plane VM driven by a config document
//! - `edge_core`: a router and a data plane per area, reconciled

use serde_json::json;

use crate::blueprint::BlueprintTypeRegistry;
use crate::provider::NativeConfigurators;

pub mod dataplane;
pub mod edge_core;
pub mod router;
pub mod vm_topology;

/// Register every built-in type.
pub fn register_builtin(registry: &mut BlueprintTypeRegistry) {
    registry
        .register(vm_topology::blueprint_type())
        .register(router::blueprint_type())
        .register(dataplane::blueprint_type())
        .register(edge_core::blueprint_type());
}

/// Native configurators shipped with the engine.
///
/// `inventory` reports what the provider learned about a VM, merged with
/// the configurator arguments.
pub fn builtin_natives() -> NativeConfigurators {
    let mut natives = NativeConfigurators::new();
    natives.register("inventory", |vm, args| {
        let interfaces: serde_json::Map<_, _> = vm
            .network_interfaces
            .iter()
            .map(|(net, iface)| {
                (
                    net.clone(),
                    json!({
                        "ip": iface.fixed.ip,
                        "mac": iface.fixed.mac,
                        "name": iface.interface_name,
                    }),
                )
            })
            .collect();
        Ok(json!({
            "name": vm.name,
            "access_ip": vm.access_ip,
            "interfaces": interfaces,
            "args": args,
        }))
    });
    natives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types_registered() {
        let mut registry = BlueprintTypeRegistry::new();
        register_builtin(&mut registry);
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["dataplane", "edge_core", "router", "vm_topology"]
        );

        let edge = registry.get("edge_core").unwrap();
        assert_eq!(
            edge.routes().collect::<Vec<_>>(),
            vec!["/areas/add", "/areas/del", "/areas/set", "/areas/update"]
        );
        assert!(registry.get("router").unwrap().operation("add_route").is_some());
        assert!(registry.get("vm_topology").unwrap().route("/add_vm").is_some());
    }

    #[test]
    fn test_inventory_native_is_registered() {
        assert!(builtin_natives().contains("inventory"));
    }
}
