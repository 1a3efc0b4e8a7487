//! Integration tests for the backend provider.
//!
//! Drives `BackendProvider` over the in-memory backend and checks the
//! idempotency and readiness contracts:
//! 1. Images, flavors and floating networks are resolved before a boot
//! 2. Backend ids are checkpointed; destroying an unknown VM is a no-op
//! 3. Configuration requires a created VM
//! 4. Waits observe the cancellation signal

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lcm_engine::blueprints::builtin_natives;
use lcm_engine::cancel::{CancelSignal, CancelTrigger};
use lcm_engine::provider::playbook::PlaybookSpec;
use lcm_engine::provider::{
    AreaConfig, BackendProvider, InMemoryBackend, ProviderError, ProviderSettings,
    ProvisionCheckpoint, VirtualizationProvider,
};
use lcm_engine::resources::{Configurator, NetResource, VmCredentials, VmImage, VmResource};
use lcm_id::{AreaId, BlueprintId, ResourceId};
use serde_json::json;

struct MapCheckpoint {
    id: BlueprintId,
    ids: BTreeMap<ResourceId, String>,
    cancel: CancelSignal,
}

impl MapCheckpoint {
    fn new() -> Self {
        Self::with_signal(CancelSignal::never())
    }

    fn with_signal(cancel: CancelSignal) -> Self {
        Self {
            id: BlueprintId::new(),
            ids: BTreeMap::new(),
            cancel,
        }
    }
}

#[async_trait]
impl ProvisionCheckpoint for MapCheckpoint {
    fn blueprint_id(&self) -> BlueprintId {
        self.id
    }

    fn backend_id(&self, resource: &ResourceId) -> Option<String> {
        self.ids.get(resource).cloned()
    }

    async fn record_backend_id(
        &mut self,
        resource: &ResourceId,
        backend_id: &str,
    ) -> Result<(), ProviderError> {
        self.ids.insert(*resource, backend_id.to_string());
        Ok(())
    }

    async fn forget_backend_id(&mut self, resource: &ResourceId) -> Result<(), ProviderError> {
        self.ids.remove(resource);
        Ok(())
    }

    fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }
}

fn test_settings() -> ProviderSettings {
    ProviderSettings {
        ssh_timeout: Duration::from_millis(200),
        ssh_retry_interval: Duration::from_millis(20),
        ..ProviderSettings::default()
    }
}

fn test_provider(
    backend: &Arc<InMemoryBackend>,
    floating: bool,
) -> BackendProvider<InMemoryBackend> {
    BackendProvider::new(
        AreaConfig::new(AreaId::new(0), "memory://0").with_floating_ip(floating),
        backend.clone(),
        backend.clone(),
        backend.clone(),
        Arc::new(builtin_natives()),
        test_settings(),
    )
}

fn test_vm(name: &str) -> VmResource {
    VmResource::new(
        AreaId::new(0),
        name,
        VmImage::named("ubuntu2204"),
        VmCredentials {
            username: "ubuntu".to_string(),
            password: "secret".to_string(),
        },
        "mgmt",
    )
}

#[tokio::test]
async fn test_create_vm_fills_addresses_and_interface_names() {
    let backend = Arc::new(InMemoryBackend::dev().with_network("data", "10.1.0.0/24"));
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let mut vm = test_vm("vm-a").with_networks(["data".to_string()]);
    provider.create_vm(&mut vm, &mut checkpoint).await.unwrap();

    assert!(vm.created);
    assert!(checkpoint.backend_id(&vm.id).is_some());

    let mgmt = &vm.network_interfaces["mgmt"];
    assert_eq!(vm.access_ip.as_deref(), Some(mgmt.fixed.ip.as_str()));
    assert_eq!(mgmt.fixed.cidr, "10.0.0.0/24");
    assert!(mgmt.floating.is_none());
    assert_eq!(mgmt.interface_name.as_deref(), Some("ens3"));
    assert_eq!(
        vm.network_interfaces["data"].interface_name.as_deref(),
        Some("ens4")
    );

    // Port security is off on every attached port
    assert_eq!(backend.insecure_port_count(), 2);
}

#[tokio::test]
async fn test_floating_address_becomes_access_ip() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, true);
    let mut checkpoint = MapCheckpoint::new();

    let mut vm = test_vm("vm-a");
    provider.create_vm(&mut vm, &mut checkpoint).await.unwrap();

    let floating = vm.network_interfaces["mgmt"].floating.clone().unwrap();
    assert!(floating.ip.starts_with("203.0.113."));
    assert_eq!(vm.access_ip, Some(floating.ip));
}

#[tokio::test]
async fn test_ambiguous_public_network_is_rejected_before_boot() {
    let backend = Arc::new(InMemoryBackend::dev().with_floating_network("public-2"));
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let mut vm = test_vm("vm-a").with_floating_ip(true);
    let result = provider.create_vm(&mut vm, &mut checkpoint).await;

    assert!(matches!(result, Err(ProviderError::AmbiguousPublicNetwork(2))));
    assert_eq!(backend.count("create_server"), 0);
    assert!(!vm.created);
}

#[tokio::test]
async fn test_missing_image_is_imported_once() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let image = VmImage {
        name: "debian12".to_string(),
        url: Some("https://images.example.org/debian12.qcow2".to_string()),
    };
    let mut first = test_vm("vm-a");
    first.image = image.clone();
    let mut second = test_vm("vm-b");
    second.image = image;

    provider.create_vm(&mut first, &mut checkpoint).await.unwrap();
    provider.create_vm(&mut second, &mut checkpoint).await.unwrap();

    assert_eq!(backend.count("import_image"), 1);
    assert_eq!(backend.count("create_server"), 2);
}

#[tokio::test]
async fn test_missing_image_without_url_fails() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let mut vm = test_vm("vm-a");
    vm.image = VmImage::named("plan9");
    let err = provider.create_vm(&mut vm, &mut checkpoint).await.unwrap_err();

    assert!(matches!(err, ProviderError::ImageNotFound(ref name) if name == "plan9"));
    assert_eq!(backend.count("import_image"), 0);
    assert_eq!(backend.count("create_server"), 0);
}

#[tokio::test]
async fn test_flavor_is_reused_within_session() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let mut first = test_vm("A");
    let mut second = test_vm("A");
    provider.create_vm(&mut first, &mut checkpoint).await.unwrap();
    provider.create_vm(&mut second, &mut checkpoint).await.unwrap();

    assert_eq!(backend.count("create_flavor"), 1);
    assert_eq!(backend.flavor_names(), vec!["Flavor_A"]);
    assert_eq!(backend.server_count(), 2);
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    // Never created: nothing to do
    let ghost = test_vm("ghost");
    provider.destroy_vm(&ghost, &mut checkpoint).await.unwrap();
    assert_eq!(backend.count("delete_server"), 0);

    let mut vm = test_vm("vm-a");
    provider.create_vm(&mut vm, &mut checkpoint).await.unwrap();
    provider.destroy_vm(&vm, &mut checkpoint).await.unwrap();
    provider.destroy_vm(&vm, &mut checkpoint).await.unwrap();

    assert_eq!(backend.count("delete_server"), 1);
    assert_eq!(backend.server_count(), 0);
    assert!(checkpoint.backend_id(&vm.id).is_none());
}

#[tokio::test]
async fn test_configure_requires_created_vm() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let vm = test_vm("vm-a");
    let cfg = Configurator::ansible(vm.id, PlaybookSpec::new("Install packages"));
    let err = provider
        .configure_vm(&cfg, &vm, &mut checkpoint)
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::NotCreated(ref name) if name == "vm-a"));
    assert!(backend.calls().is_empty());
    assert!(backend.playbook_runs().is_empty());
}

#[tokio::test]
async fn test_configure_runs_playbook_and_native_entries() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let mut vm = test_vm("vm-a");
    provider.create_vm(&mut vm, &mut checkpoint).await.unwrap();
    let runs_after_boot = backend.playbook_runs().len();

    let play = PlaybookSpec::new("Report hostname").gather_output("hostname", "hostname");
    let facts = provider
        .configure_vm(&Configurator::ansible(vm.id, play), &vm, &mut checkpoint)
        .await
        .unwrap();
    assert!(facts.get("hostname").is_some());

    let run = backend.playbook_runs().pop().unwrap();
    assert_eq!(backend.playbook_runs().len(), runs_after_boot + 1);
    assert_eq!(Some(run.host), vm.access_ip);
    assert_eq!(run.name, format!("{}_vm-a", checkpoint.blueprint_id()));

    let inventory = provider
        .configure_vm(
            &Configurator::native(vm.id, "inventory", json!({"role": "edge"})),
            &vm,
            &mut checkpoint,
        )
        .await
        .unwrap();
    assert_eq!(inventory["name"], "vm-a");
    assert_eq!(inventory["args"]["role"], "edge");
}

#[tokio::test]
async fn test_failed_playbook_is_configuration_error() {
    let backend = Arc::new(InMemoryBackend::dev());
    backend.fail_playbook("Break things");
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let mut vm = test_vm("vm-a");
    provider.create_vm(&mut vm, &mut checkpoint).await.unwrap();

    let cfg = Configurator::ansible(vm.id, PlaybookSpec::new("Break things"));
    let err = provider
        .configure_vm(&cfg, &vm, &mut checkpoint)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::ConfigurationFailed(_)));
}

#[tokio::test]
async fn test_unreachable_guest_times_out() {
    let backend = Arc::new(InMemoryBackend::dev());
    backend.set_unreachable(true);
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let mut vm = test_vm("vm-a");
    let err = provider.create_vm(&mut vm, &mut checkpoint).await.unwrap_err();

    assert!(matches!(err, ProviderError::ReadinessTimeout { .. }));
    assert!(!vm.created);
    // The server exists and stays reachable for a later destroy
    assert!(checkpoint.backend_id(&vm.id).is_some());
}

#[tokio::test]
async fn test_cancel_interrupts_boot() {
    let backend = Arc::new(InMemoryBackend::dev());
    backend.set_boot_delay(Some(Duration::from_secs(30)));
    let provider = test_provider(&backend, false);

    let trigger = CancelTrigger::new();
    let mut checkpoint = MapCheckpoint::with_signal(trigger.signal());

    let mut vm = test_vm("vm-a");
    let (result, ()) = tokio::join!(provider.create_vm(&mut vm, &mut checkpoint), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    assert!(matches!(result, Err(ProviderError::Cancelled)));
    assert!(!vm.created);

    // The server was submitted before the wait was cut short
    assert_eq!(backend.server_count(), 1);
    trigger.reset();
    provider.destroy_vm(&vm, &mut checkpoint).await.unwrap();
    assert_eq!(backend.server_count(), 0);
    assert!(checkpoint.backend_id(&vm.id).is_none());
}

#[tokio::test]
async fn test_networks_and_final_cleanup() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let data = NetResource::new(AreaId::new(0), "data", "10.1.0.0/24");
    provider.create_net(&data, &mut checkpoint).await.unwrap();
    assert!(checkpoint.backend_id(&data.id).is_some());
    // Recorded networks are not created twice
    provider.create_net(&data, &mut checkpoint).await.unwrap();
    assert_eq!(backend.count("create_network"), 1);

    let twin = NetResource::new(AreaId::new(0), "data", "10.2.0.0/24");
    assert!(matches!(
        provider.create_net(&twin, &mut checkpoint).await,
        Err(ProviderError::AlreadyExists { kind: "network", .. })
    ));

    let clash = NetResource::new(AreaId::new(0), "other", "10.1.0.0/24");
    assert!(matches!(
        provider.create_net(&clash, &mut checkpoint).await,
        Err(ProviderError::AlreadyExists { kind: "subnet", .. })
    ));
    assert!(checkpoint.backend_id(&clash.id).is_none());

    let mut vm = test_vm("vm-a");
    provider.create_vm(&mut vm, &mut checkpoint).await.unwrap();

    provider.final_cleanup().await.unwrap();
    assert!(backend.flavor_names().is_empty());
    assert!(!backend.network_names().contains(&"data".to_string()));
    // Networks the provider did not create are left alone
    assert!(backend.network_names().contains(&"mgmt".to_string()));
}

#[tokio::test]
async fn test_destroy_net_only_touches_own_networks() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);

    let mut checkpoint = MapCheckpoint::new();

    let mgmt = NetResource::new(AreaId::new(0), "mgmt", "10.0.0.0/24");
    provider.destroy_net(&mgmt, &mut checkpoint).await.unwrap();
    assert_eq!(backend.count("delete_network"), 0);

    let data = NetResource::new(AreaId::new(0), "data", "10.1.0.0/24");
    provider.create_net(&data, &mut checkpoint).await.unwrap();
    provider.destroy_net(&data, &mut checkpoint).await.unwrap();
    provider.destroy_net(&data, &mut checkpoint).await.unwrap();
    assert_eq!(backend.count("delete_subnet"), 1);
    assert_eq!(backend.count("delete_network"), 1);
    assert_eq!(backend.network_names(), vec!["mgmt"]);
}

#[tokio::test]
async fn test_recorded_network_is_destroyed_by_a_new_provider() {
    let backend = Arc::new(InMemoryBackend::dev());
    let mut checkpoint = MapCheckpoint::new();

    let data = NetResource::new(AreaId::new(0), "data", "10.1.0.0/24");
    test_provider(&backend, false)
        .create_net(&data, &mut checkpoint)
        .await
        .unwrap();

    // A restarted engine builds a fresh provider; only the mapping survives
    let provider = test_provider(&backend, false);
    provider.destroy_net(&data, &mut checkpoint).await.unwrap();
    assert_eq!(backend.network_names(), vec!["mgmt"]);
    assert_eq!(backend.count("delete_subnet"), 1);
    assert!(checkpoint.backend_id(&data.id).is_none());
}

#[tokio::test]
async fn test_failed_subnet_removes_network() {
    let backend = Arc::new(InMemoryBackend::dev());
    let provider = test_provider(&backend, false);
    let mut checkpoint = MapCheckpoint::new();

    let data = NetResource::new(AreaId::new(0), "data", "10.1.0.0/24");
    backend.fail_next("create_subnet", "quota exceeded");
    let err = provider.create_net(&data, &mut checkpoint).await.unwrap_err();
    assert!(matches!(err, ProviderError::Backend(ref m) if m == "quota exceeded"));
    assert_eq!(backend.network_names(), vec!["mgmt"]);
    assert!(checkpoint.backend_id(&data.id).is_none());

    // Nothing is left to clash with a retry
    provider.create_net(&data, &mut checkpoint).await.unwrap();
    assert!(backend.network_names().contains(&"data".to_string()));
}
