//! Integration tests for the blueprint lifecycle.
//!
//! These tests drive the manager end to end over the in-memory backend:
//! 1. DAY0 provisions a topology and persists it
//! 2. DAY2 requests run one at a time, in arrival order
//! 3. Failures, cancellation and timeouts leave a usable worker behind
//! 4. Deletion tears down and forgets the blueprint

use std::sync::Arc;
use std::time::Duration;

use lcm_engine::blueprints::{builtin_natives, register_builtin};
use lcm_engine::events::RecordingPublisher;
use lcm_engine::provider::{
    AreaConfig, InMemoryBackend, InMemoryProviderFactory, ProviderRegistry, ProviderSettings,
    StaticAreas,
};
use lcm_engine::state::{BlueprintStore, MemoryBlueprintStore, SqliteBlueprintStore};
use lcm_engine::{BlueprintManager, BlueprintTypeRegistry, ManagerError};
use lcm_events::{BlueprintEventType, CurrentOperation};
use lcm_id::{AreaId, BlueprintId};
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(10);

fn test_manager(
    store: Arc<dyn BlueprintStore>,
    backend: Arc<InMemoryBackend>,
    events: Arc<RecordingPublisher>,
) -> BlueprintManager {
    let settings = ProviderSettings {
        ssh_timeout: Duration::from_secs(1),
        ssh_retry_interval: Duration::from_millis(20),
        ..ProviderSettings::default()
    };
    let factory = InMemoryProviderFactory::new(settings, Arc::new(builtin_natives()))
        .with_backend(AreaId::new(0), backend);
    let areas = StaticAreas::new([AreaConfig::new(AreaId::new(0), "memory://0")]);

    let mut types = BlueprintTypeRegistry::new();
    register_builtin(&mut types);

    BlueprintManager::new(
        store,
        Arc::new(types),
        Arc::new(ProviderRegistry::new(Arc::new(areas), Arc::new(factory))),
        events,
        WAIT,
    )
}

fn vm_spec(name: &str) -> Value {
    json!({
        "name": name,
        "image": {"name": "ubuntu2204"},
        "credentials": {"username": "ubuntu", "password": "secret"},
        "management_network": "mgmt",
        "configure": [{"kind": "native", "entry": "inventory", "args": {"role": name}}],
    })
}

fn topology(vms: &[&str]) -> Value {
    json!({
        "area": 0,
        "networks": [{"name": "data", "cidr": "10.1.0.0/24"}],
        "vms": vms.iter().map(|name| vm_spec(name)).collect::<Vec<_>>(),
    })
}

async fn stored_status(store: &dyn BlueprintStore, id: &BlueprintId) -> CurrentOperation {
    store
        .load(id)
        .await
        .unwrap()
        .unwrap()
        .status
        .current_operation
}

#[tokio::test]
async fn test_day0_provisions_and_persists_topology() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    let events = Arc::new(RecordingPublisher::new());
    let manager = test_manager(store.clone(), backend.clone(), events.clone());

    let (id, outcome) = manager
        .create_blueprint_sync("vm_topology", topology(&["vm-a"]), None)
        .await
        .unwrap();
    assert!(outcome.is_ok(), "DAY0 failed: {:?}", outcome.detail);

    assert_eq!(backend.server_names(), vec!["vm-a"]);
    assert!(backend.network_names().contains(&"data".to_string()));

    let saved = store.load(&id).await.unwrap().unwrap();
    assert!(saved.status.is_idle());
    assert_eq!(saved.resources.len(), 3);
    // The server and the data network
    assert_eq!(saved.backend_ids.len(), 2);
    assert_eq!(saved.config_snapshot, Some(topology(&["vm-a"])));
    assert_eq!(saved.state["facts"]["vm-a"]["args"]["role"], "vm-a");

    assert_eq!(
        events.types_for(&id),
        vec![BlueprintEventType::StartedDay0, BlueprintEventType::Created]
    );

    let summary = manager.summary(&id, false).await.unwrap();
    assert_eq!(summary["type"], "vm_topology");
    assert_eq!(summary["resource_count"], 3);
}

#[tokio::test]
async fn test_day2_requests_run_in_arrival_order() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    let events = Arc::new(RecordingPublisher::new());
    let manager = test_manager(store.clone(), backend.clone(), events);

    // Nothing below waits: every request is queued behind DAY0
    let id = manager
        .create_blueprint("vm_topology", topology(&["vm-a"]))
        .await
        .unwrap();
    for name in ["vm-b", "vm-c", "vm-d"] {
        manager.day2(&id, "/add_vm", vm_spec(name)).await.unwrap();
    }

    let outcome = manager
        .call_by_name(&id, "access_ips", Value::Null, None)
        .await
        .unwrap();
    assert!(outcome.is_ok());
    let ips = outcome.result.unwrap();
    for name in ["vm-a", "vm-b", "vm-c", "vm-d"] {
        assert!(ips[name].is_string(), "{name} has no access IP");
    }

    let booted: Vec<String> = backend
        .calls()
        .into_iter()
        .filter(|c| c.op == "create_server")
        .map(|c| c.target)
        .collect();
    assert_eq!(booted, vec!["vm-a", "vm-b", "vm-c", "vm-d"]);

    let saved = store.load(&id).await.unwrap().unwrap();
    let paths: Vec<&str> = saved
        .operation_history
        .iter()
        .map(|r| r.path.as_str())
        .collect();
    assert_eq!(
        paths,
        vec!["/vm_topology", "/add_vm", "/add_vm", "/add_vm", "access_ips"]
    );
    // Only payload-carrying route calls are kept for replay
    assert_eq!(saved.day2_call_history.len(), 3);
    assert_eq!(saved.day2_call_history[0]["path"], "/add_vm");
}

#[tokio::test]
async fn test_sync_calls_do_not_overlap() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    let manager = test_manager(store.clone(), backend.clone(), Arc::new(RecordingPublisher::new()));

    let (id, outcome) = manager
        .create_blueprint_sync("vm_topology", topology(&[]), None)
        .await
        .unwrap();
    assert!(outcome.is_ok());

    backend.set_boot_delay(Some(Duration::from_millis(100)));
    let (first, second) = tokio::join!(
        manager.day2_sync(&id, "/add_vm", vm_spec("vm-a"), None),
        manager.day2_sync(&id, "/add_vm", vm_spec("vm-b"), None),
    );
    assert!(first.unwrap().is_ok());
    assert!(second.unwrap().is_ok());

    let saved = store.load(&id).await.unwrap().unwrap();
    let records = &saved.operation_history;
    assert_eq!(records.len(), 3);
    for pair in records.windows(2) {
        let ended = pair[0].ended_at.unwrap();
        assert!(pair[1].started_at >= ended, "operations overlapped");
    }
}

#[tokio::test]
async fn test_failed_day0_keeps_registered_resources() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    let events = Arc::new(RecordingPublisher::new());
    let manager = test_manager(store.clone(), backend.clone(), events.clone());

    let mut payload = topology(&["vm-a"]);
    payload["vms"][0]["image"] = json!({"name": "missing"});
    let (id, outcome) = manager
        .create_blueprint_sync("vm_topology", payload, None)
        .await
        .unwrap();

    assert!(!outcome.is_ok());
    let detail = outcome.detail.unwrap();
    assert!(detail.contains("image 'missing' not found"), "{detail}");

    let saved = store.load(&id).await.unwrap().unwrap();
    assert_eq!(saved.status.current_operation, CurrentOperation::Error);
    assert!(saved.status.error);
    assert_eq!(saved.status.detail.as_deref(), Some(detail.as_str()));
    // The network, the VM and its configurator were registered before the failure
    assert_eq!(saved.resources.len(), 3);
    assert_eq!(backend.count("create_server"), 0);
    assert_eq!(
        events.types_for(&id),
        vec![BlueprintEventType::StartedDay0, BlueprintEventType::Error]
    );

    // The worker is still usable and the blueprint can be torn down
    let outcome = manager.delete_blueprint_sync(&id, None).await.unwrap();
    assert!(outcome.is_ok());
    assert!(store.load(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_day2_marks_error_until_next_success() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    let manager = test_manager(store.clone(), backend.clone(), Arc::new(RecordingPublisher::new()));

    let (id, _) = manager
        .create_blueprint_sync("vm_topology", topology(&["vm-a"]), None)
        .await
        .unwrap();

    // Duplicate VM name
    let outcome = manager
        .day2_sync(&id, "/add_vm", vm_spec("vm-a"), None)
        .await
        .unwrap();
    assert!(!outcome.is_ok());
    assert_eq!(stored_status(store.as_ref(), &id).await, CurrentOperation::Error);

    let outcome = manager
        .day2_sync(&id, "/del_vm", json!({"name": "vm-a"}), None)
        .await
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outcome.result, Some(json!([])));
    assert_eq!(stored_status(store.as_ref(), &id).await, CurrentOperation::Idle);
    assert_eq!(backend.server_count(), 0);
}

#[tokio::test]
async fn test_unknown_route_and_bad_payload_are_rejected() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let manager = test_manager(
        store.clone(),
        Arc::new(InMemoryBackend::dev()),
        Arc::new(RecordingPublisher::new()),
    );
    let (id, _) = manager
        .create_blueprint_sync("vm_topology", topology(&[]), None)
        .await
        .unwrap();

    assert!(matches!(
        manager.day2(&id, "/resize", json!({})).await,
        Err(ManagerError::UnknownRoute { ref path, .. }) if path == "/resize"
    ));
    assert!(matches!(
        manager.call_by_name(&id, "reboot", Value::Null, None).await,
        Err(ManagerError::UnknownOperation { .. })
    ));
    assert!(matches!(
        manager.day2(&id, "/add_vm", json!({"name": 7})).await,
        Err(ManagerError::InvalidPayload(_))
    ));

    // None of them reached the worker
    let saved = store.load(&id).await.unwrap().unwrap();
    assert_eq!(saved.operation_history.len(), 1);
}

#[tokio::test]
async fn test_protected_blueprint_survives_delete() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    let events = Arc::new(RecordingPublisher::new());
    let manager = test_manager(store.clone(), backend.clone(), events.clone());

    let (id, _) = manager
        .create_blueprint_sync("vm_topology", topology(&["vm-a"]), None)
        .await
        .unwrap();

    assert!(manager.protect(&id, true).await.unwrap());
    assert!(matches!(
        manager.delete_blueprint(&id).await,
        Err(ManagerError::Protected(_))
    ));
    assert!(manager.delete_all_blueprints().await.is_empty());
    assert_eq!(backend.server_count(), 1);

    assert!(!manager.protect(&id, false).await.unwrap());
    let outcome = manager.delete_blueprint_sync(&id, None).await.unwrap();
    assert!(outcome.is_ok());

    assert!(store.load(&id).await.unwrap().is_none());
    assert_eq!(backend.server_count(), 0);
    assert!(!backend.network_names().contains(&"data".to_string()));
    assert_eq!(manager.worker_count().await, 0);
    assert_eq!(
        events.types_for(&id).last(),
        Some(&BlueprintEventType::Deleted)
    );
    manager.wait_stopped(&id, None).await.unwrap();
    assert!(matches!(
        manager.get_worker(&id).await,
        Err(ManagerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_all_blueprints() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    let manager = test_manager(store.clone(), backend.clone(), Arc::new(RecordingPublisher::new()));

    let mut ids = Vec::new();
    for name in ["vm-a", "vm-b"] {
        let mut payload = topology(&[name]);
        payload["networks"] = json!([]);
        let (id, outcome) = manager
            .create_blueprint_sync("vm_topology", payload, None)
            .await
            .unwrap();
        assert!(outcome.is_ok());
        ids.push(id);
    }

    let mut deleted = manager.delete_all_blueprints().await;
    deleted.sort();
    ids.sort();
    assert_eq!(deleted, ids);

    // STOP is queued; wait for the teardowns through the store
    for _ in 0..100 {
        if store.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(store.is_empty().await);
    assert_eq!(backend.server_count(), 0);
}

#[tokio::test]
async fn test_worker_is_restored_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blueprints.db");
    let backend = Arc::new(InMemoryBackend::dev());

    let id = {
        let store = Arc::new(SqliteBlueprintStore::open(&path).unwrap());
        let manager = test_manager(store, backend.clone(), Arc::new(RecordingPublisher::new()));
        let (id, outcome) = manager
            .create_blueprint_sync("vm_topology", topology(&["vm-a"]), None)
            .await
            .unwrap();
        assert!(outcome.is_ok());
        id
    };

    // A new manager over the same file knows nothing until asked
    let store = Arc::new(SqliteBlueprintStore::open(&path).unwrap());
    let manager = test_manager(store.clone(), backend.clone(), Arc::new(RecordingPublisher::new()));
    assert_eq!(manager.worker_count().await, 0);

    let outcome = manager
        .call_by_name(&id, "access_ips", Value::Null, None)
        .await
        .unwrap();
    assert!(outcome.result.unwrap()["vm-a"].is_string());
    assert_eq!(manager.worker_count().await, 1);

    let listed = manager.list(Some("vm_topology"), false).await.unwrap();
    assert_eq!(listed.len(), 1);

    // The backend id mapping survived, so the server and the network are
    // still reachable
    let outcome = manager.delete_blueprint_sync(&id, None).await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(backend.server_count(), 0);
    assert_eq!(backend.network_names(), vec!["mgmt"]);
    assert!(store.load(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_aborts_boot_and_worker_continues() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    backend.set_boot_delay(Some(Duration::from_secs(30)));
    let manager = test_manager(store.clone(), backend.clone(), Arc::new(RecordingPublisher::new()));

    let id = manager
        .create_blueprint("vm_topology", topology(&["vm-a"]))
        .await
        .unwrap();
    for _ in 0..100 {
        if stored_status(store.as_ref(), &id).await == CurrentOperation::Deploying {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.cancel_in_flight(&id).await.unwrap();

    // Queued behind DAY0; the flag is cleared before it runs
    let outcome = manager
        .call_by_name(&id, "access_ips", Value::Null, None)
        .await
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outcome.result, Some(json!({"vm-a": null})));

    let saved = store.load(&id).await.unwrap().unwrap();
    let day0 = &saved.operation_history[0];
    assert!(day0.detail.as_deref().unwrap_or_default().contains("cancelled"));

    // The boot was submitted before the cancel; its id was kept for teardown
    assert_eq!(backend.server_count(), 1);
    assert!(saved.backend_ids.values().any(|v| v.starts_with("server-")));
    let outcome = manager.delete_blueprint_sync(&id, None).await.unwrap();
    assert!(outcome.is_ok(), "teardown failed: {:?}", outcome.detail);
    assert_eq!(backend.server_count(), 0);
    assert!(!backend.network_names().contains(&"data".to_string()));
}

#[tokio::test]
async fn test_sync_timeout_leaves_operation_running() {
    let store = Arc::new(MemoryBlueprintStore::new());
    let backend = Arc::new(InMemoryBackend::dev());
    backend.set_boot_delay(Some(Duration::from_millis(300)));
    let manager = test_manager(store.clone(), backend.clone(), Arc::new(RecordingPublisher::new()));

    let result = manager
        .create_blueprint_sync(
            "vm_topology",
            topology(&["vm-a"]),
            Some(Duration::from_millis(20)),
        )
        .await;
    assert!(matches!(result, Err(ManagerError::Timeout { .. })));

    let listed = manager.list(None, false).await.unwrap();
    assert_eq!(listed.len(), 1);
    let id: BlueprintId = serde_json::from_value(listed[0]["id"].clone()).unwrap();

    let outcome = manager
        .call_by_name(&id, "access_ips", Value::Null, None)
        .await
        .unwrap();
    assert!(outcome.result.unwrap()["vm-a"].is_string());
    assert_eq!(backend.server_count(), 1);
}
