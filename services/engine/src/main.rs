//! Blueprint Lifecycle Engine
//!
//! Runs the blueprint manager over the local SQLite store. Areas are served
//! by in-memory backends in this build; real backends plug in through
//! `InfraBackend` and a `ProviderFactory`.

use std::sync::Arc;

use anyhow::{Context, Result};
use lcm_engine::blueprints::{builtin_natives, register_builtin};
use lcm_engine::config::Config;
use lcm_engine::events::BroadcastPublisher;
use lcm_engine::provider::{
    AreaConfig, InMemoryProviderFactory, ProviderRegistry, ProviderSettings, StaticAreas,
};
use lcm_engine::state::SqliteBlueprintStore;
use lcm_engine::{BlueprintManager, BlueprintTypeRegistry};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting blueprint lifecycle engine");
    info!(
        data_dir = %config.data_dir.display(),
        state_db = %config.state_db.display(),
        areas = ?config.areas,
        "Configuration loaded"
    );

    // Open the state store
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let store = Arc::new(SqliteBlueprintStore::open(&config.state_db)?);
    std::fs::create_dir_all(&config.playbook_dir)
        .with_context(|| format!("creating {}", config.playbook_dir.display()))?;

    // Providers, one per area, created on first use
    let settings = ProviderSettings {
        ssh_timeout: config.ssh_timeout,
        ssh_retry_interval: config.ssh_retry_interval,
        ..ProviderSettings::default()
    };
    let areas = StaticAreas::new(config.areas.iter().map(|area| {
        AreaConfig::new(*area, format!("memory://{area}")).with_floating_ip(config.use_floating_ip)
    }));
    let factory = InMemoryProviderFactory::new(settings, Arc::new(builtin_natives()));
    let providers = Arc::new(ProviderRegistry::new(Arc::new(areas), Arc::new(factory)));

    // Blueprint types
    let mut types = BlueprintTypeRegistry::new();
    register_builtin(&mut types);
    info!(types = ?types.names().collect::<Vec<_>>(), "Blueprint types registered");

    // Event log
    let events = Arc::new(BroadcastPublisher::new(1024));
    let mut rx = events.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(
                    blueprint_id = %event.blueprint_id,
                    blueprint_type = %event.blueprint_type,
                    event_type = %event.event_type,
                    status = %event.status.current_operation,
                    "Blueprint event"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let manager = BlueprintManager::new(
        store,
        Arc::new(types),
        providers.clone(),
        events,
        config.sync_call_timeout,
    );

    if let Some((blueprint_type, payload)) = config.bootstrap.clone() {
        match manager.create_blueprint(&blueprint_type, payload).await {
            Ok(id) => info!(blueprint_id = %id, blueprint_type = %blueprint_type, "Bootstrap blueprint enqueued"),
            Err(e) => error!(blueprint_type = %blueprint_type, error = %e, "Bootstrap blueprint rejected"),
        }
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    let failed = providers.final_cleanup_all().await;
    if failed > 0 {
        warn!(failed, "Some areas were not cleaned up");
    }

    drop(manager);
    event_log.abort();

    info!("Lifecycle engine shutdown complete");
    Ok(())
}
