//! Configuration for the lifecycle engine.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use lcm_id::AreaId;
use serde_json::Value;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// SQLite state file.
    pub state_db: PathBuf,

    /// Where rendered playbooks are written.
    pub playbook_dir: PathBuf,

    /// Total time to wait for a VM's management port.
    pub ssh_timeout: Duration,

    /// Pause between management port attempts.
    pub ssh_retry_interval: Duration,

    /// Default timeout of synchronous calls.
    pub sync_call_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Areas served by this engine.
    pub areas: Vec<AreaId>,

    /// Attach floating addresses to every VM.
    pub use_floating_ip: bool,

    /// Blueprint created at startup, if any.
    pub bootstrap: Option<(String, Value)>,
}

fn secs(name: &str, default: u64, min: u64) -> Result<Duration> {
    let secs = match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{name} must be a number of seconds, got '{raw}'"))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs.max(min)))
}

fn parse_areas(raw: &str) -> Result<Vec<AreaId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map(AreaId::new)
                .with_context(|| format!("invalid area id '{s}' in LCM_AREAS"))
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(
            std::env::var("LCM_DATA_DIR").unwrap_or_else(|_| "/var/lib/blueprint-lcm".to_string()),
        );

        let state_db = std::env::var("LCM_STATE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("blueprints.db"));

        let playbook_dir = PathBuf::from(
            std::env::var("LCM_PLAYBOOK_DIR")
                .unwrap_or_else(|_| "/tmp/blueprint-lcm/playbook".to_string()),
        );

        let ssh_timeout = secs("LCM_SSH_TIMEOUT_SECS", 300, 1)?;
        let ssh_retry_interval = secs("LCM_SSH_RETRY_SECS", 5, 1)?;
        let sync_call_timeout = secs("LCM_SYNC_CALL_TIMEOUT_SECS", 600, 1)?;

        let log_level = std::env::var("LCM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let areas = parse_areas(&std::env::var("LCM_AREAS").unwrap_or_else(|_| "0".to_string()))?;

        let use_floating_ip = std::env::var("LCM_USE_FLOATING_IP")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let bootstrap = match std::env::var("LCM_BOOTSTRAP_TYPE") {
            Ok(blueprint_type) => {
                let payload = match std::env::var("LCM_BOOTSTRAP_PAYLOAD") {
                    Ok(raw) => serde_json::from_str(&raw)
                        .context("LCM_BOOTSTRAP_PAYLOAD is not valid JSON")?,
                    Err(_) => Value::Object(Default::default()),
                };
                Some((blueprint_type, payload))
            }
            Err(_) => None,
        };

        Ok(Self {
            data_dir,
            state_db,
            playbook_dir,
            ssh_timeout,
            ssh_retry_interval,
            sync_call_timeout,
            log_level,
            areas,
            use_floating_ip,
            bootstrap,
        })
    }
}
