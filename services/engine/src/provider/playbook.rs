//! Playbook-based configuration.
//!
//! A [`PlaybookSpec`] is a single play against the VM being configured. It
//! renders to a JSON playbook (JSON is valid YAML, so `ansible-playbook`
//! reads it as-is). Commands whose output should come back to the caller
//! are registered with [`PlaybookSpec::gather_output`]; their stdout is
//! stored as a cacheable fact and shows up in [`PlaybookReport::facts`].

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ProviderError;

/// Fact holding `<iface>: <mac>` lines for every non-loopback interface.
pub const INTERFACES_MAC_FACT: &str = "interfaces_mac";

/// Shell command producing [`INTERFACES_MAC_FACT`].
pub const INTERFACES_MAC_COMMAND: &str = r#"find /sys/class/net -mindepth 1 -maxdepth 1 ! -name lo -printf "%P: " -execdir cat {}/address \;"#;

/// A command whose stdout is captured as a fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatheredOutput {
    pub command: String,
    pub fact: String,
}

/// One play against the target VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookSpec {
    pub name: String,

    #[serde(default)]
    pub tasks: Vec<Value>,

    #[serde(default)]
    pub gather: Vec<GatheredOutput>,
}

impl PlaybookSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            gather: Vec::new(),
        }
    }

    /// Append a raw task (a mapping in ansible task syntax).
    pub fn task(mut self, task: Value) -> Self {
        self.tasks.push(task);
        self
    }

    /// Append a shell task with a display name.
    pub fn shell(self, name: &str, command: impl Into<String>) -> Self {
        self.task(json!({ "name": name, "ansible.builtin.shell": command.into() }))
    }

    /// Capture the stdout of `command` as fact `fact`.
    pub fn gather_output(mut self, command: impl Into<String>, fact: impl Into<String>) -> Self {
        self.gather.push(GatheredOutput {
            command: command.into(),
            fact: fact.into(),
        });
        self
    }

    /// The play that discovers guest interface names.
    pub fn interface_discovery() -> Self {
        Self::new("Gather guest interface names")
            .gather_output(INTERFACES_MAC_COMMAND, INTERFACES_MAC_FACT)
    }

    pub fn to_document(&self) -> Value {
        let mut tasks = self.tasks.clone();
        for gathered in &self.gather {
            let register = format!("{}_out", gathered.fact);
            tasks.push(json!({
                "name": format!("Run {}", gathered.fact),
                "ansible.builtin.shell": gathered.command,
                "register": register,
            }));
            tasks.push(json!({
                "name": format!("Store {}", gathered.fact),
                "ansible.builtin.set_fact": {
                    gathered.fact.as_str(): format!("{{{{ {register}.stdout }}}}"),
                    "cacheable": true,
                },
            }));
        }
        json!([{
            "name": self.name,
            "hosts": "all",
            "become": true,
            "gather_facts": false,
            "tasks": tasks,
        }])
    }

    pub fn render(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_document())
    }
}

/// A rendered playbook ready to run against one host.
#[derive(Debug, Clone)]
pub struct PlaybookRun {
    /// Unique per blueprint and VM, e.g. `bp_..._vm-a`.
    pub name: String,
    pub host: String,
    pub username: String,
    pub password: String,
    pub playbook: String,
}

/// Result of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybookReport {
    pub failed: bool,
    pub facts: Map<String, Value>,
}

#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn run(&self, run: &PlaybookRun) -> Result<PlaybookReport, ProviderError>;
}

/// Runs playbooks with the `ansible-playbook` CLI and its JSON stdout
/// callback.
#[derive(Debug, Clone)]
pub struct AnsibleCliRunner {
    playbook_dir: PathBuf,
    binary: String,
}

impl AnsibleCliRunner {
    pub fn new(playbook_dir: impl Into<PathBuf>) -> Self {
        Self {
            playbook_dir: playbook_dir.into(),
            binary: "ansible-playbook".to_string(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn write_files(&self, run: &PlaybookRun) -> Result<(PathBuf, PathBuf), ProviderError> {
        tokio::fs::create_dir_all(&self.playbook_dir)
            .await
            .map_err(|e| ProviderError::Backend(format!("creating playbook dir: {e}")))?;

        let playbook_path = self.playbook_dir.join(format!("{}.json", run.name));
        let vars_path = self.playbook_dir.join(format!("{}.vars.json", run.name));

        let vars = json!({
            "ansible_user": run.username,
            "ansible_password": run.password,
            "ansible_become_password": run.password,
            "ansible_ssh_common_args": "-o StrictHostKeyChecking=no",
        });

        tokio::fs::write(&playbook_path, &run.playbook)
            .await
            .map_err(|e| ProviderError::Backend(format!("writing playbook: {e}")))?;
        tokio::fs::write(&vars_path, vars.to_string())
            .await
            .map_err(|e| ProviderError::Backend(format!("writing playbook vars: {e}")))?;

        Ok((playbook_path, vars_path))
    }
}

#[async_trait]
impl PlaybookRunner for AnsibleCliRunner {
    async fn run(&self, run: &PlaybookRun) -> Result<PlaybookReport, ProviderError> {
        let (playbook_path, vars_path) = self.write_files(run).await?;
        info!(host = %run.host, playbook = %playbook_path.display(), "Running playbook");

        let output = Command::new(&self.binary)
            .arg("-i")
            .arg(format!("{},", run.host))
            .arg("-e")
            .arg(format!("@{}", vars_path.display()))
            .arg(&playbook_path)
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Backend(format!("spawning {}: {e}", self.binary)))?;

        if let Err(e) = tokio::fs::remove_file(&vars_path).await {
            warn!(path = %vars_path.display(), error = %e, "Failed to remove playbook vars");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut report = parse_json_callback(&stdout, &run.host)?;
        if !output.status.success() {
            debug!(status = ?output.status, "ansible-playbook exited unsuccessfully");
            report.failed = true;
        }
        Ok(report)
    }
}

/// Extract the facts and failure state for `host` from the output of the
/// ansible JSON stdout callback.
pub fn parse_json_callback(stdout: &str, host: &str) -> Result<PlaybookReport, ProviderError> {
    let doc: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| ProviderError::ConfigurationFailed(format!("unreadable ansible output: {e}")))?;

    let mut report = PlaybookReport::default();

    let plays = doc["plays"].as_array().map(Vec::as_slice).unwrap_or_default();
    for task in plays.iter().flat_map(|play| {
        play["tasks"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }) {
        if let Some(Value::Object(facts)) = task["hosts"][host].get("ansible_facts") {
            for (key, value) in facts {
                report.facts.insert(key.clone(), value.clone());
            }
        }
    }

    let stats = &doc["stats"][host];
    let failures = stats["failures"].as_u64().unwrap_or(0);
    let unreachable = stats["unreachable"].as_u64().unwrap_or(0);
    report.failed = failures > 0 || unreachable > 0;

    Ok(report)
}

/// Parse `<iface>: <mac>` lines into `(mac, iface)` pairs.
pub fn parse_interfaces_mac(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let (name, mac) = line.split_once(':')?;
            let name = name.trim();
            let mac = mac.trim();
            if name.is_empty() || mac.is_empty() {
                return None;
            }
            Some((mac.to_ascii_lowercase(), name.to_string()))
        })
        .collect()
}
