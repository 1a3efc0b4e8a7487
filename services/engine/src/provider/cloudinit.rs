//! Boot-time guest configuration.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
struct ChpasswdSection {
    expire: bool,
}

/// Cloud-init user data that sets the default user's password and enables
/// password SSH logins, which the management probe relies on.
#[derive(Debug, Clone, Serialize)]
pub struct CloudInit {
    manage_etc_hosts: bool,
    password: String,
    chpasswd: ChpasswdSection,
    ssh_pwauth: bool,
}

impl CloudInit {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            manage_etc_hosts: true,
            password: password.into(),
            chpasswd: ChpasswdSection { expire: false },
            ssh_pwauth: true,
        }
    }

    /// Render as a `#cloud-config` document. JSON is valid YAML, so the
    /// body is emitted with serde_json.
    pub fn render(&self) -> Result<String, serde_json::Error> {
        Ok(format!("#cloud-config\n{}\n", serde_json::to_string_pretty(self)?))
    }
}
