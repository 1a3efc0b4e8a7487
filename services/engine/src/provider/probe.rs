//! Management-port readiness.
//!
//! Before a playbook can run against a freshly booted VM, its management
//! port must accept an authenticated session. [`wait_until_reachable`]
//! retries a [`ManagementProbe`] at a fixed interval until it succeeds, the
//! timeout elapses or the operation is cancelled.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use super::ProviderError;
use crate::cancel::CancelSignal;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ManagementTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// One connection attempt.
#[async_trait]
pub trait ManagementProbe: Send + Sync {
    /// `Ok(())` once an authenticated session could be opened. Any error is
    /// treated as "not ready yet".
    async fn try_connect(&self, target: &ManagementTarget) -> Result<(), String>;
}

/// Opens an SSH session with password authentication.
#[derive(Debug, Clone)]
pub struct SshProbe {
    connect_timeout: Duration,
}

impl SshProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for SshProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn open_session(target: &ManagementTarget, connect_timeout: Duration) -> Result<(), String> {
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| format!("resolving {}: {e}", target.host))?
        .next()
        .ok_or_else(|| format!("no address for {}", target.host))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| format!("TCP connection failed: {e}"))?;

    let mut session = ssh2::Session::new().map_err(|e| format!("SSH session creation failed: {e}"))?;
    session.set_timeout(connect_timeout.as_millis().try_into().unwrap_or(u32::MAX));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| format!("SSH handshake failed: {e}"))?;
    session
        .userauth_password(&target.username, &target.password)
        .map_err(|e| format!("SSH password auth failed: {e}"))?;

    if !session.authenticated() {
        return Err("SSH authentication failed".to_string());
    }
    Ok(())
}

#[async_trait]
impl ManagementProbe for SshProbe {
    async fn try_connect(&self, target: &ManagementTarget) -> Result<(), String> {
        let target = target.clone();
        let connect_timeout = self.connect_timeout;
        tokio::task::spawn_blocking(move || open_session(&target, connect_timeout))
            .await
            .map_err(|e| format!("probe task failed: {e}"))?
    }
}

/// Retry `probe` every `interval` until it succeeds.
pub async fn wait_until_reachable(
    probe: &dyn ManagementProbe,
    target: &ManagementTarget,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelSignal,
) -> Result<(), ProviderError> {
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        match probe.try_connect(target).await {
            Ok(()) => {
                info!(host = %target.host, elapsed = ?started.elapsed(), "Management port ready");
                return Ok(());
            }
            Err(reason) => debug!(host = %target.host, %reason, "Management port not ready"),
        }

        if Instant::now() + interval > deadline {
            return Err(ProviderError::ReadinessTimeout {
                what: format!("management port of {}", target.host),
                elapsed: started.elapsed(),
            });
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        }
    }
}
