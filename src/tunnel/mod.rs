//! Developer tunnel for the kittyparty server
//!
//! Exposes the local listener through a localtunnel-compatible relay so a
//! phone on another network can reach a development build. Never started in
//! production, and failures never affect the server itself.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::relay::{Backoff, RetryConfig};
use crate::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn default_max_conn_count() -> usize {
    1
}

/// Tunnel assignment returned by the relay server
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub url: String,
    pub port: u16,
    #[serde(default = "default_max_conn_count")]
    pub max_conn_count: usize,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TunnelRejection {
    message: String,
}

/// Asks the tunnel server for a public URL.
pub async fn request_tunnel(client: &reqwest::Client, config: &TunnelConfig) -> Result<TunnelInfo> {
    let base = Url::parse(&config.host).map_err(|e| TunnelError::InvalidHost(e.to_string()))?;
    let endpoint = match &config.subdomain {
        Some(subdomain) => base.join(subdomain),
        None => base.join("?new"),
    }
    .map_err(|e| TunnelError::InvalidHost(e.to_string()))?;

    debug!("Requesting tunnel from {}", endpoint);
    let response = client.get(endpoint).timeout(REQUEST_TIMEOUT).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let message = response
            .json::<TunnelRejection>()
            .await
            .map(|r| r.message)
            .unwrap_or_else(|_| status.to_string());
        return Err(TunnelError::Rejected(message).into());
    }

    Ok(response.json::<TunnelInfo>().await?)
}

/// Running tunnel; proxy workers are aborted on drop.
pub struct DevTunnel {
    info: TunnelInfo,
    workers: Vec<JoinHandle<()>>,
}

impl DevTunnel {
    /// Requests a tunnel and starts `max_conn_count` proxy workers forwarding
    /// remote sockets to `local`.
    pub async fn open(config: &TunnelConfig, local: SocketAddr) -> Result<Self> {
        let client = reqwest::Client::new();
        let info = request_tunnel(&client, config).await?;

        let remote_host = match &info.ip {
            Some(ip) => ip.clone(),
            None => Url::parse(&config.host)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string))
                .ok_or_else(|| TunnelError::InvalidHost(config.host.clone()))?,
        };

        let workers = (0..info.max_conn_count.max(1))
            .map(|slot| {
                tokio::spawn(proxy_worker(slot, remote_host.clone(), info.port, local))
            })
            .collect();

        info!("Tunnel {} forwarding {} to {}", info.id, info.url, local);
        Ok(Self { info, workers })
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }
}

impl Drop for DevTunnel {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

/// Opens the tunnel on a background task and returns at once, so a slow or
/// unreachable tunnel host never delays the server. The task owns the tunnel;
/// aborting it closes the tunnel.
pub fn spawn(config: TunnelConfig, local: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        match DevTunnel::open(&config, local).await {
            Ok(tunnel) => {
                info!("Public URL: {}", tunnel.url());
                // proxy workers live as long as `tunnel`
                std::future::pending::<()>().await;
            }
            Err(e) => warn!("Tunnel failed. The subdomain may already be taken: {}", e),
        }
    })
}

fn worker_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        initial_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(30),
        ..Default::default()
    }
}

async fn proxy_worker(slot: usize, remote_host: String, remote_port: u16, local: SocketAddr) {
    let mut backoff = Backoff::new(worker_retry());

    loop {
        match proxy_once(&remote_host, remote_port, local).await {
            Ok((to_local, to_remote)) => {
                debug!(
                    "Tunnel slot {} session finished ({} bytes in, {} bytes out)",
                    slot, to_local, to_remote
                );
                backoff.reset();
                continue;
            }
            Err(e) => warn!("Tunnel slot {} error: {}", slot, e),
        }

        let Some(delay) = backoff.next_delay() else {
            warn!("Tunnel closed (slot {})", slot);
            return;
        };
        tokio::time::sleep(delay).await;
    }
}

async fn proxy_once(remote_host: &str, remote_port: u16, local: SocketAddr) -> std::io::Result<(u64, u64)> {
    let mut remote = TcpStream::connect((remote_host, remote_port)).await?;
    let mut local = TcpStream::connect(local).await?;
    copy_bidirectional(&mut remote, &mut local).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_info_defaults() {
        let info: TunnelInfo = serde_json::from_str(
            r#"{"id":"kittyparty","url":"https://kittyparty.loca.lt","port":40123}"#,
        )
        .unwrap();
        assert_eq!(info.max_conn_count, 1);
        assert!(info.ip.is_none());
    }

    #[tokio::test]
    async fn test_invalid_host() {
        let config = TunnelConfig {
            host: "not a url".to_string(),
            subdomain: None,
        };
        let result = request_tunnel(&reqwest::Client::new(), &config).await;
        assert!(matches!(
            result,
            Err(crate::AppError::TunnelError(TunnelError::InvalidHost(_)))
        ));
    }
}
