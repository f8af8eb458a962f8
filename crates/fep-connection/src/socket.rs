//! Socket establishment with primary/backup fallback
//!
//! Each channel connects against its primary endpoint first and falls
//! back to the backup on failure, honoring the per-socket connect
//! timeout and TCP options.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use fep_types::{EndpointConfig, FepError, Result, SocketConfig};

/// Which role a socket plays on a dual link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Send,
    Receive,
}

impl std::fmt::Display for SocketRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Send => "send",
            Self::Receive => "receive",
        })
    }
}

async fn try_endpoint(
    endpoint: &EndpointConfig,
    config: &SocketConfig,
) -> Result<TcpStream> {
    let connect = TcpStream::connect(endpoint.address());
    let stream = timeout(Duration::from_millis(config.connect_timeout_ms), connect)
        .await
        .map_err(|_| {
            FepError::connection(format!(
                "connect to {} timed out after {} ms",
                endpoint.address(),
                config.connect_timeout_ms
            ))
        })?
        .map_err(|e| FepError::connection(format!("connect to {}: {}", endpoint.address(), e)))?;
    stream
        .set_nodelay(config.no_delay)
        .map_err(|e| FepError::connection(format!("set_nodelay: {}", e)))?;
    Ok(stream)
}

/// Connect one socket, primary first, then backup. Records timing.
pub async fn connect_socket(role: SocketRole, config: &SocketConfig) -> Result<TcpStream> {
    let started = std::time::Instant::now();
    match try_endpoint(&config.primary, config).await {
        Ok(stream) => {
            info!(
                %role,
                endpoint = %config.primary.address(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "socket connected"
            );
            Ok(stream)
        }
        Err(primary_err) => {
            let Some(backup) = &config.backup else {
                return Err(primary_err);
            };
            warn!(%role, error = %primary_err, backup = %backup.address(), "primary failed, trying backup");
            let stream = try_endpoint(backup, config).await?;
            info!(
                %role,
                endpoint = %backup.address(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "socket connected via backup"
            );
            Ok(stream)
        }
    }
}
