//! flatlink Client
//!
//! Dials a server and hands the connection to a local coordinator. The
//! protocol is symmetric, so the client side can serve methods too.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::connection::serve_connection;
use super::{resolve_host, NetworkConfig};
use crate::transport::Coordinator;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Transport closed")]
    TransportClosed,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Connect to `server_addr` and spawn the connection pump.
///
/// The returned task resolves with the reason the connection ended.
pub async fn connect(
    server_addr: SocketAddr,
    coordinator: &Coordinator,
    config: &NetworkConfig,
) -> ClientResult<JoinHandle<String>> {
    if coordinator.is_closed() {
        return Err(ClientError::TransportClosed);
    }

    tracing::info!("Connecting to {}", server_addr);

    let stream = match tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        TcpStream::connect(server_addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ClientError::Io(e)),
        Err(_) => return Err(ClientError::Timeout),
    };
    stream.set_nodelay(true)?;

    let coordinator = coordinator.clone();
    let config = config.clone();
    Ok(tokio::spawn(async move {
        serve_connection(stream, server_addr, coordinator, &config).await
    }))
}

/// Resolve `host` on the configured port, then [`connect`]
pub async fn connect_host(
    host: &str,
    coordinator: &Coordinator,
    config: &NetworkConfig,
) -> ClientResult<JoinHandle<String>> {
    let addr = resolve_host(host, config.port).await?;
    connect(addr, coordinator, config).await
}
