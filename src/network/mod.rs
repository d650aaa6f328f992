//! Network module - Carries coordinator traffic over TCP
//!
//! Provides:
//! - Link framing (one message in, one message out)
//! - Server for accepting incoming connections
//! - Client for dialing a server
//! - The per-connection pump that feeds a coordinator

mod client;
mod connection;
mod framing;
mod server;

pub use client::*;
pub use connection::*;
pub use framing::*;
pub use server::*;

use std::net::SocketAddr;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to bind when serving
    pub bind_address: String,
    /// Port to listen on or connect to (0 picks a free port when serving)
    pub port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Largest link payload accepted or sent
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            connect_timeout_ms: 5000,
            max_message_size: 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
