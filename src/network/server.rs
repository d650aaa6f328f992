//! flatlink Server
//!
//! Accepts connections and hands each one to the coordinator.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use super::connection::serve_connection;
use super::NetworkConfig;
use crate::transport::Coordinator;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// TCP front end for a coordinator
pub struct Server {
    config: NetworkConfig,
    coordinator: Coordinator,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    running: Arc<RwLock<bool>>,
}

impl Server {
    pub fn new(config: NetworkConfig, coordinator: Coordinator) -> Self {
        Self {
            config,
            coordinator,
            local_addr: None,
            shutdown_tx: None,
            accept_task: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and spawn the accept loop. Returns the bound address.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if *self.running.read().await {
            return Err(ServerError::AlreadyRunning);
        }
        if self.coordinator.is_closed() {
            return Err(ServerError::TransportClosed);
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        *self.running.write().await = true;

        let coordinator = self.coordinator.clone();
        let config = self.config.clone();
        let running = self.running.clone();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);
                                if let Err(e) = stream.set_nodelay(true) {
                                    tracing::debug!("set_nodelay failed for {}: {}", addr, e);
                                }

                                let coordinator = coordinator.clone();
                                let config = config.clone();
                                tokio::spawn(async move {
                                    serve_connection(stream, addr, coordinator, &config).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                    _ = coordinator.closed() => {
                        tracing::info!("Transport closed, no longer accepting");
                        break;
                    }
                }
            }

            *running.write().await = false;
        }));

        Ok(local_addr)
    }

    /// Stop accepting connections. Safe to call more than once.
    ///
    /// Live connections stay up until the coordinator is closed.
    pub async fn stop(&mut self) -> ServerResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
