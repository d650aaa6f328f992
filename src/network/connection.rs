//! Connection handling for flatlink
//!
//! Owns one TCP stream and pumps it against a coordinator:
//! - Link message encoding/decoding
//! - Ping/pong handling
//! - Forwarding the coordinator's outbound queue

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::framing::{Decoder, Encoder, FramingError, LinkFrame, LinkMessage};
use super::NetworkConfig;
use crate::transport::{ConnectionHandle, Coordinator, Outbound};

/// Longest wait for the goodbye message once a connection is ending
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Connection closed mid-message")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Represents a link to a remote flatlink peer
pub struct Connection {
    remote_addr: SocketAddr,
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    last_activity: Instant,
    stats: ConnectionStats,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Connection {
    /// Wrap an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, max_message_size: usize) -> Self {
        Self {
            remote_addr,
            stream,
            encoder: Encoder::new(max_message_size),
            decoder: Decoder::new(max_message_size),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send one link message
    pub async fn send(&mut self, message: &LinkMessage) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        self.last_activity = Instant::now();

        Ok(())
    }

    /// Receive one link message. Returns None on a clean close.
    pub async fn recv(&mut self) -> ConnectionResult<Option<LinkFrame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                self.last_activity = Instant::now();
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Receive with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<LinkFrame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Say goodbye and shut the write half
    pub async fn close(&mut self, reason: &str) -> ConnectionResult<()> {
        self.send(&LinkMessage::Close(reason.to_string())).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Run one connection against `coordinator` until either side ends it.
///
/// Registers the connection on entry and deregisters it on exit, whatever
/// the reason. Returns the reason the connection ended.
pub async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    coordinator: Coordinator,
    config: &NetworkConfig,
) -> String {
    let mut conn = Connection::new(stream, remote_addr, config.max_message_size);
    let (handle, mut outbound_rx) =
        ConnectionHandle::channel(remote_addr.to_string(), coordinator.config().outbound_queue);

    coordinator.on_connection_opened(handle.clone());

    let mut write_interrupted = false;
    let reason = loop {
        let message = tokio::select! {
            result = conn.recv() => match result {
                Ok(Some(frame)) => match frame.message {
                    LinkMessage::Text(text) => {
                        tracing::trace!("<- {} seq={} {}", remote_addr, frame.sequence, text);
                        coordinator.on_frame_received(&handle, &text);
                        continue;
                    }
                    LinkMessage::Ping(nonce) => LinkMessage::Pong(nonce),
                    LinkMessage::Pong(_) => {
                        coordinator.on_pong(&handle);
                        continue;
                    }
                    LinkMessage::Close(reason) => break format!("Peer closed: {}", reason),
                },
                Ok(None) => break "Connection closed".to_string(),
                Err(e) => break format!("Error: {}", e),
            },

            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Frame(text)) => LinkMessage::Text(text),
                Some(Outbound::Ping(nonce)) => LinkMessage::Ping(nonce),
                None => break "Outbound queue closed".to_string(),
            },

            reason = handle.terminated() => break reason,
        };

        // a peer that stops reading must not hold off termination
        tokio::select! {
            sent = conn.send(&message) => {
                if let Err(e) = sent {
                    break format!("Send error: {}", e);
                }
            }
            reason = handle.terminated() => {
                write_interrupted = true;
                break reason;
            }
        }
    };

    coordinator.on_connection_closed(&handle);

    let stats = conn.stats();
    tracing::info!(
        "Connection {} ended ({}): {} sent, {} received",
        remote_addr,
        reason,
        stats.messages_sent,
        stats.messages_received
    );

    if write_interrupted {
        tracing::debug!("Dropping {} mid-write, no close handshake", remote_addr);
    } else {
        match tokio::time::timeout(CLOSE_TIMEOUT, conn.close(&reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Close handshake with {} failed: {}", remote_addr, e),
            Err(_) => tracing::debug!("Close handshake with {} timed out", remote_addr),
        }
    }

    reason
}
