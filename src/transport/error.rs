//! Errors surfaced by outbound calls

use thiserror::Error;

use super::connection::ConnectionId;
use crate::protocol::{EnvelopeError, Frame};

/// Why an outbound call did not produce a result
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No peer connected")]
    NoPeerConnected,

    #[error("Request timeout: {method} (id {id})")]
    RequestTimeout { method: String, id: String },

    /// The peer answered `status=error`. `frame` is the full decoded
    /// response, kept for diagnosing protocol mismatches.
    #[error("Peer error: {message}")]
    PeerReported {
        id: String,
        message: String,
        frame: Frame,
    },

    #[error("Server closed")]
    ServerClosed,

    #[error("Connection {0} closed before a response arrived")]
    ConnectionClosed(ConnectionId),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("Send failed: connection {0} is gone")]
    SendFailed(ConnectionId),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    /// The raw response frame, for peer-reported errors
    pub fn frame(&self) -> Option<&Frame> {
        match self {
            TransportError::PeerReported { frame, .. } => Some(frame),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::RequestTimeout { .. })
    }
}
