//! Transport module - Correlated RPC over one logical peer connection
//!
//! Provides:
//! - The coordinator that owns the pending-call table and connection set
//! - Connection handles used by whatever host owns the sockets
//! - Method handler registration for inbound requests
//! - Liveness probing

mod connection;
mod coordinator;
mod error;
mod handler;

pub use connection::*;
pub use coordinator::*;
pub use error::*;
pub use handler::*;

use std::time::Duration;

use crate::protocol::MAX_FRAME_BYTES;

/// Configuration for a coordinator
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default time to wait for a response
    pub request_timeout_ms: u64,
    /// Default time to wait for a peer when none is connected
    pub connect_timeout_ms: u64,
    /// Largest encoded frame accepted or sent
    pub max_frame_bytes: usize,
    /// Fail calls as soon as the connection they went out on closes,
    /// instead of letting them run into their own timeout
    pub fail_pending_on_disconnect: bool,
    /// Ping interval in milliseconds (0 disables probing)
    pub liveness_interval_ms: u64,
    /// Drop a connection after this long without a pong
    pub liveness_timeout_ms: u64,
    /// Outbound queue depth per connection
    pub outbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            connect_timeout_ms: 2000,
            max_frame_bytes: MAX_FRAME_BYTES,
            fail_pending_on_disconnect: false,
            liveness_interval_ms: 15_000,
            liveness_timeout_ms: 45_000,
            outbound_queue: 256,
        }
    }
}

impl TransportConfig {
    pub fn with_timeouts(mut self, request_timeout_ms: u64, connect_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }

    pub fn with_liveness(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.liveness_interval_ms = interval_ms;
        self.liveness_timeout_ms = timeout_ms;
        self
    }

    pub fn without_liveness(mut self) -> Self {
        self.liveness_interval_ms = 0;
        self
    }

    pub fn failing_pending_on_disconnect(mut self) -> Self {
        self.fail_pending_on_disconnect = true;
        self
    }

    /// Call options derived from the configured defaults
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

/// Per-call timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Time to wait for the response once the request is sent
    pub timeout: Duration,
    /// Time to wait for a peer if none is connected
    pub connect_timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        TransportConfig::default().call_options()
    }
}

impl CallOptions {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            timeout,
            connect_timeout,
        }
    }

    pub fn from_millis(timeout_ms: u64, connect_timeout_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(connect_timeout_ms),
        )
    }
}
