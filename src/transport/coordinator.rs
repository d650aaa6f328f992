//! Transport coordinator
//!
//! Multiplexes outbound correlated calls and inbound dispatched calls over
//! the live peer connection.
//!
//! ```text
//!   call() ──► pending[id] = oneshot ──► Outbound::Frame ──► socket owner
//!                    ▲
//!   on_frame_received ─┬─ response ─► pending.remove(id) ─► oneshot
//!                      └─ request  ─► handler task ─► reply frame
//! ```
//!
//! The pending table and the connection set sit behind one lock that is
//! never held across an await. Every terminal outcome of a call (response,
//! timeout, cancel, disconnect, shutdown) starts by removing the entry from
//! the table, and only the remover resolves it.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::connection::{ConnectionHandle, ConnectionId, Outbound};
use super::error::{TransportError, TransportResult};
use super::handler::{FnHandler, MethodHandler};
use super::{CallOptions, TransportConfig};
use crate::protocol::{
    build_request, build_response_error, build_response_ok, decode_frame_limited, encode_frame,
    parse_request, parse_response, sniff_envelope, DecodeError, EnvelopeError, Frame, Outcome,
    Request, KEY_ID, KEY_TYPE, TYPE_REQUEST, TYPE_RESPONSE,
};

/// Reply text for requests naming an unregistered method
pub const METHOD_NOT_IMPLEMENTED: &str = "method not implemented";

type CallResult = TransportResult<Frame>;

struct PendingEntry {
    method: String,
    connection: ConnectionId,
    tx: oneshot::Sender<CallResult>,
    /// Fires the timeout at the call's deadline
    expiry: AbortHandle,
}

impl PendingEntry {
    fn resolve(self, result: CallResult) {
        self.expiry.abort();
        // the caller may have dropped its PendingCall in the meantime
        let _ = self.tx.send(result);
    }
}

#[derive(Default)]
struct State {
    /// Open connections, oldest first
    connections: Vec<ConnectionHandle>,
    /// Callers waiting for the first connection, FIFO
    waiters: VecDeque<oneshot::Sender<ConnectionHandle>>,
    pending: HashMap<String, PendingEntry>,
    closed: bool,
}

struct Inner {
    config: TransportConfig,
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
    next_ping: AtomicU64,
}

/// Owns the handler registry, the pending-call table and the connection set.
///
/// Cheap to clone; clones share state. Separate instances are fully
/// independent.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Coordinator {
    pub fn new(config: TransportConfig) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                handlers: RwLock::new(HashMap::new()),
                state: Mutex::new(State::default()),
                shutdown,
                next_ping: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Call options built from the configured defaults
    pub fn default_call_options(&self) -> CallOptions {
        self.inner.config.call_options()
    }

    /// Register the handler for `method`. The last registration wins.
    pub fn register_handler(&self, method: impl Into<String>, handler: impl MethodHandler) {
        let method = method.into();
        let previous = self
            .inner
            .handlers
            .write()
            .insert(method.clone(), Arc::new(handler));

        if previous.is_some() {
            tracing::debug!("Replaced handler for {}", method);
        }
    }

    /// Register an async closure as the handler for `method`
    pub fn register_fn<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Frame>> + Send + 'static,
    {
        self.register_handler(method, FnHandler(handler));
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.inner.handlers.read().contains_key(method)
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Add a connection and release everyone waiting for one
    pub fn on_connection_opened(&self, connection: ConnectionHandle) {
        let waiters = {
            let mut state = self.inner.state.lock();
            if state.closed {
                None
            } else {
                connection.touch();
                state.connections.push(connection.clone());
                Some(std::mem::take(&mut state.waiters))
            }
        };

        let Some(waiters) = waiters else {
            tracing::warn!(
                "Rejecting connection {} ({}): transport closed",
                connection.label(),
                connection.id()
            );
            connection.terminate("server closed");
            return;
        };

        tracing::info!(
            "Peer connected: {} ({})",
            connection.label(),
            connection.id()
        );

        for waiter in waiters {
            // a waiter whose caller already timed out is skipped
            let _ = waiter.send(connection.clone());
        }
    }

    /// Remove a connection. Safe to call more than once.
    ///
    /// Calls sent over it keep running into their own timeout unless
    /// `fail_pending_on_disconnect` is set.
    pub fn on_connection_closed(&self, connection: &ConnectionHandle) {
        connection.mark_disconnected();

        let orphaned: Vec<PendingEntry> = {
            let mut state = self.inner.state.lock();
            let before = state.connections.len();
            state.connections.retain(|c| c.id() != connection.id());
            if state.connections.len() == before {
                return;
            }

            if self.inner.config.fail_pending_on_disconnect {
                let ids: Vec<String> = state
                    .pending
                    .iter()
                    .filter(|(_, entry)| entry.connection == connection.id())
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.iter()
                    .filter_map(|id| state.pending.remove(id))
                    .collect()
            } else {
                Vec::new()
            }
        };

        tracing::info!(
            "Peer disconnected: {} ({}), {} call(s) failed",
            connection.label(),
            connection.id(),
            orphaned.len()
        );

        for entry in orphaned {
            entry.resolve(Err(TransportError::ConnectionClosed(connection.id())));
        }
    }

    /// Record a pong from the peer
    pub fn on_pong(&self, connection: &ConnectionHandle) {
        tracing::trace!("Pong from {}", connection.label());
        connection.touch();
    }

    /// Most recently opened live connection
    pub fn active_connection(&self) -> Option<ConnectionHandle> {
        Self::latest(&self.inner.state.lock())
    }

    fn latest(state: &State) -> Option<ConnectionHandle> {
        state
            .connections
            .iter()
            .rev()
            .find(|c| c.is_connected())
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Resolve with the active connection, or the next one to open.
    ///
    /// Fails with `NoPeerConnected` when `timeout` passes first, and with
    /// `ServerClosed` if the coordinator shuts down meanwhile.
    pub async fn wait_for_connection(&self, timeout: Duration) -> TransportResult<ConnectionHandle> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TransportError::ServerClosed);
            }
            if let Some(connection) = Self::latest(&state) {
                return Ok(connection);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.retain(|waiter| !waiter.is_closed());
            state.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(_)) => Err(TransportError::ServerClosed),
            Err(_) => Err(TransportError::NoPeerConnected),
        }
    }

    // ========================================================================
    // Inbound path
    // ========================================================================

    /// Handle one inbound wire message.
    ///
    /// Never fails: malformed requests are answered with `status=error`,
    /// malformed or unmatched responses are dropped. Request handlers run
    /// on their own tasks, so this must be called from within a runtime.
    pub fn on_frame_received(&self, connection: &ConnectionHandle, text: &str) {
        let frame = match decode_frame_limited(text, self.inner.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                self.reject_malformed(connection, text, err);
                return;
            }
        };

        let kind = frame.get(KEY_TYPE).map(str::to_string);
        match kind.as_deref() {
            Some(TYPE_RESPONSE) => self.resolve_response(frame),
            Some(TYPE_REQUEST) => self.dispatch_request(connection, frame),
            other => tracing::warn!(
                "Dropping frame of unknown type {:?} from {}",
                other,
                connection.label()
            ),
        }
    }

    fn reject_malformed(&self, connection: &ConnectionHandle, text: &str, err: DecodeError) {
        let sniffed = sniff_envelope(text);
        if !sniffed.is_request() {
            tracing::warn!(
                "Dropping malformed frame from {}: {}",
                connection.label(),
                err
            );
            return;
        }

        let id = sniffed.id.unwrap_or_default();
        tracing::warn!(
            "Malformed request {:?} from {}: {}",
            id,
            connection.label(),
            err
        );
        self.spawn_reply(
            connection,
            build_response_error(&id, &format!("malformed request: {}", err)),
        );
    }

    fn resolve_response(&self, frame: Frame) {
        let response = match parse_response(&frame) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("Dropping invalid response: {}", err);
                return;
            }
        };

        let entry = self.inner.state.lock().pending.remove(&response.id);
        let Some(entry) = entry else {
            tracing::debug!("Dropping response for unknown id {}", response.id);
            return;
        };

        let result = match response.outcome {
            Outcome::Ok(fields) => {
                tracing::debug!("{} ({}) succeeded", entry.method, response.id);
                Ok(fields)
            }
            Outcome::Error(message) => {
                tracing::debug!(
                    "{} ({}) failed on peer: {}",
                    entry.method,
                    response.id,
                    message
                );
                Err(TransportError::PeerReported {
                    id: response.id,
                    message,
                    frame,
                })
            }
        };

        entry.resolve(result);
    }

    fn dispatch_request(&self, connection: &ConnectionHandle, frame: Frame) {
        let request = match parse_request(&frame) {
            Ok(request) => request,
            Err(err) => {
                let id = frame.get(KEY_ID).unwrap_or_default();
                tracing::warn!(
                    "Invalid request {:?} from {}: {}",
                    id,
                    connection.label(),
                    err
                );
                self.spawn_reply(connection, build_response_error(id, &err.to_string()));
                return;
            }
        };

        let handler = self.inner.handlers.read().get(&request.method).cloned();
        let Some(handler) = handler else {
            tracing::warn!(
                "No handler for {} ({}) from {}",
                request.method,
                request.id,
                connection.label()
            );
            self.spawn_reply(
                connection,
                build_response_error(&request.id, METHOD_NOT_IMPLEMENTED),
            );
            return;
        };

        tracing::debug!(
            "Dispatching {} ({}) from {}",
            request.method,
            request.id,
            connection.label()
        );

        let coordinator = self.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            let reply = invoke_handler(handler, request).await;
            coordinator.send_reply(&connection, reply).await;
        });
    }

    fn spawn_reply(&self, connection: &ConnectionHandle, frame: Frame) {
        let coordinator = self.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            coordinator.send_reply(&connection, frame).await;
        });
    }

    async fn send_reply(&self, connection: &ConnectionHandle, frame: Frame) {
        let max = self.inner.config.max_frame_bytes;
        let mut text = encode_frame(&frame);

        if text.len() > max {
            let id = frame.get(KEY_ID).unwrap_or_default();
            let message = format!("response too large: {} bytes (max: {})", text.len(), max);
            tracing::warn!("Reply {} to {}: {}", id, connection.label(), message);
            text = encode_frame(&build_response_error(id, &message));
        }

        if let Err(err) = connection.send(Outbound::Frame(text)).await {
            tracing::debug!("Reply to {} dropped: {}", connection.label(), err);
        }
    }

    // ========================================================================
    // Outbound path
    // ========================================================================

    /// Send a request and register it as pending.
    ///
    /// Waits up to `options.connect_timeout` for a peer if none is
    /// connected. The response deadline starts once the entry is
    /// registered and also bounds the wait for queue space. The returned
    /// [`PendingCall`] resolves with the peer's result, or fails on
    /// timeout, cancel or shutdown.
    pub async fn issue(
        &self,
        method: &str,
        args: Frame,
        options: CallOptions,
    ) -> TransportResult<PendingCall> {
        let connection = self.wait_for_connection(options.connect_timeout).await?;
        let max = self.inner.config.max_frame_bytes;

        let mut id = new_correlation_id();
        let mut request = build_request(&id, method, args)?;
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + options.timeout;

        let text = loop {
            let text = encode_frame(&request);
            if text.len() > max {
                return Err(TransportError::FrameTooLarge {
                    size: text.len(),
                    max,
                });
            }

            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TransportError::ServerClosed);
            }
            if !state.pending.contains_key(&id) {
                state.pending.insert(
                    id.clone(),
                    PendingEntry {
                        method: method.to_string(),
                        connection: connection.id(),
                        tx,
                        expiry: self.arm_expiry(&id, deadline),
                    },
                );
                break text;
            }
            drop(state);

            tracing::error!("Correlation id collision on {}, regenerating", id);
            id = new_correlation_id();
            request
                .insert(KEY_ID, id.clone())
                .map_err(|_| EnvelopeError::InvalidId(Some(id.clone())))?;
        };

        tracing::debug!("Sending {} ({}) to {}", method, id, connection.label());

        let sent = tokio::select! {
            sent = tokio::time::timeout_at(deadline, connection.send(Outbound::Frame(text))) => sent,
            _ = self.closed() => {
                self.take_pending(&id);
                return Err(TransportError::ServerClosed);
            }
        };

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.take_pending(&id);
                return Err(err);
            }
            Err(_) => {
                tracing::warn!(
                    "{} ({}) timed out waiting for queue space on {}",
                    method,
                    id,
                    connection.label()
                );
                self.take_pending(&id);
                return Err(TransportError::RequestTimeout {
                    method: method.to_string(),
                    id,
                });
            }
        }

        Ok(PendingCall {
            id,
            method: method.to_string(),
            deadline,
            rx,
            coordinator: self.clone(),
        })
    }

    /// Call `method` on the peer and wait for its result
    pub async fn call(&self, method: &str, args: Frame, options: CallOptions) -> TransportResult<Frame> {
        self.issue(method, args, options).await?.wait().await
    }

    /// Fail a pending call as if its timer had fired.
    ///
    /// Returns `false` if the id is not pending.
    pub fn cancel(&self, id: &str) -> bool {
        match self.take_pending(id) {
            Some(entry) => {
                tracing::debug!("Cancelled {} ({})", entry.method, id);
                let method = entry.method.clone();
                entry.resolve(Err(TransportError::RequestTimeout {
                    method,
                    id: id.to_string(),
                }));
                true
            }
            None => false,
        }
    }

    fn take_pending(&self, id: &str) -> Option<PendingEntry> {
        let entry = self.inner.state.lock().pending.remove(id);
        if let Some(entry) = &entry {
            entry.expiry.abort();
        }
        entry
    }

    /// Spawn the timer that fails `id` with `RequestTimeout` at `deadline`,
    /// whether or not anyone is waiting on it
    fn arm_expiry(&self, id: &str, deadline: Instant) -> AbortHandle {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let coordinator = Coordinator { inner };
            if let Some(entry) = coordinator.take_pending(&id) {
                tracing::warn!("{} ({}) timed out", entry.method, id);
                let method = entry.method.clone();
                entry.resolve(Err(TransportError::RequestTimeout { method, id }));
            }
        })
        .abort_handle()
    }

    /// Ids of calls awaiting a response, sorted
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().pending.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    // ========================================================================
    // Shutdown and liveness
    // ========================================================================

    /// Terminate every connection, fail every pending call with
    /// `ServerClosed` and refuse new connections. Idempotent.
    pub fn close(&self) {
        let (connections, pending, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.connections),
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.waiters),
            )
        };

        self.inner.shutdown.send_replace(true);
        tracing::info!(
            "Closing transport: {} connection(s), {} pending call(s)",
            connections.len(),
            pending.len()
        );

        for connection in &connections {
            connection.terminate("server closed");
        }
        for (id, entry) in pending {
            tracing::debug!("Failing {} ({}): server closed", entry.method, id);
            entry.resolve(Err(TransportError::ServerClosed));
        }
        // dropping the senders fails every waiter with ServerClosed
        drop(waiters);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Ping every connection and terminate those silent for longer than
    /// `timeout`. Returns how many were terminated.
    pub fn probe_liveness(&self, timeout: Duration) -> usize {
        let connections = self.inner.state.lock().connections.clone();
        let mut terminated = 0;

        for connection in connections {
            let idle = connection.idle_time();
            if idle > timeout {
                tracing::warn!(
                    "No pong from {} ({}) for {:?}, terminating",
                    connection.label(),
                    connection.id(),
                    idle
                );
                connection.terminate("liveness timeout");
                self.on_connection_closed(&connection);
                terminated += 1;
                continue;
            }

            let nonce = self.inner.next_ping.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = connection.try_send(Outbound::Ping(nonce)) {
                tracing::debug!("Ping to {} not queued: {}", connection.label(), err);
            }
        }

        terminated
    }

    /// Spawn the periodic liveness prober. Returns `None` when the
    /// configured interval is zero. The task ends on [`close`](Self::close).
    pub fn start_liveness(&self) -> Option<JoinHandle<()>> {
        let interval_ms = self.inner.config.liveness_interval_ms;
        if interval_ms == 0 {
            return None;
        }
        let timeout = Duration::from_millis(self.inner.config.liveness_timeout_ms);
        let coordinator = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let shutdown = coordinator.closed();
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.probe_liveness(timeout);
                    }
                    _ = &mut shutdown => break,
                }
            }

            tracing::debug!("Liveness prober stopped");
        }))
    }
}

async fn invoke_handler(handler: Arc<dyn MethodHandler>, request: Request) -> Frame {
    let Request { id, method, args } = request;

    // a separate task turns a panicking handler into a JoinError
    let outcome = tokio::spawn(async move { handler.handle(args).await }).await;

    match outcome {
        Ok(Ok(result)) => build_response_ok(&id, result).unwrap_or_else(|err| {
            tracing::warn!("Handler {} returned an unusable result: {}", method, err);
            build_response_error(&id, &err.to_string())
        }),
        Ok(Err(err)) => {
            tracing::debug!("Handler {} ({}) failed: {:#}", method, id, err);
            build_response_error(&id, &err.to_string())
        }
        Err(err) => {
            tracing::error!("Handler {} ({}) panicked: {}", method, id, err);
            build_response_error(&id, "handler panicked")
        }
    }
}

/// An outbound call that has been sent and is awaiting its response.
///
/// Dropping it without waiting removes the pending entry.
pub struct PendingCall {
    id: String,
    method: String,
    deadline: Instant,
    rx: oneshot::Receiver<CallResult>,
    coordinator: Coordinator,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn timeout_error(&self) -> TransportError {
        TransportError::RequestTimeout {
            method: self.method.clone(),
            id: self.id.clone(),
        }
    }

    /// Wait for the response, the deadline, a cancel or shutdown.
    ///
    /// A response that arrives after the deadline is never returned, even
    /// if nobody was waiting when the deadline passed.
    pub async fn wait(mut self) -> TransportResult<Frame> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ServerClosed),
            Err(_) => {
                if self.coordinator.take_pending(&self.id).is_some() {
                    tracing::warn!("{} ({}) timed out", self.method, self.id);
                    return Err(self.timeout_error());
                }
                // resolved by someone else right as the timer fired
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(self.timeout_error()),
                }
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.coordinator.take_pending(&self.id);
    }
}
