//! Client builder and reconnect loop.
//!
//! The [`ClientBuilder`] collects a dialer, handlers and a [`ClientPolicy`].
//! The [`Client`] then runs one session at a time:
//! 1. Dial a transport
//! 2. Run a session over it, relaying queued sends into the live connection
//! 3. When the dial or the session fails, ask the policy for the next dialer
//! 4. Stop when the policy returns `None` or [`Client::stop`] is called
//!
//! Sends go through the client rather than a specific connection, so callers
//! do not need to track reconnects. A send made while no session is live
//! waits for the next one.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use framelink::{Client, ClientPolicy, Connection, FramelinkError};
//! use framelink::transport::{Dialer, TcpDialer};
//!
//! struct Redial(Arc<dyn Dialer>);
//!
//! #[async_trait::async_trait]
//! impl ClientPolicy for Redial {
//!     async fn on_dial_error(&self, _err: &FramelinkError) -> Option<Arc<dyn Dialer>> {
//!         tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!         Some(self.0.clone())
//!     }
//!
//!     async fn on_session_error(&self, _conn: &Connection, _err: &FramelinkError) -> Option<Arc<dyn Dialer>> {
//!         Some(self.0.clone())
//!     }
//! }
//!
//! let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new("127.0.0.1:7000"));
//! let client = Client::builder()
//!     .dialer(dialer.clone())
//!     .handle(2, |req| async move {
//!         tracing::info!("pong: {} bytes", req.payload().len());
//!         Ok(())
//!     })
//!     .policy(Redial(dialer))
//!     .start()?;
//!
//! client.send(1, &b"ping"[..]).await?;
//! client.stop().await;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::ack::{AckCell, Completion};
use crate::codec::MsgPackCodec;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{FramelinkError, Result};
use crate::handler::{HandlerRegistry, HandlerResult, Request};
use crate::protocol::{Frame, FrameCodec};
use crate::session::SessionDriver;
use crate::transport::Dialer;

/// Decides what a [`Client`] does after a failure.
///
/// Returning `Some(dialer)` dials again (the same dialer or another one);
/// returning `None` stops the client. Any delay between attempts is up to
/// the implementation.
#[async_trait]
pub trait ClientPolicy: Send + Sync + 'static {
    /// Called when a dial attempt fails.
    async fn on_dial_error(&self, error: &FramelinkError) -> Option<Arc<dyn Dialer>>;

    /// Called when a session ends, with the error that ended it.
    async fn on_session_error(
        &self,
        connection: &Connection,
        error: &FramelinkError,
    ) -> Option<Arc<dyn Dialer>>;

    /// Called once per session, concurrently with frame processing.
    async fn on_connected(&self, _connection: Connection) {}
}

/// Policy that stops the client on the first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOnError;

#[async_trait]
impl ClientPolicy for StopOnError {
    async fn on_dial_error(&self, _error: &FramelinkError) -> Option<Arc<dyn Dialer>> {
        None
    }

    async fn on_session_error(
        &self,
        _connection: &Connection,
        _error: &FramelinkError,
    ) -> Option<Arc<dyn Dialer>> {
        None
    }
}

/// Builder for configuring and starting a [`Client`].
pub struct ClientBuilder {
    dialer: Option<Arc<dyn Dialer>>,
    registry: HandlerRegistry,
    config: ClientConfig,
    policy: Arc<dyn ClientPolicy>,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            dialer: None,
            registry: HandlerRegistry::new(),
            config: ClientConfig::default(),
            policy: Arc::new(StopOnError),
        }
    }

    /// Dialer used for the first attempt.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Register a handler for inbound frames with `id`.
    pub fn handle<F, Fut>(mut self, id: u32, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register(id, handler);
        self
    }

    /// Register a handler whose payload is decoded from MsgPack first.
    pub fn handle_typed<F, T, Fut>(mut self, id: u32, handler: F) -> Self
    where
        F: Fn(T, Request) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register_typed(id, handler);
        self
    }

    /// Replace the handler registry wholesale.
    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the client configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum payload size.
    ///
    /// Default: 8 KiB
    pub fn max_frame_size(mut self, max: u32) -> Self {
        self.config.max_frame_size = max;
        self
    }

    /// Set the failure policy.
    ///
    /// Default: [`StopOnError`]
    pub fn policy<P: ClientPolicy>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Start the client's run loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Client> {
        let dialer = self
            .dialer
            .ok_or_else(|| FramelinkError::Config("client requires a dialer".to_string()))?;
        Ok(Client::start(
            dialer,
            Arc::new(self.registry),
            self.config,
            self.policy,
        ))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("has_dialer", &self.dialer.is_some())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A queued client send waiting to be relayed into a live connection.
struct Relayed {
    cell: AckCell,
    cancel: CancellationToken,
}

struct ClientShared {
    lifecycle: CancellationToken,
    relay: mpsc::Sender<Arc<Relayed>>,
    live: watch::Sender<Option<Connection>>,
    stopped: Completion<()>,
    codec: FrameCodec,
    dial_attempts: AtomicU64,
    sessions: AtomicU64,
}

/// A running client.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn start(
        dialer: Arc<dyn Dialer>,
        registry: Arc<HandlerRegistry>,
        config: ClientConfig,
        policy: Arc<dyn ClientPolicy>,
    ) -> Self {
        let (relay, relay_rx) = mpsc::channel(1);
        let (live, _) = watch::channel(None);
        let shared = Arc::new(ClientShared {
            lifecycle: CancellationToken::new(),
            relay,
            live,
            stopped: Completion::new(),
            codec: FrameCodec::new(config.max_frame_size),
            dial_attempts: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
        });

        tokio::spawn(run(
            shared.clone(),
            dialer,
            relay_rx,
            registry,
            config,
            policy,
        ));

        Self { shared }
    }

    /// Send one frame on the current (or next) session and wait for the write outcome.
    pub async fn send(&self, id: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.send_until(id, payload.into(), CancellationToken::new())
            .await
    }

    /// Send one frame, giving up with `Cancelled` if `cancel` fires before a live
    /// session's send task claims it.
    pub async fn send_with_cancel(
        &self,
        id: u32,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.send_until(id, payload.into(), cancel.clone()).await
    }

    /// Send one frame, giving up with `Cancelled` if `timeout` elapses before a
    /// live session's send task claims it.
    pub async fn send_timeout(
        &self,
        id: u32,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        let _deadline = AbortOnDropHandle::new(tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            }
        }));
        self.send_until(id, payload.into(), cancel).await
    }

    /// Serialize `value` as MsgPack and send it.
    pub async fn send_msgpack<T>(&self, id: u32, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = MsgPackCodec::encode(value)?;
        self.send(id, payload).await
    }

    async fn send_until(
        &self,
        id: u32,
        payload: Bytes,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.shared.codec.check_len(payload.len())?;

        let relayed = Arc::new(Relayed {
            cell: AckCell::new(Frame::new(id, payload)),
            cancel,
        });
        let lifecycle = &self.shared.lifecycle;

        let permit = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => return Err(FramelinkError::Closed),
            _ = relayed.cancel.cancelled() => return Err(FramelinkError::Cancelled),
            permit = self.shared.relay.reserve() => {
                permit.map_err(|_| FramelinkError::Closed)?
            }
        };
        permit.send(relayed.clone());

        // Until the relay claims the cell no session has seen it, so either
        // token can still fail it. Once claimed, the connection's own send
        // keeps honouring `cancel` until its send task takes the frame.
        relayed
            .cell
            .wait_or_abort(async {
                tokio::select! {
                    biased;
                    _ = lifecycle.cancelled() => FramelinkError::Closed,
                    _ = relayed.cancel.cancelled() => FramelinkError::Cancelled,
                }
            })
            .await
    }

    /// Stop the client and return a future resolving once the run loop has exited.
    ///
    /// The live session, if any, is stopped; queued and blocked sends resolve
    /// with `Closed`. Teardown starts immediately, whether or not the future
    /// is awaited. Idempotent.
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        self.shared.lifecycle.cancel();
        self.stopped()
    }

    /// Resolves once the run loop has exited.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let shared = self.shared.clone();
        async move { shared.stopped.wait().await }
    }

    /// True until the client is stopped or its policy gives up.
    pub fn is_running(&self) -> bool {
        !self.shared.lifecycle.is_cancelled()
    }

    /// The live connection, if a session is currently running.
    pub fn connection(&self) -> Option<Connection> {
        self.shared
            .live
            .borrow()
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    /// Wait for a live connection. Returns `None` once the client has stopped.
    pub async fn connected(&self) -> Option<Connection> {
        let mut live = self.shared.live.subscribe();
        loop {
            let current = live.borrow_and_update().clone();
            if let Some(conn) = current.filter(|conn| !conn.is_closed()) {
                return Some(conn);
            }
            tokio::select! {
                _ = self.shared.lifecycle.cancelled() => return None,
                changed = live.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Number of dial attempts made so far.
    pub fn dial_attempts(&self) -> u64 {
        self.shared.dial_attempts.load(Ordering::Relaxed)
    }

    /// Number of sessions started so far.
    pub fn sessions(&self) -> u64 {
        self.shared.sessions.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("running", &self.is_running())
            .field("dial_attempts", &self.dial_attempts())
            .field("sessions", &self.sessions())
            .finish()
    }
}

async fn run(
    shared: Arc<ClientShared>,
    mut dialer: Arc<dyn Dialer>,
    mut relay_rx: mpsc::Receiver<Arc<Relayed>>,
    registry: Arc<HandlerRegistry>,
    config: ClientConfig,
    policy: Arc<dyn ClientPolicy>,
) {
    let lifecycle = shared.lifecycle.clone();

    while !lifecycle.is_cancelled() {
        let attempt = shared.dial_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(attempt, "dialing");

        let dialed = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => break,
            dialed = dialer.dial(&lifecycle) => dialed,
        };

        let next = match dialed {
            Err(e) => {
                let err = FramelinkError::dial(e);
                tracing::warn!(attempt, "dial failed: {}", err);
                policy.on_dial_error(&err).await
            }
            Ok(transport) => {
                shared.sessions.fetch_add(1, Ordering::Relaxed);

                let hook = policy.clone();
                let driver = SessionDriver::builder(registry.clone())
                    .config(config.session())
                    .parent(&lifecycle)
                    .on_connected(move |conn| async move { hook.on_connected(conn).await })
                    .spawn(transport);
                let conn = driver.connection().clone();
                tracing::info!(conn = conn.id(), attempt, "session established");

                shared.live.send_replace(Some(conn.clone()));
                relay(&mut relay_rx, &conn).await;
                driver.stop().await;
                shared.live.send_replace(None);

                let err = driver.error().unwrap_or(FramelinkError::ClosedByRequest);
                tracing::info!(conn = conn.id(), "session ended: {}", err);
                policy.on_session_error(&conn, &err).await
            }
        };

        match next {
            Some(next) => dialer = next,
            None => break,
        }
    }

    lifecycle.cancel();
    relay_rx.close();
    while let Ok(relayed) = relay_rx.try_recv() {
        relayed.cell.fail(FramelinkError::Closed);
    }
    shared.live.send_replace(None);
    tracing::debug!("client stopped");
    shared.stopped.fire(());
}

/// Move queued sends into `conn` until its session starts tearing down.
async fn relay(relay_rx: &mut mpsc::Receiver<Arc<Relayed>>, conn: &Connection) {
    loop {
        let relayed = tokio::select! {
            biased;
            _ = conn.closed() => return,
            relayed = relay_rx.recv() => match relayed {
                Some(relayed) => relayed,
                None => return,
            },
        };

        let frame = relayed.cell.frame().clone();
        let cancel = &relayed.cancel;
        relayed
            .cell
            .complete(move || conn.send_with_cancel(frame.id(), frame.payload, cancel))
            .await;
    }
}
