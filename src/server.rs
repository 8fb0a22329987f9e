//! Server - acceptor tasks and admission control.
//!
//! A [`Server`] runs N acceptor tasks against one shared [`Listener`]. Each
//! accepted transport is admitted only while the number of live sessions is
//! below the configured ceiling; transports over the ceiling are dropped
//! immediately without any handshake.
//!
//! ```text
//! Listener ──► acceptor 1 ─┐
//!          ──► acceptor 2 ─┼─► admitted? ──yes──► SessionDriver ──► on_session_error
//!          ──► acceptor N ─┘        └──no───► drop transport
//! ```
//!
//! # Example
//!
//! ```ignore
//! use framelink::{Server, transport::TcpAcceptor};
//!
//! let server = Server::builder()
//!     .listener(TcpAcceptor::bind("0.0.0.0:7000").await?)
//!     .handle(1, |req| async move { req.reply(2, req.bytes()).await })
//!     .max_connections(512)
//!     .build()?;
//!
//! let done = server.start(8);
//! tokio::signal::ctrl_c().await?;
//! server.stop().await;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::ack::Completion;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{FramelinkError, Result};
use crate::handler::{HandlerRegistry, HandlerResult, Request};
use crate::session::SessionDriver;
use crate::transport::{Accepted, Listener};

/// Pause after a transient accept error before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Hooks invoked by a [`Server`] for each served session.
#[async_trait]
pub trait ServerPolicy: Send + Sync + 'static {
    /// Called once per session, concurrently with frame processing.
    async fn on_connected(&self, _connection: Connection) {}

    /// Called after a session has fully stopped, with the error that ended it.
    async fn on_session_error(&self, _connection: &Connection, _error: &FramelinkError) {}
}

/// Policy with no hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPolicy;

impl ServerPolicy for NoopPolicy {}

/// Builder for configuring a [`Server`].
pub struct ServerBuilder {
    listener: Option<Arc<dyn Listener>>,
    registry: HandlerRegistry,
    config: ServerConfig,
    policy: Arc<dyn ServerPolicy>,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            listener: None,
            registry: HandlerRegistry::new(),
            config: ServerConfig::default(),
            policy: Arc::new(NoopPolicy),
        }
    }

    /// Listener to accept transports from.
    pub fn listener<L: Listener>(mut self, listener: L) -> Self {
        self.listener = Some(Arc::new(listener));
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

    /// Set the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the admission ceiling.
    ///
    /// Default: 1024
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the maximum payload size.
    ///
    /// Default: 8 KiB
    pub fn max_frame_size(mut self, max: u32) -> Self {
        self.config.max_frame_size = max;
        self
    }

    /// Set the session hooks.
    pub fn policy<P: ServerPolicy>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Validate the configuration and build the server. Nothing runs until
    /// [`Server::start`].
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        let listener = self
            .listener
            .ok_or_else(|| FramelinkError::Config("server requires a listener".to_string()))?;

        Ok(Server {
            shared: Arc::new(ServerShared {
                listener,
                registry: Arc::new(self.registry),
                config: self.config,
                policy: self.policy,
                lifecycle: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                admitted: AtomicUsize::new(0),
                served: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                stopped: Completion::new(),
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("has_listener", &self.listener.is_some())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct ServerShared {
    listener: Arc<dyn Listener>,
    registry: Arc<HandlerRegistry>,
    config: ServerConfig,
    policy: Arc<dyn ServerPolicy>,
    lifecycle: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    running: AtomicBool,
    admitted: AtomicUsize,
    served: AtomicU64,
    rejected: AtomicU64,
    stopped: Completion<()>,
}

impl ServerShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.lifecycle.is_cancelled()
    }

    /// Reserve an admission slot, or refuse if the ceiling is reached.
    fn admit(&self) -> bool {
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_connections).then_some(n + 1)
            })
            .is_ok()
    }
}

/// A server accepting transports from a [`Listener`].
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Start `acceptors` acceptor tasks and return a future resolving once
    /// the server has fully stopped.
    ///
    /// Only the first call starts anything; later calls just return the
    /// stopped future. Must be called from within a tokio runtime.
    pub fn start(&self, acceptors: usize) -> impl Future<Output = ()> + Send + 'static {
        let shared = &self.shared;
        if !shared.started.swap(true, Ordering::AcqRel) {
            let acceptors = acceptors.max(1);
            shared.running.store(true, Ordering::Release);
            tracing::info!(
                acceptors,
                max_connections = shared.config.max_connections,
                "server starting"
            );

            for worker in 0..acceptors {
                shared.tracker.spawn(accept_loop(shared.clone(), worker));
            }
            shared.tracker.close();

            let watcher = shared.clone();
            tokio::spawn(async move {
                watcher.tracker.wait().await;
                tracing::info!(
                    served = watcher.served.load(Ordering::Relaxed),
                    rejected = watcher.rejected.load(Ordering::Relaxed),
                    "server stopped"
                );
                watcher.stopped.fire(());
            });
        }
        self.stopped()
    }

    /// Start with the configured number of acceptors.
    pub fn start_default(&self) -> impl Future<Output = ()> + Send + 'static {
        self.start(self.shared.config.acceptors)
    }

    /// Stop accepting, stop every session and return a future resolving once
    /// all tasks have exited.
    ///
    /// Teardown starts immediately, whether or not the future is awaited.
    /// Idempotent; stopping a server that was never started prevents it from
    /// starting.
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        let shared = &self.shared;
        shared.running.store(false, Ordering::Release);
        shared.listener.close();
        shared.lifecycle.cancel();
        if !shared.started.swap(true, Ordering::AcqRel) {
            shared.stopped.fire(());
        }
        self.stopped()
    }

    /// Resolves once the server has fully stopped.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let shared = self.shared.clone();
        async move { shared.stopped.wait().await }
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Sessions currently admitted.
    pub fn active_connections(&self) -> usize {
        self.shared.admitted.load(Ordering::Acquire)
    }

    /// Sessions admitted since start.
    pub fn served(&self) -> u64 {
        self.shared.served.load(Ordering::Relaxed)
    }

    /// Transports refused at the ceiling since start.
    pub fn rejected(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("running", &self.is_running())
            .field("active_connections", &self.active_connections())
            .field("config", &self.shared.config)
            .finish()
    }
}

async fn accept_loop(shared: Arc<ServerShared>, worker: usize) {
    tracing::debug!(worker, "acceptor started");

    while shared.is_running() {
        let accepted = tokio::select! {
            biased;
            _ = shared.lifecycle.cancelled() => break,
            accepted = shared.listener.accept() => accepted,
        };

        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if !shared.is_running() {
                    break;
                }
                tracing::warn!(worker, "accept error: {}", e);
                tokio::select! {
                    _ = shared.lifecycle.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                }
            }
        };

        if !shared.admit() {
            shared.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                worker,
                peer = ?accepted.attachment,
                max_connections = shared.config.max_connections,
                "connection ceiling reached, dropping transport"
            );
            drop(accepted);
            continue;
        }

        shared.served.fetch_add(1, Ordering::Relaxed);
        shared.tracker.spawn(serve(shared.clone(), accepted));
    }

    tracing::debug!(worker, "acceptor stopped");
}

async fn serve(shared: Arc<ServerShared>, accepted: Accepted) {
    let hook = shared.policy.clone();
    let driver = SessionDriver::builder(shared.registry.clone())
        .config(shared.config.session())
        .parent(&shared.lifecycle)
        .attachment(accepted.attachment)
        .on_connected(move |conn| async move { hook.on_connected(conn).await })
        .spawn(accepted.transport);
    tracing::debug!(conn = driver.connection().id(), "session admitted");

    driver.stopped().await;
    shared.admitted.fetch_sub(1, Ordering::AcqRel);

    let err = driver.error().unwrap_or(FramelinkError::ClosedByRequest);
    tracing::debug!(conn = driver.connection().id(), "session ended: {}", err);
    shared
        .policy
        .on_session_error(driver.connection(), &err)
        .await;
}
