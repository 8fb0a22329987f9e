//! Session driver - runs one transport.
//!
//! A session owns a transport for its whole life and runs three tasks on a
//! shared [`TaskTracker`]:
//!
//! ```text
//!                 ┌─► callback task: on_connected(conn)
//! SessionDriver ──┼─► read task:  decode frame ─► handler (inline)
//!                 └─► send task:  outbound cell ─► encode ─► transport
//! ```
//!
//! All three share one cancellation token with the session's [`Connection`].
//! The first fault (read or write error) is recorded and tears the session
//! down; an explicit stop records [`FramelinkError::ClosedByRequest`] unless a
//! fault got there first. The stopped signal fires only once every task has
//! returned, and every frame handed to the send task gets exactly one outcome.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use framelink::{HandlerRegistry, SessionDriver};
//!
//! let (transport, _peer) = tokio::io::duplex(4096);
//! let driver = SessionDriver::builder(Arc::new(HandlerRegistry::new())).spawn(transport);
//!
//! driver.stop().await;
//! assert!(driver.error().unwrap().to_string().contains("closed by request"));
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::ack::Completion;
use crate::config::SessionConfig;
use crate::connection::{Connection, OutboundRx, Property};
use crate::error::FramelinkError;
use crate::handler::{BoxFuture, HandlerRegistry, Request};
use crate::protocol::FrameCodec;
use crate::transport::Transport;

/// Upper bound on the graceful write shutdown at teardown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback run once per session, concurrently with the read and send tasks.
pub type ConnectedHook = Box<dyn FnOnce(Connection) -> BoxFuture<'static, ()> + Send>;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Tasks are being spawned.
    Starting,
    /// Reading and writing frames.
    Running,
    /// Teardown started; tasks are finishing.
    Draining,
    /// Every task has returned.
    Stopped,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Builder for a [`SessionDriver`].
pub struct SessionBuilder {
    handlers: Arc<HandlerRegistry>,
    config: SessionConfig,
    parent: Option<CancellationToken>,
    attachment: Option<Property>,
    on_connected: Option<ConnectedHook>,
}

impl SessionBuilder {
    /// Start a builder dispatching inbound frames to `handlers`.
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            handlers,
            config: SessionConfig::default(),
            parent: None,
            attachment: None,
            on_connected: None,
        }
    }

    /// Set the session configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Tie the session to `parent`: cancelling it stops the session.
    pub fn parent(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Value exposed through [`Connection::attachment`].
    pub fn attachment(mut self, attachment: Option<Property>) -> Self {
        self.attachment = attachment;
        self
    }

    /// Run `hook` with the connection once the session is up.
    pub fn on_connected<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(Connection) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connected = Some(Box::new(move |conn| -> BoxFuture<'static, ()> {
            Box::pin(hook(conn))
        }));
        self
    }

    /// Take ownership of `transport` and start the session tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: Transport>(self, transport: T) -> SessionDriver {
        let lifecycle = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let codec = FrameCodec::new(self.config.max_frame_size);
        let (connection, outbound) = Connection::new(lifecycle.clone(), codec, self.attachment);

        let shared = Arc::new(Shared {
            connection,
            lifecycle,
            tracker: TaskTracker::new(),
            error: OnceLock::new(),
            state: AtomicU8::new(SessionState::Starting as u8),
            stopped: Completion::new(),
        });
        tracing::debug!(conn = shared.connection.id(), "session starting");

        let (reader, writer) = tokio::io::split(transport);

        if let Some(hook) = self.on_connected {
            shared.tracker.spawn(hook(shared.connection.clone()));
        }
        shared
            .tracker
            .spawn(read_loop(shared.clone(), reader, self.handlers, codec));
        shared
            .tracker
            .spawn(send_loop(shared.clone(), writer, outbound, codec));
        shared.tracker.close();

        let _ = shared.state.compare_exchange(
            SessionState::Starting as u8,
            SessionState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let supervisor = shared.clone();
        tokio::spawn(async move {
            supervisor.tracker.wait().await;
            supervisor.lifecycle.cancel();
            supervisor
                .state
                .store(SessionState::Stopped as u8, Ordering::Release);
            tracing::debug!(
                conn = supervisor.connection.id(),
                error = ?supervisor.error.get(),
                "session stopped"
            );
            supervisor.stopped.fire(());
        });

        SessionDriver { shared }
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .field("attachment", &self.attachment)
            .finish_non_exhaustive()
    }
}

struct Shared {
    connection: Connection,
    lifecycle: CancellationToken,
    tracker: TaskTracker,
    error: OnceLock<FramelinkError>,
    state: AtomicU8,
    stopped: Completion<()>,
}

impl Shared {
    /// Record `err` as the session error if none is set, then tear down.
    fn fail(&self, err: FramelinkError) {
        let _ = self.error.set(err);
        self.begin_draining();
        self.lifecycle.cancel();
    }

    fn stop(&self) {
        self.fail(FramelinkError::ClosedByRequest);
    }

    fn begin_draining(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < SessionState::Draining as u8).then_some(SessionState::Draining as u8)
            });
    }
}

/// Handle to a running session.
#[derive(Clone)]
pub struct SessionDriver {
    shared: Arc<Shared>,
}

impl SessionDriver {
    /// Start building a session.
    pub fn builder(handlers: Arc<HandlerRegistry>) -> SessionBuilder {
        SessionBuilder::new(handlers)
    }

    /// Start a session over `transport` with no parent token or attachment.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: Transport>(
        transport: T,
        handlers: Arc<HandlerRegistry>,
        config: SessionConfig,
        on_connected: Option<ConnectedHook>,
    ) -> Self {
        let mut builder = SessionBuilder::new(handlers).config(config);
        builder.on_connected = on_connected;
        builder.spawn(transport)
    }

    /// The session's connection handle.
    #[inline]
    pub fn connection(&self) -> &Connection {
        &self.shared.connection
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        let state = SessionState::from_u8(self.shared.state.load(Ordering::Acquire));
        if state == SessionState::Running && self.shared.lifecycle.is_cancelled() {
            return SessionState::Draining;
        }
        state
    }

    /// The error that ended the session, once teardown has started.
    pub fn error(&self) -> Option<FramelinkError> {
        self.shared.error.get().cloned()
    }

    /// The session's cancellation token. Cancelling it stops the session.
    pub fn lifecycle(&self) -> CancellationToken {
        self.shared.lifecycle.clone()
    }

    /// True once every session task has returned.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.is_done()
    }

    /// Begin teardown and return a future resolving once it is complete.
    ///
    /// Teardown starts immediately, whether or not the future is awaited.
    /// Idempotent.
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        self.shared.stop();
        self.stopped()
    }

    /// Resolves once every session task has returned.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let shared = self.shared.clone();
        async move { shared.stopped.wait().await }
    }
}

impl fmt::Debug for SessionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDriver")
            .field("connection", &self.shared.connection)
            .field("state", &self.state())
            .field("error", &self.shared.error.get())
            .finish()
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut reader: R,
    handlers: Arc<HandlerRegistry>,
    codec: FrameCodec,
) where
    R: AsyncRead + Unpin,
{
    let conn_id = shared.connection.id();
    loop {
        let decoded = tokio::select! {
            biased;
            _ = shared.lifecycle.cancelled() => break,
            decoded = codec.decode(&mut reader) => decoded,
        };

        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(conn = conn_id, "read loop ended: {}", e);
                shared.fail(e);
                return;
            }
        };

        let id = frame.id();
        match handlers
            .dispatch(Request::new(shared.connection.clone(), frame))
            .await
        {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::warn!(conn = conn_id, id, "handler error: {}", e);
            }
            None => {
                tracing::debug!(conn = conn_id, id, "no handler registered, frame discarded");
            }
        }
    }
    shared.stop();
}

async fn send_loop<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut outbound: OutboundRx,
    codec: FrameCodec,
) where
    W: AsyncWrite + Unpin,
{
    let conn_id = shared.connection.id();
    let lifecycle = shared.lifecycle.clone();

    loop {
        let cell = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => break,
            cell = outbound.recv() => match cell {
                Some(cell) => cell,
                None => break,
            },
        };

        let mut fault = None;
        {
            let writer = &mut writer;
            let fault = &mut fault;
            let frame = cell.frame().clone();
            let lifecycle = &lifecycle;
            cell.complete(move || async move {
                let outcome = tokio::select! {
                    biased;
                    _ = lifecycle.cancelled() => Err(FramelinkError::Closed),
                    written = codec.encode(writer, frame.id(), frame.payload()) => written,
                };
                if let Err(e) = &outcome {
                    if !matches!(e, FramelinkError::Closed) {
                        *fault = Some(e.clone());
                    }
                }
                outcome
            })
            .await;
        }

        if let Some(e) = fault {
            tracing::warn!(conn = conn_id, "send loop ended: {}", e);
            shared.fail(e);
            break;
        }
    }

    // Cells that made it into the queue but were never claimed.
    outbound.close();
    while let Ok(cell) = outbound.try_recv() {
        cell.fail(FramelinkError::Closed);
    }

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
    shared.stop();
}
