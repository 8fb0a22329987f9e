//! Transport module - byte streams, dialers and listeners.
//!
//! A session runs over any bidirectional byte stream ([`Transport`]). How a
//! stream is obtained is abstracted by two traits:
//! - [`Dialer`] produces one outbound transport per call (clients)
//! - [`Listener`] yields accepted transports (servers)
//!
//! Implementations provided here:
//! - TCP ([`TcpDialer`], [`TcpAcceptor`])
//! - Unix domain sockets ([`UnixDialer`], [`UnixAcceptor`], unix only)
//! - In-process streams ([`memory::channel`]) for tests and embedding

pub mod memory;
mod tcp;
#[cfg(unix)]
mod unix;

pub use tcp::{TcpAcceptor, TcpDialer};
#[cfg(unix)]
pub use unix::{UnixAcceptor, UnixDialer};

use std::fmt;
use std::future::Future;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::connection::Property;

/// Bidirectional byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport.
pub type BoxTransport = Box<dyn Transport>;

/// Produces one outbound transport per call.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Open a transport.
    ///
    /// Implementations should give up promptly once `cancel` fires.
    async fn dial(&self, cancel: &CancellationToken) -> io::Result<BoxTransport>;
}

/// Adapter turning an async closure into a [`Dialer`].
pub struct DialFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Dialer`].
///
/// The closure receives a clone of the dial cancellation token.
///
/// ```
/// use framelink::transport::dial_fn;
///
/// let dialer = dial_fn(|_cancel| async {
///     let (client, _server) = tokio::io::duplex(1024);
///     Ok::<_, std::io::Error>(client)
/// });
/// # let _ = dialer;
/// ```
pub fn dial_fn<F, Fut, T>(f: F) -> DialFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<T>> + Send,
    T: Transport,
{
    DialFn { f }
}

#[async_trait]
impl<F, Fut, T> Dialer for DialFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<T>> + Send,
    T: Transport,
{
    async fn dial(&self, cancel: &CancellationToken) -> io::Result<BoxTransport> {
        let transport: BoxTransport = Box::new((self.f)(cancel.clone()).await?);
        Ok(transport)
    }
}

/// A transport yielded by a [`Listener`].
pub struct Accepted {
    /// The accepted stream.
    pub transport: BoxTransport,
    /// Opaque value exposed through [`Connection::attachment`](crate::Connection::attachment),
    /// typically the peer address.
    pub attachment: Option<Property>,
}

impl Accepted {
    /// Wrap a transport without an attachment.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
            attachment: None,
        }
    }

    /// Attach a value to the accepted transport.
    pub fn with_attachment(mut self, attachment: impl Into<Property>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("attachment", &self.attachment)
            .finish_non_exhaustive()
    }
}

/// Yields accepted transports.
///
/// `accept` is called concurrently from several acceptor tasks.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next inbound transport.
    ///
    /// Must return an error promptly once [`close`](Self::close) was called.
    async fn accept(&self) -> io::Result<Accepted>;

    /// Stop accepting. Idempotent.
    fn close(&self);
}

pub(crate) fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

pub(crate) fn dial_cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "dial cancelled")
}
