//! TCP dialer and acceptor.
//!
//! # Example
//!
//! ```ignore
//! use framelink::transport::{TcpAcceptor, TcpDialer};
//!
//! let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
//! let dialer = TcpDialer::new(acceptor.local_addr()?.to_string());
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use super::{dial_cancelled, listener_closed, Accepted, BoxTransport, Dialer, Listener};
use crate::connection::Property;

/// Dials a TCP address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    nodelay: bool,
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    /// Dial `addr` (`host:port`), with `TCP_NODELAY` enabled.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            nodelay: true,
            connect_timeout: None,
        }
    }

    /// Set `TCP_NODELAY` on dialed sockets.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Fail a dial that takes longer than `timeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Target address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let connect = TcpStream::connect(self.addr.as_str());
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
            None => connect.await?,
        };
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, cancel: &CancellationToken) -> io::Result<BoxTransport> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(dial_cancelled()),
            stream = self.connect() => stream?,
        };
        let transport: BoxTransport = Box::new(stream);
        Ok(transport)
    }
}

/// Accepts TCP connections.
///
/// Each accepted connection carries the peer address as a
/// [`Property::Text`] attachment.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    closed: CancellationToken,
    nodelay: bool,
}

impl TcpAcceptor {
    /// Bind to `addr`.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener))
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            closed: CancellationToken::new(),
            nodelay: true,
        }
    }

    /// Set `TCP_NODELAY` on accepted sockets.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> io::Result<Accepted> {
        if self.closed.is_cancelled() {
            return Err(listener_closed());
        }
        let (stream, peer) = tokio::select! {
            _ = self.closed.cancelled() => return Err(listener_closed()),
            accepted = self.listener.accept() => accepted?,
        };
        stream.set_nodelay(self.nodelay)?;
        Ok(Accepted::new(stream).with_attachment(Property::Text(peer.to_string())))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
