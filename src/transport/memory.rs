//! In-process transports built on [`tokio::io::duplex`].
//!
//! [`channel`] returns a connected pair: every [`MemoryConnector::connect`]
//! creates a duplex stream and hands the far end to the [`MemoryListener`].
//! Useful for tests and for embedding a client and server in one process.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> std::io::Result<()> {
//! use framelink::transport::{memory, Listener};
//!
//! let (connector, listener) = memory::channel(4096);
//! let _client_side = connector.connect().await?;
//! let accepted = listener.accept().await?;
//! assert!(accepted.attachment.is_some());
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{dial_cancelled, listener_closed, Accepted, BoxTransport, Dialer, Listener};

/// Pending connections queued between connector and listener.
const BACKLOG: usize = 128;

struct Pending {
    stream: DuplexStream,
    peer: u64,
}

/// Create a connected connector/listener pair.
///
/// `buffer` is the per-direction capacity of each duplex stream.
pub fn channel(buffer: usize) -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::channel(BACKLOG);
    let closed = CancellationToken::new();
    let connector = MemoryConnector {
        tx,
        buffer,
        closed: closed.clone(),
        next_peer: Arc::new(AtomicU64::new(1)),
    };
    let listener = MemoryListener {
        rx: Mutex::new(rx),
        closed,
    };
    (connector, listener)
}

/// Client side of an in-process listener.
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::Sender<Pending>,
    buffer: usize,
    closed: CancellationToken,
    next_peer: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Open a stream to the listener.
    ///
    /// Fails with `ConnectionRefused` once the listener is closed or dropped.
    pub async fn connect(&self) -> io::Result<DuplexStream> {
        if self.closed.is_cancelled() {
            return Err(refused());
        }
        let (local, remote) = tokio::io::duplex(self.buffer);
        let pending = Pending {
            stream: remote,
            peer: self.next_peer.fetch_add(1, Ordering::Relaxed),
        };
        self.tx.send(pending).await.map_err(|_| refused())?;
        Ok(local)
    }
}

#[async_trait]
impl Dialer for MemoryConnector {
    async fn dial(&self, cancel: &CancellationToken) -> io::Result<BoxTransport> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(dial_cancelled()),
            stream = self.connect() => stream?,
        };
        let transport: BoxTransport = Box::new(stream);
        Ok(transport)
    }
}

/// Server side of an in-process listener.
///
/// Accepted connections carry `memory:{n}` as a
/// [`Property::Text`](crate::Property::Text) attachment.
pub struct MemoryListener {
    rx: Mutex<mpsc::Receiver<Pending>>,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> io::Result<Accepted> {
        if self.closed.is_cancelled() {
            return Err(listener_closed());
        }
        let next = async { self.rx.lock().await.recv().await };
        let pending = tokio::select! {
            _ = self.closed.cancelled() => return Err(listener_closed()),
            pending = next => pending.ok_or_else(listener_closed)?,
        };
        Ok(Accepted::new(pending.stream).with_attachment(format!("memory:{}", pending.peer)))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn refused() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Property;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_and_accept() {
        let (connector, listener) = channel(64);

        let mut client = connector.connect().await.unwrap();
        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.attachment, Some(Property::from("memory:1")));

        client.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        accepted.transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn test_close_refuses_and_unblocks() {
        let (connector, listener) = channel(64);
        let listener = Arc::new(listener);

        let pending = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await }
        });
        tokio::task::yield_now().await;

        listener.close();
        assert!(pending.await.unwrap().is_err());
        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_dial_through_trait() {
        let (connector, listener) = channel(64);
        let dialer: Arc<dyn Dialer> = Arc::new(connector);

        let mut dialed = dialer.dial(&CancellationToken::new()).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        accepted.transport.write_all(b"x").await.unwrap();
        assert_eq!(dialed.read_u8().await.unwrap(), b'x');
    }
}
