//! Unix domain socket dialer and acceptor.
//!
//! # Example
//!
//! ```ignore
//! use framelink::transport::{UnixAcceptor, UnixDialer};
//!
//! let path = UnixAcceptor::temp_path();
//! let acceptor = UnixAcceptor::bind(&path)?;
//! let dialer = UnixDialer::new(&path);
//! ```

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::{dial_cancelled, listener_closed, Accepted, BoxTransport, Dialer, Listener};
use crate::connection::Property;

/// Dials a Unix socket path.
#[derive(Debug, Clone)]
pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    /// Dial the socket at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Dialer for UnixDialer {
    async fn dial(&self, cancel: &CancellationToken) -> io::Result<BoxTransport> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(dial_cancelled()),
            stream = UnixStream::connect(&self.path) => stream?,
        };
        let transport: BoxTransport = Box::new(stream);
        Ok(transport)
    }
}

/// Accepts Unix socket connections.
///
/// The socket file is removed when the acceptor is dropped. Accepted
/// connections carry the socket path as a [`Property::Text`] attachment.
#[derive(Debug)]
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
    closed: CancellationToken,
}

impl UnixAcceptor {
    /// Bind to `path`, removing a stale socket file first.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            closed: CancellationToken::new(),
        })
    }

    /// A fresh socket path under the system temp directory.
    ///
    /// Format: `{tmp}/framelink-{pid}-{random}.sock`
    pub fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "framelink-{}-{:x}.sock",
            std::process::id(),
            rand_u64()
        ))
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Listener for UnixAcceptor {
    async fn accept(&self) -> io::Result<Accepted> {
        if self.closed.is_cancelled() {
            return Err(listener_closed());
        }
        let (stream, _peer) = tokio::select! {
            _ = self.closed.cancelled() => return Err(listener_closed()),
            accepted = self.listener.accept() => accepted?,
        };
        let path = self.path.to_string_lossy().into_owned();
        Ok(Accepted::new(stream).with_attachment(Property::Text(path)))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Cheap per-call randomness from the clock, a counter and the pid.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() as u64;
    nanos.wrapping_mul(0x517cc1b727220a95) ^ count.rotate_left(32) ^ pid
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_temp_path_unique() {
        let a = UnixAcceptor::temp_path();
        let b = UnixAcceptor::temp_path();
        assert_ne!(a, b);
        assert!(a
            .to_string_lossy()
            .contains(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let path = UnixAcceptor::temp_path();
        let acceptor = UnixAcceptor::bind(&path).unwrap();
        let dialer = UnixDialer::new(&path);

        let cancel = CancellationToken::new();
        let (dialed, accepted) = tokio::join!(dialer.dial(&cancel), acceptor.accept());
        let mut dialed = dialed.unwrap();
        let mut accepted = accepted.unwrap();

        accepted.transport.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        dialed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_drop_removes_socket_file() {
        let path = UnixAcceptor::temp_path();
        let acceptor = UnixAcceptor::bind(&path).unwrap();
        assert!(path.exists());

        drop(acceptor);
        assert!(!path.exists());
    }
}
