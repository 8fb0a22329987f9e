//! Connection - the handle applications use to send frames.
//!
//! A [`Connection`] is a cheap, cloneable handle onto one live session. It
//! never touches the transport itself: every send builds an [`AckCell`],
//! queues it for the session's send task and waits for the write outcome. Concurrent senders are therefore serialized
//! by the send task and frames never interleave on the wire.
//!
//! Send outcomes:
//! - `Ok(())` - the whole frame was written.
//! - `Err(Cancelled)` - the caller's token or deadline fired before handoff.
//! - `Err(Closed)` - the connection was torn down before the frame was written.
//! - `Err(OversizedFrame)` - the payload exceeds the session maximum; nothing queued.
//! - `Err(TransportWrite)` - the write itself failed.
//!
//! A frame is handed off when the send task claims its cell, not when it is
//! queued. From then on the caller's cancellation no longer matters and the
//! send waits for the real outcome. A queued cell that is cancelled first is
//! skipped by the send task.

mod properties;

pub use properties::{Property, PropertyStore};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ack::AckCell;
use crate::codec::MsgPackCodec;
use crate::error::{FramelinkError, Result};
use crate::protocol::{Frame, FrameCodec};

/// Sender side of a session's outbound queue.
pub(crate) type Outbound = mpsc::Sender<Arc<AckCell>>;

/// Receiver side of a session's outbound queue.
pub(crate) type OutboundRx = mpsc::Receiver<Arc<AckCell>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a live session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    outbound: Outbound,
    lifecycle: CancellationToken,
    codec: FrameCodec,
    attachment: Option<Property>,
    properties: PropertyStore,
}

impl Connection {
    /// Create a connection bound to `lifecycle` and its outbound queue.
    pub(crate) fn new(
        lifecycle: CancellationToken,
        codec: FrameCodec,
        attachment: Option<Property>,
    ) -> (Self, OutboundRx) {
        // one queued cell at a time; the send task claims it before writing
        let (outbound, rx) = mpsc::channel(1);
        let conn = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                outbound,
                lifecycle,
                codec,
                attachment,
                properties: PropertyStore::new(),
            }),
        };
        (conn, rx)
    }

    /// Process-unique connection id, useful for logging.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Maximum payload size accepted by [`send`](Self::send).
    #[inline]
    pub fn max_frame_size(&self) -> u32 {
        self.inner.codec.max_frame_size()
    }

    /// Opaque value supplied when the session was created.
    ///
    /// Acceptors attach the peer address here.
    pub fn attachment(&self) -> Option<&Property> {
        self.inner.attachment.as_ref()
    }

    /// Per-connection property store.
    pub fn properties(&self) -> &PropertyStore {
        &self.inner.properties
    }

    /// Send one frame and wait for the write outcome.
    pub async fn send(&self, id: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.send_until(id, payload.into(), std::future::pending::<()>())
            .await
    }

    /// Send one frame, giving up with `Cancelled` if `cancel` fires before the
    /// send task claims it.
    pub async fn send_with_cancel(
        &self,
        id: u32,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.send_until(id, payload.into(), cancel.cancelled()).await
    }

    /// Send one frame, giving up with `Cancelled` if `timeout` elapses before the
    /// send task claims it.
    pub async fn send_timeout(
        &self,
        id: u32,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<()> {
        self.send_until(id, payload.into(), tokio::time::sleep(timeout))
            .await
    }

    /// Serialize `value` as MsgPack and send it.
    pub async fn send_msgpack<T>(&self, id: u32, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = MsgPackCodec::encode(value)?;
        self.send(id, payload).await
    }

    async fn send_until<C>(&self, id: u32, payload: Bytes, cancelled: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        self.inner.codec.check_len(payload.len())?;

        let cell = Arc::new(AckCell::new(Frame::new(id, payload)));
        let lifecycle = &self.inner.lifecycle;
        let mut cancelled = std::pin::pin!(cancelled);

        let permit = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => return Err(FramelinkError::Closed),
            _ = &mut cancelled => return Err(FramelinkError::Cancelled),
            permit = self.inner.outbound.reserve() => {
                permit.map_err(|_| FramelinkError::Closed)?
            }
        };
        permit.send(cell.clone());

        // Queued is not handed off: the send task owns the frame only once it
        // claims the cell, and until then either token can still fail it.
        cell.wait_or_abort(async {
            tokio::select! {
                biased;
                _ = lifecycle.cancelled() => FramelinkError::Closed,
                _ = cancelled => FramelinkError::Cancelled,
            }
        })
        .await
    }

    /// Tear down the session this connection belongs to.
    ///
    /// Idempotent. Blocked and future sends resolve with `Closed`.
    pub fn close(&self) {
        self.inner.lifecycle.cancel();
    }

    /// True once the session has started tearing down.
    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_cancelled()
    }

    /// Resolves once the session has started tearing down.
    pub async fn closed(&self) {
        self.inner.lifecycle.cancelled().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("attachment", &self.inner.attachment)
            .finish()
    }
}
