//! Inbound request passed to handlers.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::Frame;

/// One decoded inbound frame together with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Request {
    connection: Connection,
    frame: Frame,
}

impl Request {
    pub(crate) fn new(connection: Connection, frame: Frame) -> Self {
        Self { connection, frame }
    }

    /// Message id from the frame header.
    #[inline]
    pub fn id(&self) -> u32 {
        self.frame.id()
    }

    /// Raw payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.frame.payload()
    }

    /// Payload as a cheaply cloneable buffer.
    pub fn bytes(&self) -> Bytes {
        self.frame.payload.clone()
    }

    /// The connection the frame arrived on.
    #[inline]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Decode the payload as MsgPack.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(self.payload())
    }

    /// Send a frame back on the same connection.
    pub async fn reply(&self, id: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.connection.send(id, payload).await
    }

    /// Send a MsgPack-encoded value back on the same connection.
    pub async fn reply_msgpack<T>(&self, id: u32, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.connection.send_msgpack(id, value).await
    }
}
