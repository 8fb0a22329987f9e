//! Codec module - serialization helpers for frame payloads.
//!
//! Frames carry opaque bytes. Applications that want structured payloads
//! can use [`MsgPackCodec`] directly, or the convenience wrappers
//! [`Connection::send_msgpack`](crate::Connection::send_msgpack) and
//! [`Request::decode`](crate::handler::Request::decode).
//!
//! ```
//! use framelink::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode("hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
