//! MsgPack codec using `rmp-serde`.
//!
//! Structs are encoded with `to_vec_named` (struct-as-map) so that payloads
//! stay readable by peers that decode by field name rather than position.
//!
//! # Example
//!
//! ```
//! use framelink::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Login {
//!     user: String,
//!     token: u64,
//! }
//!
//! let msg = Login { user: "ana".to_string(), token: 7 };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Login = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for structured payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
