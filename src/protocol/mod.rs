//! Protocol module - wire format, frame type and the async frame codec.
//!
//! This module implements the binary framing used on every transport:
//! - 8-byte header encoding/decoding (`id`, `length`, both big-endian)
//! - Frame struct
//! - [`FrameCodec`] for reading and writing one frame at a time

mod codec;
mod frame;
mod wire_format;

pub use codec::FrameCodec;
pub use frame::{build_frame, Frame};
pub use wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, ID_SIZE, LENGTH_SIZE};
