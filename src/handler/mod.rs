//! Handler module - inbound frame dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps message ids to handlers
//! - [`Request`] - the inbound frame plus the connection it arrived on
//!
//! Frames whose id has no registered handler are discarded.
//!
//! # Example
//!
//! ```
//! use framelink::handler::{handler_fn, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register_handler(
//!     10,
//!     handler_fn(|req| async move {
//!         tracing::info!(len = req.payload().len(), "ping");
//!         req.reply(11, &b"pong"[..]).await
//!     }),
//! );
//! ```

mod registry;
mod request;

pub use registry::{
    handler_fn, BoxFuture, Handler, HandlerFn, HandlerRegistry, HandlerResult, TypedHandler,
};
pub use request::Request;
