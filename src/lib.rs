//! # framelink
//!
//! Length-prefixed framed messaging over any duplex byte stream.
//!
//! Every message travels as one frame:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ id (u32 BE)  │ len (u32 BE) │ payload (len bytes) │
//! └──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! ## Architecture
//!
//! - **Session** ([`SessionDriver`]): owns one transport and runs a read
//!   task (decode, dispatch to handlers), a send task (the single writer) and
//!   an optional on-connected callback, all under one cancellation token.
//! - **Connection** ([`Connection`]): cloneable handle used to send. Each send
//!   waits for the actual write outcome.
//! - **Client** ([`Client`]): dials, runs one session at a time and asks a
//!   [`ClientPolicy`] what to do after failures.
//! - **Server** ([`Server`]): N acceptor tasks over one listener, with an
//!   admission ceiling on concurrent sessions.
//!
//! ## Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> framelink::Result<()> {
//! use std::sync::Arc;
//! use framelink::{Client, Server};
//! use framelink::transport::memory;
//!
//! let (connector, listener) = memory::channel(64 * 1024);
//!
//! let server = Server::builder()
//!     .listener(listener)
//!     .handle(1, |req| async move { req.reply(2, req.bytes()).await })
//!     .build()?;
//! let _done = server.start(4);
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(1);
//! let client = Client::builder()
//!     .dialer(Arc::new(connector))
//!     .handle(2, move |req| {
//!         let tx = tx.clone();
//!         async move {
//!             let _ = tx.send(req.bytes()).await;
//!             Ok(())
//!         }
//!     })
//!     .start()?;
//!
//! client.send(1, &b"ping"[..]).await?;
//! assert_eq!(&rx.recv().await.unwrap()[..], b"ping");
//!
//! client.stop().await;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod client;
mod server;
mod session;

pub use client::{Client, ClientBuilder, ClientPolicy, StopOnError};
pub use config::{ClientConfig, ServerConfig, SessionConfig};
pub use connection::{Connection, Property, PropertyStore};
pub use error::{FramelinkError, Result};
pub use handler::{HandlerRegistry, Request};
pub use server::{NoopPolicy, Server, ServerBuilder, ServerPolicy};
pub use session::{ConnectedHook, SessionBuilder, SessionDriver, SessionState};
