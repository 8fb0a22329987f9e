//! Handler registry for dispatching inbound frames by message id.
//!
//! The registry is built once, wrapped in an `Arc` and shared by every
//! session that uses it. Lookups are read-only, so no locking is needed.
//!
//! # Example
//!
//! ```
//! use framelink::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // Raw handler: echo the payload back under id 2
//! registry.register(1, |req| async move {
//!     req.reply(2, req.bytes()).await
//! });
//!
//! // Typed handler: payload decoded from MsgPack first
//! registry.register_typed(3, |name: String, req| async move {
//!     req.reply_msgpack(4, &format!("hello {name}")).await
//! });
//!
//! assert!(registry.contains(1));
//! assert_eq!(registry.len(), 2);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::Request;
use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for frame handlers.
///
/// Handlers run inline on the session's read task: the next frame is not
/// read until the handler's future resolves. A handler that needs to do
/// long work should spawn it.
pub trait Handler: Send + Sync + 'static {
    /// Handle one inbound frame.
    fn call(&self, request: Request) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure taking a [`Request`] as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(request))
    }
}

/// Wrapper that deserializes the MsgPack payload before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, Request) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, Request) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, Request) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match MsgPackCodec::decode(request.payload()) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(parsed, request))
    }
}

/// Registry mapping message ids to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u32, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `id`, replacing any previous handler.
    pub fn register<F, Fut>(&mut self, id: u32, handler: F) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(id, handler_fn(handler))
    }

    /// Register a handler whose payload is decoded from MsgPack first.
    ///
    /// Frames that fail to decode are reported as handler errors.
    pub fn register_typed<F, T, Fut>(&mut self, id: u32, handler: F) -> &mut Self
    where
        F: Fn(T, Request) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(id, TypedHandler::new(handler))
    }

    /// Register any [`Handler`] implementation for `id`.
    pub fn register_handler<H: Handler>(&mut self, id: u32, handler: H) -> &mut Self {
        self.handlers.insert(id, Arc::new(handler));
        self
    }

    /// Handler registered for `id`.
    pub fn get(&self, id: u32) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(&id)
    }

    /// True if a handler is registered for `id`.
    pub fn contains(&self, id: u32) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Registered message ids, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.handlers.keys().copied()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a request to its handler.
    ///
    /// Returns `None` when no handler is registered for the request's id;
    /// such frames are discarded by the caller.
    pub async fn dispatch(&self, request: Request) -> Option<HandlerResult> {
        let handler = self.handlers.get(&request.id())?.clone();
        Some(handler.call(request).await)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<u32> = self.ids().collect();
        ids.sort_unstable();
        f.debug_struct("HandlerRegistry").field("ids", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::error::FramelinkError;
    use crate::protocol::{Frame, FrameCodec};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn request(id: u32, payload: &[u8]) -> Request {
        let (conn, _rx) = Connection::new(CancellationToken::new(), FrameCodec::default(), None);
        Request::new(conn, Frame::from_slice(id, payload))
    }

    #[tokio::test]
    async fn test_dispatch_by_id() {
        let seen = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();

        let s = seen.clone();
        registry.register(5, move |req| {
            let s = s.clone();
            async move {
                s.store(req.id() + req.payload().len() as u32, Ordering::SeqCst);
                Ok(())
            }
        });

        let result = registry.dispatch(request(5, b"abc")).await;

        assert!(matches!(result, Some(Ok(()))));
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_dispatched() {
        let mut registry = HandlerRegistry::new();
        registry.register(1, |_req| async { Ok(()) });

        assert!(registry.dispatch(request(99, b"")).await.is_none());
        assert!(registry.get(99).is_none());
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_msgpack() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed(2, |value: (u8, String), _req| async move {
            assert_eq!(value, (1, "one".to_string()));
            Ok(())
        });

        let payload = MsgPackCodec::encode(&(1u8, "one")).unwrap();
        assert!(matches!(
            registry.dispatch(request(2, &payload)).await,
            Some(Ok(()))
        ));
    }

    #[tokio::test]
    async fn test_typed_handler_decode_error() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed(2, |_: u64, _req| async { Ok(()) });

        let result = registry.dispatch(request(2, b"\xc1")).await;

        assert!(matches!(result, Some(Err(FramelinkError::Codec(_)))));
    }

    #[test]
    fn test_register_replaces_and_lists_ids() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(1, |_req| async { Ok(()) })
            .register(2, |_req| async { Ok(()) })
            .register(1, |_req| async { Ok(()) });

        assert_eq!(registry.len(), 2);
        let mut ids: Vec<u32> = registry.ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(format!("{registry:?}"), "HandlerRegistry { ids: [1, 2] }");
    }
}
