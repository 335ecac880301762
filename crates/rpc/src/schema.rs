//! Typed call sugar over the name-based engine API.
//!
//! Nothing here changes what goes on the wire: every typed or proxied call
//! produces exactly the packet the equivalent [`Rpc::request`] or
//! [`Rpc::send`] call would.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use tether_rpc::{rpc_messages, rpc_requests, Rpc};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Multiply {
//!     a: i64,
//!     b: i64,
//! }
//!
//! rpc_requests! {
//!     pub trait Calculator {
//!         fn multiply(Multiply) -> i64 = "multiply";
//!     }
//! }
//!
//! rpc_messages! {
//!     pub trait Notifications {
//!         fn progress(u8) = "progress";
//!     }
//! }
//!
//! async fn example(rpc: Rpc) -> tether_rpc::Result<()> {
//!     let proxy = rpc.proxy();
//!     let product = proxy.request().multiply(Multiply { a: 6, b: 7 }).await?;
//!     proxy.send().progress(100)?;
//!     assert_eq!(product, 42);
//!     Ok(())
//! }
//! ```
//!
//! [`Rpc::request`]: crate::Rpc::request
//! [`Rpc::send`]: crate::Rpc::send

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::correlator::RequestFuture;
use crate::error::Result;
use crate::rpc::Rpc;

/// A request type bound to a method name.
///
/// Implemented on the params type; `Response` is what the peer answers with.
pub trait RpcRequest: Serialize {
    /// Method name on the wire.
    const METHOD: &'static str;

    /// Type the response payload decodes into.
    type Response: DeserializeOwned;
}

/// A message payload type bound to a message name.
pub trait RpcMessage: Serialize + DeserializeOwned {
    /// Message name on the wire.
    const NAME: &'static str;
}

/// A request whose response payload is decoded into `R`.
#[must_use = "dropping a TypedRequest cancels the request"]
pub struct TypedRequest<R> {
    inner: RequestFuture,
    _response: PhantomData<fn() -> R>,
}

impl<R> TypedRequest<R> {
    pub(crate) const fn new(inner: RequestFuture) -> Self {
        Self {
            inner,
            _response: PhantomData,
        }
    }

    /// Returns the underlying untyped request.
    pub fn into_inner(self) -> RequestFuture {
        self.inner
    }
}

impl<R: DeserializeOwned> Future for TypedRequest<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(Ok(payload)) => {
                Poll::Ready(serde_json::from_value(payload).map_err(Into::into))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Request half of an [`RpcProxy`].
#[derive(Clone, Debug)]
pub struct RequestProxy {
    rpc: Rpc,
}

impl RequestProxy {
    /// Same as [`Rpc::request`](crate::Rpc::request).
    pub fn call(&self, method: &str, params: impl Serialize) -> RequestFuture {
        self.rpc.request(method, params)
    }

    /// Like [`call`](Self::call) with the response decoded into `R`.
    pub fn call_as<R: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> TypedRequest<R> {
        TypedRequest::new(self.call(method, params))
    }
}

/// Message half of an [`RpcProxy`].
#[derive(Clone, Debug)]
pub struct MessageProxy {
    rpc: Rpc,
}

impl MessageProxy {
    /// Same as [`Rpc::send`](crate::Rpc::send).
    ///
    /// # Errors
    ///
    /// See [`Rpc::send`](crate::Rpc::send).
    pub fn emit(&self, name: &str, payload: impl Serialize) -> Result<()> {
        self.rpc.send(name, payload)
    }
}

/// Name-based call surface of an engine.
///
/// Traits generated by [`rpc_requests!`](crate::rpc_requests) and
/// [`rpc_messages!`](crate::rpc_messages) add named methods to its halves.
#[derive(Clone, Debug)]
pub struct RpcProxy {
    request: RequestProxy,
    send: MessageProxy,
}

impl RpcProxy {
    pub(crate) fn new(rpc: &Rpc) -> Self {
        Self {
            request: RequestProxy { rpc: rpc.clone() },
            send: MessageProxy { rpc: rpc.clone() },
        }
    }

    /// Request proxy.
    #[must_use]
    pub const fn request(&self) -> &RequestProxy {
        &self.request
    }

    /// Message proxy.
    #[must_use]
    pub const fn send(&self) -> &MessageProxy {
        &self.send
    }
}

/// Declares a trait of named request methods on [`RequestProxy`].
///
/// Each method forwards to [`RequestProxy::call_as`] with its method name.
#[macro_export]
macro_rules! rpc_requests {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident($params:ty) -> $response:ty = $wire:literal;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis trait $name {
            $(
                $(#[$method_meta])*
                fn $method(&self, params: $params) -> $crate::TypedRequest<$response>;
            )*
        }

        impl $name for $crate::RequestProxy {
            $(
                fn $method(&self, params: $params) -> $crate::TypedRequest<$response> {
                    self.call_as($wire, params)
                }
            )*
        }
    };
}

/// Declares a trait of named message methods on [`MessageProxy`].
///
/// Each method forwards to [`MessageProxy::emit`] with its message name.
#[macro_export]
macro_rules! rpc_messages {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident($payload:ty) = $wire:literal;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis trait $name {
            $(
                $(#[$method_meta])*
                fn $method(&self, payload: $payload) -> $crate::Result<()>;
            )*
        }

        impl $name for $crate::MessageProxy {
            $(
                fn $method(&self, payload: $payload) -> $crate::Result<()> {
                    self.emit($wire, payload)
                }
            )*
        }
    };
}
