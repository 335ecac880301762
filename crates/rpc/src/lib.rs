//! Bidirectional, transport-agnostic RPC sessions.
//!
//! Two [`Rpc`] engines talk to each other over any [`Transport`] that can send
//! a [`Packet`] and deliver inbound JSON to a registered handler. Each side can
//! both make requests and serve them, and either side can emit fire-and-forget
//! messages to named or wildcard listeners.
//!
//! # Features
//!
//! - **Correlated requests**: each request resolves exactly once, with the
//!   peer's result, the peer's error message, or a timeout
//! - **Multiplexing**: any number of requests may be pending at once
//! - **Messages**: named and wildcard (`"*"`) listeners, dispatched in order
//! - **Hot-swappable transport**: pending requests survive a transport swap
//! - **Typed sugar**: [`RpcRequest`], [`RpcMessage`] and the
//!   [`rpc_requests!`] / [`rpc_messages!`] proxy macros
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tether_rpc::{FnTransport, KeyedHandlers, Rpc};
//!
//! async fn example() -> tether_rpc::Result<()> {
//!     let transport = FnTransport::builder()
//!         .send(|packet| {
//!             println!("{packet:?}");
//!             Ok(())
//!         })
//!         .register_handler(|_handler| {})
//!         .build();
//!
//!     let rpc = Rpc::builder()
//!         .transport(Arc::new(transport))
//!         .request_handler(
//!             KeyedHandlers::new().on_sync("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b)),
//!         )
//!         .build();
//!
//!     let sum = rpc.request("add", (1, 2)).await?;
//!     println!("{sum}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod binding;
pub mod config;
pub mod correlator;
pub mod define;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod packet;
mod rpc;
pub mod schema;
pub mod transport;

// Re-export commonly used types
pub use config::{DebugHooks, MaxRequestTime, RpcConfig};
pub use correlator::{IdAllocator, RequestFuture};
pub use define::RpcDefinition;
pub use dispatcher::{MessageListener, WILDCARD, WildcardListener};
pub use error::{Error, HandlerError, Result, TransportError};
pub use handler::{HandlerResult, KeyedHandlers, RequestHandler, RpcHandler};
pub use packet::{MessagePacket, Outcome, Packet, RequestId, RequestPacket, ResponsePacket};
pub use rpc::{Rpc, RpcBuilder};
pub use schema::{MessageProxy, RequestProxy, RpcMessage, RpcProxy, RpcRequest, TypedRequest};
pub use transport::{
    Capabilities, FallbackTransport, FnTransport, FnTransportBuilder, InboundHandler,
    NullTransport, Transport,
};

// Re-export dependencies that are part of our public API
pub use async_trait::async_trait;
pub use serde_json::Value;
