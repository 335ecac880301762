//! The RPC engine.

use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, instrument, trace, warn};

use crate::binding::TransportBinding;
use crate::config::{DebugHooks, MaxRequestTime, RpcConfig};
use crate::correlator::{Correlator, RequestFuture};
use crate::dispatcher::{ListenerRegistry, MessageListener, WildcardListener};
use crate::error::{Error, Result};
use crate::handler::{DispatchFn, RequestHandler, invoke};
use crate::packet::{Packet, RequestPacket, ResponsePacket};
use crate::schema::{RpcMessage, RpcProxy, RpcRequest, TypedRequest};
use crate::transport::{InboundHandler, Transport};

/// One endpoint of a bidirectional RPC session.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    config: RpcConfig,
    hooks: DebugHooks,
    binding: TransportBinding,
    handler: RwLock<Option<DispatchFn>>,
    correlator: Correlator,
    listeners: ListenerRegistry,
}

type InboundRequest = (DispatchFn, RequestPacket);

impl Rpc {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> RpcBuilder {
        RpcBuilder::new()
    }

    /// Creates an engine with no transport and no request handler.
    #[must_use]
    pub fn new(config: RpcConfig) -> Self {
        Self::with_parts(config, DebugHooks::default())
    }

    fn with_parts(config: RpcConfig, hooks: DebugHooks) -> Self {
        let inner = Arc::new(RpcInner {
            correlator: Correlator::new(config.id_ceiling),
            config,
            hooks,
            binding: TransportBinding::default(),
            handler: RwLock::new(None),
            listeners: ListenerRegistry::new(),
        });

        Self { inner }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Replaces the active transport.
    ///
    /// The previous transport's handler is unregistered first, and packets
    /// it still delivers afterwards are ignored. Requests that are pending
    /// stay pending and can be answered through the new transport.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        debug!("setting transport {:?}", transport.capabilities());
        self.swap_transport(Some(transport));
    }

    /// Detaches the active transport.
    pub fn clear_transport(&self) {
        debug!("clearing transport");
        self.swap_transport(None);
    }

    fn swap_transport(&self, transport: Option<Arc<dyn Transport>>) {
        let engine = Arc::downgrade(&self.inner);
        self.inner
            .binding
            .replace(transport, |epoch| inbound_handler(engine, epoch));
    }

    /// Installs the handler for inbound requests, replacing any previous one.
    pub fn set_request_handler(&self, handler: impl Into<RequestHandler>) {
        *self.inner.handler.write() = Some(handler.into().normalize());
    }

    /// Removes the request handler; inbound requests then fail.
    pub fn clear_request_handler(&self) {
        self.inner.handler.write().take();
    }

    /// Sends a request and returns a future for its response.
    ///
    /// The packet is sent before this returns, so requests reach the
    /// transport in call order. Errors (missing send capability, params that
    /// fail to serialize, transport failure) surface when the future is
    /// polled. A finite max request time needs a Tokio runtime; without one
    /// the future fails with [`Error::NoRuntime`].
    #[instrument(skip(self, params))]
    pub fn request(&self, method: &str, params: impl Serialize) -> RequestFuture {
        self.start_request(method, params)
            .unwrap_or_else(RequestFuture::failed)
    }

    fn start_request(&self, method: &str, params: impl Serialize) -> Result<RequestFuture> {
        let transport = self.inner.binding.sender("make requests")?;
        let params = serde_json::to_value(params)?;
        let (id, future) = self
            .inner
            .correlator
            .register(self.inner.config.max_request_time)?;

        let packet = Packet::request(id, method, params);
        self.inner.hooks.sent(&packet);
        debug!("sending request {}", id);

        // Dropping `future` on failure releases the pending entry.
        transport.send(packet)?;
        Ok(future)
    }

    /// Sends a typed request.
    pub fn request_typed<R: RpcRequest>(&self, request: R) -> TypedRequest<R::Response> {
        TypedRequest::new(self.request(R::METHOD, request))
    }

    /// Sends a fire-and-forget message.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot send, the payload fails to
    /// serialize, or the transport rejects the packet.
    #[instrument(skip(self, payload))]
    pub fn send(&self, name: &str, payload: impl Serialize) -> Result<()> {
        let transport = self.inner.binding.sender("send messages")?;
        let packet = Packet::message(name, serde_json::to_value(payload)?);

        self.inner.hooks.sent(&packet);
        transport.send(packet)?;
        Ok(())
    }

    /// Sends a typed message.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_message<M: RpcMessage>(&self, message: &M) -> Result<()> {
        self.send(M::NAME, message)
    }

    /// Adds a listener for messages named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCapability`] if the transport cannot receive,
    /// or [`Error::WildcardName`] for `"*"`, whose listeners are added with
    /// [`add_wildcard_listener`](Self::add_wildcard_listener).
    pub fn add_message_listener(&self, name: &str, listener: MessageListener) -> Result<()> {
        self.inner
            .binding
            .ensure_receive("register message listeners")?;
        self.inner.listeners.add(name, listener)
    }

    /// Removes a listener added with
    /// [`add_message_listener`](Self::add_message_listener).
    pub fn remove_message_listener(&self, name: &str, listener: &MessageListener) {
        self.inner.listeners.remove(name, listener);
    }

    /// Adds a listener that receives every message with its name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCapability`] if the transport cannot receive.
    pub fn add_wildcard_listener(&self, listener: WildcardListener) -> Result<()> {
        self.inner
            .binding
            .ensure_receive("register message listeners")?;
        self.inner.listeners.add_wildcard(listener);
        Ok(())
    }

    /// Removes a wildcard listener.
    pub fn remove_wildcard_listener(&self, listener: &WildcardListener) {
        self.inner.listeners.remove_wildcard(listener);
    }

    /// Adds a typed listener for `M`.
    ///
    /// Payloads that do not decode into `M` are logged and skipped. Returns
    /// the registered listener so it can be removed later.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCapability`] if the transport cannot receive.
    pub fn on_message<M, F>(&self, f: F) -> Result<MessageListener>
    where
        M: RpcMessage + 'static,
        F: Fn(M) + Send + Sync + 'static,
    {
        let listener: MessageListener =
            Arc::new(move |payload: &Value| match M::deserialize(payload) {
                Ok(message) => f(message),
                Err(e) => warn!("skipping {} message with invalid payload: {}", M::NAME, e),
            });

        self.add_message_listener(M::NAME, Arc::clone(&listener))?;
        Ok(listener)
    }

    /// Returns the name-based call proxy.
    #[must_use]
    pub fn proxy(&self) -> RpcProxy {
        RpcProxy::new(self)
    }

    /// Routes one inbound packet, awaiting request handling inline.
    ///
    /// This is the path the transport-registered handler takes, except that
    /// requests are answered before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a valid packet, or if it is a
    /// request and the engine has no request handler or cannot send.
    #[instrument(skip_all)]
    pub async fn receive(&self, value: Value) -> Result<()> {
        if let Some((dispatch, request)) = self.inner.route(value)? {
            self.inner.respond(dispatch, request).await;
        }
        Ok(())
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    pub(crate) fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }
}

impl Default for Rpc {
    fn default() -> Self {
        Self::new(RpcConfig::default())
    }
}

impl Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("config", &self.inner.config)
            .field("pending_requests", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

impl RpcInner {
    fn route(&self, value: Value) -> Result<Option<InboundRequest>> {
        self.hooks.received(&value);

        match Packet::from_value(value)? {
            Packet::Response(response) => {
                self.correlator.resolve(response);
                Ok(None)
            }
            Packet::Message(message) => {
                trace!("dispatching message {}", message.id);
                self.listeners.dispatch(&message.id, &message.payload);
                Ok(None)
            }
            Packet::Request(request) => {
                let handler = self.handler.read().clone();
                match handler {
                    Some(dispatch) if self.binding.can_send() => Ok(Some((dispatch, request))),
                    _ => Err(Error::MissingCapability {
                        methods: &["send", "requestHandler"],
                        action: "handle requests",
                    }),
                }
            }
        }
    }

    async fn respond(&self, dispatch: DispatchFn, request: RequestPacket) {
        let RequestPacket { id, method, params } = request;
        debug!("handling request {} for {}", id, method);

        let outcome = invoke(&dispatch, method, params).await;
        let packet = Packet::Response(ResponsePacket { id, outcome });

        // The transport may have been swapped while the handler ran.
        match self.binding.sender("handle requests") {
            Ok(transport) => {
                self.hooks.sent(&packet);
                if let Err(e) = transport.send(packet) {
                    warn!("failed to send response {}: {}", id, e);
                }
            }
            Err(e) => warn!("dropping response {}: {}", id, e),
        }
    }
}

fn inbound_handler(engine: Weak<RpcInner>, epoch: u64) -> InboundHandler {
    Arc::new(move |value| {
        let Some(inner) = engine.upgrade() else {
            trace!("engine dropped, ignoring inbound packet");
            return Ok(());
        };
        if !inner.binding.is_current(epoch) {
            trace!("ignoring packet from replaced transport (epoch {})", epoch);
            return Ok(());
        }

        let (dispatch, request) = match inner.route(value) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!("failed to route inbound packet: {}", e);
                return Err(e);
            }
        };

        let respond = async move { inner.respond(dispatch, request).await };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(respond);
            }
            Err(_) => {
                debug!("no Tokio runtime, answering request inline");
                futures::executor::block_on(respond);
            }
        }
        Ok(())
    })
}

/// Builder for [`Rpc`].
#[derive(Default)]
pub struct RpcBuilder {
    transport: Option<Arc<dyn Transport>>,
    handler: Option<RequestHandler>,
    config: RpcConfig,
    hooks: DebugHooks,
}

impl RpcBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the initial request handler.
    #[must_use]
    pub fn request_handler(mut self, handler: impl Into<RequestHandler>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Sets how long requests may stay pending.
    #[must_use]
    pub const fn max_request_time(mut self, duration: Duration) -> Self {
        self.config.max_request_time = MaxRequestTime::Finite(duration);
        self
    }

    /// Lets requests wait indefinitely.
    #[must_use]
    pub const fn no_request_timeout(mut self) -> Self {
        self.config.max_request_time = MaxRequestTime::Infinite;
        self
    }

    /// Sets the debug hooks.
    #[must_use]
    pub fn debug_hooks(mut self, hooks: DebugHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> Rpc {
        let rpc = Rpc::with_parts(self.config, self.hooks);

        if let Some(handler) = self.handler {
            rpc.set_request_handler(handler);
        }
        if let Some(transport) = self.transport {
            rpc.set_transport(transport);
        }

        rpc
    }
}

impl Debug for RpcBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcBuilder")
            .field("transport", &self.transport.as_ref().map(|t| t.capabilities()))
            .field("handler", &self.handler)
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .finish()
    }
}
