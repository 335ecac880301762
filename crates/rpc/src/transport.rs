//! The pluggable seam between the engine and packet delivery.
//!
//! A transport needs at most two capabilities: sending an outbound [`Packet`]
//! and delivering inbound JSON values to a single registered handler. Sockets,
//! in-process channels, native bridges and test doubles are all valid
//! transports as long as they honour this contract.

use std::fmt::{self, Debug};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::packet::Packet;

/// Callback a transport invokes for every inbound packet.
///
/// Returns an error when the packet could not be routed (malformed packet,
/// missing capability); transports usually log it and carry on.
pub type InboundHandler = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

/// Which halves of the transport contract are available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// `send` is available.
    pub send: bool,
    /// `register_handler` / `unregister_handler` are available.
    pub receive: bool,
}

impl Capabilities {
    /// Both send and receive.
    pub const DUPLEX: Self = Self {
        send: true,
        receive: true,
    };

    /// Send only.
    pub const SEND_ONLY: Self = Self {
        send: true,
        receive: false,
    };

    /// Receive only.
    pub const RECEIVE_ONLY: Self = Self {
        send: false,
        receive: true,
    };
}

/// Packet transport used by an [`Rpc`](crate::Rpc) engine.
pub trait Transport: Send + Sync + 'static {
    /// Reports which operations this transport supports.
    fn capabilities(&self) -> Capabilities {
        Capabilities::DUPLEX
    }

    /// Sends one packet to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be handed to the peer.
    fn send(&self, packet: Packet) -> std::result::Result<(), TransportError>;

    /// Installs the handler inbound packets are delivered to, replacing any
    /// previous one.
    fn register_handler(&self, handler: InboundHandler);

    /// Removes the installed handler; later inbound packets are dropped.
    fn unregister_handler(&self);
}

type SendFn = Box<dyn Fn(Packet) -> std::result::Result<(), TransportError> + Send + Sync>;
type RegisterFn = Box<dyn Fn(InboundHandler) + Send + Sync>;
type UnregisterFn = Box<dyn Fn() + Send + Sync>;

/// A transport assembled from optional closures.
///
/// Each closure that is left out removes the matching capability, so a
/// transport built without [`FnTransportBuilder::send`] cannot make requests
/// and one built without [`FnTransportBuilder::register_handler`] cannot
/// receive.
pub struct FnTransport {
    send: Option<SendFn>,
    register: Option<RegisterFn>,
    unregister: Option<UnregisterFn>,
}

impl FnTransport {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> FnTransportBuilder {
        FnTransportBuilder::default()
    }
}

impl Debug for FnTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

impl Transport for FnTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            send: self.send.is_some(),
            receive: self.register.is_some(),
        }
    }

    fn send(&self, packet: Packet) -> std::result::Result<(), TransportError> {
        self.send
            .as_ref()
            .map_or(Err(TransportError::Unsupported("send")), |send| send(packet))
    }

    fn register_handler(&self, handler: InboundHandler) {
        if let Some(register) = &self.register {
            register(handler);
        }
    }

    fn unregister_handler(&self) {
        if let Some(unregister) = &self.unregister {
            unregister();
        }
    }
}

/// Builder for [`FnTransport`].
#[derive(Default)]
pub struct FnTransportBuilder {
    send: Option<SendFn>,
    register: Option<RegisterFn>,
    unregister: Option<UnregisterFn>,
}

impl FnTransportBuilder {
    /// Sets the outbound send closure.
    #[must_use]
    pub fn send<F>(mut self, f: F) -> Self
    where
        F: Fn(Packet) -> std::result::Result<(), TransportError> + Send + Sync + 'static,
    {
        self.send = Some(Box::new(f));
        self
    }

    /// Sets the handler registration closure.
    #[must_use]
    pub fn register_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(InboundHandler) + Send + Sync + 'static,
    {
        self.register = Some(Box::new(f));
        self
    }

    /// Sets the handler removal closure.
    #[must_use]
    pub fn unregister_handler<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.unregister = Some(Box::new(f));
        self
    }

    /// Builds the transport.
    #[must_use]
    pub fn build(self) -> FnTransport {
        FnTransport {
            send: self.send,
            register: self.register,
            unregister: self.unregister,
        }
    }
}

/// Placeholder transport that can only accept handler registration.
///
/// Lets message listeners be registered before the real transport is known.
/// Outbound calls fail with a missing-capability error.
#[derive(Clone, Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities::RECEIVE_ONLY
    }

    fn send(&self, _packet: Packet) -> std::result::Result<(), TransportError> {
        Err(TransportError::Unsupported("send"))
    }

    fn register_handler(&self, _handler: InboundHandler) {}

    fn unregister_handler(&self) {}
}

/// Sends through a primary transport, falling back to a secondary one.
///
/// The secondary is used when the primary cannot send at all or reports
/// [`TransportError::Closed`] for a packet. Inbound handlers are registered on
/// every member that can receive.
pub struct FallbackTransport {
    primary: Arc<dyn Transport>,
    secondary: Arc<dyn Transport>,
}

impl FallbackTransport {
    /// Creates a fallback pair.
    pub fn new(primary: Arc<dyn Transport>, secondary: Arc<dyn Transport>) -> Self {
        Self { primary, secondary }
    }
}

impl Debug for FallbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackTransport")
            .field("primary", &self.primary.capabilities())
            .field("secondary", &self.secondary.capabilities())
            .finish()
    }
}

impl Transport for FallbackTransport {
    fn capabilities(&self) -> Capabilities {
        let primary = self.primary.capabilities();
        let secondary = self.secondary.capabilities();
        Capabilities {
            send: primary.send || secondary.send,
            receive: primary.receive || secondary.receive,
        }
    }

    fn send(&self, packet: Packet) -> std::result::Result<(), TransportError> {
        if !self.primary.capabilities().send {
            return self.secondary.send(packet);
        }

        if !self.secondary.capabilities().send {
            return self.primary.send(packet);
        }

        match self.primary.send(packet.clone()) {
            Err(TransportError::Closed) => {
                debug!("primary transport closed, falling back to secondary");
                self.secondary.send(packet)
            }
            other => other,
        }
    }

    fn register_handler(&self, handler: InboundHandler) {
        for member in [&self.primary, &self.secondary] {
            if member.capabilities().receive {
                member.register_handler(Arc::clone(&handler));
            }
        }
    }

    fn unregister_handler(&self) {
        for member in [&self.primary, &self.secondary] {
            if member.capabilities().receive {
                member.unregister_handler();
            }
        }
    }
}
