//! Shared test transports.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tether_rpc::{InboundHandler, Packet, RequestId, Rpc, Transport, TransportError};

/// Records outbound packets and lets tests inject inbound ones.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Packet>>,
    handler: Mutex<Option<InboundHandler>>,
    last_handler: Mutex<Option<InboundHandler>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.sent()
            .into_iter()
            .filter_map(|packet| match packet {
                Packet::Request(request) => Some(request.id),
                _ => None,
            })
            .collect()
    }

    pub fn is_registered(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Delivers `value` to the registered handler, if any.
    pub fn deliver(&self, value: Value) -> Option<tether_rpc::Result<()>> {
        let handler = self.handler.lock().clone();
        handler.map(|handler| handler(value))
    }

    /// Delivers `value` to the last handler ever registered, even after it
    /// was unregistered.
    pub fn replay(&self, value: Value) -> Option<tether_rpc::Result<()>> {
        let handler = self.last_handler.lock().clone();
        handler.map(|handler| handler(value))
    }
}

impl Transport for RecordingTransport {
    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.sent.lock().push(packet);
        Ok(())
    }

    fn register_handler(&self, handler: InboundHandler) {
        *self.last_handler.lock() = Some(Arc::clone(&handler));
        *self.handler.lock() = Some(handler);
    }

    fn unregister_handler(&self) {
        self.handler.lock().take();
    }
}

/// One end of a synchronous in-process link.
struct LinkTransport {
    own: Arc<Mutex<Option<InboundHandler>>>,
    peer: Arc<Mutex<Option<InboundHandler>>>,
}

impl Transport for LinkTransport {
    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let value = packet
            .to_value()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let handler = self.peer.lock().clone().ok_or(TransportError::Closed)?;
        if let Err(e) = handler(value) {
            tracing::warn!("peer rejected packet: {}", e);
        }
        Ok(())
    }

    fn register_handler(&self, handler: InboundHandler) {
        *self.own.lock() = Some(handler);
    }

    fn unregister_handler(&self) {
        self.own.lock().take();
    }
}

/// Two engines wired to each other.
pub fn linked(left: Rpc, right: Rpc) -> (Rpc, Rpc) {
    let left_slot = Arc::new(Mutex::new(None));
    let right_slot = Arc::new(Mutex::new(None));

    left.set_transport(Arc::new(LinkTransport {
        own: Arc::clone(&left_slot),
        peer: Arc::clone(&right_slot),
    }));
    right.set_transport(Arc::new(LinkTransport {
        own: right_slot,
        peer: left_slot,
    }));

    (left, right)
}
