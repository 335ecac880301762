//! In-memory transport implementation for tether RPC engines.
//!
//! [`MemoryTransport::pair`] returns two connected ends. Packets are encoded
//! to JSON text, queued on a channel and delivered to the peer's handler by a
//! background task, so both engines see exactly what a real wire would carry.
//! Packets queued while the task is busy are coalesced into a single
//! JSON-array frame and unpacked in order on the other side.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tether_rpc::{InboundHandler, Packet, Transport, TransportError};
use tracing::{debug, trace, warn};

type HandlerSlot = Arc<RwLock<Option<InboundHandler>>>;

/// Configuration for memory transport
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Most packets coalesced into one frame; `1` disables batching.
    pub max_batch: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self { max_batch: 64 }
    }
}

/// One end of an in-memory link.
#[derive(Clone)]
pub struct MemoryTransport {
    name: &'static str,
    outbound: flume::Sender<String>,
    handler: HandlerSlot,
    closed: Arc<AtomicBool>,
    frames_received: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Creates two connected ends with default options.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        Self::pair_with_options(&MemoryOptions::default())
    }

    /// Creates two connected ends.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn pair_with_options(options: &MemoryOptions) -> (Self, Self) {
        let (left_tx, left_rx) = flume::unbounded();
        let (right_tx, right_rx) = flume::unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        let left = Self {
            name: "left",
            outbound: left_tx,
            handler: Arc::new(RwLock::new(None)),
            closed: Arc::clone(&closed),
            frames_received: Arc::new(AtomicUsize::new(0)),
        };
        let right = Self {
            name: "right",
            outbound: right_tx,
            handler: Arc::new(RwLock::new(None)),
            closed,
            frames_received: Arc::new(AtomicUsize::new(0)),
        };

        let max_batch = options.max_batch.max(1);
        tokio::spawn(pump(left_rx, right.inbox(), max_batch));
        tokio::spawn(pump(right_rx, left.inbox(), max_batch));

        debug!("memory transport pair created (max_batch {})", max_batch);
        (left, right)
    }

    /// Closes both ends; later sends fail with [`TransportError::Closed`].
    pub fn close(&self) {
        debug!("closing memory transport ({})", self.name);
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` once either end was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of frames delivered to this end.
    #[must_use]
    pub fn frames_received(&self) -> usize {
        self.frames_received.load(Ordering::Relaxed)
    }

    fn inbox(&self) -> Inbox {
        Inbox {
            name: self.name,
            handler: Arc::clone(&self.handler),
            closed: Arc::clone(&self.closed),
            frames: Arc::clone(&self.frames_received),
        }
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("queued", &self.outbound.len())
            .finish()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let frame = packet
            .to_json()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        trace!(
            "memory transport ({}) queueing {} bytes",
            self.name,
            frame.len()
        );

        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn register_handler(&self, handler: InboundHandler) {
        *self.handler.write() = Some(handler);
    }

    fn unregister_handler(&self) {
        self.handler.write().take();
    }
}

/// Receiving side of one direction.
struct Inbox {
    name: &'static str,
    handler: HandlerSlot,
    closed: Arc<AtomicBool>,
    frames: Arc<AtomicUsize>,
}

impl Inbox {
    fn deliver(&self, frame: &str) {
        self.frames.fetch_add(1, Ordering::Relaxed);

        let value: Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(e) => {
                warn!("memory transport ({}) dropped undecodable frame: {}", self.name, e);
                return;
            }
        };

        let packets = match value {
            Value::Array(packets) => packets,
            single => vec![single],
        };

        for packet in packets {
            // Re-read per packet so a handler swap mid-frame takes effect.
            let Some(handler) = self.handler.read().clone() else {
                debug!("memory transport ({}) has no handler, dropping packet", self.name);
                continue;
            };
            if let Err(e) = handler(packet) {
                warn!("memory transport ({}) handler error: {}", self.name, e);
            }
        }
    }
}

async fn pump(queue: flume::Receiver<String>, inbox: Inbox, max_batch: usize) {
    while let Ok(first) = queue.recv_async().await {
        if inbox.closed.load(Ordering::Acquire) {
            debug!("memory transport ({}) closed, stopping", inbox.name);
            break;
        }

        let mut batch = vec![first];
        while batch.len() < max_batch {
            match queue.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if batch.len() == 1 {
            inbox.deliver(&batch[0]);
        } else {
            trace!(
                "memory transport ({}) coalescing {} packets",
                inbox.name,
                batch.len()
            );
            inbox.deliver(&format!("[{}]", batch.join(",")));
        }
    }

    debug!("memory transport ({}) pump finished", inbox.name);
}
