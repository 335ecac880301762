//! Fire-and-forget message listeners.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, trace};

use crate::error::{Error, Result};

/// Listener for one message name.
pub type MessageListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Listener for every message; receives the name and the payload.
pub type WildcardListener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Reserved message name that subscribes to every message.
pub const WILDCARD: &str = "*";

#[derive(Default)]
struct Listeners {
    wildcard: Vec<WildcardListener>,
    named: HashMap<String, Vec<MessageListener>>,
}

/// Registry of message listeners keyed by message name.
///
/// Listeners are kept in insertion order and added at most once, compared by
/// `Arc` identity. Dispatch works on a snapshot so listeners may add or remove
/// listeners (including themselves) without affecting the current round.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Listeners>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `listener` for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WildcardName`] for [`WILDCARD`]: wildcard listeners
    /// need the message name and are added with
    /// [`add_wildcard`](Self::add_wildcard).
    pub fn add(&self, name: &str, listener: MessageListener) -> Result<()> {
        if name == WILDCARD {
            return Err(Error::WildcardName);
        }

        let mut listeners = self.listeners.write();
        let entry = listeners.named.entry(name.to_string()).or_default();
        if !entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entry.push(listener);
        }
        Ok(())
    }

    /// Removes `listener` from `name`. Unknown listeners are ignored.
    pub fn remove(&self, name: &str, listener: &MessageListener) {
        let mut listeners = self.listeners.write();
        if let Some(entry) = listeners.named.get_mut(name) {
            entry.retain(|l| !Arc::ptr_eq(l, listener));
            if entry.is_empty() {
                listeners.named.remove(name);
            }
        }
    }

    /// Adds a listener that receives every message with its name.
    pub fn add_wildcard(&self, listener: WildcardListener) {
        let mut listeners = self.listeners.write();
        if !listeners.wildcard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.wildcard.push(listener);
        }
    }

    /// Removes a wildcard listener. Unknown listeners are ignored.
    pub fn remove_wildcard(&self, listener: &WildcardListener) {
        self.listeners
            .write()
            .wildcard
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Number of listeners registered for `name`; [`WILDCARD`] counts the
    /// wildcard listeners.
    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        if name == WILDCARD {
            return self.listeners.read().wildcard.len();
        }
        self.listeners.read().named.get(name).map_or(0, Vec::len)
    }

    /// Delivers a message: wildcard listeners first, then listeners for
    /// `name`, each in insertion order.
    ///
    /// A panicking listener is logged and skipped.
    pub fn dispatch(&self, name: &str, payload: &Value) {
        let (wildcard, named) = {
            let listeners = self.listeners.read();
            (
                listeners.wildcard.clone(),
                listeners.named.get(name).cloned().unwrap_or_default(),
            )
        };

        if wildcard.is_empty() && named.is_empty() {
            trace!("no listeners for message {}", name);
            return;
        }

        for listener in &wildcard {
            guarded(name, || listener(name, payload));
        }
        for listener in &named {
            guarded(name, || listener(payload));
        }
    }
}

fn guarded(name: &str, f: impl FnOnce()) {
    if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(
            "message listener for {} panicked: {}",
            name,
            panic_message(cause.as_ref())
        );
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(cause: &(dyn Any + Send)) -> String {
    cause
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| cause.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
