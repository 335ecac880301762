//! Holds the single active transport of an engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{InboundHandler, Transport};

/// The active-transport slot.
///
/// Swaps are serialized by `swap_lock`; the slot itself is only locked long
/// enough to clone or replace the `Arc`, never while the transport runs.
///
/// Every swap starts a new epoch. Handlers are minted per epoch so one that a
/// replaced transport keeps calling can tell it is stale.
#[derive(Default)]
pub struct TransportBinding {
    active: RwLock<Option<Arc<dyn Transport>>>,
    epoch: AtomicU64,
    swap_lock: Mutex<()>,
}

impl TransportBinding {
    /// Replaces the active transport.
    ///
    /// The previous transport's handler is unregistered before the new
    /// transport's handler is registered, so at no point are both wired to
    /// the engine. `make_handler` receives the new epoch.
    pub fn replace<F>(&self, next: Option<Arc<dyn Transport>>, make_handler: F)
    where
        F: FnOnce(u64) -> InboundHandler,
    {
        let _swap = self.swap_lock.lock();

        let previous = self.active.read().clone();
        if let Some(previous) = previous {
            if previous.capabilities().receive {
                debug!("unregistering handler from previous transport");
                previous.unregister_handler();
            }
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        *self.active.write() = next.clone();

        if let Some(next) = next {
            if next.capabilities().receive {
                debug!("registering handler on new transport (epoch {})", epoch);
                next.register_handler(make_handler(epoch));
            }
        }
    }

    /// Returns `true` if `epoch` belongs to the active transport.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    /// Returns the active transport if it can send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCapability`] if there is no transport or it
    /// cannot send.
    pub fn sender(&self, action: &'static str) -> Result<Arc<dyn Transport>> {
        self.active
            .read()
            .as_ref()
            .filter(|transport| transport.capabilities().send)
            .cloned()
            .ok_or(Error::MissingCapability {
                methods: &["send"],
                action,
            })
    }

    /// Checks that the active transport can deliver inbound packets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCapability`] if there is no transport or it
    /// cannot receive.
    pub fn ensure_receive(&self, action: &'static str) -> Result<()> {
        let receive = self
            .active
            .read()
            .as_ref()
            .is_some_and(|transport| transport.capabilities().receive);

        if receive {
            Ok(())
        } else {
            Err(Error::MissingCapability {
                methods: &["registerHandler"],
                action,
            })
        }
    }

    /// Returns `true` if the active transport can send.
    pub fn can_send(&self) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|transport| transport.capabilities().send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::transport::{Capabilities, FnTransport, NullTransport};

    #[test]
    fn test_swap_unregisters_before_registering() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let make = |name: &'static str| {
            let on_register = Arc::clone(&events);
            let on_unregister = Arc::clone(&events);
            Arc::new(
                FnTransport::builder()
                    .send(|_| Ok(()))
                    .register_handler(move |_| on_register.lock().push(format!("register {name}")))
                    .unregister_handler(move || on_unregister.lock().push(format!("unregister {name}")))
                    .build(),
            ) as Arc<dyn Transport>
        };

        let binding = TransportBinding::default();
        let handler: InboundHandler = Arc::new(|_| Ok(()));

        binding.replace(Some(make("a")), |_| Arc::clone(&handler));
        binding.replace(Some(make("b")), |_| Arc::clone(&handler));

        assert_eq!(
            *events.lock(),
            vec!["register a", "unregister a", "register b"]
        );
    }

    #[test]
    fn test_each_swap_starts_new_epoch() {
        let binding = TransportBinding::default();
        let epochs = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = Arc::clone(&epochs);
            binding.replace(Some(Arc::new(NullTransport)), move |epoch| {
                seen.lock().push(epoch);
                Arc::new(|_| Ok(()))
            });
        }

        let epochs = epochs.lock().clone();
        assert_eq!(epochs, vec![1, 2]);
        assert!(!binding.is_current(1));
        assert!(binding.is_current(2));
    }

    #[test]
    fn test_missing_capabilities() {
        let binding = TransportBinding::default();
        let handler: InboundHandler = Arc::new(|_| Ok(()));

        assert!(matches!(
            binding.sender("make requests"),
            Err(Error::MissingCapability { methods: ["send"], .. })
        ));
        assert!(binding.ensure_receive("register message listeners").is_err());

        binding.replace(Some(Arc::new(NullTransport)), |_| Arc::clone(&handler));
        assert!(binding.sender("make requests").is_err());
        assert!(binding.ensure_receive("register message listeners").is_ok());
        assert!(!binding.can_send());
    }

    #[test]
    fn test_send_only_transport_never_registers() {
        let registered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&registered);
        let transport = FnTransport::builder().send(|_| Ok(())).build();
        assert_eq!(transport.capabilities(), Capabilities::SEND_ONLY);

        let binding = TransportBinding::default();
        let handler: InboundHandler = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        binding.replace(Some(Arc::new(transport)), |_| Arc::clone(&handler));

        assert!(binding.can_send());
        assert!(binding.ensure_receive("register message listeners").is_err());
        assert_eq!(registered.load(Ordering::SeqCst), 0);
    }
}
