//! One-call setup of an engine from handler tables.
//!
//! Useful when both sides of a session are declared up front and the real
//! transport only becomes available later: the engine starts on a
//! [`NullTransport`] so message handlers are wired immediately, and
//! [`Rpc::set_transport`] attaches the real transport when it exists.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::config::{MaxRequestTime, RpcConfig};
use crate::dispatcher::{MessageListener, WildcardListener};
use crate::handler::KeyedHandlers;
use crate::rpc::Rpc;
use crate::schema::RpcMessage;
use crate::transport::NullTransport;

/// Declarative description of one side of a session.
#[derive(Default)]
pub struct RpcDefinition {
    requests: KeyedHandlers,
    extra_requests: KeyedHandlers,
    messages: HashMap<String, MessageListener>,
    any_message: Option<WildcardListener>,
    config: RpcConfig,
}

impl RpcDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request handlers this side serves.
    #[must_use]
    pub fn requests(mut self, handlers: KeyedHandlers) -> Self {
        self.requests = handlers;
        self
    }

    /// Adds request handlers on top of [`requests`](Self::requests).
    ///
    /// Entries here win over entries with the same method name.
    #[must_use]
    pub fn extra_requests(mut self, handlers: KeyedHandlers) -> Self {
        self.extra_requests = self.extra_requests.merge(handlers);
        self
    }

    /// Handles messages named `name`.
    #[must_use]
    pub fn message<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.messages.insert(name.into(), Arc::new(f));
        self
    }

    /// Handles messages of type `M`, skipping payloads that do not decode.
    #[must_use]
    pub fn on_message<M, F>(self, f: F) -> Self
    where
        M: RpcMessage + 'static,
        F: Fn(M) + Send + Sync + 'static,
    {
        self.message(M::NAME, move |payload: &Value| match M::deserialize(payload) {
            Ok(message) => f(message),
            Err(e) => warn!("skipping {} message with invalid payload: {}", M::NAME, e),
        })
    }

    /// Handles every message; runs before the per-name handler.
    #[must_use]
    pub fn any_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.any_message = Some(Arc::new(f));
        self
    }

    /// Sets how long requests may stay pending.
    #[must_use]
    pub const fn max_request_time(mut self, duration: Duration) -> Self {
        self.config.max_request_time = MaxRequestTime::Finite(duration);
        self
    }

    /// Replaces the engine configuration.
    #[must_use]
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine on a placeholder transport.
    #[must_use]
    pub fn build(self) -> Rpc {
        let rpc = Rpc::builder()
            .config(self.config)
            .request_handler(self.requests.merge(self.extra_requests))
            .transport(Arc::new(NullTransport))
            .build();

        if !self.messages.is_empty() || self.any_message.is_some() {
            let messages = self.messages;
            let any_message = self.any_message;
            rpc.listeners()
                .add_wildcard(Arc::new(move |name: &str, payload: &Value| {
                    if let Some(global) = &any_message {
                        global(name, payload);
                    }
                    if let Some(handler) = messages.get(name) {
                        handler(payload);
                    }
                }));
        }

        rpc
    }
}

impl Debug for RpcDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut messages: Vec<_> = self.messages.keys().collect();
        messages.sort();
        f.debug_struct("RpcDefinition")
            .field("requests", &self.requests)
            .field("extra_requests", &self.extra_requests)
            .field("messages", &messages)
            .field("any_message", &self.any_message.is_some())
            .field("config", &self.config)
            .finish()
    }
}
