//! Error types for the RPC engine.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The active transport does not provide a method the operation needs.
    #[error(
        "This RPC instance cannot {action} because the transport did not provide one or more of these methods: {}",
        quote_methods(.methods)
    )]
    MissingCapability {
        /// Transport methods (or the request handler) that were missing.
        methods: &'static [&'static str],
        /// What the caller was trying to do.
        action: &'static str,
    },

    /// The peer's request handler failed; carries the peer's message verbatim.
    #[error("{0}")]
    Remote(String),

    /// No response arrived within the configured request time.
    #[error("RPC request timed out after {0:?}")]
    Timeout(Duration),

    /// An inbound packet could not be classified or decoded.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Serialization or deserialization of params or payloads failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The transport rejected an outbound packet.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Every request id up to the configured ceiling is held by a pending request.
    #[error("No free request id below ceiling {0}")]
    IdSpaceExhausted(u64),

    /// The pending entry was dropped without being resolved.
    #[error("Channel closed")]
    ChannelClosed,

    /// The request was cancelled by its caller.
    #[error("Request cancelled")]
    Cancelled,

    /// A finite request timeout was requested outside a Tokio runtime.
    #[error("Request timeouts need a Tokio runtime")]
    NoRuntime,

    /// `"*"` was used as a plain message name.
    #[error("\"*\" listeners receive the message name; use add_wildcard_listener")]
    WildcardName,
}

/// Errors raised by transports.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The underlying channel or connection is closed.
    #[error("Transport closed")]
    Closed,

    /// The transport does not implement the requested operation.
    #[error("Operation not supported by transport: {0}")]
    Unsupported(&'static str),

    /// The transport failed to encode or decode a frame.
    #[error("Transport codec error: {0}")]
    Codec(String),

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// Errors produced while handling an inbound request.
///
/// Only the rendered message of these errors crosses the wire.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Neither an exact method handler nor a fallback exists.
    #[error("The requested method has no handler: {0}")]
    NotFound(String),

    /// The request params did not match the handler's parameter type.
    #[error("Invalid params for {method}: {reason}")]
    InvalidParams {
        /// Method being invoked.
        method: String,
        /// Decoder message.
        reason: String,
    },

    /// The handler returned an error.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Builds a [`HandlerError::Failed`] from anything displayable.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

fn quote_methods(methods: &[&str]) -> String {
    methods
        .iter()
        .map(|m| format!("\"{m}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_capability_message() {
        let err = Error::MissingCapability {
            methods: &["send", "requestHandler"],
            action: "handle requests",
        };

        assert_eq!(
            err.to_string(),
            "This RPC instance cannot handle requests because the transport did not provide one or more of these methods: \"send\", \"requestHandler\""
        );
    }

    #[test]
    fn test_remote_error_is_verbatim() {
        assert_eq!(Error::Remote("boom".to_string()).to_string(), "boom");
        assert_eq!(HandlerError::failed("boom").to_string(), "boom");
    }
}
