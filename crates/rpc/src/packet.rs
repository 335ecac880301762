//! Wire-level packets exchanged between two engines.
//!
//! Packets are JSON objects discriminated by a `type` field:
//!
//! ```text
//! {"type":"request","id":1,"method":"add","params":{"a":1,"b":2}}
//! {"type":"response","id":1,"success":true,"payload":3}
//! {"type":"response","id":1,"success":false,"error":"boom"}
//! {"type":"message","id":"ping","payload":{"x":1}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Correlation id of a request, owned by the endpoint that sent it.
pub type RequestId = u64;

/// One unit exchanged between engines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    /// A call expecting exactly one [`Packet::Response`].
    Request(RequestPacket),
    /// The answer to a request.
    Response(ResponsePacket),
    /// A fire-and-forget message.
    Message(MessagePacket),
}

/// Body of a request packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestPacket {
    /// Id assigned by the requesting endpoint.
    pub id: RequestId,
    /// Method name to invoke on the peer.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Body of a response packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct ResponsePacket {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Result of the call.
    pub outcome: Outcome,
}

/// Result carried by a response.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The handler returned a value.
    Success(Value),
    /// The handler failed; only its message crosses the wire.
    Failure(String),
}

/// Body of a message packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePacket {
    /// Message name. Not a correlation id.
    pub id: String,
    /// Message payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

#[derive(Serialize, Deserialize)]
struct RawResponse {
    id: RequestId,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TryFrom<RawResponse> for ResponsePacket {
    type Error = String;

    fn try_from(raw: RawResponse) -> std::result::Result<Self, Self::Error> {
        let outcome = if raw.success {
            if raw.error.is_some() {
                return Err(format!(
                    "response {} is marked successful but carries an error",
                    raw.id
                ));
            }
            Outcome::Success(raw.payload.unwrap_or(Value::Null))
        } else {
            Outcome::Failure(raw.error.unwrap_or_default())
        };

        Ok(Self {
            id: raw.id,
            outcome,
        })
    }
}

impl From<ResponsePacket> for RawResponse {
    fn from(response: ResponsePacket) -> Self {
        match response.outcome {
            Outcome::Success(payload) => Self {
                id: response.id,
                success: true,
                payload: (!payload.is_null()).then_some(payload),
                error: None,
            },
            Outcome::Failure(error) => Self {
                id: response.id,
                success: false,
                payload: None,
                error: Some(error),
            },
        }
    }
}

impl Packet {
    /// Builds a request packet.
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self::Request(RequestPacket {
            id,
            method: method.into(),
            params,
        })
    }

    /// Builds a successful response packet.
    #[must_use]
    pub const fn success(id: RequestId, payload: Value) -> Self {
        Self::Response(ResponsePacket {
            id,
            outcome: Outcome::Success(payload),
        })
    }

    /// Builds a failed response packet.
    pub fn failure(id: RequestId, error: impl Into<String>) -> Self {
        Self::Response(ResponsePacket {
            id,
            outcome: Outcome::Failure(error.into()),
        })
    }

    /// Builds a message packet.
    pub fn message(name: impl Into<String>, payload: Value) -> Self {
        Self::Message(MessagePacket {
            id: name.into(),
            payload,
        })
    }

    /// Returns the `type` discriminant as it appears on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Message(_) => "message",
        }
    }

    /// Classifies and decodes an inbound JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] if the value has no `type` field, an
    /// unknown `type`, or a body that does not match its type.
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = match value.get("type") {
            None => {
                return Err(Error::MalformedPacket(
                    "Message does not contain a type.".to_string(),
                ));
            }
            Some(Value::String(kind)) => kind.as_str(),
            Some(other) => {
                return Err(Error::MalformedPacket(format!(
                    "Unexpected RPC message type: {other}"
                )));
            }
        };

        if !matches!(kind, "request" | "response" | "message") {
            return Err(Error::MalformedPacket(format!(
                "Unexpected RPC message type: {kind}"
            )));
        }

        serde_json::from_value(value).map_err(|e| Error::MalformedPacket(e.to_string()))
    }

    /// Encodes the packet as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if a params or payload value fails to serialize.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(Into::into)
    }

    /// Encodes the packet as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if a params or payload value fails to serialize.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Decodes a packet from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or not a valid packet.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::MalformedPacket(e.to_string()))?;
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let packet = Packet::request(7, "add", json!({"a": 1, "b": 2}));

        assert_eq!(
            packet.to_value().unwrap(),
            json!({"type": "request", "id": 7, "method": "add", "params": {"a": 1, "b": 2}})
        );
    }

    #[test]
    fn test_null_params_are_omitted() {
        let packet = Packet::request(1, "ping", Value::Null);

        assert_eq!(
            packet.to_value().unwrap(),
            json!({"type": "request", "id": 1, "method": "ping"})
        );
        assert_eq!(Packet::from_value(packet.to_value().unwrap()).unwrap(), packet);
    }

    #[test]
    fn test_response_wire_shapes() {
        assert_eq!(
            Packet::success(3, json!(42)).to_value().unwrap(),
            json!({"type": "response", "id": 3, "success": true, "payload": 42})
        );
        assert_eq!(
            Packet::failure(3, "boom").to_value().unwrap(),
            json!({"type": "response", "id": 3, "success": false, "error": "boom"})
        );
    }

    #[test]
    fn test_failure_without_error_field() {
        let packet =
            Packet::from_value(json!({"type": "response", "id": 9, "success": false})).unwrap();

        assert_eq!(packet, Packet::failure(9, ""));
    }

    #[test]
    fn test_success_with_error_is_rejected() {
        let result = Packet::from_value(
            json!({"type": "response", "id": 9, "success": true, "error": "nope"}),
        );

        assert!(matches!(result, Err(Error::MalformedPacket(_))));
    }

    #[test]
    fn test_missing_type() {
        let err = Packet::from_value(json!({"id": 1})).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Malformed packet: Message does not contain a type."
        );
    }

    #[test]
    fn test_unknown_type() {
        let err = Packet::from_value(json!({"type": "gossip", "id": 1})).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Malformed packet: Unexpected RPC message type: gossip"
        );
    }

    #[test]
    fn test_message_from_json() {
        let packet = Packet::from_json(r#"{"type":"message","id":"ping","payload":{"x":1}}"#)
            .unwrap();

        assert_eq!(packet, Packet::message("ping", json!({"x": 1})));
        assert_eq!(packet.kind(), "message");
    }
}
