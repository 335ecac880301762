//! Engine configuration and debug hooks.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::packet::Packet;

/// Default time a request may stay pending.
pub const DEFAULT_MAX_REQUEST_TIME: Duration = Duration::from_millis(1000);

/// Default request id ceiling before the counter wraps.
pub const DEFAULT_ID_CEILING: u64 = 10_000_000_000;

/// How long a request may wait for its response.
///
/// Serialized as a number of milliseconds, or `null` for no limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum MaxRequestTime {
    /// Fail with [`Error::Timeout`](crate::Error::Timeout) after this long.
    Finite(Duration),
    /// Never time out.
    Infinite,
}

impl Default for MaxRequestTime {
    fn default() -> Self {
        Self::Finite(DEFAULT_MAX_REQUEST_TIME)
    }
}

impl From<Duration> for MaxRequestTime {
    fn from(duration: Duration) -> Self {
        Self::Finite(duration)
    }
}

impl From<Option<u64>> for MaxRequestTime {
    fn from(millis: Option<u64>) -> Self {
        millis.map_or(Self::Infinite, |ms| Self::Finite(Duration::from_millis(ms)))
    }
}

impl From<MaxRequestTime> for Option<u64> {
    fn from(time: MaxRequestTime) -> Self {
        match time {
            MaxRequestTime::Finite(duration) => {
                Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            MaxRequestTime::Infinite => None,
        }
    }
}

/// Configuration for an [`Rpc`](crate::Rpc) engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Time a request may stay pending before it fails.
    #[serde(rename = "max_request_time_ms")]
    pub max_request_time: MaxRequestTime,
    /// Highest request id before the counter wraps to 0.
    pub id_ceiling: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_request_time: MaxRequestTime::default(),
            id_ceiling: DEFAULT_ID_CEILING,
        }
    }
}

type SendHook = Arc<dyn Fn(&Packet) + Send + Sync>;
type ReceiveHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// Observers for packet traffic.
///
/// Hooks see every outbound packet just before it is handed to the transport
/// and every inbound value before it is classified. They cannot alter either.
#[derive(Clone, Default)]
pub struct DebugHooks {
    on_send: Option<SendHook>,
    on_receive: Option<ReceiveHook>,
}

impl DebugHooks {
    /// Creates an empty set of hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes outbound packets.
    #[must_use]
    pub fn on_send<F>(mut self, f: F) -> Self
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.on_send = Some(Arc::new(f));
        self
    }

    /// Observes inbound values.
    #[must_use]
    pub fn on_receive<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(f));
        self
    }

    pub(crate) fn sent(&self, packet: &Packet) {
        if let Some(hook) = &self.on_send {
            hook(packet);
        }
    }

    pub(crate) fn received(&self, value: &Value) {
        if let Some(hook) = &self.on_receive {
            hook(value);
        }
    }
}

impl Debug for DebugHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugHooks")
            .field("on_send", &self.on_send.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .finish()
    }
}
