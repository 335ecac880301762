//! Inbound request handling.
//!
//! A [`RequestHandler`] is either a single dispatch function that sees every
//! method, or a [`KeyedHandlers`] table of per-method functions with an
//! optional fallback. Either form is normalized into one dispatch closure when
//! it is installed on an engine.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use crate::dispatcher::panic_message;
use crate::error::HandlerError;
use crate::packet::Outcome;

/// Result of handling one request.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

type MethodFn = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type FallbackFn = Arc<dyn Fn(String, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Normalized form of a [`RequestHandler`].
pub(crate) type DispatchFn =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Handler that receives every inbound request.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handles one request.
    ///
    /// # Errors
    ///
    /// The error's message is sent to the peer as a failed response.
    async fn handle(&self, method: &str, params: Value) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, method: &str, params: Value) -> HandlerResult {
        (self.0)(method.to_string(), params).await
    }
}

/// Per-method request handlers with an optional fallback.
#[derive(Clone, Default)]
pub struct KeyedHandlers {
    methods: HashMap<String, MethodFn>,
    fallback: Option<FallbackFn>,
}

impl KeyedHandlers {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async handler for `method`.
    ///
    /// Params are decoded into `P`; a decode failure is answered with
    /// [`HandlerError::InvalidParams`]. An `Err(e)` from the handler is
    /// answered with `e.to_string()`.
    #[must_use]
    pub fn on<P, R, E, F, Fut>(mut self, method: impl Into<String>, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let method = method.into();
        let name = method.clone();
        let handler: MethodFn = Arc::new(move |params| match decode::<P>(&name, params) {
            Ok(params) => {
                let pending = f(params);
                async move { encode(pending.await) }.boxed()
            }
            Err(e) => future::ready(Err(e)).boxed(),
        });

        self.methods.insert(method, handler);
        self
    }

    /// Registers a synchronous handler for `method`.
    #[must_use]
    pub fn on_sync<P, R, E, F>(self, method: impl Into<String>, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(P) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        self.on(method, move |params| future::ready(f(params)))
    }

    /// Sets the handler for methods without an exact entry.
    ///
    /// It receives the method name and the raw params.
    #[must_use]
    pub fn fallback<R, E, F, Fut>(mut self, f: F) -> Self
    where
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |method, params| {
            let pending = f(method, params);
            async move { encode(pending.await) }.boxed()
        }));
        self
    }

    /// Adds every entry of `other`, replacing entries with the same method.
    /// A fallback in `other` replaces this table's fallback.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.methods.extend(other.methods);
        if other.fallback.is_some() {
            self.fallback = other.fallback;
        }
        self
    }

    /// Returns `true` if `method` has an exact entry.
    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Returns `true` if a fallback is set.
    #[must_use]
    pub const fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    fn call(&self, method: String, params: Value) -> BoxFuture<'static, HandlerResult> {
        if let Some(handler) = self.methods.get(&method) {
            return handler(params);
        }

        match &self.fallback {
            Some(fallback) => {
                debug!("no handler for {}, using fallback", method);
                fallback(method, params)
            }
            None => future::ready(Err(HandlerError::NotFound(method))).boxed(),
        }
    }
}

impl Debug for KeyedHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("KeyedHandlers")
            .field("methods", &methods)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// The request handler installed on an engine.
#[derive(Clone)]
pub enum RequestHandler {
    /// One handler for every method.
    Dispatch(Arc<dyn RpcHandler>),
    /// Per-method handlers.
    Keyed(KeyedHandlers),
}

impl RequestHandler {
    /// Wraps an [`RpcHandler`].
    pub fn dispatch(handler: impl RpcHandler) -> Self {
        Self::Dispatch(Arc::new(handler))
    }

    /// Builds a dispatch handler from an async closure over
    /// `(method, params)`.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::dispatch(FnHandler(f))
    }

    pub(crate) fn normalize(self) -> DispatchFn {
        match self {
            Self::Dispatch(handler) => Arc::new(move |method, params| {
                let handler = Arc::clone(&handler);
                async move { handler.handle(&method, params).await }.boxed()
            }),
            Self::Keyed(table) => Arc::new(move |method, params| table.call(method, params)),
        }
    }
}

impl From<KeyedHandlers> for RequestHandler {
    fn from(table: KeyedHandlers) -> Self {
        Self::Keyed(table)
    }
}

impl Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch(_) => f.write_str("RequestHandler::Dispatch"),
            Self::Keyed(table) => f.debug_tuple("RequestHandler::Keyed").field(table).finish(),
        }
    }
}

/// Runs `dispatch` and turns its result, error or panic into an outcome.
pub(crate) async fn invoke(dispatch: &DispatchFn, method: String, params: Value) -> Outcome {
    let call = AssertUnwindSafe(async { dispatch(method.clone(), params).await });

    let result = match call.catch_unwind().await {
        Ok(result) => result,
        Err(cause) => {
            let message = panic_message(cause.as_ref());
            error!("request handler for {} panicked: {}", method, message);
            Err(HandlerError::Panicked(message))
        }
    };

    match result {
        Ok(payload) => Outcome::Success(payload),
        Err(e) => {
            debug!("request {} failed: {}", method, e);
            Outcome::Failure(e.to_string())
        }
    }
}

fn decode<P: DeserializeOwned>(method: &str, params: Value) -> std::result::Result<P, HandlerError> {
    serde_json::from_value(params).map_err(|e| HandlerError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

fn encode<R: Serialize, E: Display>(result: std::result::Result<R, E>) -> HandlerResult {
    let response = result.map_err(HandlerError::failed)?;
    serde_json::to_value(response).map_err(HandlerError::failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Pair {
        a: i64,
        b: i64,
    }

    fn calculator() -> KeyedHandlers {
        KeyedHandlers::new()
            .on("add", |p: Pair| async move { Ok::<_, String>(p.a + p.b) })
            .on_sync("div", |p: Pair| {
                if p.b == 0 {
                    Err("division by zero")
                } else {
                    Ok(p.a / p.b)
                }
            })
    }

    async fn run(handler: RequestHandler, method: &str, params: Value) -> Outcome {
        invoke(&handler.normalize(), method.to_string(), params).await
    }

    #[tokio::test]
    async fn test_keyed_exact_match() {
        let outcome = run(calculator().into(), "add", json!({"a": 2, "b": 3})).await;

        assert_eq!(outcome, Outcome::Success(json!(5)));
    }

    #[tokio::test]
    async fn test_handler_error_message_is_verbatim() {
        let outcome = run(calculator().into(), "div", json!({"a": 1, "b": 0})).await;

        assert_eq!(outcome, Outcome::Failure("division by zero".to_string()));
    }

    #[tokio::test]
    async fn test_missing_method_without_fallback() {
        let outcome = run(calculator().into(), "mul", json!({})).await;

        assert_eq!(
            outcome,
            Outcome::Failure("The requested method has no handler: mul".to_string())
        );
    }

    #[tokio::test]
    async fn test_fallback_receives_method_and_params() {
        let table = calculator().fallback(|method, params| async move {
            Ok::<_, String>(json!({"method": method, "params": params}))
        });

        let outcome = run(table.into(), "echo", json!([1, 2])).await;

        assert_eq!(
            outcome,
            Outcome::Success(json!({"method": "echo", "params": [1, 2]}))
        );
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let outcome = run(calculator().into(), "add", json!({"a": "two"})).await;

        let Outcome::Failure(message) = outcome else {
            panic!("expected failure");
        };
        assert!(message.starts_with("Invalid params for add:"));
    }

    #[tokio::test]
    async fn test_merge_overrides() {
        let extra = KeyedHandlers::new().on_sync("add", |_: Value| Ok::<_, String>("overridden"));
        let table = calculator().merge(extra);

        assert!(table.contains("div"));
        let outcome = run(table.into(), "add", json!({"a": 1, "b": 1})).await;
        assert_eq!(outcome, Outcome::Success(json!("overridden")));
    }

    #[tokio::test]
    async fn test_dispatch_form() {
        let handler = RequestHandler::from_fn(|method, params| async move {
            match method.as_str() {
                "echo" => Ok(params),
                _ => Err(HandlerError::NotFound(method)),
            }
        });

        assert_eq!(
            run(handler.clone(), "echo", json!("hi")).await,
            Outcome::Success(json!("hi"))
        );
        assert_eq!(
            run(handler, "nope", Value::Null).await,
            Outcome::Failure("The requested method has no handler: nope".to_string())
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_answered() {
        let table = KeyedHandlers::new().on_sync("boom", |_: Value| -> Result<(), String> {
            panic!("kaboom")
        });

        let outcome = run(table.into(), "boom", Value::Null).await;

        assert_eq!(
            outcome,
            Outcome::Failure("Handler panicked: kaboom".to_string())
        );
    }
}
