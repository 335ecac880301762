//! Integration tests for engines connected through memory transports

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether_rpc::{
    Error, FallbackTransport, KeyedHandlers, MessageListener, Rpc, RpcDefinition, rpc_messages,
    rpc_requests,
};
use tether_rpc_memory::{MemoryOptions, MemoryTransport};
use tokio::time::timeout;

#[derive(Debug, Serialize, Deserialize)]
struct Multiply {
    a: i64,
    b: i64,
}

rpc_requests! {
    trait BunRequests {
        fn multiply(Multiply) -> i64 = "multiply";
        fn throw_error(Value) -> Value = "throwError";
        fn echo(String) -> String = "echo";
    }
}

rpc_messages! {
    trait BunMessages {
        fn log(String) = "log";
    }
}

fn bun_handlers() -> KeyedHandlers {
    KeyedHandlers::new()
        .on_sync("multiply", |Multiply { a, b }| Ok::<_, String>(a * b))
        .on_sync("throwError", |_: Value| Err::<Value, _>("boom"))
        .on("echo", |text: String| async move { Ok::<_, String>(text) })
}

fn connect(options: &MemoryOptions) -> (Rpc, Rpc) {
    let (left, right) = MemoryTransport::pair_with_options(options);
    let client = Rpc::builder().transport(Arc::new(left)).build();
    let server = Rpc::builder()
        .transport(Arc::new(right))
        .request_handler(bun_handlers())
        .build();
    (client, server)
}

#[tokio::test]
async fn test_multiply_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let (client, _server) = connect(&MemoryOptions::default());

    let product = client
        .proxy()
        .request()
        .multiply(Multiply { a: 6, b: 7 })
        .await
        .expect("multiply failed");

    assert_eq!(product, 42);
}

#[tokio::test]
async fn test_error_propagation() {
    let (client, _server) = connect(&MemoryOptions::default());

    let err = client
        .proxy()
        .request()
        .throw_error(json!({}))
        .await
        .expect_err("throwError should fail");

    assert!(matches!(&err, Error::Remote(_)));
    assert_eq!(err.to_string(), "boom");
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let (client, server) = connect(&MemoryOptions::default());
    let payload: String = "0123456789abcdef".repeat(2 * 1024 * 1024 / 16 + 1);
    assert!(payload.len() >= 2 * 1024 * 1024);

    let echoed = client
        .proxy()
        .request()
        .echo(payload.clone())
        .await
        .expect("echo failed");
    assert_eq!(echoed, payload);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let listener: MessageListener = Arc::new(move |value| {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(value.as_str().map(str::to_string));
        }
    });
    server.add_message_listener("log", listener).unwrap();

    client.proxy().send().log(payload.clone()).unwrap();
    let received = timeout(Duration::from_secs(5), rx)
        .await
        .expect("message not delivered")
        .unwrap();
    assert_eq!(received.as_deref(), Some(payload.as_str()));
}

#[tokio::test]
async fn test_many_concurrent_requests_with_batching() {
    let (client, _server) = connect(&MemoryOptions { max_batch: 8 });

    let futures: Vec<_> = (0..50)
        .map(|i| client.request("multiply", json!({"a": i, "b": 2})))
        .collect();

    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(future.await.unwrap(), json!(i * 2));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_transport_swap_between_memory_links() {
    let (first_left, first_right) = MemoryTransport::pair();
    let (second_left, second_right) = MemoryTransport::pair();

    let server_a = Rpc::builder()
        .transport(Arc::new(first_right))
        .request_handler(KeyedHandlers::new().on_sync("who", |_: Value| Ok::<_, String>("a")))
        .build();
    let server_b = Rpc::builder()
        .transport(Arc::new(second_right))
        .request_handler(KeyedHandlers::new().on_sync("who", |_: Value| Ok::<_, String>("b")))
        .build();

    let client = Rpc::builder().transport(Arc::new(first_left)).build();
    assert_eq!(client.request("who", ()).await.unwrap(), json!("a"));

    client.set_transport(Arc::new(second_left));
    assert_eq!(client.request("who", ()).await.unwrap(), json!("b"));

    // The old link no longer reaches the client.
    let heard = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&heard);
    let listener: MessageListener = Arc::new(move |_| *counter.lock() += 1);
    client.add_message_listener("ping", listener).unwrap();

    server_a.send("ping", ()).unwrap();
    server_b.send("ping", ()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*heard.lock(), 1);
}

#[tokio::test]
async fn test_definition_wired_after_transport_arrives() {
    let logs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&logs);
    let any = Arc::clone(&logs);

    let webview = RpcDefinition::new()
        .requests(KeyedHandlers::new().on_sync("ping", |_: Value| Ok::<_, String>("pong")))
        .extra_requests(
            KeyedHandlers::new().on_sync("ping", |_: Value| Ok::<_, String>("extra pong")),
        )
        .any_message(move |name, _| any.lock().push(format!("*:{name}")))
        .message("log", move |payload| {
            sink.lock().push(format!("log:{}", payload.as_str().unwrap_or_default()));
        })
        .max_request_time(Duration::from_secs(5))
        .build();

    let (left, right) = MemoryTransport::pair();
    webview.set_transport(Arc::new(left));
    let bun = Rpc::builder().transport(Arc::new(right)).build();

    assert_eq!(bun.request("ping", ()).await.unwrap(), json!("extra pong"));

    bun.send("log", "hello").unwrap();
    bun.send("other", ()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        *logs.lock(),
        vec!["*:log".to_string(), "log:hello".to_string(), "*:other".to_string()]
    );
}

#[tokio::test]
async fn test_fallback_transport_switches_when_primary_closes() {
    let (primary, primary_peer) = MemoryTransport::pair();
    let (secondary, secondary_peer) = MemoryTransport::pair();

    let server_primary = Rpc::builder()
        .transport(Arc::new(primary_peer))
        .request_handler(bun_handlers())
        .build();
    let server_secondary = Rpc::builder()
        .transport(Arc::new(secondary_peer))
        .request_handler(bun_handlers())
        .build();

    let primary = Arc::new(primary);
    let fallback = FallbackTransport::new(primary.clone(), Arc::new(secondary));
    let client = Rpc::builder().transport(Arc::new(fallback)).build();

    let product = client
        .request("multiply", json!({"a": 3, "b": 3}))
        .await
        .unwrap();
    assert_eq!(product, json!(9));

    primary.close();
    let product = client
        .request("multiply", json!({"a": 4, "b": 4}))
        .await
        .unwrap();
    assert_eq!(product, json!(16));

    drop((server_primary, server_secondary));
}
