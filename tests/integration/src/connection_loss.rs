//! Connection failures: what callers see and how the client recovers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cinder_client::{ClientError, Command, Frame, Multiplexer, RetryPolicy};

use crate::helpers::{
    connect, eventually, init_tracing, kv_handler, simple, test_config, Action, MockNetwork,
    MockNode, Protocol,
};

/// A kv node that drops the connection the first `n` times it sees `CRASH`.
fn crashing(n: usize) -> Arc<MockNode> {
    let crashes = AtomicUsize::new(0);
    let kv = kv_handler(Protocol::Resp3);
    MockNode::new(move |args| {
        if args[0] == "CRASH" {
            if crashes.fetch_add(1, Ordering::SeqCst) < n {
                return Action::Close;
            }
            return Action::Reply(simple("SURVIVED"));
        }
        kv(args)
    })
}

#[tokio::test]
async fn sent_request_fails_with_maybe_executed() {
    let network = MockNetwork::new();
    let node = crashing(1);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let err = client.submit(Command::new(["CRASH"])).await.unwrap_err();
    assert_eq!(err, ClientError::ConnectionLost { sent: true });
    assert!(err.maybe_executed());
    // not retried by default
    assert_eq!(node.count("CRASH"), 1);

    // the next request reconnects
    let pong = client.submit(Command::new(["PING"])).await.unwrap();
    assert_eq!(pong, Frame::Simple("PONG".into()));
    assert_eq!(node.connections(), 2);
    eventually("failure recorded", || client.stats().connection_failures == 1).await;
}

#[tokio::test]
async fn retry_after_send_is_opt_in() {
    let network = MockNetwork::new();
    let node = crashing(1);
    let endpoint = network.add("node-a:7000", &node);
    let config = test_config(&endpoint);
    let retry = RetryPolicy {
        retry_after_send: true,
        ..config.retry.clone()
    };
    let client = connect(&network, config.retry(retry)).await;

    let reply = client.submit(Command::new(["CRASH"])).await.unwrap();
    assert_eq!(reply, Frame::Simple("SURVIVED".into()));
    assert_eq!(node.count("CRASH"), 2);
    assert_eq!(client.stats().connection_retries, 1);
}

#[tokio::test]
async fn unsent_request_is_retried_on_a_new_connection() {
    let network = MockNetwork::new();
    let node = crashing(1);
    let endpoint = network.add("node-a:7000", &node);
    // one request in flight at a time, so ECHO is held back until CRASH is
    // resolved and never reaches the dying connection
    let client = connect(&network, test_config(&endpoint).max_in_flight(1)).await;

    let (crash, echo) = tokio::join!(
        client.submit(Command::new(["CRASH"])),
        client.submit(Command::new(["ECHO", "behind"])),
    );
    assert_eq!(crash, Err(ClientError::ConnectionLost { sent: true }));
    assert_eq!(echo.unwrap().as_str(), Some("behind"));

    assert_eq!(node.count("ECHO"), 1);
    assert_eq!(node.connections(), 2);
    assert_eq!(client.stats().connection_retries, 1);
}

#[tokio::test]
async fn unreachable_default_endpoint() {
    init_tracing();
    let network = MockNetwork::new();
    let endpoint = "nowhere:6379".parse().unwrap();

    let err = Multiplexer::builder(test_config(&endpoint))
        .connector(network)
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionUnavailable(_)), "got {err:?}");
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);

    let err = Multiplexer::builder(test_config(&endpoint).max_in_flight(0))
        .connector(network)
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidConfig(_)), "got {err:?}");
    assert_eq!(node.connections(), 0);
}
