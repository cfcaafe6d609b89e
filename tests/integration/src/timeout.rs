//! Request timeouts and caller cancellation.

use std::time::Duration;

use cinder_client::{ClientError, Command, Frame};

use crate::helpers::{
    connect, kv_handler, simple, test_config, Action, MockNetwork, MockNode, Protocol,
};

/// A kv node that answers `SLOW` after `delay`.
fn slow_node(delay: Duration) -> std::sync::Arc<MockNode> {
    let kv = kv_handler(Protocol::Resp3);
    MockNode::new(move |args| match args[0].as_str() {
        "SLOW" => Action::Delay(delay, simple("LATE")),
        "BLACKHOLE" => Action::Silent,
        _ => kv(args),
    })
}

#[tokio::test]
async fn request_timeout_discards_the_late_reply() {
    let network = MockNetwork::new();
    let node = slow_node(Duration::from_millis(200));
    let endpoint = network.add("node-a:7000", &node);
    let config = test_config(&endpoint).request_timeout(Duration::from_millis(50));
    let client = connect(&network, config).await;

    let err = client.submit(Command::new(["SLOW"])).await.unwrap_err();
    assert_eq!(err, ClientError::Timeout);
    assert!(err.maybe_executed());
    assert_eq!(client.stats().timeouts, 1);

    // let the late reply arrive; it belongs to the abandoned request
    tokio::time::sleep(Duration::from_millis(250)).await;
    let reply = client.submit(Command::new(["PING"])).await.unwrap();
    assert_eq!(reply, Frame::Simple("PONG".into()));
    assert_eq!(node.connections(), 1);
}

#[tokio::test]
async fn dropped_caller_does_not_shift_replies() {
    let network = MockNetwork::new();
    let node = slow_node(Duration::from_millis(100));
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), client.submit(Command::new(["SLOW"])))
            .await;
    assert!(abandoned.is_err());

    let echo = client
        .submit(Command::new(["ECHO", "after"]))
        .await
        .unwrap();
    assert_eq!(echo.as_str(), Some("after"));
    // caller-side cancellation is not a request timeout
    assert_eq!(client.stats().timeouts, 0);
}

#[tokio::test]
async fn silent_server_times_out_every_waiter() {
    let network = MockNetwork::new();
    let node = slow_node(Duration::ZERO);
    let endpoint = network.add("node-a:7000", &node);
    let config = test_config(&endpoint).request_timeout(Duration::from_millis(30));
    let client = connect(&network, config).await;

    let (a, b) = tokio::join!(
        client.submit(Command::new(["BLACKHOLE"])),
        client.submit(Command::new(["BLACKHOLE"])),
    );
    assert_eq!(a, Err(ClientError::Timeout));
    assert_eq!(b, Err(ClientError::Timeout));
    assert_eq!(client.stats().timeouts, 2);
}
