//! Cluster redirects and transient errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder_client::{key_slot, ClientError, Command, Frame};

use crate::helpers::{
    bulk, connect, error, eventually, kv_handler, simple, test_config, Action, MockNetwork,
    MockNode, Protocol,
};

/// A node that answers every keyed command with `reply` and PING normally.
fn redirecting(reply: &'static str) -> Arc<MockNode> {
    MockNode::new(move |args| match args[0].as_str() {
        "PING" => Action::Reply(simple("PONG")),
        _ => Action::Reply(error(reply)),
    })
}

#[tokio::test]
async fn moved_updates_the_slot_table() {
    assert_eq!(key_slot(b"foo"), 12182);

    let network = MockNetwork::new();
    let a = redirecting("MOVED 12182 node-b:7001");
    let b = MockNode::kv(Protocol::Resp3);
    let a_ep = network.add("node-a:7000", &a);
    let b_ep = network.add("node-b:7001", &b);
    let client = connect(&network, test_config(&a_ep)).await;

    client
        .submit(Command::new(["SET", "foo", "bar"]))
        .await
        .unwrap();
    assert_eq!(client.slot_owner(12182), Some(b_ep.clone()));

    // the next request for the slot skips the old owner
    let reply = client.submit(Command::new(["GET", "foo"])).await.unwrap();
    assert_eq!(reply, bulk("bar"));
    assert_eq!(a.count("SET"), 1);
    assert_eq!(a.count("GET"), 0);
    assert_eq!(b.count("GET"), 1);

    let stats = client.stats();
    assert_eq!(stats.moved, 1);
    assert_eq!(stats.retransmissions(), 1);
}

#[tokio::test]
async fn ask_sends_asking_and_leaves_the_table_alone() {
    let network = MockNetwork::new();
    let a = redirecting("ASK 12182 node-b:7001");
    let b = MockNode::kv(Protocol::Resp3);
    let a_ep = network.add("node-a:7000", &a);
    network.add("node-b:7001", &b);
    let client = connect(&network, test_config(&a_ep)).await;

    let reply = client.submit(Command::new(["GET", "foo"])).await.unwrap();
    assert_eq!(reply, Frame::NullBulk);
    assert_eq!(
        b.log(),
        vec![vec!["ASKING".to_string()], vec!["GET".into(), "foo".into()]]
    );
    assert_eq!(client.slot_owner(12182), None);

    // ASK is one-shot: the next request goes back to the old owner
    client.submit(Command::new(["GET", "foo"])).await.unwrap();
    assert_eq!(a.count("GET"), 2);
    assert_eq!(client.stats().asked, 2);
}

#[tokio::test]
async fn redirect_without_host_keeps_the_origin_host() {
    let network = MockNetwork::new();
    let a = redirecting("MOVED 12182 :7001");
    let b = MockNode::kv(Protocol::Resp3);
    let a_ep = network.add("node-a:7000", &a);
    let b_ep = network.add("node-a:7001", &b);
    let client = connect(&network, test_config(&a_ep)).await;

    let reply = client.submit(Command::new(["GET", "foo"])).await.unwrap();
    assert_eq!(reply, Frame::NullBulk);
    assert_eq!(client.slot_owner(12182), Some(b_ep));
}

#[tokio::test]
async fn redirect_loop_gives_up_with_the_last_error() {
    let network = MockNetwork::new();
    let a = redirecting("MOVED 12182 node-b:7001");
    let b = redirecting("MOVED 12182 node-a:7000");
    let a_ep = network.add("node-a:7000", &a);
    network.add("node-b:7001", &b);
    let client = connect(&network, test_config(&a_ep)).await;

    let reply = client.submit(Command::new(["GET", "foo"])).await.unwrap();
    let message = reply.as_error().expect("error reply");
    assert!(message.starts_with("MOVED 12182"), "got {message}");

    // one initial attempt plus the redirect limit
    let limit = client.config().retry.max_redirects as usize;
    assert_eq!(a.count("GET") + b.count("GET"), limit + 1);
    assert_eq!(client.stats().moved, limit as u64);
}

#[tokio::test]
async fn redirect_to_unreachable_node() {
    let network = MockNetwork::new();
    let a = redirecting("MOVED 12182 node-z:9999");
    let a_ep = network.add("node-a:7000", &a);
    let client = connect(&network, test_config(&a_ep)).await;

    let err = client
        .submit(Command::new(["GET", "foo"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionUnavailable(_)), "got {err:?}");
    assert!(!err.maybe_executed());
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let network = MockNetwork::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let kv = kv_handler(Protocol::Resp3);
    let node = MockNode::new(move |args| {
        if args[0] == "GET" && counter.fetch_add(1, Ordering::SeqCst) < 2 {
            return Action::Reply(error("TRYAGAIN Multiple keys request during rehashing"));
        }
        kv(args)
    });
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let reply = client.submit(Command::new(["GET", "foo"])).await.unwrap();
    assert_eq!(reply, Frame::NullBulk);
    assert_eq!(node.count("GET"), 3);
    assert_eq!(client.stats().transient_retries, 2);
}

#[tokio::test]
async fn transient_errors_give_up_after_the_retry_limit() {
    let network = MockNetwork::new();
    let node = redirecting("CLUSTERDOWN The cluster is down");
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let reply = client.submit(Command::new(["GET", "foo"])).await.unwrap();
    assert_eq!(reply.as_error(), Some("CLUSTERDOWN The cluster is down"));
    let limit = client.config().retry.max_retries as usize;
    assert_eq!(node.count("GET"), limit + 1);
}

#[tokio::test]
async fn pinned_slot_overrides_the_key() {
    let network = MockNetwork::new();
    let a = MockNode::kv(Protocol::Resp3);
    let b = MockNode::kv(Protocol::Resp3);
    let a_ep = network.add("node-a:7000", &a);
    let b_ep = network.add("node-b:7001", &b);
    let client = connect(&network, test_config(&a_ep)).await;
    client.assign_slots(0..=99, &b_ep);

    client
        .submit(Command::new(["SET", "foo", "x"]).with_slot(42))
        .await
        .unwrap();
    assert_eq!(b.count("SET"), 1);
    assert_eq!(a.count("SET"), 0);
}

#[tokio::test]
async fn moved_to_a_literal_address() {
    let network = MockNetwork::new();
    let a = redirecting("MOVED 3999 127.0.0.1:7001");
    let b = MockNode::kv(Protocol::Resp3);
    let a_ep = network.add("127.0.0.1:7000", &a);
    let b_ep = network.add("127.0.0.1:7001", &b);
    let client = connect(&network, test_config(&a_ep)).await;

    let get = || Command::new(["GET", "k"]).with_slot(3999);
    assert_eq!(client.submit(get()).await.unwrap(), Frame::NullBulk);
    assert_eq!(client.slot_owner(3999), Some(b_ep));
    assert_eq!(b.count("GET"), 1);

    assert_eq!(client.submit(get()).await.unwrap(), Frame::NullBulk);
    assert_eq!(a.count("GET"), 1);
    assert_eq!(b.count("GET"), 2);
    assert_eq!(client.stats().retransmissions(), 1);
}

#[tokio::test]
async fn ask_to_a_literal_address() {
    let network = MockNetwork::new();
    let a = redirecting("ASK 3999 127.0.0.1:7002");
    let b = MockNode::kv(Protocol::Resp3);
    let a_ep = network.add("127.0.0.1:7000", &a);
    network.add("127.0.0.1:7002", &b);
    let client = connect(&network, test_config(&a_ep)).await;

    let reply = client
        .submit(Command::new(["GET", "k"]).with_slot(3999))
        .await
        .unwrap();
    assert_eq!(reply, Frame::NullBulk);
    assert_eq!(b.count("ASKING"), 1);
    assert_eq!(b.count("GET"), 1);
    assert_eq!(client.slot_owner(3999), None);
    assert_eq!(client.stats().retransmissions(), 1);
}

#[tokio::test]
async fn slow_connect_does_not_block_other_endpoints() {
    let network = MockNetwork::new();
    let a = redirecting("MOVED 12182 node-z:7999");
    let a_ep = network.add("node-a:7000", &a);
    network.stall("node-z:7999");
    let config = test_config(&a_ep).connect_timeout(Duration::from_millis(500));
    let client = connect(&network, config).await;

    let stuck = tokio::spawn({
        let client = client.clone();
        async move { client.submit(Command::new(["GET", "foo"])).await }
    });
    eventually("redirect received", || a.count("GET") == 1).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    // the default endpoint is already connected and must not wait on node-z
    let started = Instant::now();
    let pong = client.submit(Command::new(["PING"])).await.unwrap();
    assert_eq!(pong, simple("PONG"));
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "PING waited {:?} behind a stalled connect",
        started.elapsed()
    );

    let err = stuck.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::ConnectionUnavailable(_)), "got {err:?}");
}
