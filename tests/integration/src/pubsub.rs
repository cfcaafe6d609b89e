//! Integration tests for pub/sub.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cinder_client::{ClientError, Command, Frame, Message, Subscription, SubscriptionKind};
use tokio_stream::StreamExt;

use crate::helpers::{
    connect, error, eventually, kv_handler, message, pmessage, test_config, Action, MockNetwork,
    MockNode, Protocol,
};

async fn recv(sub: &mut Subscription) -> Option<Message> {
    tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("timed out waiting for a message")
}

#[tokio::test]
async fn subscribe_and_receive_push() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let mut sub = client.subscribe("news").await.unwrap();
    assert_eq!(sub.kind(), SubscriptionKind::Channel);
    assert_eq!(sub.name(), b"news");
    assert_eq!(client.subscription_count(), 1);

    node.publish(message(Protocol::Resp3, "news", "hello"));
    let msg = recv(&mut sub).await.unwrap();
    assert_eq!(&msg.channel[..], b"news");
    assert_eq!(&msg.payload[..], b"hello");
    assert_eq!(msg.pattern, None);
}

#[tokio::test]
async fn resp2_subscriber_arrays() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp2);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let mut sub = client.subscribe("news").await.unwrap();
    node.publish(message(Protocol::Resp2, "news", "one"));
    node.publish(message(Protocol::Resp2, "news", "two"));

    assert_eq!(&recv(&mut sub).await.unwrap().payload[..], b"one");
    assert_eq!(&recv(&mut sub).await.unwrap().payload[..], b"two");
}

#[tokio::test]
async fn pattern_subscription() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let mut sub = client.psubscribe("user:*").await.unwrap();
    assert_eq!(sub.kind(), SubscriptionKind::Pattern);

    node.publish(pmessage(Protocol::Resp3, "user:*", "user:login", "alice"));
    let msg = recv(&mut sub).await.unwrap();
    assert_eq!(msg.pattern.as_deref(), Some(&b"user:*"[..]));
    assert_eq!(&msg.channel[..], b"user:login");
    assert_eq!(&msg.payload[..], b"alice");
}

#[tokio::test]
async fn messages_for_other_channels_are_ignored() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let mut sub = client.subscribe("news").await.unwrap();
    node.publish(message(Protocol::Resp3, "sports", "goal"));
    node.publish(message(Protocol::Resp3, "news", "headline"));

    let msg = recv(&mut sub).await.unwrap();
    assert_eq!(&msg.channel[..], b"news");
    assert_eq!(&msg.payload[..], b"headline");
}

#[tokio::test]
async fn commands_run_beside_subscriptions() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp2);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let mut sub = client.subscribe("news").await.unwrap();
    let pong = client.submit(Command::new(["PING"])).await.unwrap();
    assert_eq!(pong, Frame::Simple("PONG".into()));

    // subscriptions live on their own connection
    assert_eq!(node.connections(), 2);

    node.publish(message(Protocol::Resp2, "news", "still here"));
    assert_eq!(&recv(&mut sub).await.unwrap().payload[..], b"still here");
}

#[tokio::test]
async fn unsubscribe_ends_the_subscription() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let mut sub = client.subscribe("news").await.unwrap();
    let mut other = sub.resubscribe();
    client.unsubscribe("news").await.unwrap();

    assert_eq!(recv(&mut sub).await, None);
    assert_eq!(recv(&mut other).await, None);
    assert_eq!(node.count("UNSUBSCRIBE"), 1);
    assert_eq!(client.subscription_count(), 0);

    // unsubscribing again is a no-op that sends nothing
    client.unsubscribe("news").await.unwrap();
    assert_eq!(node.count("UNSUBSCRIBE"), 1);
}

#[tokio::test]
async fn rejected_subscription_is_rolled_back() {
    let network = MockNetwork::new();
    let kv = kv_handler(Protocol::Resp3);
    let node = MockNode::new(move |args| {
        if args.get(1).is_some_and(|ch| ch == "secret") {
            return Action::Reply(error(
                "NOPERM this user has no permissions to access the 'secret' channel",
            ));
        }
        kv(args)
    });
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let err = client.subscribe("secret").await.unwrap_err();
    assert!(
        matches!(&err, ClientError::SubscriptionRejected(msg) if msg.starts_with("NOPERM")),
        "got {err:?}"
    );
    assert_eq!(client.subscription_count(), 0);

    // the subscriber connection is still in sync
    let mut sub = client.subscribe("public").await.unwrap();
    node.publish(message(Protocol::Resp3, "public", "hi"));
    assert_eq!(&recv(&mut sub).await.unwrap().payload[..], b"hi");
}

#[tokio::test]
async fn subscriptions_are_replayed_after_reconnect() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let mut news = client.subscribe("news").await.unwrap();
    let mut users = client.psubscribe("user:*").await.unwrap();

    node.drop_connections();
    eventually("subscriptions replayed", || {
        node.count("SUBSCRIBE") == 2 && node.count("PSUBSCRIBE") == 2
    })
    .await;

    node.publish(message(Protocol::Resp3, "news", "back"));
    node.publish(pmessage(Protocol::Resp3, "user:*", "user:1", "online"));
    assert_eq!(&recv(&mut news).await.unwrap().payload[..], b"back");
    assert_eq!(&recv(&mut users).await.unwrap().payload[..], b"online");
    assert_eq!(client.subscription_count(), 2);
}

#[tokio::test]
async fn subscription_as_stream() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let sub = client.subscribe("ticks").await.unwrap();
    for i in 0..3 {
        node.publish(message(Protocol::Resp3, "ticks", &i.to_string()));
    }

    let payloads: Vec<_> = tokio::time::timeout(
        Duration::from_secs(2),
        sub.into_stream().take(3).map(|m| m.payload).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    assert_eq!(payloads, vec!["0", "1", "2"]);
}

#[tokio::test]
async fn failed_replay_is_retried_on_a_fresh_connection() {
    let network = MockNetwork::new();
    let subscribes = AtomicUsize::new(0);
    let kv = kv_handler(Protocol::Resp3);
    // the first replay goes unanswered
    let node = MockNode::new(move |args| {
        if args[0] == "SUBSCRIBE" && subscribes.fetch_add(1, Ordering::SeqCst) == 1 {
            return Action::Silent;
        }
        kv(args)
    });
    let endpoint = network.add("node-a:7000", &node);
    let config = test_config(&endpoint).request_timeout(Duration::from_millis(50));
    let client = connect(&network, config).await;

    let mut news = client.subscribe("news").await.unwrap();
    node.drop_connections();

    eventually("replay retried", || node.count("SUBSCRIBE") == 3).await;
    // the connection whose replay timed out was never reused
    assert_eq!(node.connections(), 4);

    node.publish(message(Protocol::Resp3, "news", "restored"));
    assert_eq!(&recv(&mut news).await.unwrap().payload[..], b"restored");
    assert_eq!(client.stats().timeouts, 1);
}
