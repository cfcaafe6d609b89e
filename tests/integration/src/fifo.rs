//! Pipelining: many callers share one connection and every reply reaches
//! the caller that sent the request.

use bytes::Bytes;
use cinder_client::{Command, Frame};

use crate::helpers::{connect, test_config, MockNetwork, MockNode, Protocol};

fn echo(msg: String) -> Command {
    Command::new([Bytes::from_static(b"ECHO"), Bytes::from(msg)])
}

#[tokio::test]
async fn concurrent_callers_get_their_own_replies() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let mut tasks = Vec::new();
    for i in 0..64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client.submit(echo(format!("msg-{i}"))).await.unwrap();
            (i, reply)
        }));
    }
    for task in tasks {
        let (i, reply) = task.await.unwrap();
        assert_eq!(reply.as_str(), Some(format!("msg-{i}").as_str()));
    }

    // everything went over the single default connection
    assert_eq!(node.connections(), 1);
    assert_eq!(node.count("ECHO"), 64);
    assert_eq!(client.stats().submitted, 64);
}

#[tokio::test]
async fn replies_split_into_single_bytes() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    node.set_chunked(true);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let (a, b, c) = tokio::join!(
        client.submit(echo("first".into())),
        client.submit(echo("second".into())),
        client.submit(Command::new(["PING"])),
    );
    assert_eq!(a.unwrap().as_str(), Some("first"));
    assert_eq!(b.unwrap().as_str(), Some("second"));
    assert_eq!(c.unwrap(), Frame::Simple("PONG".into()));
}

#[tokio::test]
async fn null_and_empty_are_distinct() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let missing = client.submit(Command::new(["GET", "nothing"])).await.unwrap();
    assert_eq!(missing, Frame::NullBulk);

    client
        .submit(Command::new(["SET", "blank", ""]))
        .await
        .unwrap();
    let blank = client.submit(Command::new(["GET", "blank"])).await.unwrap();
    assert_eq!(blank, Frame::Bulk(Bytes::new()));
}

#[tokio::test]
async fn error_replies_are_values() {
    let network = MockNetwork::new();
    let node = MockNode::kv(Protocol::Resp3);
    let endpoint = network.add("node-a:7000", &node);
    let client = connect(&network, test_config(&endpoint)).await;

    let reply = client.submit(Command::new(["BOGUS"])).await.unwrap();
    assert_eq!(reply.as_error(), Some("ERR unknown command 'BOGUS'"));

    // the connection is still usable afterwards
    let pong = client.submit(Command::new(["PING"])).await.unwrap();
    assert_eq!(pong, Frame::Simple("PONG".into()));
    assert_eq!(client.stats().retransmissions(), 0);
}
