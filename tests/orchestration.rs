//! Fleet-level scenarios: many nodes, many viewers, one server.

use congo::error::ErrorKind;
use congo::protocol::AttachEndReason;
use congo::session::SessionState;
use congo::testing::TestHarness;
use congo::{Node, NodeName, Request, Response};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fleet(count: usize) -> Vec<Node> {
    (0..count)
        .map(|i| Node::new(format!("node-{i:02}"), "ssh").with_param("host", format!("10.0.0.{i}")))
        .collect()
}

/// Scenario: an operator watches one console from three terminals while the
/// node boots.
#[tokio::test]
async fn test_viewers_see_the_same_stream() {
    let harness = TestHarness::new().await.unwrap();
    harness.create(Node::new("n1", "ssh")).await.unwrap();

    let mut first = harness.attach("n1").await.unwrap();
    let mut second = harness.attach("n1").await.unwrap();
    let mut third = harness.attach("n1").await.unwrap();
    assert_eq!(harness.driver().spawn_count("n1"), 1);

    let mut remote = harness.driver().take_remote("n1").unwrap();
    for line in ["BIOS\r\n", "GRUB\r\n", "login: "] {
        remote.write_all(line.as_bytes()).await.unwrap();
    }

    let expected = b"BIOS\r\nGRUB\r\nlogin: ";
    for console in [&mut first, &mut second, &mut third] {
        let output = console.wait_for_output(b"login: ", WAIT).await.unwrap();
        assert_eq!(output, expected);
    }

    // A viewer leaving does not disturb the others.
    let (_, reason) = second.detach().await.unwrap();
    assert_eq!(reason, AttachEndReason::Detached);

    remote.write_all(b"root\r\n").await.unwrap();
    first.wait_for_output(b"root", WAIT).await.unwrap();
    third.wait_for_output(b"root", WAIT).await.unwrap();
}

/// Scenario: the newest viewer takes the keyboard; when it leaves, the
/// previous one gets it back.
#[tokio::test]
async fn test_write_token_follows_newest_viewer() {
    let harness = TestHarness::new().await.unwrap();
    harness.create(Node::new("n1", "ssh")).await.unwrap();

    let mut old = harness.attach("n1").await.unwrap();
    assert!(old.writable());
    let mut remote = harness.driver().take_remote("n1").unwrap();

    let mut new = harness.attach("n1").await.unwrap();
    assert!(new.writable());

    // Input from the displaced viewer is dropped; the newest one's arrives.
    old.send(b"ignored").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    new.send(b"typed").await.unwrap();

    let mut buf = [0u8; 5];
    timeout(WAIT, remote.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"typed");

    new.detach().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    old.send(b"again").await.unwrap();
    timeout(WAIT, remote.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"again");
}

/// Scenario: many viewers hit a cold on-demand node at once.
#[tokio::test]
async fn test_concurrent_attach_opens_once() {
    let harness = TestHarness::new().await.unwrap();
    harness.create(Node::new("n1", "ssh")).await.unwrap();

    let attaches = (0..10).map(|_| harness.attach("n1"));
    let consoles = futures::future::join_all(attaches).await;
    assert!(consoles.iter().all(Result::is_ok));
    assert_eq!(harness.driver().spawn_count("n1"), 1);

    let session = harness.manager().sessions().get("n1").await.unwrap();
    assert_eq!(session.viewer_count(), 10);
}

/// Scenario: register a rack, open every console, then decommission it.
#[tokio::test]
async fn test_bulk_fleet_lifecycle() {
    let harness = TestHarness::new().await.unwrap();
    let nodes = fleet(24);
    let names: Vec<NodeName> = nodes.iter().map(|n| NodeName { name: n.name.clone() }).collect();

    let response = harness
        .request(Request::CreateBulk { nodes: nodes.clone() })
        .await
        .unwrap();
    let Response::Bulk { result } = response else {
        panic!("expected bulk result, got {response:?}");
    };
    assert_eq!(result.len(), 24);
    assert_eq!(result.failure_count(), 0);

    let response = harness
        .request(Request::SetState {
            nodes: names.clone(),
            state: "open".into(),
        })
        .await
        .unwrap();
    let Response::Bulk { result } = response else {
        panic!("expected bulk result, got {response:?}");
    };
    assert_eq!(result.failure_count(), 0);
    for node in &nodes {
        assert_eq!(harness.driver().spawn_count(&node.name), 1);
        assert_eq!(
            harness.manager().console_state(&node.name).await,
            Some(SessionState::Open)
        );
    }

    let mut to_delete = names.clone();
    to_delete.push(NodeName::from("node-00"));
    to_delete.push(NodeName::from("ghost"));
    let response = harness
        .request(Request::DeleteBulk { nodes: to_delete })
        .await
        .unwrap();
    let Response::Bulk { result } = response else {
        panic!("expected bulk result, got {response:?}");
    };
    assert_eq!(result.len(), 25);
    assert!(result.outcome("node-05").unwrap().is_success());
    assert_eq!(result.outcomes("node-00").len(), 2);
    assert_eq!(result.outcomes("node-00")[1].error(), Some(ErrorKind::Conflict));
    assert_eq!(result.outcome("ghost").unwrap().error(), Some(ErrorKind::NotFound));

    for node in &nodes {
        assert_eq!(harness.manager().console_state(&node.name).await, None);
    }
    assert_eq!(
        harness.request(Request::List).await.unwrap(),
        Response::Nodes { nodes: vec![] }
    );
}

/// Scenario: part of a batch is unreachable; the rest still opens.
#[tokio::test]
async fn test_partial_failures_are_reported_per_node() {
    let harness = TestHarness::new().await.unwrap();
    harness.create(Node::new("good", "ssh")).await.unwrap();
    harness
        .create(Node::new("local-bad", "cmd"))
        .await
        .unwrap();

    let response = harness
        .request(Request::SetState {
            nodes: vec!["good".into(), "local-bad".into(), "missing".into()],
            state: "open".into(),
        })
        .await
        .unwrap();
    let Response::Bulk { result } = response else {
        panic!("expected bulk result, got {response:?}");
    };

    assert!(result.outcome("good").unwrap().is_success());
    // A cmd node without a command cannot start.
    assert_eq!(
        result.outcome("local-bad").unwrap().error(),
        Some(ErrorKind::DriverFailure)
    );
    assert_eq!(
        result.outcome("missing").unwrap().error(),
        Some(ErrorKind::NotFound)
    );
}

/// Scenario: an invalid target state is rejected before anything runs.
#[tokio::test]
async fn test_invalid_state_rejects_whole_batch() {
    let harness = TestHarness::new().await.unwrap();
    harness.create(Node::new("n1", "ssh")).await.unwrap();

    let response = harness
        .request(Request::SetState {
            nodes: vec!["n1".into()],
            state: "reboot".into(),
        })
        .await
        .unwrap();
    assert!(matches!(
        response,
        Response::Error {
            kind: ErrorKind::InvalidArgument,
            ..
        }
    ));
    assert_eq!(harness.driver().spawn_count("n1"), 0);
}
