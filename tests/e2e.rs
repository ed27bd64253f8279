//! End-to-end scenarios exercising real `TcpListener`s on OS-assigned
//! ports, one client connection per request.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{send_command, spawn_follower, spawn_leader, spawn_leader_with_peers, wait_until};
use dkv::protocol::{Command, Response};
use dkv::router::{Router, DEFAULT_MULTIPLIER};

#[tokio::test]
async fn single_leader_set_then_get() {
    let router = Arc::new(Router::new(DEFAULT_MULTIPLIER));
    router.add_group("g1");
    let (node, _dir) = spawn_leader(router, "g1").await;

    let resp = send_command(
        node.addr,
        &Command::Set { key: "apple".to_string(), value: "42".to_string(), req_id: 1000 },
    )
    .await;
    assert_eq!(resp, Response::Ok);

    let resp = send_command(node.addr, &Command::Get { key: "apple".to_string(), req_id: 0 }).await;
    assert_eq!(resp, Response::Value { value: "42".to_string(), req_id: 1000 });
}

#[tokio::test]
async fn delete_then_get_reports_non_existent_key() {
    let router = Arc::new(Router::new(DEFAULT_MULTIPLIER));
    router.add_group("g1");
    let (node, _dir) = spawn_leader(router, "g1").await;

    send_command(node.addr, &Command::Set { key: "apple".to_string(), value: "42".to_string(), req_id: 1000 }).await;
    let resp = send_command(node.addr, &Command::Del { key: "apple".to_string(), req_id: 1001 }).await;
    assert_eq!(resp, Response::Ok);

    let resp = send_command(node.addr, &Command::Get { key: "apple".to_string(), req_id: 0 }).await;
    assert_eq!(resp, Response::NonExistentKey);
}

#[tokio::test]
async fn stale_write_is_silently_rejected() {
    let router = Arc::new(Router::new(DEFAULT_MULTIPLIER));
    router.add_group("g1");
    let (node, _dir) = spawn_leader(router, "g1").await;

    send_command(node.addr, &Command::Set { key: "apple".to_string(), value: "42".to_string(), req_id: 1000 }).await;
    // An older req_id than what's stored; the leader still answers OK
    // (the command was well-formed) but the value does not change.
    let resp = send_command(node.addr, &Command::Set { key: "apple".to_string(), value: "stale".to_string(), req_id: 500 }).await;
    assert_eq!(resp, Response::Ok);

    let resp = send_command(node.addr, &Command::Get { key: "apple".to_string(), req_id: 0 }).await;
    assert_eq!(resp, Response::Value { value: "42".to_string(), req_id: 1000 });
}

#[tokio::test]
async fn follower_catches_up_and_then_tracks_live_writes() {
    let router = Arc::new(Router::new(DEFAULT_MULTIPLIER));
    router.add_group("g1");
    let (leader_node, _dir1) = spawn_leader(router.clone(), "g1").await;

    send_command(leader_node.addr, &Command::Set { key: "apple".to_string(), value: "42".to_string(), req_id: 1000 }).await;

    let (follower_node, _dir2) =
        spawn_follower(router, "g1", leader_node.addr, HashMap::new()).await;

    wait_until(|| follower_node.table.get("apple").is_ok()).await;
    assert_eq!(follower_node.table.get("apple").unwrap(), (b"42".to_vec(), 1000));

    send_command(leader_node.addr, &Command::Set { key: "pear".to_string(), value: "7".to_string(), req_id: 2000 }).await;
    wait_until(|| follower_node.table.get("pear").is_ok()).await;
    assert_eq!(follower_node.table.get("pear").unwrap(), (b"7".to_vec(), 2000));
}

#[tokio::test]
async fn bootstrap_replays_a_hundred_prior_writes_consistently() {
    let router = Arc::new(Router::new(DEFAULT_MULTIPLIER));
    router.add_group("g1");
    let (leader_node, _dir1) = spawn_leader(router.clone(), "g1").await;

    for i in 0..100 {
        send_command(
            leader_node.addr,
            &Command::Set { key: format!("key{i}"), value: i.to_string(), req_id: i as i64 },
        )
        .await;
    }

    let (follower_node, _dir2) =
        spawn_follower(router, "g1", leader_node.addr, HashMap::new()).await;
    wait_until(|| follower_node.table.len() == 100).await;

    assert_eq!(leader_node.leader.as_ref().unwrap().group(), "g1");

    let mut leader_entries = leader_node.table.snapshot();
    let mut follower_entries = follower_node.table.snapshot();
    leader_entries.sort();
    follower_entries.sort();
    assert_eq!(leader_entries, follower_entries);
}

#[tokio::test]
async fn routing_ownership_matches_which_group_accepts_a_key() {
    let router = Arc::new(Router::new(DEFAULT_MULTIPLIER));
    router.add_group("g1");
    router.add_group("g2");

    let (node1, _dir1) = spawn_leader(router.clone(), "g1").await;
    let mut g2_peers = HashMap::new();
    g2_peers.insert("g1".to_string(), node1.addr);
    let (node2, _dir2) = spawn_leader_with_peers(router.clone(), "g2", g2_peers).await;

    // Every key should be served identically regardless of which node in
    // the cluster receives the client connection, because both dispatch
    // against the same router.
    for i in 0..20 {
        let key = format!("routing-key-{i}");
        let owner = router.owner(&key).unwrap();
        let expected_addr = if owner == "g1" { node1.addr } else { node2.addr };

        send_command(expected_addr, &Command::Set { key: key.clone(), value: "v".to_string(), req_id: i }).await;
        let resp = send_command(expected_addr, &Command::Get { key, req_id: 0 }).await;
        assert_eq!(resp, Response::Value { value: "v".to_string(), req_id: i });
    }
}
