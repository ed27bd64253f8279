//! Shared scaffolding for the end-to-end tests: spins up a real `dkv-node`
//! equivalent (TCP listener + dispatcher) in-process, without going
//! through the `dkv-node` binary itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use dkv::commit_log::CommitLog;
use dkv::dispatcher::{Dispatcher, LocalRole};
use dkv::hash_table::HashTable;
use dkv::protocol::{Command, Response};
use dkv::replication::{Follower, Leader};
use dkv::router::Router;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub struct TestNode {
    pub addr: SocketAddr,
    pub table: Arc<HashTable>,
    pub leader: Option<Arc<Leader>>,
    pub follower: Option<Arc<Follower>>,
}

/// Starts a leader node for `group` and returns a handle to it plus the
/// tempdir its commit log lives in (kept alive by the caller).
pub async fn spawn_leader(router: Arc<Router>, group: &str) -> (TestNode, tempfile::TempDir) {
    spawn_leader_with_peers(router, group, HashMap::new()).await
}

/// Like [`spawn_leader`], but with a routing table of other groups' leader
/// addresses so this node can forward requests it does not own.
pub async fn spawn_leader_with_peers(
    router: Arc<Router>,
    group: &str,
    leader_addrs: HashMap<String, SocketAddr>,
) -> (TestNode, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CommitLog::new(dir.path().join("commit.log")).unwrap());
    let table = Arc::new(HashTable::new());
    let leader = Arc::new(Leader::new(group.to_string(), table.clone(), log));

    let dispatcher = Arc::new(Dispatcher::new(
        router,
        group.to_string(),
        LocalRole::Leader(leader.clone()),
        leader_addrs,
    ));
    let addr = spawn_accept_loop(dispatcher, Some(leader.clone()));

    (
        TestNode { addr, table, leader: Some(leader), follower: None },
        dir,
    )
}

/// Starts a follower node for `group` that joins `leader_addr`, registered
/// in `router` and reachable for forwarding through `leader_addrs`.
pub async fn spawn_follower(
    router: Arc<Router>,
    group: &str,
    leader_addr: SocketAddr,
    leader_addrs: HashMap<String, SocketAddr>,
) -> (TestNode, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CommitLog::new(dir.path().join("commit.log")).unwrap());
    let table = Arc::new(HashTable::new());
    let follower = Arc::new(Follower::new(group.to_string(), table.clone(), log));

    let follower_task = follower.clone();
    tokio::spawn(async move {
        let _ = follower_task.run(leader_addr).await;
    });

    let dispatcher = Arc::new(Dispatcher::new(router, group.to_string(), LocalRole::Follower, leader_addrs));
    let addr = spawn_accept_loop(dispatcher, None);

    (
        TestNode { addr, table, leader: None, follower: Some(follower) },
        dir,
    )
}

fn spawn_accept_loop(dispatcher: Arc<Dispatcher>, local_leader: Option<Arc<Leader>>) -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();
    let listener = TcpListener::from_std(std_listener).unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let dispatcher = dispatcher.clone();
            let local_leader = local_leader.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, dispatcher, local_leader).await;
            });
        }
    });
    addr
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    local_leader: Option<Arc<Leader>>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut first_line = String::new();
    if reader.read_line(&mut first_line).await? == 0 {
        return Ok(());
    }

    if first_line.trim_end() == "join" {
        return match local_leader {
            Some(leader) => Ok(leader.handle_follower_connection(reader, write_half).await?),
            None => {
                write_half.write_all(b"Error: this node is not a leader\n").await?;
                Ok(())
            }
        };
    }

    let mut line = first_line;
    loop {
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                write_half.write_all(format!("Error: {e}\n").as_bytes()).await?;
                return Ok(());
            }
        };
        match dispatcher.dispatch(command).await {
            Ok(response) => {
                write_half.write_all(format!("{response}\n").as_bytes()).await?;
            }
            Err(dkv::Error::NonExistentKey) => {
                write_half.write_all(format!("{}\n", Response::NonExistentKey).as_bytes()).await?;
            }
            Err(other) => {
                write_half.write_all(format!("Error: {other}\n").as_bytes()).await?;
                return Ok(());
            }
        }

        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
    }
}

/// Sends one line over a fresh connection and returns the parsed reply.
pub async fn send_command(addr: SocketAddr, command: &Command) -> Response {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(format!("{command}\n").as_bytes()).await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    Response::parse(&line).expect("reply did not parse")
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition never became true within the timeout");
}
