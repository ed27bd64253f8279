use std::sync::Arc;

use clap::Parser;
use dkv::commit_log::CommitLog;
use dkv::config::{Cli, RoleArgs};
use dkv::dispatcher::{Dispatcher, LocalRole};
use dkv::hash_table::HashTable;
use dkv::protocol::{Command, Response};
use dkv::replication::{Follower, Leader};
use dkv::router::{Router, DEFAULT_MULTIPLIER};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let leader_addrs = cli.leader_addrs();

    let router = Arc::new(Router::new(DEFAULT_MULTIPLIER));
    for group in leader_addrs.keys() {
        router.add_group(group);
    }
    if !router.node_exists(&cli.group) {
        router.add_group(&cli.group);
    }

    let table = Arc::new(HashTable::new());
    let log = Arc::new(CommitLog::new(&cli.commit_log)?);

    let local_role = match &cli.role {
        RoleArgs::Leader => {
            info!(group = %cli.group, bind = %cli.bind, "starting as leader");
            LocalRole::Leader(Arc::new(Leader::new(cli.group.clone(), table.clone(), log.clone())))
        }
        RoleArgs::Follower { leader } => {
            info!(group = %cli.group, bind = %cli.bind, %leader, "starting as follower");
            let follower = Arc::new(Follower::new(cli.group.clone(), table.clone(), log.clone()));
            let follower_task = follower.clone();
            let leader_addr = *leader;
            tokio::spawn(async move {
                if let Err(e) = follower_task.run(leader_addr).await {
                    error!(error = %e, "follower session ended");
                }
            });
            LocalRole::Follower
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(router, cli.group.clone(), local_role, leader_addrs));
    let group_leader = dispatcher.local_leader();

    let listener = TcpListener::bind(cli.bind).await?;
    info!(bind = %cli.bind, "listening");

    // Graceful shutdown (§5): stop accepting on SIGINT/ctrl-c, then wait
    // for every in-flight connection to finish on its own (its current
    // command's log append and reply, then whatever the client sends
    // next) rather than cutting it off mid-request.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let dispatcher = dispatcher.clone();
                let group_leader = group_leader.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, dispatcher, group_leader).await {
                        warn!(%peer, error = %e, "connection ended with an error");
                    }
                });
            }
        }
    }

    while connections.join_next().await.is_some() {}
    info!("shutdown complete");
    Ok(())
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
                // Routing/transport/protocol failures are not absent-key
                // misses; report them distinctly and drop the connection
                // rather than claiming a key doesn't exist (§7).
                warn!(error = %other, "dispatch failed");
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
