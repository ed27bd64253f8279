//! Command-line configuration for `dkv-node` (§6).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dkv-node", version, about = "A partitioned, replicated, in-memory key-value node", long_about = None)]
pub struct Cli {
    /// This node's own group id, used both on the ring and as the key
    /// under which --peer entries are looked up.
    #[arg(long)]
    pub group: String,

    /// Address this node listens on for client and follower connections.
    #[arg(long)]
    pub bind: SocketAddr,

    /// Path to this node's commit log file.
    #[arg(long)]
    pub commit_log: PathBuf,

    /// Every group in the cluster and its leader's client-facing address,
    /// as `group=host:port`. Repeatable. The cluster's membership is fixed
    /// for the lifetime of a run; there is no membership protocol.
    #[arg(long = "peer", value_parser = parse_peer)]
    pub peers: Vec<(String, SocketAddr)>,

    #[command(subcommand)]
    pub role: RoleArgs,
}

#[derive(Subcommand)]
pub enum RoleArgs {
    /// Run as the leader of --group.
    Leader,
    /// Run as a follower of --group, joining the leader at `leader`.
    Follower {
        #[arg(long)]
        leader: SocketAddr,
    },
}

fn parse_peer(raw: &str) -> Result<(String, SocketAddr), String> {
    let (group, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected group=host:port, got {raw:?}"))?;
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid address in {raw:?}: {e}"))?;
    Ok((group.to_string(), addr))
}

impl Cli {
    pub fn leader_addrs(&self) -> HashMap<String, SocketAddr> {
        self.peers.iter().cloned().collect()
    }
}
