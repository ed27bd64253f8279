//! The follower side of replication (§4.4.2, §4.4.4).

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::commit_log::CommitLog;
use crate::hash_table::HashTable;
use crate::protocol::Command;
use crate::router::GroupId;

/// A follower's session state (§4.4.4). There is no automatic reconnect
/// out of `Closed`; that is a design decision (see DESIGN.md) rather than
/// an oversight, since the source offers no reconnect policy to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerConnState {
    Connecting,
    CatchingUp,
    Live,
    Closed,
}

/// Runs on a non-leader replica. Owns the same [`HashTable`]/[`CommitLog`]
/// pair the group's leader owns, kept consistent by replaying whatever the
/// leader sends.
pub struct Follower {
    group: GroupId,
    table: Arc<HashTable>,
    log: Arc<CommitLog>,
    state: Mutex<FollowerConnState>,
}

impl Follower {
    pub fn new(group: GroupId, table: Arc<HashTable>, log: Arc<CommitLog>) -> Self {
        Self {
            group,
            table,
            log,
            state: Mutex::new(FollowerConnState::Connecting),
        }
    }

    pub fn state(&self) -> FollowerConnState {
        *self.state.lock()
    }

    fn set_state(&self, state: FollowerConnState) {
        *self.state.lock() = state;
    }

    /// Connects to `leader_addr`, joins, replays the bootstrap transfer,
    /// then consumes the live mutation stream until the leader closes the
    /// connection or a protocol error occurs. One attempt; on failure the
    /// follower is left `Closed` and it is the caller's job to decide
    /// whether to retry (§4.4.4 specifies no automatic reconnect).
    pub async fn run(&self, leader_addr: SocketAddr) -> crate::Result<()> {
        self.set_state(FollowerConnState::Connecting);
        let result = self.run_once(leader_addr).await;
        self.set_state(FollowerConnState::Closed);
        result
    }

    async fn run_once(&self, leader_addr: SocketAddr) -> crate::Result<()> {
        let stream = TcpStream::connect(leader_addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"join\n").await?;
        self.set_state(FollowerConnState::CatchingUp);

        let mut preamble = String::new();
        reader.read_line(&mut preamble).await?;
        if preamble.trim_end() != "commitlog" {
            return Err(crate::Error::Protocol(format!(
                "expected commitlog preamble, got {preamble:?}"
            )));
        }

        self.log.truncate().await?;
        self.log.receive_length_prefixed(&mut reader).await?;

        for command_line in self.log.read_all().await? {
            self.apply_locally(&command_line)?;
        }
        tracing::info!(group = %self.group, ?leader_addr, "bootstrap transfer complete");
        self.set_state(FollowerConnState::Live);

        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            let command_line = line.trim_end();
            if command_line.is_empty() {
                continue;
            }
            self.apply_locally(command_line)?;
            self.log.append(command_line).await?;
        }
        Ok(())
    }

    /// Applies a replicated `set`/`del` line to the local table. `get` and
    /// `join` never appear on the replication stream.
    fn apply_locally(&self, command_line: &str) -> crate::Result<()> {
        match Command::parse(command_line)? {
            Command::Set { key, value, req_id } => {
                self.table.set(&key, value.into_bytes(), req_id);
                Ok(())
            }
            Command::Del { key, req_id } => {
                self.table.delete(&key, req_id);
                Ok(())
            }
            other => Err(crate::Error::Protocol(format!(
                "unexpected command on replication stream: {other}"
            ))),
        }
    }
}
