//! The leader side of replication (§4.4.1, §4.4.3).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::commit_log::CommitLog;
use crate::hash_table::HashTable;
use crate::protocol::{Command, Response};
use crate::router::GroupId;

use super::FOLLOWER_QUEUE_CAPACITY;

/// One follower attached to this leader, as seen from the leader's side.
enum FollowerHandle {
    /// Still receiving the bootstrap commit-log transfer; mutations
    /// accepted in the meantime are queued here rather than sent, so they
    /// can be drained in order once the transfer completes (§4.4.3).
    CatchingUp { queued: Vec<String> },
    /// Caught up; mutations are forwarded straight to the per-connection
    /// writer task over this channel.
    Live { tx: mpsc::Sender<String> },
}

#[derive(Default)]
struct LeaderState {
    followers: HashMap<Uuid, FollowerHandle>,
}

/// The serialization point for one group's leader: every `set`/`get`/`del`
/// that this node accepts for `group` passes through [`Leader::apply`],
/// one at a time, in the order [`LeaderState`]'s mutex hands them out.
/// Lock order, matching §5: this mutex, then whatever `table`/`log` do
/// internally; never the other way around.
pub struct Leader {
    group: GroupId,
    table: Arc<HashTable>,
    log: Arc<CommitLog>,
    state: Mutex<LeaderState>,
}

impl Leader {
    pub fn new(group: GroupId, table: Arc<HashTable>, log: Arc<CommitLog>) -> Self {
        Self {
            group,
            table,
            log,
            state: Mutex::new(LeaderState::default()),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Applies one client-facing command (§4.4.1). `Command::Join` is
    /// rejected here; it is handled by [`Leader::handle_follower_connection`]
    /// instead, since joining takes over the whole connection rather than
    /// producing a single reply.
    pub async fn apply(&self, command: Command) -> crate::Result<Response> {
        let mut state = self.state.lock().await;
        match command {
            Command::Set { key, value, req_id } => {
                let line = Command::Set { key: key.clone(), value: value.clone(), req_id }.to_string();
                if self.table.set(&key, value.into_bytes(), req_id) {
                    self.log.append(&line).await?;
                    self.broadcast(&mut state, &line);
                }
                Ok(Response::Ok)
            }
            Command::Del { key, req_id } => {
                let line = Command::Del { key: key.clone(), req_id }.to_string();
                if self.table.delete(&key, req_id) {
                    self.log.append(&line).await?;
                    self.broadcast(&mut state, &line);
                }
                Ok(Response::Ok)
            }
            Command::Get { key, .. } => match self.table.get(&key) {
                Ok((value, req_id)) => Ok(Response::Value {
                    value: String::from_utf8_lossy(&value).into_owned(),
                    req_id,
                }),
                Err(crate::Error::NonExistentKey) => Ok(Response::NonExistentKey),
                Err(e) => Err(e),
            },
            Command::Join => Err(crate::Error::Protocol(
                "join must be the first and only line on a connection".to_string(),
            )),
        }
    }

    /// Forwards `line` to every attached follower, or queues it for the
    /// ones still catching up. Must be called with `state` already locked,
    /// in the same critical section that performed the local apply and log
    /// append, so followers observe mutations in the leader's own order.
    fn broadcast(&self, state: &mut LeaderState, line: &str) {
        let mut dead = Vec::new();
        for (&id, handle) in state.followers.iter_mut() {
            match handle {
                FollowerHandle::CatchingUp { queued } => queued.push(line.to_string()),
                FollowerHandle::Live { tx } => {
                    if tx.try_send(line.to_string()).is_err() {
                        dead.push(id);
                    }
                }
            }
        }
        for id in dead {
            state.followers.remove(&id);
            tracing::warn!(group = %self.group, %id, "follower queue overflowed, dropping session");
        }
    }

    /// Drives one follower's connection end to end: streams the commit
    /// log, then streams live mutations until the connection closes
    /// (§4.4.3). The caller has already read the connection's `join` line
    /// off `reader` to decide this is a follower connection at all, so
    /// this method picks up from there rather than re-reading it.
    pub async fn handle_follower_connection(
        &self,
        mut reader: BufReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
    ) -> crate::Result<()> {
        let peer = reader.get_ref().peer_addr().ok();
        let session_id = Uuid::new_v4();
        {
            let mut state = self.state.lock().await;
            state
                .followers
                .insert(session_id, FollowerHandle::CatchingUp { queued: Vec::new() });
        }
        tracing::info!(group = %self.group, %session_id, ?peer, "follower joining");

        write_half.write_all(b"commitlog\n").await?;
        self.log.send_length_prefixed(&mut write_half).await?;

        let (tx, mut rx) = mpsc::channel::<String>(FOLLOWER_QUEUE_CAPACITY);
        {
            let mut state = self.state.lock().await;
            if let Some(FollowerHandle::CatchingUp { queued }) = state.followers.remove(&session_id) {
                for queued_line in queued {
                    // Draining right after the transfer; the channel is
                    // fresh and sized to FOLLOWER_QUEUE_CAPACITY, so this
                    // only fails if an absurd number of writes queued up
                    // during the transfer itself.
                    let _ = tx.try_send(queued_line);
                }
            }
            state.followers.insert(session_id, FollowerHandle::Live { tx });
        }
        tracing::info!(group = %self.group, %session_id, "follower caught up, now live");

        let mut scratch = String::new();
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(command_line) => {
                            let framed = format!("{command_line}\n");
                            if write_half.write_all(framed.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                read_result = reader.read_line(&mut scratch) => {
                    // Followers do not send anything on this connection
                    // after joining; any read completing (including EOF)
                    // means the peer is gone.
                    match read_result {
                        Ok(0) | Err(_) => break,
                        Ok(_) => scratch.clear(),
                    }
                }
            }
        }

        self.state.lock().await.followers.remove(&session_id);
        tracing::info!(group = %self.group, %session_id, "follower session closed");
        Ok(())
    }

    /// Number of followers currently attached, catching up or live.
    pub async fn follower_count(&self) -> usize {
        self.state.lock().await.followers.len()
    }
}
