//! Request dispatch (§4.5): turns one client connection's command lines
//! into replies, routing each command to whichever group actually owns its
//! key.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::protocol::{Command, Response};
use crate::replication::Leader;
use crate::router::{GroupId, Router};

/// What this node is for its own group: either the leader (it can apply
/// mutations directly) or a follower (it must forward anything the local
/// leader needs to handle, since a follower never accepts mutations).
pub enum LocalRole {
    Leader(Arc<Leader>),
    Follower,
}

/// Routes and executes client commands. One `Dispatcher` is shared across
/// every client connection a node accepts.
pub struct Dispatcher {
    router: Arc<Router>,
    local_group: GroupId,
    local_role: LocalRole,
    /// Client-facing address of each group's current leader, as declared
    /// at startup (§9: membership is static for the lifetime of a run).
    leader_addrs: HashMap<GroupId, SocketAddr>,
    /// One pooled connection per remote group leader, created lazily and
    /// dropped on the first I/O error so the next request reconnects.
    /// Each group gets its own inner lock so forwarding to group A never
    /// blocks a concurrent forward to group B.
    pool: Mutex<HashMap<GroupId, Arc<Mutex<Option<TcpStream>>>>>,
}

impl Dispatcher {
    pub fn new(
        router: Arc<Router>,
        local_group: GroupId,
        local_role: LocalRole,
        leader_addrs: HashMap<GroupId, SocketAddr>,
    ) -> Self {
        Self {
            router,
            local_group,
            local_role,
            leader_addrs,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// This node's own `Leader` handle, if it is currently the leader of
    /// its group. Lets the accept loop hand `join` connections straight to
    /// it without re-deriving the role from scratch per connection.
    pub fn local_leader(&self) -> Option<Arc<Leader>> {
        match &self.local_role {
            LocalRole::Leader(leader) => Some(leader.clone()),
            LocalRole::Follower => None,
        }
    }

    /// Executes one parsed command, either locally or by forwarding to the
    /// owning group's leader.
    pub async fn dispatch(&self, command: Command) -> crate::Result<Response> {
        let key = command.key().ok_or_else(|| {
            crate::Error::Protocol("join cannot be dispatched as a client command".to_string())
        })?;
        let owner = self.router.owner(key).ok_or(crate::Error::NoOwner)?;

        if owner == self.local_group {
            return self.execute_locally(command).await;
        }
        self.forward(&owner, &command).await
    }

    async fn execute_locally(&self, command: Command) -> crate::Result<Response> {
        match &self.local_role {
            LocalRole::Leader(leader) => leader.apply(command).await,
            LocalRole::Follower => {
                // A follower owns the key locally on the ring but cannot
                // apply mutations itself; forward to its own group's
                // leader address like any other remote request.
                self.forward(&self.local_group, &command).await
            }
        }
    }

    async fn forward(&self, group: &str, command: &Command) -> crate::Result<Response> {
        let addr = *self
            .leader_addrs
            .get(group)
            .ok_or_else(|| crate::Error::Protocol(format!("no known leader address for group {group:?}")))?;

        let line = format!("{command}\n");
        let slot = self.connection_slot(group).await;

        match Self::try_forward(&slot, addr, &line).await {
            Ok(response) => Ok(response),
            Err(_) => {
                // The pooled connection was stale (or never existed yet);
                // drop it and retry once on a fresh one before giving up.
                *slot.lock().await = None;
                Self::try_forward(&slot, addr, &line).await
            }
        }
    }

    async fn connection_slot(&self, group: &str) -> Arc<Mutex<Option<TcpStream>>> {
        let mut pool = self.pool.lock().await;
        pool.entry(group.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn try_forward(
        slot: &Mutex<Option<TcpStream>>,
        addr: SocketAddr,
        line: &str,
    ) -> crate::Result<Response> {
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(TcpStream::connect(addr).await?);
        }
        let stream = guard.as_mut().expect("just populated above");

        stream.write_all(line.as_bytes()).await?;
        let mut reader = BufReader::new(stream);
        let mut reply_line = String::new();
        let n = reader.read_line(&mut reply_line).await?;
        if n == 0 {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "remote leader closed the connection",
            )));
        }
        Response::parse(&reply_line)
            .ok_or_else(|| crate::Error::Protocol(format!("unparseable reply from remote leader: {reply_line:?}")))
    }
}
