//! The append-only commit log (§4.2).
//!
//! One record per accepted mutation, `<timestamp>,<command>\n`, flushed to
//! disk before the mutation is acknowledged upstream. [`CommitLog::send`]
//! and [`CommitLog::receive`] stream the file byte-for-byte so a joining
//! follower can clone a leader's history (§4.4.3).
//!
//! All operations serialize through a single [`tokio::sync::Mutex`] rather
//! than `parking_lot`'s, because `send`/`receive` hold the lock across
//! socket `.await` points and a non-async-aware mutex would block the
//! executor thread for the duration of the transfer.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CHUNK_SIZE: usize = 4096;
const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

#[derive(Debug)]
pub struct CommitLog {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl CommitLog {
    pub fn new(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        // Create the file up front so read_all/send on a fresh log see an
        // empty file rather than a missing one.
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `"<local_timestamp>,<command>\n"` and fsyncs before returning.
    pub async fn append(&self, command: &str) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || -> crate::Result<()> {
            let now = chrono::Local::now().format(TIMESTAMP_FORMAT);
            let line = format!("{now},{command}\n");
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            file.sync_data()?;
            Ok(())
        })
        .await
        .map_err(|e| crate::Error::Other(anyhow::anyhow!(e)))??;
        Ok(())
    }

    /// Returns every command in file order with the leading timestamp
    /// stripped and discarded.
    pub async fn read_all(&self) -> crate::Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> crate::Result<Vec<String>> {
            let contents = std::fs::read_to_string(&path)?;
            Ok(contents
                .lines()
                .filter_map(|line| line.split_once(',').map(|(_, command)| command.to_string()))
                .collect())
        })
        .await
        .map_err(|e| crate::Error::Other(anyhow::anyhow!(e)))?
    }

    /// Empties the file. Only used on an explicit reset, e.g. just before
    /// a follower receives a fresh commit-log transfer on join.
    pub async fn truncate(&self) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> crate::Result<()> {
            std::fs::OpenOptions::new().write(true).truncate(true).open(&path)?;
            Ok(())
        })
        .await
        .map_err(|e| crate::Error::Other(anyhow::anyhow!(e)))??;
        Ok(())
    }

    /// Streams the entire current file to `sink` in 4 KiB chunks.
    pub async fn send<W: AsyncWrite + Unpin>(&self, sink: &mut W) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        self.stream_file_locked(sink).await
    }

    /// Reads `source` until end-of-stream and appends the bytes to the
    /// local file. Does not truncate first; call [`CommitLog::truncate`]
    /// beforehand for a clean slate.
    pub async fn receive<R: AsyncRead + Unpin>(&self, source: &mut R) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
        }
        file.sync_data().await?;
        Ok(())
    }

    /// `send`, but prefixed with an 8-byte big-endian length so a peer can
    /// tell exactly where this one-shot snapshot ends and whatever follows
    /// on the same connection begins. Used for the join bootstrap transfer
    /// (§4.4.3), which rides the follower's persistent replication
    /// connection rather than a dedicated one; plain end-of-stream framing
    /// (as `send`/`receive` use) has no way to signal "end of snapshot,
    /// more will follow" on a connection that stays open. The lock is held
    /// for the whole call, so the file cannot grow between measuring its
    /// length and streaming it.
    pub(crate) async fn send_length_prefixed<W: AsyncWrite + Unpin>(&self, sink: &mut W) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        let len = tokio::fs::metadata(&self.path).await?.len();
        sink.write_all(&len.to_be_bytes()).await?;
        self.stream_file_locked(sink).await
    }

    /// The receiving half of [`CommitLog::send_length_prefixed`].
    pub(crate) async fn receive_length_prefixed<R: AsyncRead + Unpin>(&self, source: &mut R) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        let mut len_buf = [0u8; 8];
        source.read_exact(&mut len_buf).await?;
        let mut remaining = u64::from_be_bytes(len_buf) as usize;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut buf = [0u8; CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE);
            let n = source.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "commit log transfer truncated",
                )));
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n;
        }
        file.sync_data().await?;
        Ok(())
    }

    /// Assumes `self.lock` is already held.
    async fn stream_file_locked<W: AsyncWrite + Unpin>(&self, sink: &mut W) -> crate::Result<()> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await?;
        }
        sink.flush().await?;
        Ok(())
    }
}
