use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("non-existent key")]
    NonExistentKey,

    #[error("malformed command: {0}")]
    Protocol(String),

    #[error("no group owns this key: the ring is empty")]
    NoOwner,

    #[error("commit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
