use crate::consensus::{ConsensusError, LogKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unknown log kind: {0:?}")]
    UnknownLogKind(LogKind),

    #[error("acquire lease: command did not commit before timeout")]
    AcquireTimeout,

    #[error("acquire lease: {0}")]
    AcquireRejected(#[source] ConsensusError),

    #[error("lease expired")]
    LeaseExpired,

    #[error("no primary")]
    NoPrimary,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("cannot shutdown consensus: {0}")]
    Shutdown(#[source] ConsensusError),

    #[error("cannot transfer leadership: {0}")]
    Transfer(#[source] ConsensusError),

    #[error("cannot release lease: {0}")]
    Release(#[source] ConsensusError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for failures caused by a payload the state machine could not
    /// interpret. These fail a single log entry, never the node.
    pub fn is_decode(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::UnknownLogKind(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
