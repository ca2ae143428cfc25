//! Contract between the lease layer and the replicated-log engine.
//!
//! The engine itself (election, replication, log persistence) lives outside
//! this crate. It is consumed through [`Consensus`], and it drives the
//! replicated record through [`StateMachine`].

use crate::{NodeId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("node is not the leader")]
    NotLeader,

    #[error("timed out enqueuing operation")]
    Timeout,

    #[error("consensus is shutdown")]
    Shutdown,

    #[error("leadership lost while committing log")]
    LeadershipLost,

    #[error("cannot find peer to transfer leadership to")]
    NoTransferTarget,

    #[error("consensus unavailable: {0}")]
    Unavailable(String),
}

/// Kind of a committed log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    /// Application payload, handed to the state machine.
    Command,
    /// Leader no-op written at the start of a term.
    Noop,
    Barrier,
    Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: LogKind,
    pub data: Bytes,
}

impl LogEntry {
    pub fn command(index: u64, term: u64, data: impl Into<Bytes>) -> Self {
        Self {
            index,
            term,
            kind: LogKind::Command,
            data: data.into(),
        }
    }
}

/// Cluster events the engine can report to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Leadership moved; `leader` is `None` while no leader is known.
    Leader { leader: Option<NodeId>, term: u64 },
    PeerJoined(NodeId),
    PeerLeft(NodeId),
}

impl Observation {
    pub fn is_leader_change(&self) -> bool {
        matches!(self, Observation::Leader { .. })
    }
}

/// Predicate deciding which observations an observer receives.
pub type ObservationFilter = Box<dyn Fn(&Observation) -> bool + Send + Sync>;

/// The replicated-log engine as seen from this crate.
///
/// Every method is a bounded round-trip. `apply` has two layers of result:
/// the outer one reports whether the command committed, the inner one is
/// what the state machine returned when applying it.
#[async_trait]
pub trait Consensus: Send + Sync + std::fmt::Debug {
    async fn apply(
        &self,
        command: Bytes,
        timeout: Duration,
    ) -> std::result::Result<Result<()>, ConsensusError>;

    /// Succeeds iff this node is leader at the time of the check.
    async fn verify_leader(&self) -> std::result::Result<(), ConsensusError>;

    /// Asks the cluster to elect a leader other than this node.
    async fn leadership_transfer(&self) -> std::result::Result<(), ConsensusError>;

    async fn shutdown(&self) -> std::result::Result<(), ConsensusError>;

    /// Subscribes to observations matching `filter`. The stream closes when
    /// the engine shuts down.
    fn register_observer(&self, filter: ObservationFilter) -> mpsc::UnboundedReceiver<Observation>;
}

/// Deterministic state driven by the engine's serialized apply path.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry) -> Result<()>;

    fn snapshot(&self) -> Result<Box<dyn StateSnapshot>>;

    /// Replaces all state with the content of `source`. The reader is
    /// consumed whatever the outcome.
    fn restore(&self, source: Box<dyn Read + Send>) -> Result<()>;
}

/// A point-in-time export produced by [`StateMachine::snapshot`].
pub trait StateSnapshot: Send {
    /// Writes the snapshot into `sink` and closes it. On failure the sink
    /// is cancelled instead.
    fn persist(&self, sink: Box<dyn SnapshotSink>) -> Result<()>;

    fn release(&self) {}
}

/// Destination of a snapshot being persisted.
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;

    fn close(self: Box<Self>) -> std::io::Result<()>;

    fn cancel(self: Box<Self>) -> std::io::Result<()>;
}
