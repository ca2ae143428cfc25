//! In-memory consensus engine for tests and demos.
//!
//! [`LocalCluster`] keeps one shared log and one [`PrimaryStateMachine`] per
//! node. Elections are driven by hand with [`LocalCluster::elect`], and
//! faults (partitions, lagging followers, failing transfer/shutdown) are
//! injected per node.

use crate::{
    config::LeaseConfig,
    consensus::{
        Consensus, ConsensusError, LogEntry, Observation, ObservationFilter, SnapshotSink,
        StateMachine,
    },
    fsm::PrimaryStateMachine,
    manager::ConsensusLeaser,
    primary::PrimaryRedirectInfo,
    time::{Clock, SystemClock},
    Error, NodeId, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::io::{self, Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Per-node failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Leader cannot reach a quorum: commands hang until their timeout and
    /// leadership checks fail.
    Partitioned,
    /// Follower stops applying entries until [`LocalCluster::catch_up`].
    Lagging,
    RejectTransfer,
    RejectShutdown,
    /// Leader's commands are garbled on the way into the log, so every state
    /// machine rejects them with a decode error.
    CorruptCommands,
}

struct Observer {
    filter: ObservationFilter,
    tx: mpsc::UnboundedSender<Observation>,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer").field("closed", &self.tx.is_closed()).finish()
    }
}

#[derive(Debug)]
struct NodeSlot {
    id: NodeId,
    fsm: Arc<PrimaryStateMachine>,
    observers: Mutex<Vec<Observer>>,
    shut_down: AtomicBool,
}

impl NodeSlot {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn notify(&self, observation: &Observation) {
        self.observers.lock().retain(|observer| {
            if !(observer.filter)(observation) {
                return !observer.tx.is_closed();
            }
            observer.tx.send(observation.clone()).is_ok()
        });
    }
}

#[derive(Debug)]
struct ClusterInner {
    nodes: Vec<Arc<NodeSlot>>,
    leader: RwLock<Option<usize>>,
    term: AtomicU64,
    log: Mutex<Vec<LogEntry>>,
    commit_latency: Mutex<Duration>,
    faults: DashSet<(NodeId, Fault)>,
}

impl ClusterInner {
    fn has_fault(&self, idx: usize, fault: Fault) -> bool {
        self.faults.contains(&(self.nodes[idx].id, fault))
    }

    fn is_leader(&self, idx: usize) -> bool {
        *self.leader.read() == Some(idx)
    }

    fn elect(&self, idx: Option<usize>) {
        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        *self.leader.write() = idx;

        let observation = Observation::Leader {
            leader: idx.map(|i| self.nodes[i].id),
            term,
        };
        for node in self.nodes.iter().filter(|n| !n.is_shut_down()) {
            node.notify(&observation);
        }
    }

    /// Appends a command and applies it on every live, caught-up node in
    /// log order. Returns the leader's state machine response.
    fn commit(&self, idx: usize, command: Bytes) -> std::result::Result<Result<()>, ConsensusError> {
        let mut log = self.log.lock();
        if !self.is_leader(idx) || self.nodes[idx].is_shut_down() {
            return Err(ConsensusError::LeadershipLost);
        }
        let command = if self.has_fault(idx, Fault::CorruptCommands) {
            Bytes::from_static(b"{\"advertiseURL\":")
        } else {
            command
        };

        let entry = LogEntry::command(
            log.len() as u64 + 1,
            self.term.load(Ordering::SeqCst),
            command,
        );
        let mut response = Ok(());
        for (i, node) in self.nodes.iter().enumerate() {
            if node.is_shut_down() || (i != idx && self.has_fault(i, Fault::Lagging)) {
                continue;
            }
            let result = node.fsm.apply(&entry);
            if i == idx {
                response = result;
            }
        }
        log.push(entry);
        Ok(response)
    }
}

/// A cluster of in-process nodes sharing one log.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl LocalCluster {
    /// Creates `size` nodes with no leader elected.
    pub fn new(size: usize) -> Self {
        let nodes = (0..size)
            .map(|_| {
                Arc::new(NodeSlot {
                    id: NodeId::new(),
                    fsm: Arc::new(PrimaryStateMachine::new()),
                    observers: Mutex::new(Vec::new()),
                    shut_down: AtomicBool::new(false),
                })
            })
            .collect();

        Self {
            inner: Arc::new(ClusterInner {
                nodes,
                leader: RwLock::new(None),
                term: AtomicU64::new(0),
                log: Mutex::new(Vec::new()),
                commit_latency: Mutex::new(Duration::ZERO),
                faults: DashSet::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn node_id(&self, idx: usize) -> NodeId {
        self.inner.nodes[idx].id
    }

    pub fn fsm(&self, idx: usize) -> Arc<PrimaryStateMachine> {
        self.inner.nodes[idx].fsm.clone()
    }

    pub fn consensus(&self, idx: usize) -> Arc<dyn Consensus> {
        Arc::new(LocalConsensus {
            cluster: self.inner.clone(),
            idx,
        })
    }

    /// Lease manager for node `idx` with default config and the system clock.
    pub fn leaser(&self, idx: usize, local_info: PrimaryRedirectInfo) -> ConsensusLeaser {
        self.leaser_with(idx, local_info, LeaseConfig::default(), Arc::new(SystemClock))
    }

    pub fn leaser_with(
        &self,
        idx: usize,
        local_info: PrimaryRedirectInfo,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
    ) -> ConsensusLeaser {
        ConsensusLeaser::new(self.consensus(idx), local_info, self.fsm(idx), config, clock)
    }

    pub fn leader(&self) -> Option<usize> {
        *self.inner.leader.read()
    }

    pub fn term(&self) -> u64 {
        self.inner.term.load(Ordering::SeqCst)
    }

    pub fn log_len(&self) -> usize {
        self.inner.log.lock().len()
    }

    /// Makes `idx` leader in a new term and notifies every observer.
    pub fn elect(&self, idx: usize) {
        self.inner.elect(Some(idx));
    }

    /// Drops leadership without electing anyone.
    pub fn step_down(&self) {
        self.inner.elect(None);
    }

    /// Elects `idx` and waits until the new leader's own reset command has
    /// committed, if a lease manager is watching on that node.
    pub async fn elect_settled(&self, idx: usize) {
        let before = self.log_len();
        let watched = !self.inner.nodes[idx].observers.lock().is_empty();
        self.elect(idx);
        if watched {
            wait_until(Duration::from_secs(1), || self.log_len() > before).await;
        }
    }

    pub fn set_commit_latency(&self, latency: Duration) {
        *self.inner.commit_latency.lock() = latency;
    }

    pub fn inject(&self, idx: usize, fault: Fault) {
        self.inner.faults.insert((self.node_id(idx), fault));
    }

    pub fn heal(&self, idx: usize, fault: Fault) {
        self.inner.faults.remove(&(self.node_id(idx), fault));
    }

    pub fn is_shut_down(&self, idx: usize) -> bool {
        self.inner.nodes[idx].is_shut_down()
    }

    /// Brings a lagging node up to date by installing a snapshot of the
    /// leader's state machine, then lets it follow the log again.
    pub fn catch_up(&self, idx: usize) -> Result<()> {
        let leader = self
            .leader()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("no leader to snapshot from")))?;

        let log = self.inner.log.lock();
        let snapshot = self.inner.nodes[leader].fsm.snapshot()?;
        let sink = MemorySink::new(format!("{}-{}", self.term(), log.len()));
        let contents = sink.contents();
        snapshot.persist(Box::new(sink))?;
        snapshot.release();

        self.inner.nodes[idx]
            .fsm
            .restore(Box::new(Cursor::new(contents.take())))?;
        self.heal(idx, Fault::Lagging);
        Ok(())
    }
}

/// Handle on one node of a [`LocalCluster`].
#[derive(Debug)]
pub struct LocalConsensus {
    cluster: Arc<ClusterInner>,
    idx: usize,
}

impl LocalConsensus {
    fn check_running(&self) -> std::result::Result<(), ConsensusError> {
        if self.cluster.nodes[self.idx].is_shut_down() {
            return Err(ConsensusError::Shutdown);
        }
        Ok(())
    }

    fn check_leader(&self) -> std::result::Result<(), ConsensusError> {
        self.check_running()?;
        if !self.cluster.is_leader(self.idx) {
            return Err(ConsensusError::NotLeader);
        }
        Ok(())
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn apply(
        &self,
        command: Bytes,
        timeout: Duration,
    ) -> std::result::Result<Result<()>, ConsensusError> {
        self.check_leader()?;

        let latency = *self.cluster.commit_latency.lock();
        let partitioned = self.cluster.has_fault(self.idx, Fault::Partitioned);
        let commit = async {
            if partitioned {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(latency).await;
            self.cluster.commit(self.idx, command)
        };

        tokio::time::timeout(timeout, commit)
            .await
            .map_err(|_| ConsensusError::Timeout)?
    }

    async fn verify_leader(&self) -> std::result::Result<(), ConsensusError> {
        self.check_leader()?;
        if self.cluster.has_fault(self.idx, Fault::Partitioned) {
            return Err(ConsensusError::NotLeader);
        }
        Ok(())
    }

    async fn leadership_transfer(&self) -> std::result::Result<(), ConsensusError> {
        self.check_leader()?;
        if self.cluster.has_fault(self.idx, Fault::RejectTransfer) {
            return Err(ConsensusError::Unavailable("transfer rejected".into()));
        }

        let size = self.cluster.nodes.len();
        let target = (1..size)
            .map(|step| (self.idx + step) % size)
            .find(|&i| {
                !self.cluster.nodes[i].is_shut_down()
                    && !self.cluster.has_fault(i, Fault::Partitioned)
            })
            .ok_or(ConsensusError::NoTransferTarget)?;

        self.cluster.elect(Some(target));
        Ok(())
    }

    async fn shutdown(&self) -> std::result::Result<(), ConsensusError> {
        if self.cluster.has_fault(self.idx, Fault::RejectShutdown) {
            return Err(ConsensusError::Unavailable("shutdown rejected".into()));
        }

        let node = &self.cluster.nodes[self.idx];
        if node.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        node.observers.lock().clear();
        if self.cluster.is_leader(self.idx) {
            self.cluster.elect(None);
        }
        Ok(())
    }

    fn register_observer(&self, filter: ObservationFilter) -> mpsc::UnboundedReceiver<Observation> {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = &self.cluster.nodes[self.idx];
        if !node.is_shut_down() {
            node.observers.lock().push(Observer { filter, tx });
        }
        rx
    }
}

#[derive(Debug, Default)]
struct SinkState {
    data: Vec<u8>,
    closed: bool,
    cancelled: bool,
}

/// Shared view of what a [`MemorySink`] ended up holding.
#[derive(Debug, Clone, Default)]
pub struct SinkContents(Arc<Mutex<SinkState>>);

impl SinkContents {
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().data)
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().closed
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.lock().cancelled
    }
}

/// Snapshot sink buffering into memory. Data only becomes visible through
/// [`SinkContents`] once the sink is closed.
#[derive(Debug)]
pub struct MemorySink {
    id: String,
    buf: Vec<u8>,
    contents: SinkContents,
    failing: bool,
    failing_cancel: bool,
}

impl MemorySink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            buf: Vec::new(),
            contents: SinkContents::default(),
            failing: false,
            failing_cancel: false,
        }
    }

    /// A sink whose writes always fail.
    pub fn failing(id: impl Into<String>) -> Self {
        Self {
            failing: true,
            ..Self::new(id)
        }
    }

    /// A sink whose writes and cancel both fail.
    pub fn broken(id: impl Into<String>) -> Self {
        Self {
            failing_cancel: true,
            ..Self::failing(id)
        }
    }

    pub fn contents(&self) -> SinkContents {
        self.contents.clone()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failing {
            return Err(io::Error::new(io::ErrorKind::Other, "sink unavailable"));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySink {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let sink = *self;
        let mut state = sink.contents.0.lock();
        state.data = sink.buf;
        state.closed = true;
        Ok(())
    }

    fn cancel(self: Box<Self>) -> io::Result<()> {
        if self.failing_cancel {
            return Err(io::Error::new(io::ErrorKind::Other, "cancel unavailable"));
        }
        self.contents.0.lock().cancelled = true;
        Ok(())
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns the final value of the condition.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
