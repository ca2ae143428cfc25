// A single grant of the primary lease to the local node

use crate::{
    consensus::Consensus,
    primary::PrimaryRedirectInfo,
    time::{Clock, Timestamp},
    Error, NodeId, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Lease capability handed out by a [`crate::Leaser`].
///
/// Callers treat the lease as valid while `now - renewed_at() < ttl()` and
/// must stop acting as primary as soon as `renew` fails.
#[async_trait]
pub trait Lease: Send + Sync + std::fmt::Debug {
    fn renewed_at(&self) -> Timestamp;

    fn ttl(&self) -> Duration;

    async fn renew(&mut self) -> Result<()>;

    /// Passes the lease to `target` without a fresh acquire.
    async fn handoff(&mut self, target: NodeId) -> Result<()>;

    /// Incoming handoff requests, identified by lease id.
    fn handoff_ch(&self) -> mpsc::Receiver<String>;

    /// Gives the lease up and pushes the cluster towards a new primary.
    async fn close(&mut self) -> Result<()>;
}

/// Current status of a lease handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Held and renewable
    Held,
    /// A renewal found this node no longer leads
    Expired,
    /// Released through close
    Released,
}

/// Lease backed by consensus leadership: holding the lease means being the
/// leader of the engine.
#[derive(Debug)]
pub struct ConsensusLease {
    consensus: Arc<dyn Consensus>,
    clock: Arc<dyn Clock>,
    renewed_at: Timestamp,
    ttl: Duration,
    apply_timeout: Duration,
    status: LeaseStatus,
}

impl ConsensusLease {
    pub(crate) fn new(
        consensus: Arc<dyn Consensus>,
        clock: Arc<dyn Clock>,
        renewed_at: Timestamp,
        ttl: Duration,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            clock,
            renewed_at,
            ttl,
            apply_timeout,
            status: LeaseStatus::Held,
        }
    }

    pub fn status(&self) -> LeaseStatus {
        self.status
    }

    pub fn expires_at(&self) -> Timestamp {
        self.renewed_at
            .checked_add_signed(ttl_delta(self.ttl))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
    }

    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        self.status == LeaseStatus::Held && now < self.expires_at()
    }
}

#[async_trait]
impl Lease for ConsensusLease {
    fn renewed_at(&self) -> Timestamp {
        self.renewed_at
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn renew(&mut self) -> Result<()> {
        if self.status != LeaseStatus::Held {
            return Err(Error::LeaseExpired);
        }
        if let Err(e) = self.consensus.verify_leader().await {
            warn!(error = %e, renewed_at = %self.renewed_at, "lease lost: leadership check failed");
            self.status = LeaseStatus::Expired;
            return Err(Error::LeaseExpired);
        }
        self.renewed_at = self.clock.now();
        Ok(())
    }

    async fn handoff(&mut self, _target: NodeId) -> Result<()> {
        Err(Error::Unsupported("lease handoff"))
    }

    fn handoff_ch(&self) -> mpsc::Receiver<String> {
        // No handoff protocol: the sender is dropped so the stream is empty.
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    async fn close(&mut self) -> Result<()> {
        match self.status {
            LeaseStatus::Released => return Ok(()),
            // A newer lease may be held by this node; leave it alone.
            LeaseStatus::Expired => return Err(Error::LeaseExpired),
            LeaseStatus::Held => {}
        }

        let reset = PrimaryRedirectInfo::default().encode()?;
        self.consensus
            .apply(reset.into(), self.apply_timeout)
            .await
            .map_err(Error::Release)??;

        self.consensus
            .leadership_transfer()
            .await
            .map_err(Error::Transfer)?;

        self.status = LeaseStatus::Released;
        info!("lease released, leadership transfer requested");
        Ok(())
    }
}

fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}
