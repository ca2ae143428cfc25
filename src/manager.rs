// Lease manager - maps consensus leadership onto the primary lease

use crate::{
    config::LeaseConfig,
    consensus::{Consensus, Observation},
    lease::{ConsensusLease, Lease},
    primary::{PrimaryInfo, PrimaryProvider, PrimaryRedirectInfo},
    time::Clock,
    ConsensusError, Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lease manager capability.
#[async_trait]
pub trait Leaser: Send + Sync {
    /// Takes the lease for this node. Fails if the acquire command does not
    /// commit, most commonly because this node is not the leader.
    async fn acquire(&self) -> Result<Box<dyn Lease>>;

    /// Takes over a lease handed off by another node.
    async fn acquire_existing(&self, lease_id: &str) -> Result<Box<dyn Lease>>;

    async fn primary_info(&self) -> Result<PrimaryInfo>;

    async fn redirect_url(&self) -> Result<String>;

    fn cluster_id(&self) -> String;

    async fn set_cluster_id(&self, cluster_id: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn lease_type(&self) -> &'static str;
}

/// [`Leaser`] whose lease is leadership of a consensus engine.
///
/// On construction a background task subscribes to leadership changes and
/// resets the replicated record to "no primary" on each one, so a stale
/// primary is never trusted across a leadership move. The task is aborted once
/// [`Leaser::close`] has shut the engine down, or when the manager is dropped.
#[derive(Debug)]
pub struct ConsensusLeaser {
    consensus: Arc<dyn Consensus>,
    local_info: PrimaryRedirectInfo,
    provider: Arc<dyn PrimaryProvider>,
    config: LeaseConfig,
    clock: Arc<dyn Clock>,
    reset_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsensusLeaser {
    /// Must be called from within a tokio runtime.
    pub fn new(
        consensus: Arc<dyn Consensus>,
        local_info: PrimaryRedirectInfo,
        provider: Arc<dyn PrimaryProvider>,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let observations =
            consensus.register_observer(Box::new(Observation::is_leader_change));
        let reset_task = tokio::spawn(reset_on_leader_change(
            consensus.clone(),
            observations,
            config.apply_timeout(),
        ));

        Self {
            consensus,
            local_info,
            provider,
            config,
            clock,
            reset_task: Mutex::new(Some(reset_task)),
        }
    }

    pub fn advertise_url(&self) -> &str {
        &self.local_info.primary.advertise_url
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Acquire returning the concrete lease type.
    pub async fn acquire_lease(&self) -> Result<ConsensusLease> {
        let command = self.local_info.encode()?;
        self.consensus
            .apply(command.into(), self.config.apply_timeout())
            .await
            .map_err(|e| match e {
                ConsensusError::Timeout => Error::AcquireTimeout,
                other => Error::AcquireRejected(other),
            })??;

        let renewed_at = self.clock.now();
        info!(
            advertise_url = %self.local_info.primary.advertise_url,
            %renewed_at,
            "primary lease acquired"
        );
        Ok(ConsensusLease::new(
            self.consensus.clone(),
            self.clock.clone(),
            renewed_at,
            self.config.ttl(),
            self.config.apply_timeout(),
        ))
    }

    fn stop_reset_task(&self) {
        if let Some(task) = self.reset_task.lock().take() {
            task.abort();
        }
    }

    /// True while the leadership-change task is still running.
    pub fn is_watching(&self) -> bool {
        self.reset_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[async_trait]
impl Leaser for ConsensusLeaser {
    async fn acquire(&self) -> Result<Box<dyn Lease>> {
        Ok(Box::new(self.acquire_lease().await?))
    }

    async fn acquire_existing(&self, _lease_id: &str) -> Result<Box<dyn Lease>> {
        Err(Error::Unsupported("acquire existing lease"))
    }

    async fn primary_info(&self) -> Result<PrimaryInfo> {
        let info = self.provider.primary_info();
        if info.is_empty() {
            return Err(Error::NoPrimary);
        }
        Ok(info)
    }

    async fn redirect_url(&self) -> Result<String> {
        Ok(self.provider.redirect_url())
    }

    fn cluster_id(&self) -> String {
        String::new()
    }

    async fn set_cluster_id(&self, _cluster_id: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The engine keeps running if shutdown fails, so the reset task must too.
        self.consensus.shutdown().await.map_err(Error::Shutdown)?;
        self.stop_reset_task();
        info!("consensus shut down");
        Ok(())
    }

    fn lease_type(&self) -> &'static str {
        "consensus"
    }
}

impl Drop for ConsensusLeaser {
    fn drop(&mut self) {
        self.stop_reset_task();
    }
}

async fn reset_on_leader_change(
    consensus: Arc<dyn Consensus>,
    mut observations: mpsc::UnboundedReceiver<Observation>,
    timeout: Duration,
) {
    let reset = match PrimaryRedirectInfo::default().encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "cannot encode primary reset");
            return;
        }
    };

    while let Some(observation) = observations.recv().await {
        debug!(?observation, "leadership changed, resetting primary");
        match consensus.apply(reset.clone().into(), timeout).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "lease reset rejected by state machine"),
            Err(e) => warn!(error = %e, "cannot reset lease"),
        }
    }
    debug!("observation stream closed");
}
