use primary_lease::{
    test_utils::{Fault, LocalCluster},
    ConsensusError, Error, Lease, LeaseConfig, LeaseStatus, Leaser, NodeId, PrimaryInfo,
    PrimaryRedirectInfo,
};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_acquire_publishes_local_info() {
    init_tracing();
    let cluster = LocalCluster::new(3);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", "http://a:8080"));
    let follower = cluster.leaser(1, PrimaryRedirectInfo::new("http://b", ""));
    cluster.elect_settled(0).await;

    let lease = leaser.acquire().await.unwrap();
    assert_eq!(lease.ttl(), Duration::from_secs(10));

    assert_eq!(leaser.primary_info().await.unwrap(), PrimaryInfo::new("http://a"));
    assert_eq!(leaser.redirect_url().await.unwrap(), "http://a:8080");

    // Commands apply on every node, so the follower sees the same record.
    assert_eq!(follower.primary_info().await.unwrap(), PrimaryInfo::new("http://a"));
    assert_eq!(follower.redirect_url().await.unwrap(), "http://a:8080");
}

#[tokio::test]
async fn test_acquire_on_follower_is_rejected() {
    init_tracing();
    let cluster = LocalCluster::new(2);
    let leader = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    let follower = cluster.leaser(1, PrimaryRedirectInfo::new("http://b", ""));
    cluster.elect_settled(0).await;

    let _lease = leader.acquire().await.unwrap();
    let err = follower.acquire().await.unwrap_err();
    assert!(matches!(err, Error::AcquireRejected(ConsensusError::NotLeader)));

    // A failed acquire leaves the published primary untouched.
    assert_eq!(follower.primary_info().await.unwrap(), PrimaryInfo::new("http://a"));
}

#[tokio::test]
async fn test_acquire_times_out_on_slow_commit() {
    init_tracing();
    let cluster = LocalCluster::new(1);
    let config = LeaseConfig::default().with_apply_timeout(Duration::from_millis(50));
    let leaser = cluster.leaser_with(
        0,
        PrimaryRedirectInfo::new("http://a", ""),
        config,
        std::sync::Arc::new(primary_lease::time::SystemClock),
    );
    cluster.elect_settled(0).await;

    cluster.set_commit_latency(Duration::from_millis(300));
    assert!(matches!(leaser.acquire().await, Err(Error::AcquireTimeout)));
    assert!(matches!(leaser.primary_info().await, Err(Error::NoPrimary)));

    cluster.set_commit_latency(Duration::ZERO);
    leaser.acquire().await.unwrap();
    assert_eq!(leaser.primary_info().await.unwrap(), PrimaryInfo::new("http://a"));
}

#[tokio::test]
async fn test_partitioned_leader_cannot_acquire_or_renew() {
    init_tracing();
    let cluster = LocalCluster::new(3);
    let config = LeaseConfig::default().with_apply_timeout(Duration::from_millis(50));
    let leaser = cluster.leaser_with(
        0,
        PrimaryRedirectInfo::new("http://a", ""),
        config,
        std::sync::Arc::new(primary_lease::time::SystemClock),
    );
    cluster.elect_settled(0).await;
    let mut lease = leaser.acquire_lease().await.unwrap();
    let renewed_at = lease.renewed_at();

    cluster.inject(0, Fault::Partitioned);
    assert!(matches!(leaser.acquire().await, Err(Error::AcquireTimeout)));
    assert!(matches!(lease.renew().await, Err(Error::LeaseExpired)));
    assert_eq!(lease.renewed_at(), renewed_at);
    assert_eq!(lease.status(), LeaseStatus::Expired);
}

#[tokio::test]
async fn test_close_releases_and_transfers_leadership() {
    init_tracing();
    let cluster = LocalCluster::new(3);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", "http://r"));
    let other = cluster.leaser(1, PrimaryRedirectInfo::new("http://b", ""));
    cluster.elect_settled(0).await;

    let mut lease = leaser.acquire().await.unwrap();
    assert!(leaser.primary_info().await.is_ok());

    lease.close().await.unwrap();
    assert!(matches!(leaser.primary_info().await, Err(Error::NoPrimary)));
    assert!(matches!(other.primary_info().await, Err(Error::NoPrimary)));
    assert_eq!(leaser.redirect_url().await.unwrap(), "");
    assert_eq!(cluster.leader(), Some(1));

    // Released is terminal.
    assert!(matches!(lease.renew().await, Err(Error::LeaseExpired)));
    lease.close().await.unwrap();
}

#[tokio::test]
async fn test_close_after_losing_leadership_fails() {
    init_tracing();
    let cluster = LocalCluster::new(2);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    cluster.elect_settled(0).await;
    let mut lease = leaser.acquire().await.unwrap();

    cluster.elect(1);
    let err = lease.close().await.unwrap_err();
    assert!(matches!(err, Error::Release(ConsensusError::NotLeader)));
}

#[tokio::test]
async fn test_close_reports_transfer_failure() {
    init_tracing();
    let cluster = LocalCluster::new(2);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    cluster.elect_settled(0).await;
    let mut lease = leaser.acquire_lease().await.unwrap();

    cluster.inject(0, Fault::RejectTransfer);
    let err = lease.close().await.unwrap_err();
    assert!(matches!(err, Error::Transfer(ConsensusError::Unavailable(_))));

    // The reset committed before the transfer was attempted.
    assert!(matches!(leaser.primary_info().await, Err(Error::NoPrimary)));
    assert_eq!(cluster.leader(), Some(0));
    assert_eq!(lease.status(), LeaseStatus::Held);
}

#[tokio::test]
async fn test_close_on_single_node_has_no_transfer_target() {
    init_tracing();
    let cluster = LocalCluster::new(1);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    cluster.elect_settled(0).await;
    let mut lease = leaser.acquire().await.unwrap();

    let err = lease.close().await.unwrap_err();
    assert!(matches!(err, Error::Transfer(ConsensusError::NoTransferTarget)));
}

#[tokio::test]
async fn test_handoff_is_unsupported() {
    init_tracing();
    let cluster = LocalCluster::new(2);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    cluster.elect_settled(0).await;
    let mut lease = leaser.acquire().await.unwrap();

    for target in [cluster.node_id(1), cluster.node_id(0), NodeId::new()] {
        assert!(matches!(lease.handoff(target).await, Err(Error::Unsupported(_))));
    }
    assert!(lease.handoff_ch().recv().await.is_none());

    for lease_id in ["", "lease-1", "00000000-0000-0000-0000-000000000000"] {
        assert!(matches!(
            leaser.acquire_existing(lease_id).await,
            Err(Error::Unsupported(_))
        ));
    }

    // The held lease is not disturbed by the failed handoff.
    lease.renew().await.unwrap();
}

#[tokio::test]
async fn test_manager_close_shuts_down_consensus() {
    init_tracing();
    let cluster = LocalCluster::new(2);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    assert!(leaser.is_watching());

    leaser.close().await.unwrap();
    assert!(!leaser.is_watching());
    assert!(cluster.is_shut_down(0));
    assert!(matches!(
        leaser.acquire().await,
        Err(Error::AcquireRejected(ConsensusError::Shutdown))
    ));
}

#[tokio::test]
async fn test_manager_close_reports_shutdown_failure() {
    init_tracing();
    let cluster = LocalCluster::new(1);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    cluster.elect_settled(0).await;
    let _lease = leaser.acquire().await.unwrap();
    cluster.inject(0, Fault::RejectShutdown);

    let err = leaser.close().await.unwrap_err();
    assert!(matches!(err, Error::Shutdown(ConsensusError::Unavailable(_))));
    assert!(!cluster.is_shut_down(0));
    assert!(leaser.is_watching());

    // The engine is still running, so leadership changes keep clearing the record.
    cluster.elect_settled(0).await;
    assert!(matches!(leaser.primary_info().await, Err(Error::NoPrimary)));
}

#[tokio::test]
async fn test_stale_lease_close_leaves_newer_lease_alone() {
    init_tracing();
    let cluster = LocalCluster::new(2);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    cluster.elect_settled(0).await;
    let mut old = leaser.acquire().await.unwrap();

    cluster.elect(1);
    // Let node 0's reset for this change fail now, while it is a follower.
    tokio::task::yield_now().await;
    assert!(matches!(old.renew().await, Err(Error::LeaseExpired)));

    cluster.elect_settled(0).await;
    let mut fresh = leaser.acquire().await.unwrap();
    let log_len = cluster.log_len();

    assert!(matches!(old.close().await, Err(Error::LeaseExpired)));
    assert_eq!(cluster.log_len(), log_len);
    assert_eq!(leaser.primary_info().await.unwrap(), PrimaryInfo::new("http://a"));
    assert_eq!(cluster.leader(), Some(0));
    fresh.renew().await.unwrap();
}

#[tokio::test]
async fn test_state_machine_error_is_returned_by_acquire_and_close() {
    init_tracing();
    let cluster = LocalCluster::new(2);
    let leaser = cluster.leaser(0, PrimaryRedirectInfo::new("http://a", ""));
    cluster.elect_settled(0).await;
    let mut lease = leaser.acquire_lease().await.unwrap();

    cluster.inject(0, Fault::CorruptCommands);
    let err = leaser.acquire().await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)));

    let err = lease.close().await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)));

    // The rejected reset stops close before any leadership transfer.
    assert_eq!(cluster.leader(), Some(0));
    assert_eq!(lease.status(), LeaseStatus::Held);
    assert_eq!(leaser.primary_info().await.unwrap(), PrimaryInfo::new("http://a"));

    cluster.heal(0, Fault::CorruptCommands);
    lease.close().await.unwrap();
    assert_eq!(cluster.leader(), Some(1));
    assert_eq!(lease.status(), LeaseStatus::Released);
}
