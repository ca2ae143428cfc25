use primary_lease::{
    test_utils::{wait_until, LocalCluster},
    Lease, Leaser, PrimaryRedirectInfo,
};
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Primary lease failover demo");
    println!("===========================\n");

    let cluster = LocalCluster::new(3);
    let leasers: Vec<_> = (0..cluster.size())
        .map(|i| {
            cluster.leaser(
                i,
                PrimaryRedirectInfo::new(format!("http://node{i}:20202"), format!("http://node{i}:8080")),
            )
        })
        .collect();

    cluster.elect_settled(0).await;
    let mut lease = leasers[0].acquire().await?;
    println!("node0 holds the lease (renewed at {})", lease.renewed_at());
    println!("primary seen by node2: {:?}", leasers[2].primary_info().await?);

    lease.renew().await?;
    println!("node0 renewed at {}", lease.renewed_at());

    // Graceful release: the record is cleared and leadership moves on.
    let before = cluster.log_len();
    lease.close().await?;
    let leader = cluster.leader().unwrap_or_default();
    println!("node0 released, leader is now node{leader}");
    println!("primary seen by node2: {:?}", leasers[2].primary_info().await.err());

    // Wait for the new leader's own reset to commit before acquiring.
    wait_until(Duration::from_secs(1), || cluster.log_len() >= before + 2).await;
    let _lease = leasers[leader].acquire().await?;
    println!("primary seen by node0: {:?}", leasers[0].primary_info().await?);

    for leaser in &leasers {
        leaser.close().await?;
    }
    println!("\nall nodes shut down");
    Ok(())
}
