//! A single node running alone: it is its own leader and its log commits
//! on append, but every change still takes the full write path.

use lockstep::{CacheNode, ExpirationPolicy, NodeConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("lockstep=debug,info")
        .init();

    let config = NodeConfig::new("127.0.0.1:3092")
        .with_max_capacity(10_000)
        .with_membership_enabled(true);

    println!("Starting cache node...");
    let node = CacheNode::standalone(config)?;
    let cancel = CancellationToken::new();
    node.start(&cancel).await?;

    let status = node.status();
    println!("Endpoint: {}", status.endpoint);
    println!("Is Leader: {}", status.is_leader);
    println!("Members: {:?}", status.members);

    println!("\n--- Writes ---");
    node.set("user:1", "Alice", None, &cancel).await?;
    node.set("user:2", "Bob", None, &cancel).await?;
    node.set(
        "session:1",
        "token",
        Some(ExpirationPolicy::sliding(Duration::from_millis(500))),
        &cancel,
    )
    .await?;

    if let Some(value) = node.get("user:1", &cancel).await? {
        println!("Got user:1 = {:?}", String::from_utf8_lossy(&value));
    }

    node.remove("user:2", &cancel).await?;
    println!("user:2 after remove: {:?}", node.get("user:2", &cancel).await?);

    println!("\n--- Sliding expiration ---");
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let alive = node.get("session:1", &cancel).await?.is_some();
        println!("session:1 alive while read: {}", alive);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!(
        "session:1 after 1s idle: {:?}",
        node.get("session:1", &cancel).await?
    );

    let stats = node.stats();
    println!("\nCache stats:");
    println!("  Entry count: {}", stats.entry_count);
    println!("  Hits: {}", stats.hits);
    println!("  Misses: {}", stats.misses);

    println!("\nMetrics:\n{}", node.metrics().to_prometheus());

    println!("Shutting down...");
    node.stop().await;

    Ok(())
}
