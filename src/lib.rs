//! Strongly consistent replicated key/value cache.
//!
//! A cluster of nodes exposes one logical cache. Reads are served from each
//! node's local memory; every change is ordered through a replicated log
//! and only acknowledged once it committed in the term it was written in.
//!
//! # Features
//!
//! - Per-key read/write locks: writes to one key are strictly serialized,
//!   writes to different keys proceed independently
//! - Changes issued on a follower are relayed to the leader
//! - Local changes are rolled back when replication fails, the term moves
//!   or the caller cancels, then retried
//! - Sliding, relative and absolute expiration
//! - Log compaction into the smallest equivalent set of records
//! - Cluster membership with swap-remove semantics
//!
//! Leader election and durable log storage are provided by the host
//! through the [`consensus::ReplicatedLog`], [`consensus::Replicator`] and
//! [`cluster::MessageBus`] traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use lockstep::{CacheNode, ExpirationPolicy, NodeConfig};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = CacheNode::standalone(NodeConfig::new("127.0.0.1:3092"))?;
//!     let cancel = CancellationToken::new();
//!     node.start(&cancel).await?;
//!
//!     node.set("user:123", "Alice", None, &cancel).await?;
//!     node.set(
//!         "session:9",
//!         "token",
//!         Some(ExpirationPolicy::sliding(Duration::from_secs(60))),
//!         &cancel,
//!     )
//!     .await?;
//!
//!     if let Some(value) = node.get("user:123", &cancel).await? {
//!         println!("Found: {:?}", value);
//!     }
//!
//!     node.remove("user:123", &cancel).await?;
//!     node.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Write path
//!
//! ```text
//!  set/remove/refresh
//!        │
//!        ▼
//!  ┌──────────────┐  leader elsewhere   ┌──────────────┐
//!  │    Router    │ ──────────────────► │ remote leader│
//!  └──────────────┘                     └──────────────┘
//!        │ this node leads
//!        ▼
//!  write lock(key) → apply locally → append → force replicate
//!        │                                        │
//!        │        term unchanged, committed       │ failure / new term
//!        ▼                                        ▼
//!       done                       drop entry, restore, back off, retry
//! ```

pub mod cache;
pub mod cluster;
pub mod config;
pub mod consensus;
pub mod error;
pub mod metrics;
pub mod network;
pub mod node;
#[cfg(test)]
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use cache::ReplicatedCache;
pub use config::{NodeConfig, ReplicationConfig, RouterConfig, StorageConfig};
pub use error::{Error, Result};
pub use node::{CacheNode, Collaborators};
pub use types::{
    CacheChangeRecord, CacheOperation, ExpirationPolicy, LogIndex, MembershipChangeRecord,
    MembershipOperation, NodeStatus, RecordId, Term,
};

// Re-export cluster types
pub use cluster::{InboundHandler, Leader, MemberEvent, MemberEventListener, MessageBus, Route};

// Re-export consensus contracts
pub use consensus::{LogEntry, MemoryLog, ReplicatedLog, Replicator, SnapshotBuilder, StateMachine};

// Re-export network types
pub use network::{LeaderTracker, TcpMessageBus};

// Re-export metrics types
pub use metrics::{CacheMetrics, Counter, LabeledCounter, MetricsSnapshot};
