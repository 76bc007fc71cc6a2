//! Contracts with the replicated log, plus the pieces the cache plugs into it.
//!
//! The log itself (election, quorum replication, durability) lives outside
//! this crate. The cache talks to it through [`ReplicatedLog`] and
//! [`Replicator`], and the log calls back into the cache through
//! [`StateMachine`] whenever an entry commits.

pub mod memory;
pub mod snapshot;
pub mod state_machine;

pub use memory::MemoryLog;
pub use snapshot::CacheSnapshotBuilder;
pub use state_machine::CacheStateMachine;

use crate::error::Result;
use crate::types::{LogIndex, Term};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A single entry of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    /// Serialized record; empty for no-op entries.
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, data: Bytes) -> Self {
        Self { index, term, data }
    }
}

/// Append side of the replicated log.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Append a serialized record, returning its index.
    async fn append(&self, data: Bytes, cancel: &CancellationToken) -> Result<LogIndex>;

    /// Wait until `index` is committed and its entry was handed to the
    /// state machine. Returns `false` on timeout.
    async fn wait_for_commit(
        &self,
        index: LogIndex,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Discard the uncommitted tail starting at `index`.
    ///
    /// Returns `false` if the entry committed in the meantime and can no
    /// longer be dropped.
    async fn drop_uncommitted(&self, index: LogIndex, cancel: &CancellationToken)
        -> Result<bool>;

    /// Current leadership term.
    fn term(&self) -> Term;
}

/// Pushes the log to a quorum on demand.
///
/// Nodes running without a cluster have no replicator; their appends commit
/// locally.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Attempt to replicate the log within `timeout`.
    async fn force_replicate(&self, timeout: Duration, cancel: &CancellationToken) -> Result<bool>;
}

/// Receiver of committed entries.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply a committed entry. Must not fail: bad payloads are logged and
    /// skipped.
    async fn apply(&self, entry: &LogEntry);

    /// Create a builder used by the log to compact its applied prefix.
    fn snapshot_builder(&self) -> Box<dyn SnapshotBuilder>;
}

/// Replays log payloads into the smallest equivalent record set.
pub trait SnapshotBuilder: Send {
    /// Feed the next payload in log order.
    fn apply(&mut self, data: &[u8]);

    /// Serialize the surviving records.
    fn build(&self) -> Result<Vec<Bytes>>;
}
