//! State machine applying committed log entries to the cache.

use super::{LogEntry, SnapshotBuilder, StateMachine};
use crate::cache::inline::{ApplyMode, InlineApplies};
use crate::cache::locks::NamedLocks;
use crate::cache::storage::CacheStorage;
use crate::consensus::snapshot::CacheSnapshotBuilder;
use crate::metrics::CacheMetrics;
use crate::types::CacheChangeRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The cache state machine that applies committed entries.
///
/// Entries this node is currently writing inline are applied without the key
/// lock, since the write path already holds it. Everything else takes the
/// key's write lock first.
pub struct CacheStateMachine {
    /// The underlying cache storage.
    storage: Arc<CacheStorage>,

    /// Per-key locks shared with the write path.
    locks: Arc<NamedLocks>,

    /// Ids of records being written inline on this node.
    inline: Arc<InlineApplies>,

    metrics: Arc<CacheMetrics>,

    /// The last applied index.
    applied_index: AtomicU64,
}

impl CacheStateMachine {
    pub fn new(
        storage: Arc<CacheStorage>,
        locks: Arc<NamedLocks>,
        inline: Arc<InlineApplies>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            storage,
            locks,
            inline,
            metrics,
            applied_index: AtomicU64::new(0),
        }
    }

    /// Get the last applied index.
    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// Get the underlying storage.
    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    fn update_applied(&self, index: u64) {
        self.applied_index.fetch_max(index, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateMachine for CacheStateMachine {
    async fn apply(&self, entry: &LogEntry) {
        // Empty data means a noop entry
        if entry.data.is_empty() {
            self.update_applied(entry.index);
            return;
        }

        let record = match CacheChangeRecord::from_bytes(&entry.data) {
            Ok(record) => record,
            Err(e) => {
                // Entry is already committed, nothing to do but skip it
                warn!(index = entry.index, error = %e, "Ignoring malformed log entry");
                self.metrics.replay_malformed.inc();
                self.update_applied(entry.index);
                return;
            }
        };

        match self.inline.claim(&record.id) {
            ApplyMode::AlreadyLocked => {
                debug!(
                    index = entry.index,
                    key = %record.key,
                    operation = %record.operation,
                    "Applying entry held by the local write path"
                );
                self.storage.apply(&record).await;
                self.metrics.replay_inline.inc();
            }
            ApplyMode::NeedsLock => {
                // Replay is never cancelled; only shutdown stops it.
                let never = CancellationToken::new();
                match self.locks.acquire_write(&record.key, &never).await {
                    Ok(_guard) => {
                        debug!(
                            index = entry.index,
                            term = entry.term,
                            key = %record.key,
                            operation = %record.operation,
                            "Applying replicated entry"
                        );
                        self.storage.apply(&record).await;
                        self.metrics.replay_locked.inc();
                    }
                    Err(e) => {
                        warn!(index = entry.index, key = %record.key, error = %e, "Dropping entry, locks unavailable");
                    }
                }
            }
        }

        self.update_applied(entry.index);
    }

    fn snapshot_builder(&self) -> Box<dyn SnapshotBuilder> {
        Box::new(CacheSnapshotBuilder::new())
    }
}
