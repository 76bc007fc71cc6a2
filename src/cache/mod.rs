//! Replicated cache engine.
//!
//! Reads are served from the local store. Every change goes through the
//! same cycle: offer it to the leader, otherwise lock the key, mutate the
//! local store, append to the log, force replication, check that the term
//! did not move and wait for commit. Any failure in that window undoes the
//! local mutation, drops the appended entry and starts over, because the
//! leader may have changed.

pub mod inline;
pub mod locks;
pub mod storage;

use crate::cluster::{Redirector, Route};
use crate::config::{ReplicationConfig, StorageConfig};
use crate::consensus::{CacheStateMachine, ReplicatedLog, Replicator};
use crate::error::{Error, ReplicationError, Result};
use crate::metrics::CacheMetrics;
use crate::types::{
    CacheChangeRecord, CacheOperation, ExpirationPolicy, LogIndex, RecordId, Term,
};
use bytes::Bytes;
use inline::{InlineApplies, InlineApply};
use locks::NamedLocks;
use std::sync::Arc;
use storage::{CacheEntry, CacheStats, CacheStorage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Node-local state shared by the engine and the log-replay path.
#[derive(Debug, Clone)]
pub struct CacheParts {
    pub storage: Arc<CacheStorage>,
    pub locks: Arc<NamedLocks>,
    pub inline: Arc<InlineApplies>,
    pub metrics: Arc<CacheMetrics>,
}

impl CacheParts {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            storage: Arc::new(CacheStorage::new(config)),
            locks: Arc::new(NamedLocks::new()),
            inline: Arc::new(InlineApplies::new()),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// State machine the log must call for committed entries.
    pub fn state_machine(&self) -> CacheStateMachine {
        CacheStateMachine::new(
            self.storage.clone(),
            self.locks.clone(),
            self.inline.clone(),
            self.metrics.clone(),
        )
    }
}

/// The strongly consistent cache of one node.
pub struct ReplicatedCache {
    storage: Arc<CacheStorage>,
    locks: Arc<NamedLocks>,
    inline: Arc<InlineApplies>,
    metrics: Arc<CacheMetrics>,

    /// Append side of the replicated log.
    log: Arc<dyn ReplicatedLog>,

    /// Present when running in a cluster.
    replicator: Option<Arc<dyn Replicator>>,

    /// Present when other nodes may hold leadership.
    redirector: Option<Arc<dyn Redirector<CacheChangeRecord>>>,

    config: ReplicationConfig,

    /// Cancels background refreshes on shutdown.
    shutdown: CancellationToken,
}

impl ReplicatedCache {
    /// Create an engine over `log`, with no replicator and no redirector.
    pub fn new(parts: CacheParts, log: Arc<dyn ReplicatedLog>, config: ReplicationConfig) -> Self {
        Self {
            storage: parts.storage,
            locks: parts.locks,
            inline: parts.inline,
            metrics: parts.metrics,
            log,
            replicator: None,
            redirector: None,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Force replication after every append.
    pub fn with_replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    /// Offer every change to the leader before applying it locally.
    pub fn with_redirector(mut self, redirector: Arc<dyn Redirector<CacheChangeRecord>>) -> Self {
        self.redirector = Some(redirector);
        self
    }

    /// Read a value from the local store.
    ///
    /// An absent key is `Ok(None)`. Reading a sliding entry schedules a
    /// cluster-wide `Refresh` in the background; its outcome is not reported.
    pub async fn get(self: &Arc<Self>, key: &str, cancel: &CancellationToken) -> Result<Option<Bytes>> {
        let entry = {
            let _guard = self.locks.acquire_read(key, cancel).await?;
            self.storage.get(key).await
        };

        self.metrics.record_get(entry.is_some());

        match entry {
            Some(entry) => {
                if entry.is_sliding() {
                    self.spawn_refresh(key.to_string());
                }
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    /// Insert or overwrite `key`.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        expiration: Option<ExpirationPolicy>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record = CacheChangeRecord::update(key, value, expiration);
        self.submit(record, Route::Redirect, cancel).await
    }

    /// Delete `key`. Succeeds whether or not the key exists.
    pub async fn remove(&self, key: impl Into<String>, cancel: &CancellationToken) -> Result<()> {
        self.submit(CacheChangeRecord::remove(key), Route::Redirect, cancel)
            .await
    }

    /// Restart the sliding window of `key` on every node.
    pub async fn refresh(&self, key: impl Into<String>, cancel: &CancellationToken) -> Result<()> {
        self.submit(CacheChangeRecord::refresh(key), Route::Redirect, cancel)
            .await
    }

    /// Run the redirect-apply-replicate cycle until the change is accepted.
    ///
    /// Replication failures are retried with a fresh record id. Redirection
    /// failures, leader discovery timeouts and cancellation end the cycle and
    /// reach the caller as [`Error::Change`], carrying the key, the operation,
    /// the current term and the last index this node appended for the change.
    pub async fn submit(
        &self,
        mut record: CacheChangeRecord,
        route: Route,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if record.key.is_empty() {
            return Err(Error::InvalidRequest("cache key must not be empty".to_string()));
        }

        let mut route = route;
        let mut attempt: u32 = 0;
        let mut last_index: LogIndex = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.failed(&record, last_index, Error::Cancelled));
            }

            if route == Route::Redirect {
                if let Some(redirector) = &self.redirector {
                    match redirector.redirect(&record, cancel).await {
                        Ok(true) => {
                            debug!(key = %record.key, operation = %record.operation, "Change accepted by leader");
                            self.metrics.redirected.inc();
                            self.metrics.writes.inc(&record.operation.to_string());
                            return Ok(());
                        }
                        Ok(false) => {}
                        Err(e) => return Err(self.failed(&record, last_index, e)),
                    }
                }
            }

            match self.apply_replicated(&record, &mut last_index, cancel).await {
                Ok(index) => {
                    debug!(key = %record.key, operation = %record.operation, index, attempt, "Change committed");
                    self.metrics.writes.inc(&record.operation.to_string());
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    self.metrics.retries.inc();
                    warn!(
                        key = %record.key,
                        operation = %record.operation,
                        attempt,
                        error = %e,
                        "Replication failed, retrying"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(self.failed(&record, last_index, Error::Cancelled));
                        }
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }

                    record.id = RecordId::new_v4();
                    route = Route::Redirect;
                }
                Err(e) => return Err(self.failed(&record, last_index, e)),
            }
        }
    }

    /// Attach the change context to an error that ends the cycle.
    fn failed(&self, record: &CacheChangeRecord, last_index: LogIndex, e: Error) -> Error {
        if e.is_cancelled() {
            self.metrics.cancelled.inc();
        }
        Error::Change {
            operation: record.operation.to_string(),
            key: record.key.clone(),
            term: self.log.term(),
            last_index,
            source: Box::new(e),
        }
    }

    /// One local attempt: lock, mutate, append, replicate, commit.
    ///
    /// On failure the local store is left as it was before the attempt,
    /// unless the entry committed anyway, in which case the change stands.
    async fn apply_replicated(
        &self,
        record: &CacheChangeRecord,
        last_index: &mut LogIndex,
        cancel: &CancellationToken,
    ) -> Result<LogIndex> {
        let data = Bytes::from(record.to_bytes()?);

        let _guard = self.locks.acquire_write(&record.key, cancel).await?;
        let inline = self.inline.begin(record.id);

        let fallback = self.storage.capture(&record.key).await;
        self.storage.apply(record).await;

        let index = match self.log.append(data, cancel).await {
            Ok(index) => index,
            Err(e) => {
                self.restore(record, fallback).await;
                return Err(e);
            }
        };
        *last_index = index;

        match self.replicate(index, cancel).await {
            Ok(()) if inline.applied() => Ok(index),
            Ok(()) => {
                // Our entry was dropped with a tail and the index reused
                let term = self.log.term();
                self.restore(record, fallback).await;
                self.metrics.rollbacks.inc();
                warn!(key = %record.key, operation = %record.operation, index, term, "Entry superseded, rolled back local change");
                Err(ReplicationError::Superseded { index, term }.into())
            }
            Err(e) => self.roll_back(record, index, &inline, fallback, e).await,
        }
    }

    /// Force replication of everything up to `index` and wait until it
    /// committed and reached the state machine.
    ///
    /// Any failure other than cancellation becomes a [`ReplicationError`].
    async fn replicate(&self, index: LogIndex, cancel: &CancellationToken) -> Result<()> {
        let term = self.log.term();

        if let Some(replicator) = &self.replicator {
            let replicated = replicator
                .force_replicate(self.config.replicate_timeout, cancel)
                .await
                .map_err(|e| e.into_replication(index, term))?;
            let current = self.log.term();

            if !replicated {
                return Err(ReplicationError::NotReplicated { index, term }.into());
            }
            if current != term {
                return Err(ReplicationError::TermChanged {
                    index,
                    from: term,
                    to: current,
                }
                .into());
            }
        }

        let committed = self
            .log
            .wait_for_commit(index, self.config.commit_timeout, cancel)
            .await
            .map_err(|e| e.into_replication(index, term))?;
        if !committed {
            return Err(ReplicationError::CommitTimeout { index, term }.into());
        }

        Ok(())
    }

    /// Drop the appended entry and, if that worked, undo the local change.
    async fn roll_back(
        &self,
        record: &CacheChangeRecord,
        index: LogIndex,
        inline: &InlineApply,
        fallback: Option<CacheEntry>,
        cause: Error,
    ) -> Result<LogIndex> {
        // The caller's token may be the reason we are here.
        let rollback = CancellationToken::new();

        match self.log.drop_uncommitted(index, &rollback).await {
            Ok(true) => {
                self.restore(record, fallback).await;
                self.metrics.rollbacks.inc();
                warn!(
                    key = %record.key,
                    operation = %record.operation,
                    index,
                    term = self.log.term(),
                    error = %cause,
                    "Rolled back local change"
                );
                Err(cause)
            }
            Ok(false) => {
                // Committed, but possibly another writer's entry at a reused index
                if let Err(e) = self
                    .log
                    .wait_for_commit(index, self.config.commit_timeout, &rollback)
                    .await
                {
                    debug!(key = %record.key, index, error = %e, "Waiting for committed entry failed");
                }
                if inline.applied() {
                    debug!(key = %record.key, index, error = %cause, "Entry committed before rollback, keeping change");
                    return Ok(index);
                }
                self.restore(record, fallback).await;
                self.metrics.rollbacks.inc();
                warn!(key = %record.key, index, error = %cause, "Index taken by another entry, rolled back local change");
                Err(cause)
            }
            Err(e) => {
                warn!(key = %record.key, index, error = %e, "Failed to drop uncommitted entry");
                Err(cause)
            }
        }
    }

    async fn restore(&self, record: &CacheChangeRecord, fallback: Option<CacheEntry>) {
        // A refresh has no reversible local effect
        if record.operation != CacheOperation::Refresh {
            self.storage.restore(&record.key, fallback).await;
        }
    }

    fn spawn_refresh(self: &Arc<Self>, key: String) {
        self.metrics.sliding_refreshes.inc();

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = cache.shutdown.child_token();
            let refresh = cache.refresh(key.clone(), &cancel);
            tokio::pin!(refresh);

            let result = tokio::select! {
                result = &mut refresh => result,
                _ = tokio::time::sleep(cache.config.replicate_timeout) => {
                    // Let the cycle observe the cancellation and roll back
                    cancel.cancel();
                    refresh.await
                }
            };

            if let Err(e) = result {
                debug!(key = %key, error = %e, "Background refresh failed");
            }
        });
    }

    /// Read an entry without scheduling a refresh. Intended for diagnostics.
    pub async fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.storage.peek(key).await
    }

    /// Local store statistics.
    pub fn stats(&self) -> CacheStats {
        self.storage.stats()
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Current term of the underlying log.
    pub fn term(&self) -> Term {
        self.log.term()
    }

    /// Cancel background refreshes and wait for every key lock to be released.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.locks.shutdown().await;
    }
}

impl std::fmt::Debug for ReplicatedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedCache")
            .field("storage", &self.storage)
            .field("clustered", &self.replicator.is_some())
            .finish()
    }
}
