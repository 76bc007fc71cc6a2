//! In-memory replicated log.
//!
//! `MemoryLog` keeps entries, the commit and apply positions and the
//! compacted snapshot of one node. On its own it acts as a single-voter log:
//! every append commits immediately and is applied through the state
//! machine, which is how standalone nodes run. The simulated cluster drives
//! several of them through [`MemoryLog::append_entry`],
//! [`MemoryLog::replicate_from`] and [`MemoryLog::commit_to`].
//!
//! # Index Mapping
//! Entries are contiguous and start right after the snapshot:
//! the entry at logical index `i` lives at `entries[i - snapshot_index - 1]`.

use super::{LogEntry, ReplicatedLog, StateMachine};
use crate::error::{Error, Result, StorageError};
use crate::types::{LogIndex, Term};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct LogState {
    /// Compacted records covering everything up to `snapshot_index`.
    snapshot: Vec<Bytes>,
    snapshot_index: LogIndex,
    snapshot_term: Term,

    /// Entries after the snapshot, contiguous.
    entries: Vec<LogEntry>,

    committed: LogIndex,
    applied: LogIndex,
}

impl LogState {
    fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.snapshot_index {
            return None;
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.position(index).map(|pos| self.entries[pos].term)
    }

    /// Drop every entry at or after `index`.
    fn truncate(&mut self, index: LogIndex) {
        let keep = index.saturating_sub(self.snapshot_index + 1) as usize;
        self.entries.truncate(keep);
    }
}

/// Log state exposed for status reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub term: Term,
    pub last_index: LogIndex,
    pub committed: LogIndex,
    pub applied: LogIndex,
    pub snapshot_index: LogIndex,
}

/// In-memory log feeding one state machine.
pub struct MemoryLog {
    state: Mutex<LogState>,

    term: AtomicU64,

    /// Publishes the commit index to waiters.
    commit_tx: watch::Sender<LogIndex>,

    /// Serializes application so entries reach the state machine in order.
    apply_gate: tokio::sync::Mutex<()>,

    state_machine: Arc<dyn StateMachine>,

    /// Compact once this many applied entries are retained.
    compaction_threshold: Option<usize>,
}

impl MemoryLog {
    /// Create an empty log in term 1.
    pub fn new(state_machine: Arc<dyn StateMachine>) -> Self {
        let (commit_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(LogState::default()),
            term: AtomicU64::new(1),
            commit_tx,
            apply_gate: tokio::sync::Mutex::new(()),
            state_machine,
            compaction_threshold: None,
        }
    }

    /// Compact the applied prefix whenever it grows past `threshold` entries.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = Some(threshold.max(1));
        self
    }

    /// Current term.
    pub fn term(&self) -> Term {
        self.term.load(Ordering::SeqCst)
    }

    /// Move to a new term. Terms never go backwards.
    pub fn set_term(&self, term: Term) {
        self.term.fetch_max(term, Ordering::SeqCst);
    }

    /// Current positions.
    pub fn position(&self) -> LogPosition {
        let state = self.state.lock();
        LogPosition {
            term: self.term(),
            last_index: state.last_index(),
            committed: state.committed,
            applied: state.applied,
            snapshot_index: state.snapshot_index,
        }
    }

    pub fn last_index(&self) -> LogIndex {
        self.state.lock().last_index()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.lock().committed
    }

    /// Number of entries retained after the snapshot.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Compacted records currently standing in for the log prefix.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.state.lock().snapshot.clone()
    }

    /// Append a payload in the current term without committing it.
    pub fn append_entry(&self, data: Bytes) -> LogIndex {
        let mut state = self.state.lock();
        let index = state.last_index() + 1;
        state.entries.push(LogEntry::new(index, self.term(), data));
        index
    }

    /// Entries after `index`.
    ///
    /// # Errors
    /// - `StorageError::Compacted` - part of the range was compacted away
    pub fn entries_after(&self, index: LogIndex) -> Result<Vec<LogEntry>> {
        let state = self.state.lock();
        if index < state.snapshot_index {
            return Err(StorageError::Compacted(state.snapshot_index).into());
        }
        let start = (index - state.snapshot_index) as usize;
        Ok(state.entries.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default())
    }

    /// Copy the leader's log over this one.
    ///
    /// Everything after this log's commit index is replaced by the leader's
    /// entries, which also discards tails the leader has dropped. Returns the
    /// new last index.
    pub fn replicate_from(&self, leader: &MemoryLog) -> Result<LogIndex> {
        let from = self.commit_index();
        let entries = leader.entries_after(from)?;
        self.set_term(leader.term());

        let mut state = self.state.lock();
        if let Some(first) = entries.first() {
            if first.index > state.committed + 1 {
                return Err(StorageError::LogGap {
                    last_index: state.committed,
                    first_new: first.index,
                }
                .into());
            }
        }

        let committed = state.committed;
        state.truncate(committed + 1);
        state
            .entries
            .extend(entries.into_iter().filter(|e| e.index > committed));
        Ok(state.last_index())
    }

    /// Drop the uncommitted tail starting at `index`.
    ///
    /// Returns `false` if `index` is already committed.
    pub fn truncate_from(&self, index: LogIndex) -> bool {
        let mut state = self.state.lock();
        if index <= state.committed {
            return false;
        }
        if index <= state.last_index() {
            debug!(index, last = state.last_index(), "Dropping uncommitted tail");
            state.truncate(index);
        }
        true
    }

    /// Advance the commit index to `index` and apply newly committed entries.
    pub async fn commit_to(&self, index: LogIndex) {
        let _gate = self.apply_gate.lock().await;

        let pending = {
            let mut state = self.state.lock();
            let target = index.min(state.last_index());
            if target > state.committed {
                state.committed = target;
            }
            let from = state.position(state.applied + 1);
            let to = state.position(state.committed);
            match (from, to) {
                (Some(from), Some(to)) => state.entries[from..=to].to_vec(),
                _ => Vec::new(),
            }
        };

        for entry in &pending {
            self.state_machine.apply(entry).await;
            self.state.lock().applied = entry.index;
        }

        // Waiters only wake once their entry reached the state machine
        let committed = self.commit_index();
        self.commit_tx.send_replace(committed);

        if let Some(threshold) = self.compaction_threshold {
            let retained = {
                let state = self.state.lock();
                (state.applied - state.snapshot_index) as usize
            };
            if retained > threshold {
                if let Err(e) = self.compact() {
                    warn!(error = %e, "Log compaction failed");
                }
            }
        }
    }

    /// Wait for `index` to commit and be applied. Returns `false` on timeout.
    pub async fn await_commit(
        &self,
        index: LogIndex,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut rx = self.commit_tx.subscribe();

        let wait = async {
            loop {
                if *rx.borrow_and_update() >= index {
                    return Ok(true);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return Ok(false);
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Ok(false),
        }
    }

    /// Replace the applied prefix by the state machine's compacted records.
    ///
    /// Returns the number of entries removed.
    pub fn compact(&self) -> Result<usize> {
        let mut builder = self.state_machine.snapshot_builder();
        let mut state = self.state.lock();

        let applied = state.applied;
        if applied <= state.snapshot_index {
            return Ok(0);
        }

        for record in &state.snapshot {
            builder.apply(record);
        }
        let upto = (applied - state.snapshot_index) as usize;
        for entry in &state.entries[..upto] {
            builder.apply(&entry.data);
        }

        let records = builder.build()?;
        let term = state.term_at(applied).unwrap_or(state.snapshot_term);

        state.entries.drain(..upto);
        state.snapshot = records;
        state.snapshot_index = applied;
        state.snapshot_term = term;

        info!(
            snapshot_index = applied,
            records = state.snapshot.len(),
            compacted = upto,
            "Compacted log"
        );
        Ok(upto)
    }

    /// Replay the snapshot and every committed entry into `target`.
    ///
    /// Used to rebuild a state machine after a restart.
    pub async fn replay_into(&self, target: &dyn StateMachine) {
        let (snapshot_index, snapshot, entries) = {
            let state = self.state.lock();
            let committed: Vec<_> = state
                .entries
                .iter()
                .filter(|e| e.index <= state.committed)
                .cloned()
                .collect();
            (state.snapshot_index, state.snapshot.clone(), committed)
        };

        for data in snapshot {
            target
                .apply(&LogEntry::new(snapshot_index, 0, data))
                .await;
        }
        for entry in &entries {
            target.apply(entry).await;
        }
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLog")
            .field("position", &self.position())
            .finish()
    }
}

/// Single-voter behaviour: an append is its own quorum.
#[async_trait]
impl ReplicatedLog for MemoryLog {
    async fn append(&self, data: Bytes, cancel: &CancellationToken) -> Result<LogIndex> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let index = self.append_entry(data);
        self.commit_to(index).await;
        Ok(index)
    }

    async fn wait_for_commit(
        &self,
        index: LogIndex,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.await_commit(index, timeout, cancel).await
    }

    async fn drop_uncommitted(
        &self,
        index: LogIndex,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(self.truncate_from(index))
    }

    fn term(&self) -> Term {
        MemoryLog::term(self)
    }
}
