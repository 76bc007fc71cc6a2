//! Per-key asynchronous reader/writer locks.
//!
//! Locks are created on first use and live for the lifetime of the registry.
//! Acquisition races against the caller's cancellation token; a cancelled
//! waiter leaves no queued request behind.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Registry of named locks, one per cache key.
#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
    closed: AtomicBool,
}

/// Exclusive hold on a key.
#[derive(Debug)]
pub struct NamedWriteGuard {
    key: String,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl NamedWriteGuard {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Shared hold on a key.
#[derive(Debug)]
pub struct NamedReadGuard {
    key: String,
    _guard: OwnedRwLockReadGuard<()>,
}

impl NamedReadGuard {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Result<Arc<RwLock<()>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        if let Some(lock) = self.locks.get(key) {
            return Ok(lock.value().clone());
        }

        Ok(self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone())
    }

    /// Acquire the exclusive lock for `key`.
    ///
    /// Waits until no reader or writer holds the key. Fails with
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn acquire_write(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<NamedWriteGuard> {
        let lock = self.lock_for(key)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = lock.write_owned() => Ok(NamedWriteGuard {
                key: key.to_string(),
                _guard: guard,
            }),
        }
    }

    /// Acquire the shared lock for `key`.
    ///
    /// Only waits behind an active or queued writer on the same key.
    pub async fn acquire_read(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<NamedReadGuard> {
        let lock = self.lock_for(key)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = lock.read_owned() => Ok(NamedReadGuard {
                key: key.to_string(),
                _guard: guard,
            }),
        }
    }

    /// Number of keys that have been locked at least once.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Stop handing out locks and wait for every current holder to release.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);

        let outstanding: Vec<_> = self
            .locks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        debug!(locks = outstanding.len(), "Draining named locks");
        for lock in outstanding {
            let _drained = lock.write().await;
        }
        info!("Named locks released");
    }
}
