//! Moka cache wrapper for local storage.

use crate::config::StorageConfig;
use crate::types::{CacheChangeRecord, CacheOperation, ExpirationPolicy};
use bytes::Bytes;
use dashmap::DashMap;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::Expiry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A value held in the local store together with its derived expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The stored value.
    pub value: Bytes,

    /// Absolute deadline, resolved when the entry was applied.
    pub deadline: Option<Instant>,

    /// Sliding window, reset on every read.
    pub sliding: Option<Duration>,

    /// Start of the window still running when the entry was captured.
    /// `None` starts a fresh window when the entry is stored.
    pub window_start: Option<Instant>,
}

impl CacheEntry {
    /// Build an entry applied at `now` under the given policy.
    pub fn new(value: Bytes, policy: Option<&ExpirationPolicy>, now: Instant) -> Self {
        Self {
            value,
            deadline: policy.and_then(|p| p.deadline(now)),
            sliding: policy.and_then(|p| p.sliding_expiration),
            window_start: None,
        }
    }

    /// Whether reads extend this entry's lifetime.
    pub fn is_sliding(&self) -> bool {
        self.sliding.is_some()
    }

    /// Remaining lifetime measured from `at` with a window starting at `at`;
    /// `None` means no expiry.
    fn time_to_live(&self, at: Instant) -> Option<Duration> {
        self.time_to_live_since(at, at)
    }

    /// Remaining lifetime when stored at `at`, resuming a captured window.
    fn stored_time_to_live(&self, at: Instant) -> Option<Duration> {
        self.time_to_live_since(at, self.window_start.unwrap_or(at))
    }

    fn time_to_live_since(&self, at: Instant, window_start: Instant) -> Option<Duration> {
        let absolute = self.deadline.map(|d| d.saturating_duration_since(at));
        let elapsed = at.saturating_duration_since(window_start);
        let sliding = self.sliding.map(|w| w.saturating_sub(elapsed));
        match (absolute, sliding) {
            (Some(abs), Some(window)) => Some(abs.min(window)),
            (Some(abs), None) => Some(abs),
            (None, Some(window)) => Some(window),
            (None, None) => None,
        }
    }
}

/// Per-entry expiry derived from each entry's own deadline and window.
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        value.stored_time_to_live(created_at)
    }

    fn expire_after_read(
        &self,
        _key: &String,
        value: &CacheEntry,
        read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        if value.is_sliding() {
            value.time_to_live(read_at)
        } else {
            duration_until_expiry
        }
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.stored_time_to_live(updated_at)
    }
}

/// Local store statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of entries in the local store.
    pub entry_count: u64,
    /// Number of reads that found a value.
    pub hits: u64,
    /// Number of reads that found nothing.
    pub misses: u64,
}

/// Local cache storage backed by Moka.
///
/// Only the engine and the log-replay path write to it, always under the
/// key's write lock.
pub struct CacheStorage {
    /// The underlying Moka cache.
    cache: Cache<String, CacheEntry>,

    /// When the current window of each sliding entry started.
    windows: Arc<DashMap<String, Instant>>,

    /// Hit counter for statistics.
    hits: AtomicU64,

    /// Miss counter for statistics.
    misses: AtomicU64,
}

impl CacheStorage {
    /// Create a new cache storage with the given configuration.
    pub fn new(config: &StorageConfig) -> Self {
        let windows: Arc<DashMap<String, Instant>> = Arc::new(DashMap::new());
        let listener_windows = windows.clone();
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(EntryExpiry)
            .eviction_listener(move |key: Arc<String>, _value, cause| {
                if cause != RemovalCause::Replaced {
                    listener_windows.remove(key.as_str());
                }
            })
            .build();

        Self {
            cache,
            windows,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get an entry. Reading a sliding entry restarts its window.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let result = self.cache.get(key).await;
        self.window_restarted(key, result.as_ref());

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Read an entry without counting toward hit statistics.
    ///
    /// Like any moka read this restarts the expiry timer of a sliding entry.
    pub async fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.cache.get(key).await
    }

    /// Capture an entry so that [`restore`](Self::restore) puts it back with
    /// the lifetime it had left, not a fresh sliding window.
    pub async fn capture(&self, key: &str) -> Option<CacheEntry> {
        let window_start = self.windows.get(key).map(|start| *start);
        let mut entry = self.cache.get(key).await?;
        if entry.is_sliding() {
            entry.window_start = window_start;
        }
        Some(entry)
    }

    /// Check if a key exists without touching its expiration.
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Apply a change record to the store.
    pub async fn apply(&self, record: &CacheChangeRecord) {
        match record.operation {
            CacheOperation::Update => {
                self.upsert(
                    record.key.clone(),
                    Bytes::copy_from_slice(&record.value),
                    record.expiration.as_ref(),
                )
                .await;
            }
            CacheOperation::Remove => {
                self.invalidate(&record.key).await;
            }
            CacheOperation::Refresh => {
                self.touch(&record.key).await;
            }
        }
    }

    /// Put back the state captured before a rolled back change.
    pub async fn restore(&self, key: &str, previous: Option<CacheEntry>) {
        match previous {
            Some(entry) => self.insert(key.to_string(), entry).await,
            None => self.invalidate(key).await,
        }
    }

    /// Insert or overwrite an entry.
    pub async fn insert(&self, key: String, entry: CacheEntry) {
        if entry.is_sliding() {
            let start = entry.window_start.unwrap_or_else(Instant::now);
            self.windows.insert(key.clone(), start);
        } else {
            self.windows.remove(&key);
        }
        self.cache.insert(key, entry).await;
    }

    /// Insert a value under a policy, resolving deadlines against now.
    pub async fn upsert(&self, key: String, value: Bytes, policy: Option<&ExpirationPolicy>) {
        let entry = CacheEntry::new(value, policy, Instant::now());
        self.insert(key, entry).await;
    }

    /// Remove a key, returning the previous entry.
    pub async fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.windows.remove(key);
        self.cache.remove(key).await
    }

    /// Restart the window of a sliding entry. Returns whether the key exists.
    pub async fn touch(&self, key: &str) -> bool {
        let entry = self.cache.get(key).await;
        self.window_restarted(key, entry.as_ref());
        entry.is_some()
    }

    async fn invalidate(&self, key: &str) {
        self.windows.remove(key);
        self.cache.invalidate(key).await;
    }

    fn window_restarted(&self, key: &str, entry: Option<&CacheEntry>) {
        if entry.is_some_and(CacheEntry::is_sliding) {
            self.windows.insert(key.to_string(), Instant::now());
        }
    }

    /// Get the number of entries in the cache.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Run pending maintenance tasks (cleanup expired entries, etc.).
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Collect all live entries, without touching their expiration.
    pub fn collect_entries(&self) -> Vec<(String, CacheEntry)> {
        self.cache
            .iter()
            .map(|(k, v)| ((*k).clone(), v))
            .collect()
    }
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage")
            .field("entry_count", &self.entry_count())
            .finish()
    }
}
