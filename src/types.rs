//! Core types used throughout the replicated cache.
//!
//! Records are the payloads committed to the replicated log (cache changes)
//! or relayed to the leader (cache and membership changes). They serialize
//! deterministically with bincode.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier of a single cache change attempt.
pub type RecordId = Uuid;

/// Position of an entry in the replicated log.
pub type LogIndex = u64;

/// Leadership epoch of the replicated log.
pub type Term = u64;

/// Scheme prepended to member endpoints that don't carry one.
pub const DEFAULT_SCHEME: &str = "https";

/// Kind of cache mutation carried by a [`CacheChangeRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheOperation {
    /// Insert or overwrite a key.
    Update,
    /// Delete a key.
    Remove,
    /// Extend the lifetime of a sliding entry.
    Refresh,
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheOperation::Update => write!(f, "Update"),
            CacheOperation::Remove => write!(f, "Remove"),
            CacheOperation::Refresh => write!(f, "Refresh"),
        }
    }
}

/// Expiration settings of a cache entry.
///
/// When both absolute forms are set, the relative one wins. A sliding
/// window never extends an entry past its absolute deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpirationPolicy {
    /// Absolute expiration as milliseconds since the Unix epoch.
    pub absolute_expiration_ms: Option<u64>,

    /// Absolute expiration relative to the moment the entry is applied.
    pub absolute_expiration_relative: Option<Duration>,

    /// Idle window after which the entry expires; reset on every read.
    pub sliding_expiration: Option<Duration>,
}

impl ExpirationPolicy {
    /// Policy that never expires.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire after `window` without reads.
    pub fn sliding(window: Duration) -> Self {
        Self {
            sliding_expiration: Some(window),
            ..Default::default()
        }
    }

    /// Expire `ttl` after the entry is applied.
    pub fn expires_in(ttl: Duration) -> Self {
        Self {
            absolute_expiration_relative: Some(ttl),
            ..Default::default()
        }
    }

    /// Expire at a wall-clock instant.
    pub fn expires_at(at: SystemTime) -> Self {
        Self {
            absolute_expiration_ms: Some(unix_millis(at)),
            ..Default::default()
        }
    }

    /// Add a sliding window to this policy.
    pub fn with_sliding(mut self, window: Duration) -> Self {
        self.sliding_expiration = Some(window);
        self
    }

    /// Add a relative absolute expiration to this policy.
    pub fn with_expires_in(mut self, ttl: Duration) -> Self {
        self.absolute_expiration_relative = Some(ttl);
        self
    }

    /// Whether reads extend the entry's lifetime.
    pub fn is_sliding(&self) -> bool {
        self.sliding_expiration.is_some()
    }

    /// Resolve the absolute deadline for an entry applied at `now`.
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        if let Some(ttl) = self.absolute_expiration_relative {
            return Some(now + ttl);
        }

        self.absolute_expiration_ms.map(|at_ms| {
            let now_ms = unix_millis(SystemTime::now());
            now + Duration::from_millis(at_ms.saturating_sub(now_ms))
        })
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A cache mutation, as appended to the replicated log.
///
/// Equality and hashing ignore `id`: two attempts of the same change compare
/// equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheChangeRecord {
    /// Per-attempt identifier, used to recognise entries this node is
    /// applying inline when the log replays them.
    pub id: RecordId,

    /// The mutation.
    pub operation: CacheOperation,

    /// Target key, never empty.
    pub key: String,

    /// New value; empty for `Remove` and `Refresh`.
    pub value: Vec<u8>,

    /// Expiration settings for `Update`.
    pub expiration: Option<ExpirationPolicy>,
}

impl CacheChangeRecord {
    fn new(
        operation: CacheOperation,
        key: impl Into<String>,
        value: Vec<u8>,
        expiration: Option<ExpirationPolicy>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            key: key.into(),
            value,
            expiration,
        }
    }

    /// Create an `Update` record.
    pub fn update(
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        expiration: Option<ExpirationPolicy>,
    ) -> Self {
        Self::new(CacheOperation::Update, key, value.into(), expiration)
    }

    /// Create a `Remove` record.
    pub fn remove(key: impl Into<String>) -> Self {
        Self::new(CacheOperation::Remove, key, Vec::new(), None)
    }

    /// Create a `Refresh` record.
    pub fn refresh(key: impl Into<String>) -> Self {
        Self::new(CacheOperation::Refresh, key, Vec::new(), None)
    }

    /// Whether this record installs a sliding entry.
    pub fn is_sliding(&self) -> bool {
        self.expiration
            .as_ref()
            .map(ExpirationPolicy::is_sliding)
            .unwrap_or(false)
    }

    /// Serialize record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize record from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl PartialEq for CacheChangeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.operation == other.operation
            && self.key == other.key
            && self.value == other.value
            && self.expiration == other.expiration
    }
}

impl Eq for CacheChangeRecord {}

impl Hash for CacheChangeRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.operation.hash(state);
        self.key.hash(state);
        self.value.hash(state);
        self.expiration.hash(state);
    }
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipOperation {
    Add,
    Remove,
}

impl fmt::Display for MembershipOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipOperation::Add => write!(f, "Add"),
            MembershipOperation::Remove => write!(f, "Remove"),
        }
    }
}

/// A cluster membership change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MembershipChangeRecord {
    pub operation: MembershipOperation,
    /// Normalized endpoint, always carrying a scheme.
    pub member: String,
}

impl MembershipChangeRecord {
    /// Create an `Add` record.
    pub fn add(member: &str) -> Self {
        Self {
            operation: MembershipOperation::Add,
            member: normalize_endpoint(member),
        }
    }

    /// Create a `Remove` record.
    pub fn remove(member: &str) -> Self {
        Self {
            operation: MembershipOperation::Remove,
            member: normalize_endpoint(member),
        }
    }
}

/// Normalize an endpoint so that it carries a scheme and no trailing slash.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", DEFAULT_SCHEME, trimmed)
    }
}

/// Strip the scheme from an endpoint, leaving `host:port`.
pub fn endpoint_authority(endpoint: &str) -> &str {
    match endpoint.split_once("://") {
        Some((_, rest)) => rest.trim_end_matches('/'),
        None => endpoint.trim_end_matches('/'),
    }
}

/// Snapshot of a node's view of the cluster.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    /// This node's endpoint.
    pub endpoint: String,
    /// Endpoint of the leader, if known.
    pub leader: Option<String>,
    /// Whether this node is the leader.
    pub is_leader: bool,
    /// Current term of the replicated log.
    pub term: Term,
    /// Known cluster members.
    pub members: Vec<String>,
}
