//! Correlation between in-flight local writes and log replay.
//!
//! The write path holds a key's write lock while its entry is appended and
//! committed. If the log delivers that same entry back to the state machine
//! during the window, the replay must not take the lock again. The write
//! path registers the record id for the duration of the window; replay asks
//! the registry which mode applies and marks the record as delivered. Once
//! its index commits, the write path checks that mark to tell its own entry
//! from one that took over the index after a dropped tail.

use crate::types::RecordId;
use dashmap::DashMap;
use std::sync::Arc;

/// How the replay path must apply a committed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// The originating write path on this node holds the key's lock.
    AlreadyLocked,
    /// Nobody on this node holds the key for this record.
    NeedsLock,
}

/// Record ids currently being applied inline by the local write path.
#[derive(Debug, Default)]
pub struct InlineApplies {
    /// Registered ids, with whether replay has delivered them.
    ids: DashMap<RecordId, bool>,
}

impl InlineApplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` until the returned guard is dropped.
    pub fn begin(self: &Arc<Self>, id: RecordId) -> InlineApply {
        self.ids.insert(id, false);
        InlineApply {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Decide how replay applies the record with this id.
    pub fn mode_for(&self, id: &RecordId) -> ApplyMode {
        if self.ids.contains_key(id) {
            ApplyMode::AlreadyLocked
        } else {
            ApplyMode::NeedsLock
        }
    }

    /// Like [`mode_for`](Self::mode_for), and records that replay has
    /// delivered a registered id.
    pub fn claim(&self, id: &RecordId) -> ApplyMode {
        match self.ids.get_mut(id) {
            Some(mut delivered) => {
                *delivered = true;
                ApplyMode::AlreadyLocked
            }
            None => ApplyMode::NeedsLock,
        }
    }

    /// Number of writes currently in flight.
    pub fn in_flight(&self) -> usize {
        self.ids.len()
    }
}

/// Registration of one in-flight record id.
#[derive(Debug)]
pub struct InlineApply {
    registry: Arc<InlineApplies>,
    id: RecordId,
}

impl InlineApply {
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Whether replay has delivered this record.
    pub fn applied(&self) -> bool {
        self.registry.ids.get(&self.id).map(|d| *d).unwrap_or(false)
    }
}

impl Drop for InlineApply {
    fn drop(&mut self) {
        self.registry.ids.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_guard_scopes_registration() {
        let registry = Arc::new(InlineApplies::new());
        let id = Uuid::new_v4();

        assert_eq!(registry.mode_for(&id), ApplyMode::NeedsLock);
        {
            let guard = registry.begin(id);
            assert_eq!(guard.id(), id);
            assert_eq!(registry.mode_for(&id), ApplyMode::AlreadyLocked);
            assert_eq!(registry.in_flight(), 1);
        }
        assert_eq!(registry.mode_for(&id), ApplyMode::NeedsLock);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_claim_marks_only_registered_ids() {
        let registry = Arc::new(InlineApplies::new());
        let ours = registry.begin(Uuid::new_v4());
        let foreign = Uuid::new_v4();

        assert!(!ours.applied());
        assert_eq!(registry.claim(&foreign), ApplyMode::NeedsLock);
        assert!(!ours.applied());

        assert_eq!(registry.claim(&ours.id()), ApplyMode::AlreadyLocked);
        assert!(ours.applied());
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn test_concurrent_ids_are_independent() {
        let registry = Arc::new(InlineApplies::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let guard_a = registry.begin(a);
        let _guard_b = registry.begin(b);
        drop(guard_a);

        assert_eq!(registry.mode_for(&a), ApplyMode::NeedsLock);
        assert_eq!(registry.mode_for(&b), ApplyMode::AlreadyLocked);
    }
}
