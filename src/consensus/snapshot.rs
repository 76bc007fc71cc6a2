//! Log compaction into surviving `Update` records.

use super::SnapshotBuilder;
use crate::error::Result;
use crate::types::{CacheChangeRecord, CacheOperation, ExpirationPolicy, RecordId};
use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::warn;

/// Latest write for one surviving key.
#[derive(Debug, Clone)]
struct Surviving {
    id: RecordId,
    value: Vec<u8>,
    expiration: Option<ExpirationPolicy>,
}

/// Builds a snapshot from a private working map; never touches the live
/// store.
///
/// `Update` overwrites, `Remove` deletes, `Refresh` is ignored. Each
/// surviving key is emitted as one `Update` carrying the id and expiration
/// policy of the write that produced it. Keys are emitted in sorted order so
/// the output is deterministic.
#[derive(Debug, Default)]
pub struct CacheSnapshotBuilder {
    records: BTreeMap<String, Surviving>,
}

impl CacheSnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys that would be emitted.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn apply_record(&mut self, record: CacheChangeRecord) {
        match record.operation {
            CacheOperation::Update => {
                self.records.insert(
                    record.key,
                    Surviving {
                        id: record.id,
                        value: record.value,
                        expiration: record.expiration,
                    },
                );
            }
            CacheOperation::Remove => {
                self.records.remove(&record.key);
            }
            CacheOperation::Refresh => {}
        }
    }
}

impl SnapshotBuilder for CacheSnapshotBuilder {
    fn apply(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        match CacheChangeRecord::from_bytes(data) {
            Ok(record) => self.apply_record(record),
            Err(e) => warn!(error = %e, len = data.len(), "Skipping malformed entry during compaction"),
        }
    }

    fn build(&self) -> Result<Vec<Bytes>> {
        self.records
            .iter()
            .map(|(key, surviving)| -> Result<Bytes> {
                let record = CacheChangeRecord {
                    id: surviving.id,
                    operation: CacheOperation::Update,
                    key: key.clone(),
                    value: surviving.value.clone(),
                    expiration: surviving.expiration.clone(),
                };
                Ok(Bytes::from(record.to_bytes()?))
            })
            .collect()
    }
}
