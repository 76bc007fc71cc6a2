//! Cluster membership list.
//!
//! Members are held in a positional list. Removal overwrites the removed
//! slot with the last member and shortens the list, so order carries no
//! meaning beyond indexing. Changes are relayed to the leader like cache
//! changes, but applied in a single attempt under one process-wide lock.

use super::events::{MemberEvent, MemberEventListener};
use super::{Redirector, Route};
use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;
use crate::types::{normalize_endpoint, MembershipChangeRecord, MembershipOperation};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Ordered list of member endpoints. Comparisons ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberList {
    slots: Vec<String>,
}

impl MemberList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, member: &str) -> Option<usize> {
        self.slots.iter().position(|m| m.eq_ignore_ascii_case(member))
    }

    pub fn contains(&self, member: &str) -> bool {
        self.position(member).is_some()
    }

    /// Append `member` if absent. Returns whether the list changed.
    pub fn add(&mut self, member: String) -> bool {
        if self.contains(&member) {
            return false;
        }
        self.slots.push(member);
        true
    }

    /// Remove `member` if present. Returns whether the list changed.
    pub fn remove(&mut self, member: &str) -> bool {
        match self.position(member) {
            Some(index) => self.remove_by_swapping_last(index).is_some(),
            None => false,
        }
    }

    /// Overwrite slot `index` with the last member and drop the last slot.
    pub fn remove_by_swapping_last(&mut self, index: usize) -> Option<String> {
        (index < self.slots.len()).then(|| self.slots.swap_remove(index))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.slots
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.slots.clone()
    }
}

impl<S: AsRef<str>> FromIterator<S> for MemberList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = MemberList::new();
        for member in iter {
            list.add(normalize_endpoint(member.as_ref()));
        }
        list
    }
}

/// Applies membership changes and publishes the resulting member list.
pub struct MembershipHandler {
    /// Serializes every change to the list.
    members: Mutex<MemberList>,

    /// Effective configuration, reloaded after each change.
    config_tx: watch::Sender<Vec<String>>,

    redirector: Option<Arc<dyn Redirector<MembershipChangeRecord>>>,

    listeners: RwLock<Vec<Arc<dyn MemberEventListener>>>,

    metrics: Arc<CacheMetrics>,
}

impl MembershipHandler {
    pub fn new(initial: MemberList, metrics: Arc<CacheMetrics>) -> Self {
        let (config_tx, _) = watch::channel(initial.to_vec());
        Self {
            members: Mutex::new(initial),
            config_tx,
            redirector: None,
            listeners: RwLock::new(Vec::new()),
            metrics,
        }
    }

    /// Offer every change to the leader before applying it locally.
    pub fn with_redirector(
        mut self,
        redirector: Arc<dyn Redirector<MembershipChangeRecord>>,
    ) -> Self {
        self.redirector = Some(redirector);
        self
    }

    /// Add an event listener.
    pub fn add_listener(&self, listener: Arc<dyn MemberEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Current members.
    pub fn members(&self) -> Vec<String> {
        self.members.lock().to_vec()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.lock().contains(&normalize_endpoint(member))
    }

    /// Follow the effective member list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.config_tx.subscribe()
    }

    /// Add a member to the cluster.
    pub async fn add(&self, member: &str, cancel: &CancellationToken) -> Result<()> {
        self.submit(MembershipChangeRecord::add(member), Route::Redirect, cancel)
            .await
    }

    /// Remove a member from the cluster.
    pub async fn remove(&self, member: &str, cancel: &CancellationToken) -> Result<()> {
        self.submit(MembershipChangeRecord::remove(member), Route::Redirect, cancel)
            .await
    }

    /// Relay the change to the leader or apply it here.
    pub async fn submit(
        &self,
        record: MembershipChangeRecord,
        route: Route,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if record.member.is_empty() {
            return Err(Error::InvalidRequest("member must not be empty".to_string()));
        }

        if route == Route::Redirect {
            if let Some(redirector) = &self.redirector {
                if redirector.redirect(&record, cancel).await? {
                    debug!(member = %record.member, operation = %record.operation, "Membership change accepted by leader");
                    return Ok(());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.apply(&record);
        Ok(())
    }

    /// Apply a change to the local list. Returns whether the list changed.
    pub fn apply(&self, record: &MembershipChangeRecord) -> bool {
        let reloaded = {
            let mut members = self.members.lock();
            let changed = match record.operation {
                MembershipOperation::Add => members.add(record.member.clone()),
                MembershipOperation::Remove => members.remove(&record.member),
            };
            changed.then(|| members.to_vec())
        };

        let Some(members) = reloaded else {
            debug!(member = %record.member, operation = %record.operation, "Membership unchanged");
            return false;
        };

        info!(
            member = %record.member,
            operation = %record.operation,
            members = members.len(),
            "Membership changed"
        );
        self.config_tx.send_replace(members);
        self.metrics.membership_changes.inc();

        let event = match record.operation {
            MembershipOperation::Add => MemberEvent::Added {
                member: record.member.clone(),
            },
            MembershipOperation::Remove => MemberEvent::Removed {
                member: record.member.clone(),
            },
        };
        for listener in self.listeners.read().iter() {
            listener.on_event(event.clone());
        }

        true
    }
}

impl std::fmt::Debug for MembershipHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipHandler")
            .field("members", &self.members.lock().as_slice())
            .finish()
    }
}
